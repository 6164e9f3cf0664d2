//! Job nodes, handles and the per-worker arena that owns them.
//!
//! A job is a function pointer plus a small inline payload, a link to the
//! job that spawned it, and a pending counter. The counter starts at one for
//! the job's own execution and grows by one for every child attached to it;
//! the job is complete when it drops back to zero.
//!
//! Nodes never move and are never deallocated while the scheduler lives.
//! "Freeing" a node pushes its slot onto the owning arena's free list.

use crate::deque::DequeItem;
use crate::error::SchedulerError;
use crate::topology::CACHE_LINE_SIZE;
use crate::worker::Worker;
use std::cell::UnsafeCell;
use std::mem::{MaybeUninit, align_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, Ordering};

const PAYLOAD_WORDS: usize = 4;

/// Bytes of argument data a job node stores inline.
pub const PAYLOAD_CAPACITY: usize = PAYLOAD_WORDS * size_of::<u64>();

/// The work a job performs. It receives the context of the executing worker
/// and a view of its own node.
pub type JobFn = fn(&Worker<'_>, &Job<'_>);

/// Highest worker count a [`JobRef`] can address. One worker id is reserved
/// to mark "no parent" inside a node.
pub const MAX_WORKERS: usize = u16::MAX as usize;

/// Handle to a job node: the worker whose arena holds it, the slot index,
/// and the slot's generation when the job was created.
///
/// A slot's generation advances every time it is released, so a handle kept
/// past `wait` no longer matches the slot once it is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobRef {
    worker: u16,
    generation: u16,
    slot: u32,
}

impl JobRef {
    const NONE: JobRef = JobRef {
        worker: u16::MAX,
        generation: 0,
        slot: 0,
    };

    pub(crate) fn new(worker: usize, slot: u32, generation: u16) -> Self {
        debug_assert!(worker < MAX_WORKERS);
        JobRef {
            worker: worker as u16,
            generation,
            slot,
        }
    }

    /// Worker whose arena holds the node.
    pub fn worker(&self) -> usize {
        self.worker as usize
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }
}

impl DequeItem for JobRef {
    fn into_bits(self) -> u64 {
        ((self.worker as u64) << 48) | ((self.generation as u64) << 32) | self.slot as u64
    }

    fn from_bits(bits: u64) -> Self {
        JobRef {
            worker: (bits >> 48) as u16,
            generation: (bits >> 32) as u16,
            slot: bits as u32,
        }
    }
}

/// Lifecycle of a node slot. Completion itself is tracked by the pending
/// counter, not here.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Free = 0,
    Created = 1,
    Queued = 2,
    Running = 3,
    Executed = 4,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => JobState::Created,
            2 => JobState::Queued,
            3 => JobState::Running,
            4 => JobState::Executed,
            _ => JobState::Free,
        }
    }
}

fn unset(_: &Worker<'_>, _: &Job<'_>) {}

const NO_SLOT: u32 = u32::MAX;

/// One schedulable unit, sized and aligned to a cache line so concurrently
/// touched nodes never share one.
#[repr(C, align(64))]
pub(crate) struct JobNode {
    function: UnsafeCell<JobFn>,
    /// `JobRef::NONE` for roots.
    parent: UnsafeCell<JobRef>,
    pending: AtomicU32,
    next_free: AtomicU32,
    generation: AtomicU16,
    state: AtomicU8,
    owns_self: AtomicBool,
    payload_len: UnsafeCell<u8>,
    payload: UnsafeCell<[MaybeUninit<u64>; PAYLOAD_WORDS]>,
}

const _: () = assert!(size_of::<JobNode>() == CACHE_LINE_SIZE);

// SAFETY: the `UnsafeCell` fields are written only by the allocating worker
// between allocation and submission, and read only after the node has been
// handed over through a deque (release/acquire on `back`/`front`) or after
// the creating worker published it by other synchronisation. Everything
// mutated after submission is atomic.
unsafe impl Sync for JobNode {}

impl JobNode {
    fn new() -> Self {
        JobNode {
            function: UnsafeCell::new(unset as JobFn),
            parent: UnsafeCell::new(JobRef::NONE),
            pending: AtomicU32::new(0),
            next_free: AtomicU32::new(NO_SLOT),
            generation: AtomicU16::new(0),
            state: AtomicU8::new(JobState::Free as u8),
            owns_self: AtomicBool::new(false),
            payload_len: UnsafeCell::new(0),
            payload: UnsafeCell::new([MaybeUninit::uninit(); PAYLOAD_WORDS]),
        }
    }

    /// Fills a freshly allocated node.
    ///
    /// # Safety
    ///
    /// The caller must have just allocated this slot and not yet published
    /// its handle. `payload` must fit the inline capacity.
    unsafe fn init(&self, function: JobFn, parent: Option<JobRef>, payload: &[u8]) {
        debug_assert!(payload.len() <= PAYLOAD_CAPACITY);
        unsafe {
            *self.function.get() = function;
            *self.parent.get() = parent.unwrap_or(JobRef::NONE);
            *self.payload_len.get() = payload.len() as u8;
            let dst = (*self.payload.get()).as_mut_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len());
        }
        self.owns_self.store(false, Ordering::Relaxed);
        self.pending.store(1, Ordering::Relaxed);
        // Pairs with the acquire in `mark_queued`: whoever queues the job
        // sees the fields written above.
        self.state.store(JobState::Created as u8, Ordering::Release);
    }

    /// Moves a closure into the payload area.
    ///
    /// # Safety
    ///
    /// Same as [`JobNode::init`]; `F` must fit the payload's size and
    /// alignment, and `function` must read it back exactly once as `F`.
    unsafe fn init_closure<F>(&self, function: JobFn, parent: Option<JobRef>, closure: F) {
        debug_assert!(size_of::<F>() <= PAYLOAD_CAPACITY && align_of::<F>() <= align_of::<u64>());
        unsafe {
            self.init(function, parent, &[]);
            let dst = (*self.payload.get()).as_mut_ptr() as *mut F;
            dst.write(closure);
        }
    }

    /// Moves the closure stored by `init_closure` out of the node.
    ///
    /// # Safety
    ///
    /// The node must have been initialised with a closure of type `F` that
    /// has not been taken yet.
    pub(crate) unsafe fn take_closure<F>(&self) -> F {
        unsafe { ((*self.payload.get()).as_ptr() as *const F).read() }
    }

    pub(crate) fn function(&self) -> JobFn {
        // SAFETY: written before publication, never mutated while live.
        unsafe { *self.function.get() }
    }

    pub(crate) fn parent(&self) -> Option<JobRef> {
        // SAFETY: as for `function`.
        let parent = unsafe { *self.parent.get() };
        (parent != JobRef::NONE).then_some(parent)
    }

    pub(crate) fn generation(&self) -> u16 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `job` still names the current occupant of this slot.
    pub(crate) fn is_current(&self, job: JobRef) -> bool {
        self.generation() == job.generation
    }

    pub(crate) fn payload(&self) -> &[u8] {
        // SAFETY: as for `function`; the first `payload_len` bytes were
        // initialised by `init`.
        unsafe {
            let len = *self.payload_len.get() as usize;
            std::slice::from_raw_parts((*self.payload.get()).as_ptr() as *const u8, len)
        }
    }

    pub(crate) fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.pending() == 0
    }

    /// Counts a newly attached child.
    pub(crate) fn add_child(&self) {
        // Relaxed is enough: the increment is sequenced before the child is
        // pushed, and that push is the release the child's executor acquires.
        let prev = self.pending.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "child attached to a completed job");
    }

    /// Drops one outstanding unit of work. Returns true when this was the
    /// last one.
    pub(crate) fn finish_one(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn owns_self(&self) -> bool {
        self.owns_self.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Created -> Queued`, recording who releases the node.
    ///
    /// # Panics
    ///
    /// Panics if the job was already submitted or its slot is free.
    pub(crate) fn mark_queued(&self, owns_self: bool) {
        if let Err(actual) = self.state.compare_exchange(
            JobState::Created as u8,
            JobState::Queued as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "job submitted in state {:?}; each job is submitted exactly once",
                JobState::from_u8(actual)
            );
        }
        // Published to other workers by the deque push that follows.
        self.owns_self.store(owns_self, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Fixed pool of job nodes owned by one worker.
///
/// Only the owning worker allocates; any thread may free. Freed slots go on
/// an intrusive Treiber stack threaded through `next_free`. With a single
/// popping thread the stack head cannot be popped and re-pushed behind a
/// pop's back, so the classic ABA problem does not arise.
pub(crate) struct JobArena {
    worker: usize,
    nodes: Box<[JobNode]>,
    free_head: AtomicU32,
    /// First never-used slot. Touched only by the owner.
    fresh: AtomicU32,
}

impl JobArena {
    pub(crate) fn new(worker: usize, capacity: usize) -> Self {
        JobArena {
            worker,
            nodes: (0..capacity).map(|_| JobNode::new()).collect(),
            free_head: AtomicU32::new(NO_SLOT),
            fresh: AtomicU32::new(0),
        }
    }

    pub(crate) fn node(&self, slot: usize) -> &JobNode {
        &self.nodes[slot]
    }

    /// Takes a slot off the free list, or a never-used one. Owner only.
    fn allocate(&self) -> Result<u32, SchedulerError> {
        let mut head = self.free_head.load(Ordering::Acquire);
        while head != NO_SLOT {
            let next = self.nodes[head as usize].next_free.load(Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(head),
                Err(current) => head = current,
            }
        }

        let fresh = self.fresh.load(Ordering::Relaxed);
        if fresh as usize == self.nodes.len() {
            return Err(SchedulerError::ArenaExhausted {
                worker: self.worker,
                capacity: self.nodes.len(),
            });
        }
        self.fresh.store(fresh + 1, Ordering::Relaxed);
        Ok(fresh)
    }

    /// Returns a slot to the free list, invalidating every handle to its
    /// current job. Any thread.
    pub(crate) fn release(&self, slot: u32) {
        let node = &self.nodes[slot as usize];
        node.set_state(JobState::Free);
        node.generation.fetch_add(1, Ordering::Release);
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            node.next_free.store(head, Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                slot,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Allocates and fills a node with a byte payload. Owner only.
    pub(crate) fn create(
        &self,
        function: JobFn,
        parent: Option<JobRef>,
        payload: &[u8],
    ) -> Result<JobRef, SchedulerError> {
        if payload.len() > PAYLOAD_CAPACITY {
            return Err(SchedulerError::PayloadTooLarge {
                len: payload.len(),
                capacity: PAYLOAD_CAPACITY,
            });
        }
        let slot = self.allocate()?;
        let node = &self.nodes[slot as usize];
        // SAFETY: the slot was just taken from the arena and is unpublished.
        unsafe { node.init(function, parent, payload) };
        Ok(JobRef::new(self.worker, slot, node.generation()))
    }

    /// Allocates a node that runs `closure` once. Owner only.
    pub(crate) fn create_closure<F>(
        &self,
        parent: Option<JobRef>,
        closure: F,
    ) -> Result<JobRef, SchedulerError>
    where
        F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
    {
        if size_of::<F>() > PAYLOAD_CAPACITY || align_of::<F>() > align_of::<u64>() {
            return Err(SchedulerError::PayloadTooLarge {
                len: size_of::<F>().max(align_of::<F>()),
                capacity: PAYLOAD_CAPACITY,
            });
        }
        let slot = self.allocate()?;
        let node = &self.nodes[slot as usize];
        // SAFETY: fresh unpublished slot; `run_closure::<F>` reads it once.
        unsafe { node.init_closure(run_closure::<F>, parent, closure) };
        Ok(JobRef::new(self.worker, slot, node.generation()))
    }
}

fn run_closure<F>(worker: &Worker<'_>, job: &Job<'_>)
where
    F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
{
    // SAFETY: this trampoline is only installed by `create_closure::<F>`,
    // and a node's function runs exactly once per allocation.
    let closure = unsafe { job.node.take_closure::<F>() };
    closure(worker, job);
}

/// View of the running job handed to its function.
pub struct Job<'a> {
    handle: JobRef,
    node: &'a JobNode,
}

impl<'a> Job<'a> {
    pub(crate) fn new(handle: JobRef, node: &'a JobNode) -> Self {
        Job { handle, node }
    }

    /// Handle of this job, for attaching children.
    pub fn handle(&self) -> JobRef {
        self.handle
    }

    /// Argument bytes copied in when the job was created. Empty for closure
    /// jobs.
    pub fn payload(&self) -> &[u8] {
        self.node.payload()
    }

    /// Handle of the job that spawned this one.
    pub fn parent(&self) -> Option<JobRef> {
        self.node.parent()
    }
}
