//! Hardware topology queries used once at scheduler startup.

use sysinfo::{CpuRefreshKind, System};

/// Cache line size the job node layout is compiled for.
pub const CACHE_LINE_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct Topology {
    pub logical_cores: usize,
    pub cache_line_size: usize,
    pub cpu_brand: String,
}

impl Topology {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());

        let cpus = system.cpus();
        // sysinfo can come back empty inside some containers.
        let logical_cores = if cpus.is_empty() {
            logical_cores()
        } else {
            cpus.len()
        };
        let cpu_brand = cpus
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .unwrap_or_default();

        Topology {
            logical_cores: logical_cores.max(1),
            cache_line_size: cache_line_size(),
            cpu_brand,
        }
    }
}

/// Number of logical cores available to the process.
pub fn logical_cores() -> usize {
    num_cpus::get().max(1)
}

/// Size in bytes of an L1 data cache line.
///
/// Read from sysfs on Linux; every other platform reports
/// [`CACHE_LINE_SIZE`].
pub fn cache_line_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        let path = "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size";
        if let Some(size) = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&s| s > 0)
        {
            return size;
        }
    }
    CACHE_LINE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reports_cores() {
        let topo = Topology::detect();
        assert!(topo.logical_cores >= 1);
        assert!(topo.cache_line_size.is_power_of_two());
    }

    #[test]
    fn test_logical_cores_nonzero() {
        assert!(logical_cores() >= 1);
    }
}
