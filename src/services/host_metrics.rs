//! Host resource sampling
//!
//! `ProcHostMetrics` reads Linux procfs and `statvfs`. Every call blocks
//! (CPU usage needs two readings 200ms apart), so callers run it on the
//! blocking pool.

use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::domain::HostSample;
use crate::error::{Result, TripwireError};

const CPU_SAMPLE_GAP: Duration = Duration::from_millis(200);
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const KB_PER_GB: f64 = 1024.0 * 1024.0;

/// Source of host resource readings
#[cfg_attr(test, mockall::automock)]
pub trait HostMetrics: Send + Sync {
    /// Take one blocking reading
    fn sample(&self) -> Result<HostSample>;
}

/// procfs-backed host metrics
#[derive(Debug, Clone)]
pub struct ProcHostMetrics {
    proc_root: PathBuf,
    disk_path: PathBuf,
}

impl ProcHostMetrics {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_path: disk_path.into(),
        }
    }

    /// Read procfs from another root (containers, tests)
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path)
            .map_err(|e| TripwireError::HostMetrics(format!("{}: {}", path.display(), e)))
    }

    fn cpu_pct(&self) -> Result<f64> {
        let first = parse_cpu_times(&self.read_proc("stat")?)
            .ok_or_else(|| TripwireError::HostMetrics("malformed /proc/stat".to_string()))?;
        std::thread::sleep(CPU_SAMPLE_GAP);
        let second = parse_cpu_times(&self.read_proc("stat")?)
            .ok_or_else(|| TripwireError::HostMetrics("malformed /proc/stat".to_string()))?;
        Ok(cpu_usage(first, second))
    }

    fn memory(&self) -> Result<(f64, f64)> {
        let (total_kb, available_kb) = parse_meminfo(&self.read_proc("meminfo")?)
            .ok_or_else(|| TripwireError::HostMetrics("malformed /proc/meminfo".to_string()))?;
        if total_kb == 0 {
            return Err(TripwireError::HostMetrics("MemTotal is zero".to_string()));
        }

        let used_pct = (total_kb.saturating_sub(available_kb)) as f64 / total_kb as f64 * 100.0;
        Ok((used_pct, available_kb as f64 / KB_PER_GB))
    }

    #[cfg(unix)]
    fn disk(&self) -> Result<(f64, f64)> {
        let stat = nix::sys::statvfs::statvfs(self.disk_path.as_path())?;
        let block = stat.fragment_size() as f64;
        let total = stat.blocks() as f64 * block;
        let free = stat.blocks_available() as f64 * block;
        let used_pct = if total > 0.0 {
            (total - stat.blocks_free() as f64 * block) / total * 100.0
        } else {
            0.0
        };
        Ok((free / BYTES_PER_GB, used_pct))
    }

    #[cfg(not(unix))]
    fn disk(&self) -> Result<(f64, f64)> {
        Err(TripwireError::HostMetrics(format!(
            "disk usage unsupported on this platform ({})",
            self.disk_path.display()
        )))
    }

    fn network_connections(&self) -> u64 {
        ["net/tcp", "net/tcp6"]
            .iter()
            .filter_map(|name| self.read_proc(name).ok())
            .map(|content| count_socket_entries(&content))
            .sum()
    }
}

impl Default for ProcHostMetrics {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostMetrics for ProcHostMetrics {
    fn sample(&self) -> Result<HostSample> {
        let cpu_pct = self.cpu_pct()?;
        let (memory_pct, memory_available_gb) = self.memory()?;
        let (disk_free_gb, disk_used_pct) = self.disk()?;
        let network_connections = self.network_connections();

        let sample = HostSample {
            cpu_pct,
            memory_pct,
            memory_available_gb,
            disk_free_gb,
            disk_used_pct,
            network_connections,
        };
        debug!(
            "Host sample: cpu {:.1}% mem {:.1}% disk free {:.2}GB conns {}",
            sample.cpu_pct, sample.memory_pct, sample.disk_free_gb, sample.network_connections
        );
        Ok(sample)
    }
}

/// (idle, total) jiffies from the aggregate `cpu` line
fn parse_cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() < 4 {
        return None;
    }

    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Some((idle, total))
}

fn cpu_usage(first: (u64, u64), second: (u64, u64)) -> f64 {
    let idle = second.0.saturating_sub(first.0) as f64;
    let total = second.1.saturating_sub(first.1) as f64;
    if total <= 0.0 {
        return 0.0;
    }
    ((total - idle) / total * 100.0).clamp(0.0, 100.0)
}

/// (MemTotal, MemAvailable) in kB
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;

    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    Some((total?, available?))
}

fn count_socket_entries(table: &str) -> u64 {
    table
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        assert_eq!(parse_cpu_times(stat), Some((850, 1000)));
        assert_eq!(parse_cpu_times("intr 1 2 3"), None);
    }

    #[test]
    fn test_cpu_usage_delta() {
        assert!((cpu_usage((850, 1000), (900, 1200)) - 75.0).abs() < 1e-9);
        assert_eq!(cpu_usage((10, 10), (10, 10)), 0.0);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    4096000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((16_384_000, 4_096_000)));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_count_socket_entries() {
        let table = "  sl  local_address rem_address   st\n   0: 0100007F:1F90 00000000:0000 0A\n   1: 0100007F:1F91 00000000:0000 0A\n";
        assert_eq!(count_socket_entries(table), 2);
        assert_eq!(count_socket_entries(""), 0);
    }

    #[test]
    fn test_fake_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  100 0 50 800 50 0 0 0\n").unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemAvailable: 250 kB\n",
        )
        .unwrap();

        let metrics = ProcHostMetrics::new(dir.path()).with_proc_root(dir.path());
        let (used, _) = metrics.memory().unwrap();
        assert!((used - 75.0).abs() < 1e-9);
        assert_eq!(metrics.network_connections(), 0);
        // Identical readings mean no CPU time elapsed
        assert_eq!(metrics.cpu_pct().unwrap(), 0.0);
    }
}
