//! Memory probes
//!
//! The reading strategy is picked once by [`detect`]: inside a container the
//! cgroup counter is what matters, otherwise the host-wide figure is used.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const CGROUP_V2_CURRENT: &str = "/sys/fs/cgroup/memory.current";
const CGROUP_V1_USAGE: &str = "/sys/fs/cgroup/memory/memory.usage_in_bytes";
const PROC_MEMINFO: &str = "/proc/meminfo";

/// Reads the current memory usage in bytes
pub trait MemoryProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self) -> io::Result<u64>;
}

/// Reads a cgroup memory counter (a single integer in a file)
#[derive(Debug, Clone)]
pub struct CgroupProbe {
    path: PathBuf,
}

impl CgroupProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryProbe for CgroupProbe {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn read(&self) -> io::Result<u64> {
        let raw = std::fs::read_to_string(&self.path)?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Host-wide used memory from a meminfo file
#[derive(Debug, Clone)]
pub struct HostProbe {
    meminfo: PathBuf,
}

impl HostProbe {
    pub fn new(meminfo: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new(PROC_MEMINFO)
    }
}

impl MemoryProbe for HostProbe {
    fn name(&self) -> &'static str {
        "host"
    }

    fn read(&self) -> io::Result<u64> {
        let raw = std::fs::read_to_string(&self.meminfo)?;
        used_memory(&raw).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "MemTotal/MemAvailable missing")
        })
    }
}

/// `MemTotal - MemAvailable` in bytes
fn used_memory(meminfo: &str) -> Option<u64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };

    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some(total.saturating_sub(available))
}

/// Picks the probe for this environment
pub fn detect() -> Arc<dyn MemoryProbe> {
    let probe: Arc<dyn MemoryProbe> = if Path::new(CGROUP_V2_CURRENT).is_file() {
        Arc::new(CgroupProbe::new(CGROUP_V2_CURRENT))
    } else if Path::new(CGROUP_V1_USAGE).is_file() {
        Arc::new(CgroupProbe::new(CGROUP_V1_USAGE))
    } else {
        Arc::new(HostProbe::default())
    };

    info!("Using {} memory probe", probe.name());
    probe
}
