//! Statistics records filled in by the resource handlers.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Per-container statistics. Each resource handler fills the section it
/// owns; sections for resources the container does not isolate stay at their
/// defaults.
#[derive(Debug, Default, Serialize)]
pub struct ContainerStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub blockio: BlkioStats,
    pub filesystem: FilesystemStats,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    /// Cpu time consumed by tasks in total, in nanoseconds.
    pub usage_ns: u64,
    /// Cpu time consumed in user mode, in scheduler ticks.
    pub user: u64,
    /// Cpu time consumed in kernel mode, in scheduler ticks.
    pub system: u64,
    pub throttling: CpuThrottling,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct CpuThrottling {
    /// Number of enforcement intervals that have elapsed.
    pub periods: u64,
    /// Number of intervals in which tasks exhausted their quota.
    pub throttled_periods: u64,
    /// Total time tasks have been throttled, in nanoseconds.
    pub throttled_time_ns: u64,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub usage_bytes: u64,
    pub max_usage_bytes: u64,
    /// Number of times usage hit the limit.
    pub fail_count: u64,
    pub limit_bytes: i64,
    /// Detailed counters from `memory.stat`; only read for full queries.
    pub stat: HashMap<String, u64>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlkioStats {
    /// I/O operations performed, summed over devices.
    pub serviced_total: u64,
    /// Bytes transferred, summed over devices.
    pub service_bytes_total: u64,
    /// Per-device operation counts; only read for full queries.
    pub serviced: Vec<BlkioDeviceStat>,
    /// Per-device byte counts; only read for full queries.
    pub service_bytes: Vec<BlkioDeviceStat>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct BlkioDeviceStat {
    pub major: u64,
    pub minor: u64,
    pub op: String,
    pub value: u64,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct FilesystemStats {
    pub fd_usage: u64,
    pub fd_fail_count: u64,
}

/// Parses `key value` lines the way several control files report counters
/// (`memory.stat`, `cpuacct.stat`, `cpu.stat`).
pub(crate) fn parse_flat_keyed_data(content: &str, path: &Path) -> Result<HashMap<String, u64>> {
    let mut data = HashMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (key, value) = match (fields.next(), fields.next()) {
            (Some(key), Some(value)) => (key, value),
            _ => continue,
        };
        let value: u64 = value.parse().map_err(|_| {
            Error::failed_precondition(format!(
                "malformed entry \"{line}\" in {}",
                path.display()
            ))
        })?;
        data.insert(key.to_string(), value);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_flat_keyed_data() {
        let content = "cache 1024\nrss 4096\nmapped_file 0\n";
        let data = parse_flat_keyed_data(content, Path::new("memory.stat")).unwrap();
        assert_eq!(data["cache"], 1024);
        assert_eq!(data["rss"], 4096);
        assert_eq!(data["mapped_file"], 0);
    }

    #[test]
    fn test_parse_flat_keyed_data_malformed() {
        let err =
            parse_flat_keyed_data("cache lots\n", Path::new("memory.stat")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert!(err.message().contains("cache lots"));
    }
}
