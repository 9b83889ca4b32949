//! Cgroup hierarchy discovery and per-cgroup control.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub mod controller;
pub mod factory;

pub use controller::CgroupController;
pub use factory::{CgroupFactory, ControllerFactory};

/// The cgroup-v1 hierarchies corral can manipulate.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum CgroupHierarchy {
    Cpu,
    CpuAcct,
    CpuSet,
    Memory,
    Blkio,
    NetCls,
    NetPrio,
    PerfEvent,
    Freezer,
    Devices,
    Job,
    RLimit,
}

impl CgroupHierarchy {
    /// The subsystem name the kernel knows this hierarchy by.
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::CpuAcct => "cpuacct",
            Self::CpuSet => "cpuset",
            Self::Memory => "memory",
            Self::Blkio => "blkio",
            Self::NetCls => "net_cls",
            Self::NetPrio => "net_prio",
            Self::PerfEvent => "perf_event",
            Self::Freezer => "freezer",
            Self::Devices => "devices",
            Self::Job => "job",
            Self::RLimit => "rlimit",
        }
    }
}

impl Display for CgroupHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AsRef<str> for CgroupHierarchy {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

pub const HIERARCHIES: &[CgroupHierarchy] = &[
    CgroupHierarchy::Cpu,
    CgroupHierarchy::CpuAcct,
    CgroupHierarchy::CpuSet,
    CgroupHierarchy::Memory,
    CgroupHierarchy::Blkio,
    CgroupHierarchy::NetCls,
    CgroupHierarchy::NetPrio,
    CgroupHierarchy::PerfEvent,
    CgroupHierarchy::Freezer,
    CgroupHierarchy::Devices,
    CgroupHierarchy::Job,
    CgroupHierarchy::RLimit,
];
