//! Declarative records exchanged with the API: container specifications,
//! machine initialization, run requests, and the policy flags the operations
//! take.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cgroups::CgroupHierarchy;

/// Declarative description of a container. Every resource section is
/// optional; only the sections present cause the matching resource handler
/// to participate in an operation.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Delegate ownership of all cgroups to this uid.
    pub owner: Option<u32>,
    /// Delegate group ownership of all cgroups to this gid.
    pub owner_group: Option<u32>,
    /// Cap on the number of nested child containers, where supported.
    pub children_limit: Option<i64>,
    pub cpu: Option<CpuSpec>,
    pub memory: Option<MemorySpec>,
    pub blockio: Option<BlockIoSpec>,
    pub network: Option<NetworkSpec>,
    pub monitoring: Option<MonitoringSpec>,
    pub filesystem: Option<FilesystemSpec>,
    pub device: Option<DeviceSpec>,
    /// Requests a namespace scope for the container.
    pub virtual_host: Option<VirtualHostSpec>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSpec {
    /// Relative share of cpu time (`cpu.shares`).
    pub shares: Option<u64>,
    /// Bandwidth enforcement period in microseconds (`cpu.cfs_period_us`).
    pub period_us: Option<u64>,
    /// Bandwidth limit per period in microseconds; -1 is unlimited
    /// (`cpu.cfs_quota_us`).
    pub quota_us: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpec {
    /// Hard limit in bytes; -1 is unlimited (`memory.limit_in_bytes`).
    pub limit_bytes: Option<i64>,
    /// Soft reservation in bytes; -1 is none (`memory.soft_limit_in_bytes`).
    pub reservation_bytes: Option<i64>,
    /// Swap aggressiveness, 0-100 (`memory.swappiness`).
    pub swappiness: Option<u64>,
    /// Disables the kernel OOM killer for this container.
    pub oom_killer_disabled: Option<bool>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIoSpec {
    /// Default proportional weight, 10-1000 (`blkio.weight`).
    pub weight: Option<u64>,
    /// Per-device weight overrides (`blkio.weight_device`).
    pub device_weights: Vec<DeviceWeight>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceWeight {
    pub major: u64,
    pub minor: u64,
    pub weight: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Traffic classifier id (`net_cls.classid`).
    pub class_id: Option<u32>,
    /// Per-interface priorities (`net_prio.ifpriomap`).
    pub interface_priorities: Vec<InterfacePriority>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacePriority {
    pub interface: String,
    pub priority: u32,
}

/// Attaches the container to the monitoring (perf_event) hierarchy. The
/// hierarchy carries no tunables; presence of the section is the request.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSpec {}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    /// Cap on open file descriptors; -1 is unlimited (`rlimit.fd_limit`).
    pub fd_limit: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Access rules, applied in order.
    pub rules: Vec<DeviceRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Whether the entry is written to `devices.allow` or `devices.deny`.
    pub allow: bool,
    /// Device cgroup entry, e.g. `c 1:3 rwm`.
    pub entry: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHostSpec {
    pub hostname: Option<String>,
}

/// How `update` treats fields absent from the provided spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePolicy {
    /// Per-field merge: missing fields keep their current values.
    Diff,
    /// Full re-specification: missing fields revert to resource defaults.
    Replace,
}

/// Whether listings cover only the container itself or its whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListPolicy {
    SelfOnly,
    Recursive,
}

/// How much of the statistics surface a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsType {
    Summary,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdPolicy {
    Inherit,
    Detached,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub fd_policy: Option<FdPolicy>,
}

/// Kernel events a notification can be registered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSpec {
    /// The container ran out of memory.
    OutOfMemory,
    /// Memory usage crossed the given threshold.
    MemoryThreshold { usage_bytes: u64 },
}

/// Machine initialization parameters: which hierarchies to mount and where.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSpec {
    pub cgroup_mounts: Vec<CgroupMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupMount {
    pub mount_path: PathBuf,
    /// Hierarchies co-mounted at this path.
    pub hierarchies: Vec<CgroupHierarchy>,
}

/// Passive record of the observed cgroup layout, populated by factories and
/// controllers and consumed when setting up namespace scopes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub cgroup_mounts: Vec<CgroupMountPoint>,
    pub virtual_roots: Vec<CgroupVirtualRoot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupMountPoint {
    pub hierarchy: CgroupHierarchy,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupVirtualRoot {
    pub hierarchy: CgroupHierarchy,
    /// Path of the container's cgroup within the hierarchy.
    pub root: String,
}
