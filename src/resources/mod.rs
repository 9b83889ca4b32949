//! Per-resource policy appliers.
//!
//! Each resource handler owns the controllers for one resource of one
//! container and maps the declarative spec onto controller parameter
//! writes. Handlers are created through factories keyed by resource kind;
//! the container API scans the factory registry instead of dispatching over
//! a type hierarchy.

use std::fmt::Display;

use nix::unistd::{Gid, Pid, Uid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::notifications::{EventCallback, Handle};
use crate::spec_types::{ContainerSpec, EventSpec, InitSpec, MachineSpec, StatsType, UpdatePolicy};
use crate::stats::ContainerStats;

pub mod blockio;
pub mod cpu;
pub mod device;
pub mod filesystem;
pub mod memory;
pub mod monitoring;
pub mod network;

pub use blockio::BlockIoHandlerFactory;
pub use cpu::CpuHandlerFactory;
pub use device::DeviceHandlerFactory;
pub use filesystem::FilesystemHandlerFactory;
pub use memory::MemoryHandlerFactory;
pub use monitoring::MonitoringHandlerFactory;
pub use network::NetworkHandlerFactory;

/// The resources a container spec can exercise.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Memory,
    BlockIo,
    Network,
    Monitoring,
    Filesystem,
    Device,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::BlockIo => "blockio",
            ResourceKind::Network => "network",
            ResourceKind::Monitoring => "monitoring",
            ResourceKind::Filesystem => "filesystem",
            ResourceKind::Device => "device",
        };
        f.write_str(name)
    }
}

/// Applies one resource's policy for one container.
pub trait ResourceHandler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Absolute name of the container this handler is attached to. May name
    /// an ancestor when the container does not isolate the resource itself.
    fn container_name(&self) -> &str;

    /// Applies a configuration change under the given policy.
    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()>;

    /// Fills this resource's section of the stats record.
    fn stats(&self, stats_type: StatsType, output: &mut ContainerStats) -> Result<()>;

    /// Reads back the current configuration into this resource's section of
    /// the spec record.
    fn spec(&self, output: &mut ContainerSpec) -> Result<()>;

    /// Enters every tid into each owned controller. A partial failure
    /// leaves the container in an undefined intermediate state.
    fn enter(&self, tids: &[Pid]) -> Result<()>;

    fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()>;

    /// Destroys every owned controller, newest first. Consumes the handler.
    fn destroy(self: Box<Self>) -> Result<()>;

    /// Registers a notification if this resource handles the event; returns
    /// `NotFound` otherwise so the container layer can scan handlers.
    fn register_notification(&self, event: &EventSpec, callback: EventCallback)
        -> Result<Handle>;

    fn populate_machine_spec(&self, spec: &mut MachineSpec) -> Result<()>;
}

impl std::fmt::Debug for dyn ResourceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandler")
            .field("kind", &self.kind())
            .field("container_name", &self.container_name())
            .finish()
    }
}

/// Creates and attaches [`ResourceHandler`]s for one resource kind.
pub trait ResourceHandlerFactory: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Creates the resource's cgroups for a new container and applies the
    /// initial configuration. Anything created before a failure is
    /// destroyed again before the error is returned.
    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>>;

    /// Attaches to an existing container's resource. Returns `NotFound` if
    /// the container has no cgroup in this resource's hierarchy.
    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>>;

    /// Resource-specific machine initialization hook.
    fn init_machine(&self, _spec: &InitSpec) -> Result<()> {
        Ok(())
    }
}

/// Whether the spec carries a section for the given resource.
pub(crate) fn resource_in_spec(kind: ResourceKind, spec: &ContainerSpec) -> bool {
    match kind {
        ResourceKind::Cpu => spec.cpu.is_some(),
        ResourceKind::Memory => spec.memory.is_some(),
        ResourceKind::BlockIo => spec.blockio.is_some(),
        ResourceKind::Network => spec.network.is_some(),
        ResourceKind::Monitoring => spec.monitoring.is_some(),
        ResourceKind::Filesystem => spec.filesystem.is_some(),
        ResourceKind::Device => spec.device.is_some(),
    }
}

/// The uniform "this resource does not handle that event" answer.
pub(crate) fn no_handled_event() -> Error {
    Error::not_found("no handled event found")
}

/// Destroys a freshly built handler after a failed initial update, keeping
/// the original error.
pub(crate) fn undo_create<H, F>(handler: H, teardown: F, err: Error) -> Error
where
    F: FnOnce(H) -> Result<()>,
{
    if let Err(undo_err) = teardown(handler) {
        tracing::warn!("rollback of partially created resource failed: {undo_err}");
    }
    err
}
