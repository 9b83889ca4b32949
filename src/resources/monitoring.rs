//! Monitoring resource: attaches containers to the perf_event hierarchy so
//! profiling tools can account them.
//!
//! The perf_event hierarchy is flat: every container lands directly under
//! the hierarchy root under its base name, regardless of nesting.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{ContainerSpec, EventSpec, MachineSpec, StatsType, UpdatePolicy};
use crate::stats::ContainerStats;

/// Maps a nested container name onto the flat perf_event namespace.
fn flat_container_name(container_name: &str) -> String {
    match container_name.rsplit('/').next() {
        Some(base) if !base.is_empty() => format!("/{base}"),
        _ => "/".to_string(),
    }
}

pub struct MonitoringHandlerFactory {
    controllers: ControllerFactory,
}

impl MonitoringHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::PerfEvent) {
            return Err(Error::not_found(
                "monitoring resource depends on the perf_event cgroup hierarchy",
            ));
        }
        Ok(Self {
            controllers: ControllerFactory::new(CgroupHierarchy::PerfEvent, cgroups, notifications),
        })
    }
}

impl ResourceHandlerFactory for MonitoringHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Monitoring
    }

    fn create(
        &self,
        container_name: &str,
        _spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.create(&flat_container_name(container_name))?;
        Ok(Box::new(MonitoringHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.get(&flat_container_name(container_name))?;
        Ok(Box::new(MonitoringHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }
}

pub struct MonitoringHandler {
    container_name: String,
    controller: CgroupController,
}

impl ResourceHandler for MonitoringHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Monitoring
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, _spec: &ContainerSpec, _policy: UpdatePolicy) -> Result<()> {
        // Attachment is the whole configuration.
        Ok(())
    }

    fn stats(&self, _stats_type: StatsType, _output: &mut ContainerStats) -> Result<()> {
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        output.monitoring = Some(Default::default());
        Ok(())
    }

    fn enter(&self, tids: &[Pid]) -> Result<()> {
        for tid in tids {
            self.controller.enter(*tid)?;
        }
        Ok(())
    }

    fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.controller.delegate(uid, gid)
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        self.controller.destroy()
    }

    fn register_notification(
        &self,
        _event: &EventSpec,
        _callback: EventCallback,
    ) -> Result<Handle> {
        Err(no_handled_event())
    }

    fn populate_machine_spec(&self, spec: &mut MachineSpec) -> Result<()> {
        self.controller.populate_machine_spec(spec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::kernel::{KernelOps, TestKernelOps};
    use crate::notifications::ActiveNotifications;

    fn make_factory(tmp: &Path) -> MonitoringHandlerFactory {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        fs::create_dir_all(tmp.join("perf_event")).unwrap();
        let cgroups = Arc::new(CgroupFactory::from_mounts(
            &[(CgroupHierarchy::PerfEvent, tmp.join("perf_event"))],
            Arc::clone(&kernel),
        ));
        let notifications = Arc::new(
            EventFdNotifications::new(Arc::new(ActiveNotifications::default()), kernel).unwrap(),
        );
        MonitoringHandlerFactory::new(cgroups, notifications).unwrap()
    }

    #[test]
    fn test_flat_container_name() {
        assert_eq!(flat_container_name("/a/b/c"), "/c");
        assert_eq!(flat_container_name("/test"), "/test");
        assert_eq!(flat_container_name("/"), "/");
    }

    #[test]
    fn test_create_uses_flat_name() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());

        let handler = factory
            .create("/parent/child", &ContainerSpec::default())
            .unwrap();
        assert_eq!(handler.container_name(), "/parent/child");
        // The cgroup lands directly under the hierarchy root.
        assert!(tmp.path().join("perf_event/child").is_dir());
        assert!(!tmp.path().join("perf_event/parent").exists());
    }

    #[test]
    fn test_get_resolves_flat_name() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        fs::create_dir_all(tmp.path().join("perf_event/child")).unwrap();

        factory.get("/parent/child").unwrap();
    }
}
