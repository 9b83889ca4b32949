//! Device resource: access rules over the devices hierarchy.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{
    ContainerSpec, DeviceRule, DeviceSpec, EventSpec, MachineSpec, StatsType, UpdatePolicy,
};
use crate::stats::ContainerStats;

const DEVICES_ALLOW: &str = "devices.allow";
const DEVICES_DENY: &str = "devices.deny";
const DEVICES_LIST: &str = "devices.list";

pub struct DeviceHandlerFactory {
    controllers: ControllerFactory,
}

impl DeviceHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::Devices) {
            return Err(Error::not_found(
                "device resource depends on the devices cgroup hierarchy",
            ));
        }
        Ok(Self {
            controllers: ControllerFactory::new(CgroupHierarchy::Devices, cgroups, notifications),
        })
    }
}

impl ResourceHandlerFactory for DeviceHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Device
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.create(container_name)?;
        let mut handler = DeviceHandler {
            container_name: container_name.to_string(),
            controller,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, DeviceHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.get(container_name)?;
        Ok(Box::new(DeviceHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }
}

pub struct DeviceHandler {
    container_name: String,
    controller: CgroupController,
}

impl DeviceHandler {
    fn validate(spec: &DeviceSpec) -> Result<()> {
        for rule in &spec.rules {
            if rule.entry.trim().is_empty() {
                return Err(Error::invalid_argument("empty device cgroup entry"));
            }
        }
        Ok(())
    }

    fn apply(&self, spec: &DeviceSpec) -> Result<()> {
        for rule in &spec.rules {
            let file = if rule.allow { DEVICES_ALLOW } else { DEVICES_DENY };
            self.controller.set_param_string(file, &rule.entry)?;
        }
        Ok(())
    }

    fn teardown(self) -> Result<()> {
        self.controller.destroy()
    }
}

impl ResourceHandler for DeviceHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Device
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, _policy: UpdatePolicy) -> Result<()> {
        // Device rules are imperative writes; there is no current state to
        // merge with, so both policies validate the full rule list and then
        // apply it in order.
        let provided = spec.device.clone().unwrap_or_default();
        Self::validate(&provided)?;
        self.apply(&provided)
    }

    fn stats(&self, _stats_type: StatsType, _output: &mut ContainerStats) -> Result<()> {
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        let rules = self
            .controller
            .get_param_lines(DEVICES_LIST)?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(|entry| DeviceRule { allow: true, entry })
            .collect();
        output.device = Some(DeviceSpec { rules });
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
        (*self).teardown()
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
    use crate::error::ErrorKind;
    use crate::kernel::{KernelOps, TestKernelOps};
    use crate::notifications::ActiveNotifications;
    use crate::test_util::set_fixture;

    fn make_factory(tmp: &Path) -> DeviceHandlerFactory {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        fs::create_dir_all(tmp.join("devices")).unwrap();
        let cgroups = Arc::new(CgroupFactory::from_mounts(
            &[(CgroupHierarchy::Devices, tmp.join("devices"))],
            Arc::clone(&kernel),
        ));
        let notifications = Arc::new(
            EventFdNotifications::new(Arc::new(ActiveNotifications::default()), kernel).unwrap(),
        );
        DeviceHandlerFactory::new(cgroups, notifications).unwrap()
    }

    #[test]
    fn test_update_applies_rules_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("devices/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, DEVICES_ALLOW, "").unwrap();
        set_fixture(&dir, DEVICES_DENY, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            device: Some(DeviceSpec {
                rules: vec![
                    DeviceRule {
                        allow: false,
                        entry: "a *:* rwm".into(),
                    },
                    DeviceRule {
                        allow: true,
                        entry: "c 1:3 rwm".into(),
                    },
                ],
            }),
            ..Default::default()
        };
        handler.update(&spec, UpdatePolicy::Replace).unwrap();

        assert_eq!(fs::read_to_string(dir.join(DEVICES_DENY)).unwrap(), "a *:* rwm");
        assert_eq!(fs::read_to_string(dir.join(DEVICES_ALLOW)).unwrap(), "c 1:3 rwm");
    }

    #[test]
    fn test_update_rejects_empty_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        fs::create_dir_all(tmp.path().join("devices/test")).unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            device: Some(DeviceSpec {
                rules: vec![DeviceRule {
                    allow: true,
                    entry: "  ".into(),
                }],
            }),
            ..Default::default()
        };
        let err = handler.update(&spec, UpdatePolicy::Replace).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_update_validates_all_rules_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("devices/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, DEVICES_ALLOW, "").unwrap();
        set_fixture(&dir, DEVICES_DENY, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            device: Some(DeviceSpec {
                rules: vec![
                    DeviceRule {
                        allow: true,
                        entry: "c 1:3 rwm".into(),
                    },
                    DeviceRule {
                        allow: false,
                        entry: "  ".into(),
                    },
                ],
            }),
            ..Default::default()
        };
        let err = handler.update(&spec, UpdatePolicy::Diff).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The bad rule was caught before any rule was written.
        assert_eq!(fs::read_to_string(dir.join(DEVICES_ALLOW)).unwrap(), "");
        assert_eq!(fs::read_to_string(dir.join(DEVICES_DENY)).unwrap(), "");
    }

    #[test]
    fn test_spec_reads_device_list() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path());
        let dir = tmp.path().join("devices/test");
        fs::create_dir_all(&dir).unwrap();
        set_fixture(&dir, DEVICES_LIST, "c 1:3 rwm\nc 1:5 rwm\n").unwrap();

        let handler = factory.get("/test").unwrap();
        let mut spec = ContainerSpec::default();
        handler.spec(&mut spec).unwrap();
        let device = spec.device.unwrap();
        assert_eq!(device.rules.len(), 2);
        assert!(device.rules.iter().all(|rule| rule.allow));
        assert_eq!(device.rules[0].entry, "c 1:3 rwm");
    }
}
