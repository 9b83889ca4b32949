//! Network resource: traffic classification over net_cls and per-interface
//! priorities over net_prio.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{
    ContainerSpec, EventSpec, InterfacePriority, MachineSpec, NetworkSpec, StatsType, UpdatePolicy,
};
use crate::stats::ContainerStats;

const NET_CLS_CLASSID: &str = "net_cls.classid";
const NET_PRIO_IFPRIOMAP: &str = "net_prio.ifpriomap";

pub struct NetworkHandlerFactory {
    net_cls: ControllerFactory,
    net_prio: Option<ControllerFactory>,
}

impl NetworkHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::NetCls) {
            return Err(Error::not_found(
                "network resource depends on the net_cls cgroup hierarchy",
            ));
        }
        let net_prio = cgroups.is_mounted(CgroupHierarchy::NetPrio).then(|| {
            ControllerFactory::new(
                CgroupHierarchy::NetPrio,
                Arc::clone(&cgroups),
                Arc::clone(&notifications),
            )
        });
        Ok(Self {
            net_cls: ControllerFactory::new(CgroupHierarchy::NetCls, cgroups, notifications),
            net_prio,
        })
    }
}

impl ResourceHandlerFactory for NetworkHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let net_cls = self.net_cls.create(container_name)?;
        let net_prio = match &self.net_prio {
            Some(factory) => match factory.create(container_name) {
                Ok(controller) => Some(controller),
                Err(err) => {
                    return Err(undo_create(net_cls, CgroupController::destroy, err));
                }
            },
            None => None,
        };

        let mut handler = NetworkHandler {
            container_name: container_name.to_string(),
            net_cls,
            net_prio,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, NetworkHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let net_cls = self.net_cls.get(container_name)?;
        let net_prio = match &self.net_prio {
            Some(factory) => Some(factory.get(container_name)?),
            None => None,
        };
        Ok(Box::new(NetworkHandler {
            container_name: container_name.to_string(),
            net_cls,
            net_prio,
        }))
    }
}

pub struct NetworkHandler {
    container_name: String,
    net_cls: CgroupController,
    net_prio: Option<CgroupController>,
}

impl NetworkHandler {
    fn fill_from_current(&self, mut spec: NetworkSpec) -> Result<NetworkSpec> {
        if spec.class_id.is_none() {
            spec.class_id = Some(self.net_cls.get_param_int(NET_CLS_CLASSID)? as u32);
        }
        Ok(spec)
    }

    fn fill_defaults(mut spec: NetworkSpec) -> NetworkSpec {
        spec.class_id.get_or_insert(0);
        spec
    }

    fn apply(&self, spec: &NetworkSpec) -> Result<()> {
        if let Some(class_id) = spec.class_id {
            self.net_cls
                .set_param_int(NET_CLS_CLASSID, class_id as i64)?;
        }
        if spec.interface_priorities.is_empty() {
            return Ok(());
        }
        let net_prio = self.net_prio.as_ref().ok_or_else(|| {
            Error::failed_precondition(
                "interface priorities require the net_prio cgroup hierarchy, which is not mounted",
            )
        })?;
        for priority in &spec.interface_priorities {
            net_prio.set_param_string(
                NET_PRIO_IFPRIOMAP,
                &format!("{} {}", priority.interface, priority.priority),
            )?;
        }
        Ok(())
    }

    fn teardown(self) -> Result<()> {
        if let Some(net_prio) = self.net_prio {
            net_prio.destroy()?;
        }
        self.net_cls.destroy()
    }
}

impl ResourceHandler for NetworkHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let provided = spec.network.clone().unwrap_or_default();
        let full = match policy {
            UpdatePolicy::Diff => self.fill_from_current(provided.clone())?,
            UpdatePolicy::Replace => Self::fill_defaults(provided.clone()),
        };

        match policy {
            UpdatePolicy::Diff => self.apply(&provided),
            UpdatePolicy::Replace => self.apply(&full),
        }
    }

    fn stats(&self, _stats_type: StatsType, _output: &mut ContainerStats) -> Result<()> {
        // The network hierarchies expose no usage counters.
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        let mut interface_priorities = Vec::new();
        if let Some(net_prio) = &self.net_prio {
            for line in net_prio.get_param_lines(NET_PRIO_IFPRIOMAP)? {
                let mut fields = line.split_whitespace();
                if let (Some(interface), Some(priority)) = (fields.next(), fields.next()) {
                    interface_priorities.push(InterfacePriority {
                        interface: interface.to_string(),
                        priority: priority.parse().map_err(|_| {
                            Error::failed_precondition(format!(
                                "malformed entry \"{line}\" in {NET_PRIO_IFPRIOMAP}"
                            ))
                        })?,
                    });
                }
            }
        }
        output.network = Some(NetworkSpec {
            class_id: Some(self.net_cls.get_param_int(NET_CLS_CLASSID)? as u32),
            interface_priorities,
        });
        Ok(())
    }

    fn enter(&self, tids: &[Pid]) -> Result<()> {
        for tid in tids {
            self.net_cls.enter(*tid)?;
            if let Some(net_prio) = &self.net_prio {
                net_prio.enter(*tid)?;
            }
        }
        Ok(())
    }

    fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.net_cls.delegate(uid, gid)?;
        if let Some(net_prio) = &self.net_prio {
            net_prio.delegate(uid, gid)?;
        }
        Ok(())
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
        self.net_cls.populate_machine_spec(spec);
        if let Some(net_prio) = &self.net_prio {
            net_prio.populate_machine_spec(spec);
        }
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

    fn make_factory(tmp: &Path, with_net_prio: bool) -> NetworkHandlerFactory {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        let mut mounts = vec![(CgroupHierarchy::NetCls, tmp.join("net_cls"))];
        if with_net_prio {
            mounts.push((CgroupHierarchy::NetPrio, tmp.join("net_prio")));
        }
        for (_, path) in &mounts {
            fs::create_dir_all(path).unwrap();
        }
        let cgroups = Arc::new(CgroupFactory::from_mounts(&mounts, Arc::clone(&kernel)));
        let notifications = Arc::new(
            EventFdNotifications::new(Arc::new(ActiveNotifications::default()), kernel).unwrap(),
        );
        NetworkHandlerFactory::new(cgroups, notifications).unwrap()
    }

    #[test]
    fn test_update_writes_classid_and_priorities() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path(), true);
        let cls_dir = tmp.path().join("net_cls/test");
        let prio_dir = tmp.path().join("net_prio/test");
        fs::create_dir_all(&cls_dir).unwrap();
        fs::create_dir_all(&prio_dir).unwrap();
        set_fixture(&cls_dir, NET_CLS_CLASSID, "").unwrap();
        set_fixture(&prio_dir, NET_PRIO_IFPRIOMAP, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            network: Some(NetworkSpec {
                class_id: Some(0x100001),
                interface_priorities: vec![InterfacePriority {
                    interface: "eth0".into(),
                    priority: 5,
                }],
            }),
            ..Default::default()
        };
        handler.update(&spec, UpdatePolicy::Diff).unwrap();

        assert_eq!(
            fs::read_to_string(cls_dir.join(NET_CLS_CLASSID)).unwrap(),
            format!("{}", 0x100001)
        );
        assert_eq!(
            fs::read_to_string(prio_dir.join(NET_PRIO_IFPRIOMAP)).unwrap(),
            "eth0 5"
        );
    }

    #[test]
    fn test_priorities_without_net_prio_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path(), false);
        let cls_dir = tmp.path().join("net_cls/test");
        fs::create_dir_all(&cls_dir).unwrap();
        set_fixture(&cls_dir, NET_CLS_CLASSID, "").unwrap();

        let mut handler = factory.get("/test").unwrap();
        let spec = ContainerSpec {
            network: Some(NetworkSpec {
                class_id: None,
                interface_priorities: vec![InterfacePriority {
                    interface: "eth0".into(),
                    priority: 5,
                }],
            }),
            ..Default::default()
        };
        let err = handler.update(&spec, UpdatePolicy::Diff).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn test_spec_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = make_factory(tmp.path(), true);
        let cls_dir = tmp.path().join("net_cls/test");
        let prio_dir = tmp.path().join("net_prio/test");
        fs::create_dir_all(&cls_dir).unwrap();
        fs::create_dir_all(&prio_dir).unwrap();
        set_fixture(&cls_dir, NET_CLS_CLASSID, "1048577").unwrap();
        set_fixture(&prio_dir, NET_PRIO_IFPRIOMAP, "lo 0\neth0 5\n").unwrap();

        let handler = factory.get("/test").unwrap();
        let mut spec = ContainerSpec::default();
        handler.spec(&mut spec).unwrap();
        let network = spec.network.unwrap();
        assert_eq!(network.class_id, Some(1048577));
        assert_eq!(network.interface_priorities.len(), 2);
        assert_eq!(network.interface_priorities[1].interface, "eth0");
        assert_eq!(network.interface_priorities[1].priority, 5);
    }
}
