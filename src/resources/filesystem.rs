//! Filesystem resource: file-descriptor accounting and limits over the
//! rlimit hierarchy.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{
    ContainerSpec, EventSpec, FilesystemSpec, MachineSpec, StatsType, UpdatePolicy,
};
use crate::stats::ContainerStats;

const RLIMIT_FD_LIMIT: &str = "rlimit.fd_limit";
const RLIMIT_FD_USAGE: &str = "rlimit.fd_usage";
const RLIMIT_FD_FAILCNT: &str = "rlimit.fd_failcnt";

const FD_LIMIT_UNLIMITED: i64 = -1;

pub struct FilesystemHandlerFactory {
    controllers: ControllerFactory,
}

impl FilesystemHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::RLimit) {
            return Err(Error::not_found(
                "filesystem resource depends on the rlimit cgroup hierarchy",
            ));
        }
        Ok(Self {
            controllers: ControllerFactory::new(CgroupHierarchy::RLimit, cgroups, notifications),
        })
    }
}

impl ResourceHandlerFactory for FilesystemHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Filesystem
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.create(container_name)?;
        let mut handler = FilesystemHandler {
            container_name: container_name.to_string(),
            controller,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, FilesystemHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.get(container_name)?;
        Ok(Box::new(FilesystemHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }
}

pub struct FilesystemHandler {
    container_name: String,
    controller: CgroupController,
}

impl FilesystemHandler {
    fn fill_from_current(&self, mut spec: FilesystemSpec) -> Result<FilesystemSpec> {
        if spec.fd_limit.is_none() {
            spec.fd_limit = Some(self.controller.get_param_int(RLIMIT_FD_LIMIT)?);
        }
        Ok(spec)
    }

    fn fill_defaults(mut spec: FilesystemSpec) -> FilesystemSpec {
        spec.fd_limit.get_or_insert(FD_LIMIT_UNLIMITED);
        spec
    }

    fn validate(spec: &FilesystemSpec) -> Result<()> {
        if let Some(fd_limit) = spec.fd_limit {
            if fd_limit < FD_LIMIT_UNLIMITED {
                return Err(Error::invalid_argument(format!(
                    "fd limit must be -1 or non-negative, got {fd_limit}"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, spec: &FilesystemSpec) -> Result<()> {
        if let Some(fd_limit) = spec.fd_limit {
            self.controller.set_param_int(RLIMIT_FD_LIMIT, fd_limit)?;
        }
        Ok(())
    }

    fn teardown(self) -> Result<()> {
        self.controller.destroy()
    }
}

impl ResourceHandler for FilesystemHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Filesystem
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let provided = spec.filesystem.clone().unwrap_or_default();
        let full = match policy {
            UpdatePolicy::Diff => self.fill_from_current(provided.clone())?,
            UpdatePolicy::Replace => Self::fill_defaults(provided.clone()),
        };
        Self::validate(&full)?;

        match policy {
            UpdatePolicy::Diff => self.apply(&provided),
            UpdatePolicy::Replace => self.apply(&full),
        }
    }

    fn stats(&self, _stats_type: StatsType, output: &mut ContainerStats) -> Result<()> {
        output.filesystem.fd_usage = self.controller.get_param_int(RLIMIT_FD_USAGE)? as u64;
        output.filesystem.fd_fail_count =
            self.controller.get_param_int(RLIMIT_FD_FAILCNT)? as u64;
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        output.filesystem = Some(FilesystemSpec {
            fd_limit: Some(self.controller.get_param_int(RLIMIT_FD_LIMIT)?),
        });
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
