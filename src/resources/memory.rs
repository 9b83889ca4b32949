//! Memory resource: limits, reservations, swappiness, OOM policy, and the
//! memory-pressure notifications.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{
    ContainerSpec, EventSpec, MachineSpec, MemorySpec, StatsType, UpdatePolicy,
};
use crate::stats::{self, ContainerStats};

const MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const MEMORY_SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const MEMORY_SWAPPINESS: &str = "memory.swappiness";
const MEMORY_OOM_CONTROL: &str = "memory.oom_control";
const MEMORY_USAGE: &str = "memory.usage_in_bytes";
const MEMORY_MAX_USAGE: &str = "memory.max_usage_in_bytes";
const MEMORY_FAILCNT: &str = "memory.failcnt";
const MEMORY_STAT: &str = "memory.stat";

const LIMIT_UNLIMITED: i64 = -1;
const DEFAULT_SWAPPINESS: u64 = 60;
const MAX_SWAPPINESS: u64 = 100;

pub struct MemoryHandlerFactory {
    controllers: ControllerFactory,
}

impl MemoryHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::Memory) {
            return Err(Error::not_found(
                "memory resource depends on the memory cgroup hierarchy",
            ));
        }
        Ok(Self {
            controllers: ControllerFactory::new(CgroupHierarchy::Memory, cgroups, notifications),
        })
    }
}

impl ResourceHandlerFactory for MemoryHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.create(container_name)?;
        let mut handler = MemoryHandler {
            container_name: container_name.to_string(),
            controller,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, MemoryHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let controller = self.controllers.get(container_name)?;
        Ok(Box::new(MemoryHandler {
            container_name: container_name.to_string(),
            controller,
        }))
    }
}

pub struct MemoryHandler {
    container_name: String,
    controller: CgroupController,
}

impl MemoryHandler {
    fn read_oom_killer_disabled(&self) -> Result<bool> {
        // memory.oom_control reports flat keyed values, e.g.
        // "oom_kill_disable 1\nunder_oom 0".
        let content = self.controller.get_param_string(MEMORY_OOM_CONTROL)?;
        let data = stats::parse_flat_keyed_data(
            &content,
            &self.controller.cgroup_path().join(MEMORY_OOM_CONTROL),
        )?;
        Ok(data.get("oom_kill_disable").copied().unwrap_or_default() != 0)
    }

    fn fill_from_current(&self, mut spec: MemorySpec) -> Result<MemorySpec> {
        if spec.limit_bytes.is_none() {
            spec.limit_bytes = Some(self.controller.get_param_int(MEMORY_LIMIT)?);
        }
        if spec.reservation_bytes.is_none() {
            spec.reservation_bytes = Some(self.controller.get_param_int(MEMORY_SOFT_LIMIT)?);
        }
        if spec.swappiness.is_none() {
            spec.swappiness = Some(self.controller.get_param_int(MEMORY_SWAPPINESS)? as u64);
        }
        if spec.oom_killer_disabled.is_none() {
            spec.oom_killer_disabled = Some(self.read_oom_killer_disabled()?);
        }
        Ok(spec)
    }

    fn fill_defaults(mut spec: MemorySpec) -> MemorySpec {
        spec.limit_bytes.get_or_insert(LIMIT_UNLIMITED);
        spec.reservation_bytes.get_or_insert(LIMIT_UNLIMITED);
        spec.swappiness.get_or_insert(DEFAULT_SWAPPINESS);
        spec.oom_killer_disabled.get_or_insert(false);
        spec
    }

    fn validate(spec: &MemorySpec) -> Result<()> {
        if let Some(swappiness) = spec.swappiness {
            if swappiness > MAX_SWAPPINESS {
                return Err(Error::invalid_argument(format!(
                    "memory swappiness must be between 0 and {MAX_SWAPPINESS}, got {swappiness}"
                )));
            }
        }
        if let Some(limit) = spec.limit_bytes {
            if limit < LIMIT_UNLIMITED {
                return Err(Error::invalid_argument(format!(
                    "memory limit must be -1 or non-negative, got {limit}"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, spec: &MemorySpec) -> Result<()> {
        if let Some(limit) = spec.limit_bytes {
            self.controller.set_param_int(MEMORY_LIMIT, limit)?;
        }
        if let Some(reservation) = spec.reservation_bytes {
            self.controller.set_param_int(MEMORY_SOFT_LIMIT, reservation)?;
        }
        if let Some(swappiness) = spec.swappiness {
            self.controller
                .set_param_int(MEMORY_SWAPPINESS, swappiness as i64)?;
        }
        if let Some(disabled) = spec.oom_killer_disabled {
            // Writing 1 disables the kernel OOM killer.
            self.controller.set_param_bool(MEMORY_OOM_CONTROL, disabled)?;
        }
        Ok(())
    }

    fn teardown(self) -> Result<()> {
        self.controller.destroy()
    }
}

impl ResourceHandler for MemoryHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let provided = spec.memory.clone().unwrap_or_default();
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

    fn stats(&self, stats_type: StatsType, output: &mut ContainerStats) -> Result<()> {
        output.memory.usage_bytes = self.controller.get_param_int(MEMORY_USAGE)? as u64;
        output.memory.max_usage_bytes = self.controller.get_param_int(MEMORY_MAX_USAGE)? as u64;
        output.memory.fail_count = self.controller.get_param_int(MEMORY_FAILCNT)? as u64;
        output.memory.limit_bytes = self.controller.get_param_int(MEMORY_LIMIT)?;

        if stats_type == StatsType::Full {
            let content = self.controller.get_param_string(MEMORY_STAT)?;
            output.memory.stat = stats::parse_flat_keyed_data(
                &content,
                &self.controller.cgroup_path().join(MEMORY_STAT),
            )?;
        }
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        output.memory = Some(MemorySpec {
            limit_bytes: Some(self.controller.get_param_int(MEMORY_LIMIT)?),
            reservation_bytes: Some(self.controller.get_param_int(MEMORY_SOFT_LIMIT)?),
            swappiness: Some(self.controller.get_param_int(MEMORY_SWAPPINESS)? as u64),
            oom_killer_disabled: Some(self.read_oom_killer_disabled()?),
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

    fn register_notification(&self, event: &EventSpec, callback: EventCallback) -> Result<Handle> {
        match event {
            EventSpec::OutOfMemory => {
                self.controller
                    .register_notification(MEMORY_OOM_CONTROL, "", callback)
            }
            EventSpec::MemoryThreshold { usage_bytes } => self.controller.register_notification(
                MEMORY_USAGE,
                &usage_bytes.to_string(),
                callback,
            ),
        }
    }

    fn populate_machine_spec(&self, spec: &mut MachineSpec) -> Result<()> {
        self.controller.populate_machine_spec(spec);
        Ok(())
    }
}
