//! Cpu resource: proportional shares and bandwidth limits over the cpu
//! hierarchy, usage accounting over cpuacct.

use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::{no_handled_event, undo_create, ResourceHandler, ResourceHandlerFactory, ResourceKind};
use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{ContainerSpec, CpuSpec, EventSpec, MachineSpec, StatsType, UpdatePolicy};
use crate::stats::{self, ContainerStats};

const CPU_SHARES: &str = "cpu.shares";
const CPU_CFS_PERIOD: &str = "cpu.cfs_period_us";
const CPU_CFS_QUOTA: &str = "cpu.cfs_quota_us";
// Throttling counters.
const CPU_STAT: &str = "cpu.stat";
// Total cpu time consumed, in nanoseconds.
const CPUACCT_USAGE: &str = "cpuacct.usage";
// User/system split, in scheduler ticks.
const CPUACCT_STAT: &str = "cpuacct.stat";

const DEFAULT_SHARES: u64 = 1024;
const DEFAULT_PERIOD_US: u64 = 100_000;
const QUOTA_UNLIMITED: i64 = -1;
// The kernel rejects shares below 2.
const MIN_SHARES: u64 = 2;

pub struct CpuHandlerFactory {
    cpu: ControllerFactory,
    cpuacct: Option<ControllerFactory>,
}

impl CpuHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        if !cgroups.is_mounted(CgroupHierarchy::Cpu) {
            return Err(Error::not_found(
                "cpu resource depends on the cpu cgroup hierarchy",
            ));
        }
        let cpuacct = cgroups
            .is_mounted(CgroupHierarchy::CpuAcct)
            .then(|| {
                ControllerFactory::new(
                    CgroupHierarchy::CpuAcct,
                    Arc::clone(&cgroups),
                    Arc::clone(&notifications),
                )
            });
        Ok(Self {
            cpu: ControllerFactory::new(CgroupHierarchy::Cpu, cgroups, notifications),
            cpuacct,
        })
    }
}

impl ResourceHandlerFactory for CpuHandlerFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        let cpu = self.cpu.create(container_name)?;
        let cpuacct = match &self.cpuacct {
            Some(factory) => match factory.create(container_name) {
                Ok(controller) => Some(controller),
                Err(err) => {
                    return Err(undo_create(cpu, CgroupController::destroy, err));
                }
            },
            None => None,
        };

        let mut handler = CpuHandler {
            container_name: container_name.to_string(),
            cpu,
            cpuacct,
        };
        match handler.update(spec, UpdatePolicy::Replace) {
            Ok(()) => Ok(Box::new(handler)),
            Err(err) => Err(undo_create(handler, CpuHandler::teardown, err)),
        }
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn ResourceHandler>> {
        let cpu = self.cpu.get(container_name)?;
        let cpuacct = match &self.cpuacct {
            Some(factory) => Some(factory.get(container_name)?),
            None => None,
        };
        Ok(Box::new(CpuHandler {
            container_name: container_name.to_string(),
            cpu,
            cpuacct,
        }))
    }
}

pub struct CpuHandler {
    container_name: String,
    cpu: CgroupController,
    cpuacct: Option<CgroupController>,
}

impl CpuHandler {
    fn fill_from_current(&self, mut spec: CpuSpec) -> Result<CpuSpec> {
        if spec.shares.is_none() {
            spec.shares = Some(self.cpu.get_param_int(CPU_SHARES)? as u64);
        }
        if spec.period_us.is_none() {
            spec.period_us = Some(self.cpu.get_param_int(CPU_CFS_PERIOD)? as u64);
        }
        if spec.quota_us.is_none() {
            spec.quota_us = Some(self.cpu.get_param_int(CPU_CFS_QUOTA)?);
        }
        Ok(spec)
    }

    fn fill_defaults(mut spec: CpuSpec) -> CpuSpec {
        spec.shares.get_or_insert(DEFAULT_SHARES);
        spec.period_us.get_or_insert(DEFAULT_PERIOD_US);
        spec.quota_us.get_or_insert(QUOTA_UNLIMITED);
        spec
    }

    fn validate(spec: &CpuSpec) -> Result<()> {
        if let Some(shares) = spec.shares {
            if shares < MIN_SHARES {
                return Err(Error::invalid_argument(format!(
                    "cpu shares must be at least {MIN_SHARES}, got {shares}"
                )));
            }
        }
        if let Some(period) = spec.period_us {
            if !(1_000..=1_000_000).contains(&period) {
                return Err(Error::invalid_argument(format!(
                    "cpu period must be between 1ms and 1s, got {period}us"
                )));
            }
        }
        if let Some(quota) = spec.quota_us {
            if quota != QUOTA_UNLIMITED && quota < 1_000 {
                return Err(Error::invalid_argument(format!(
                    "cpu quota must be -1 or at least 1ms, got {quota}us"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, spec: &CpuSpec) -> Result<()> {
        if let Some(shares) = spec.shares {
            self.cpu.set_param_int(CPU_SHARES, shares as i64)?;
        }
        if let Some(period) = spec.period_us {
            self.cpu.set_param_int(CPU_CFS_PERIOD, period as i64)?;
        }
        if let Some(quota) = spec.quota_us {
            self.cpu.set_param_int(CPU_CFS_QUOTA, quota)?;
        }
        Ok(())
    }

    fn teardown(self) -> Result<()> {
        if let Some(cpuacct) = self.cpuacct {
            cpuacct.destroy()?;
        }
        self.cpu.destroy()
    }
}

impl ResourceHandler for CpuHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn update(&mut self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let provided = spec.cpu.clone().unwrap_or_default();
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
        if let Some(cpuacct) = &self.cpuacct {
            output.cpu.usage_ns = cpuacct.get_param_int(CPUACCT_USAGE)? as u64;
        }
        if stats_type == StatsType::Summary {
            return Ok(());
        }

        if let Some(cpuacct) = &self.cpuacct {
            let content = cpuacct.get_param_string(CPUACCT_STAT)?;
            let data = stats::parse_flat_keyed_data(
                &content,
                &cpuacct.cgroup_path().join(CPUACCT_STAT),
            )?;
            output.cpu.user = data.get("user").copied().unwrap_or_default();
            output.cpu.system = data.get("system").copied().unwrap_or_default();
        }

        let content = self.cpu.get_param_string(CPU_STAT)?;
        let data =
            stats::parse_flat_keyed_data(&content, &self.cpu.cgroup_path().join(CPU_STAT))?;
        output.cpu.throttling.periods = data.get("nr_periods").copied().unwrap_or_default();
        output.cpu.throttling.throttled_periods =
            data.get("nr_throttled").copied().unwrap_or_default();
        output.cpu.throttling.throttled_time_ns =
            data.get("throttled_time").copied().unwrap_or_default();
        Ok(())
    }

    fn spec(&self, output: &mut ContainerSpec) -> Result<()> {
        output.cpu = Some(CpuSpec {
            shares: Some(self.cpu.get_param_int(CPU_SHARES)? as u64),
            period_us: Some(self.cpu.get_param_int(CPU_CFS_PERIOD)? as u64),
            quota_us: Some(self.cpu.get_param_int(CPU_CFS_QUOTA)?),
        });
        Ok(())
    }

    fn enter(&self, tids: &[Pid]) -> Result<()> {
        for tid in tids {
            self.cpu.enter(*tid)?;
            if let Some(cpuacct) = &self.cpuacct {
                cpuacct.enter(*tid)?;
            }
        }
        Ok(())
    }

    fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.cpu.delegate(uid, gid)?;
        if let Some(cpuacct) = &self.cpuacct {
            cpuacct.delegate(uid, gid)?;
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
        self.cpu.populate_machine_spec(spec);
        if let Some(cpuacct) = &self.cpuacct {
            cpuacct.populate_machine_spec(spec);
        }
        Ok(())
    }
}
