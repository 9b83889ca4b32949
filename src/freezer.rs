//! Freezer controller: suspending and resuming all tasks of a container.
//!
//! On machines where the job hierarchy provides task tracking, or where the
//! freezer hierarchy is absent, a stub variant stands in: lifecycle
//! operations succeed so container creation works uniformly, while
//! freeze/unfreeze report that the feature is unavailable.

use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{Gid, Pid, Uid};

use crate::cgroups::{CgroupController, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::kernel::KernelOps;
use crate::notifications::EventFdNotifications;
use crate::spec_types::MachineSpec;

const FREEZER_STATE: &str = "freezer.state";
const FREEZER_STATE_FROZEN: &str = "FROZEN";
const FREEZER_STATE_THAWED: &str = "THAWED";
const FREEZER_STATE_FREEZING: &str = "FREEZING";

const FREEZE_RETRIES: u32 = 10;
const FREEZE_RETRY_DELAY: Duration = Duration::from_millis(10);

pub struct FreezerController {
    /// `None` is the stub: freezing is unsupported on this host.
    controller: Option<CgroupController>,
    kernel: Arc<dyn KernelOps>,
}

impl FreezerController {
    fn new(controller: CgroupController, kernel: Arc<dyn KernelOps>) -> Self {
        Self {
            controller: Some(controller),
            kernel,
        }
    }

    fn stub(kernel: Arc<dyn KernelOps>) -> Self {
        Self {
            controller: None,
            kernel,
        }
    }

    fn controller(&self) -> Result<&CgroupController> {
        self.controller.as_ref().ok_or_else(|| {
            Error::not_found("the freezer cgroup hierarchy is not available on this machine")
        })
    }

    /// Suspends every task in the container. The kernel may report FREEZING
    /// while tasks are still being stopped; the write is repeated until the
    /// cgroup settles in FROZEN.
    pub fn freeze(&self) -> Result<()> {
        let controller = self.controller()?;

        for attempt in 0..FREEZE_RETRIES {
            controller.set_param_string(FREEZER_STATE, FREEZER_STATE_FROZEN)?;
            let state = controller.get_param_string(FREEZER_STATE)?;
            match state.trim() {
                FREEZER_STATE_FROZEN => {
                    if attempt > 0 {
                        tracing::debug!("frozen after {attempt} retries");
                    }
                    return Ok(());
                }
                FREEZER_STATE_FREEZING => {
                    self.kernel.usleep(FREEZE_RETRY_DELAY);
                }
                other => {
                    // Leaving the cgroup half-frozen would wedge its tasks.
                    let _ = controller.set_param_string(FREEZER_STATE, FREEZER_STATE_THAWED);
                    return Err(Error::internal(format!(
                        "unexpected freezer state \"{other}\" while freezing {}",
                        controller.cgroup_path().display()
                    )));
                }
            }
        }

        let _ = controller.set_param_string(FREEZER_STATE, FREEZER_STATE_THAWED);
        Err(Error::internal(format!(
            "unable to freeze {}",
            controller.cgroup_path().display()
        )))
    }

    /// Resumes every task in the container.
    pub fn unfreeze(&self) -> Result<()> {
        self.controller()?
            .set_param_string(FREEZER_STATE, FREEZER_STATE_THAWED)
    }

    pub fn enter(&self, tid: Pid) -> Result<()> {
        match &self.controller {
            Some(controller) => controller.enter(tid),
            None => Ok(()),
        }
    }

    pub fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        match &self.controller {
            Some(controller) => controller.delegate(uid, gid),
            None => Ok(()),
        }
    }

    pub fn destroy(self) -> Result<()> {
        match self.controller {
            Some(controller) => controller.destroy(),
            None => Ok(()),
        }
    }

    pub fn populate_machine_spec(&self, spec: &mut MachineSpec) {
        if let Some(controller) = &self.controller {
            controller.populate_machine_spec(spec);
        }
    }
}

pub struct FreezerControllerFactory {
    /// `None` yields stub controllers.
    controllers: Option<ControllerFactory>,
    kernel: Arc<dyn KernelOps>,
}

impl FreezerControllerFactory {
    pub fn new(
        cgroups: Arc<crate::cgroups::CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Self {
        let kernel = Arc::clone(cgroups.kernel());
        Self {
            controllers: Some(ControllerFactory::new(
                CgroupHierarchy::Freezer,
                cgroups,
                notifications,
            )),
            kernel,
        }
    }

    /// A factory for hosts where freezing is unavailable or handled by the
    /// tasks hierarchy.
    pub fn stub(kernel: Arc<dyn KernelOps>) -> Self {
        Self {
            controllers: None,
            kernel,
        }
    }

    pub fn create(&self, container_name: &str) -> Result<FreezerController> {
        match &self.controllers {
            Some(factory) => Ok(FreezerController::new(
                factory.create(container_name)?,
                Arc::clone(&self.kernel),
            )),
            None => Ok(FreezerController::stub(Arc::clone(&self.kernel))),
        }
    }

    pub fn get(&self, container_name: &str) -> Result<FreezerController> {
        match &self.controllers {
            Some(factory) => Ok(FreezerController::new(
                factory.get(container_name)?,
                Arc::clone(&self.kernel),
            )),
            None => Ok(FreezerController::stub(Arc::clone(&self.kernel))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::cgroups::CgroupFactory;
    use crate::error::ErrorKind;
    use crate::kernel::TestKernelOps;
    use crate::notifications::ActiveNotifications;
    use crate::test_util::set_fixture;

    fn factory(tmp: &std::path::Path) -> FreezerControllerFactory {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        fs::create_dir_all(tmp.join("freezer")).unwrap();
        let cgroups = Arc::new(CgroupFactory::from_mounts(
            &[(CgroupHierarchy::Freezer, tmp.join("freezer"))],
            Arc::clone(&kernel),
        ));
        let notifications = Arc::new(
            EventFdNotifications::new(Arc::new(ActiveNotifications::default()), kernel).unwrap(),
        );
        FreezerControllerFactory::new(cgroups, notifications)
    }

    #[test]
    fn test_freeze_and_unfreeze() {
        let tmp = tempfile::tempdir().unwrap();
        let freezer = factory(tmp.path()).create("/test").unwrap();
        let state_path = tmp.path().join("freezer/test").join(FREEZER_STATE);
        set_fixture(&tmp.path().join("freezer/test"), FREEZER_STATE, "FROZEN").unwrap();

        freezer.freeze().unwrap();
        assert_eq!(fs::read_to_string(&state_path).unwrap(), "FROZEN");

        freezer.unfreeze().unwrap();
        assert_eq!(fs::read_to_string(&state_path).unwrap(), "THAWED");
    }

    #[test]
    fn test_freeze_missing_state_file() {
        let tmp = tempfile::tempdir().unwrap();
        let freezer = factory(tmp.path()).create("/test").unwrap();

        // The cgroup directory exists but carries no freezer.state file.
        let err = freezer.freeze().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_stub_lifecycle_succeeds_but_freeze_reports_not_found() {
        let kernel: Arc<dyn KernelOps> = Arc::new(TestKernelOps::new());
        let factory = FreezerControllerFactory::stub(kernel);
        let freezer = factory.create("/test").unwrap();

        freezer.enter(Pid::from_raw(42)).unwrap();
        freezer.delegate(Some(Uid::from_raw(2)), None).unwrap();

        let err = freezer.freeze().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = freezer.unfreeze().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        freezer.destroy().unwrap();
    }
}
