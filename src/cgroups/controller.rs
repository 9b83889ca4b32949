//! A handle for one `(hierarchy, cgroup path)` pair.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use super::CgroupHierarchy;
use crate::common::{
    self, CGROUP_CHILDREN_LIMIT, CGROUP_CLONE_CHILDREN, CGROUP_PROCS, CGROUP_TASKS,
};
use crate::error::{Error, Result};
use crate::kernel::KernelOps;
use crate::notifications::{EventCallback, EventFdNotifications, Handle};
use crate::spec_types::{CgroupVirtualRoot, MachineSpec};

/// Controls a single cgroup directory. Controllers for unowned hierarchies
/// (attach-only, or co-mounted behind another hierarchy) silently skip every
/// mutating operation; reads stay valid.
pub struct CgroupController {
    hierarchy: CgroupHierarchy,
    /// Path of the cgroup within its hierarchy (the container name, for
    /// most hierarchies).
    hierarchy_path: String,
    /// Absolute filesystem path of the cgroup directory.
    cgroup_path: PathBuf,
    owns_cgroup: bool,
    kernel: Arc<dyn KernelOps>,
    notifications: Arc<EventFdNotifications>,
}

impl CgroupController {
    pub(crate) fn new(
        hierarchy: CgroupHierarchy,
        hierarchy_path: String,
        cgroup_path: PathBuf,
        owns_cgroup: bool,
        kernel: Arc<dyn KernelOps>,
        notifications: Arc<EventFdNotifications>,
    ) -> Self {
        Self {
            hierarchy,
            hierarchy_path,
            cgroup_path,
            owns_cgroup,
            kernel,
            notifications,
        }
    }

    pub fn hierarchy(&self) -> CgroupHierarchy {
        self.hierarchy
    }

    pub fn cgroup_path(&self) -> &Path {
        &self.cgroup_path
    }

    pub fn owns_cgroup(&self) -> bool {
        self.owns_cgroup
    }

    /// Removes the cgroup directory. The directory must hold no child
    /// cgroups and no tasks. Consumes the controller: a destroyed cgroup
    /// cannot be operated on.
    pub fn destroy(self) -> Result<()> {
        if !self.owns_cgroup {
            return Ok(());
        }

        tracing::debug!(cgroup = %self.cgroup_path.display(), "destroying cgroup");

        // Child cgroups show up as directories; control files are removed
        // by the kernel together with the directory.
        if let Some(child) = self.child_directories()?.first() {
            return Err(Error::failed_precondition(format!(
                "cgroup {} is not empty: contains \"{child}\"",
                self.cgroup_path.display()
            )));
        }

        // On cgroupfs control files cannot be unlinked and vanish with the
        // directory; on other filesystems they have to go first.
        if let Ok(entries) = fs::read_dir(&self.cgroup_path) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }

        fs::remove_dir(&self.cgroup_path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!(
                "cgroup {} does not exist",
                self.cgroup_path.display()
            )),
            _ => Error::failed_precondition(format!(
                "failed to remove cgroup {}: {err}",
                self.cgroup_path.display()
            )),
        })
    }

    /// Moves a task into this cgroup. A tid of 0 moves the calling task.
    pub fn enter(&self, tid: Pid) -> Result<()> {
        if !self.owns_cgroup {
            return Ok(());
        }
        common::write_control_file(self.cgroup_path.join(CGROUP_TASKS), tid.as_raw())?;
        Ok(())
    }

    /// Transfers ownership of the cgroup directory and its tasks file so the
    /// delegate may enter tasks and create children. A `None` uid or gid
    /// leaves that half unchanged.
    pub fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        if !self.owns_cgroup || (uid.is_none() && gid.is_none()) {
            return Ok(());
        }

        for path in [self.cgroup_path.clone(), self.cgroup_path.join(CGROUP_TASKS)] {
            self.kernel.chown(&path, uid, gid).map_err(|err| {
                Error::failed_precondition(format!(
                    "failed to change ownership of {}: {err}",
                    path.display()
                ))
            })?;
        }
        Ok(())
    }

    pub fn get_processes(&self) -> Result<Vec<Pid>> {
        self.read_task_ids(CGROUP_PROCS)
    }

    pub fn get_threads(&self) -> Result<Vec<Pid>> {
        self.read_task_ids(CGROUP_TASKS)
    }

    fn read_task_ids(&self, file: &str) -> Result<Vec<Pid>> {
        let contents = self.get_param_string(file)?;
        let mut tasks = Vec::new();
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let tid: i32 = line.parse().map_err(|_| {
                Error::failed_precondition(format!(
                    "malformed task id \"{line}\" in {}",
                    self.cgroup_path.join(file).display()
                ))
            })?;
            tasks.push(Pid::from_raw(tid));
        }
        Ok(tasks)
    }

    /// Lists the bare names of the immediate child cgroups.
    pub fn get_subcontainers(&self) -> Result<Vec<String>> {
        let mut children = self.child_directories()?;
        children.sort();
        Ok(children)
    }

    fn child_directories(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.cgroup_path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!(
                "cgroup {} does not exist",
                self.cgroup_path.display()
            )),
            _ => Error::failed_precondition(format!(
                "failed to list cgroup {}: {err}",
                self.cgroup_path.display()
            )),
        })?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::failed_precondition(format!(
                    "failed to list cgroup {}: {err}",
                    self.cgroup_path.display()
                ))
            })?;
            if entry.path().is_dir() {
                children.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(children)
    }

    pub fn set_param_string(&self, file: &str, value: &str) -> Result<()> {
        common::write_control_file(self.cgroup_path.join(file), value)?;
        Ok(())
    }

    pub fn set_param_int(&self, file: &str, value: i64) -> Result<()> {
        common::write_control_file(self.cgroup_path.join(file), value)?;
        Ok(())
    }

    pub fn set_param_bool(&self, file: &str, value: bool) -> Result<()> {
        self.set_param_string(file, if value { "1" } else { "0" })
    }

    pub fn get_param_string(&self, file: &str) -> Result<String> {
        let path = self.cgroup_path.join(file);
        if !path.exists() {
            return Err(Error::not_found(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(common::read_control_file(path)?)
    }

    pub fn get_param_lines(&self, file: &str) -> Result<Vec<String>> {
        Ok(self
            .get_param_string(file)?
            .lines()
            .map(String::from)
            .collect())
    }

    pub fn get_param_int(&self, file: &str) -> Result<i64> {
        let contents = self.get_param_string(file)?;
        contents.trim().parse().map_err(|_| {
            Error::failed_precondition(format!(
                "failed to parse \"{}\" from {} as an integer",
                contents.trim(),
                self.cgroup_path.join(file).display()
            ))
        })
    }

    pub fn get_param_bool(&self, file: &str) -> Result<bool> {
        match self.get_param_int(file)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::out_of_range(format!(
                "expected 0 or 1 in {}, found {other}",
                self.cgroup_path.join(file).display()
            ))),
        }
    }

    /// Makes child cgroups inherit this cgroup's configuration on creation.
    pub fn enable_clone_children(&self) -> Result<()> {
        if !self.owns_cgroup {
            return Ok(());
        }
        self.set_param_bool(CGROUP_CLONE_CHILDREN, true)
    }

    pub fn disable_clone_children(&self) -> Result<()> {
        if !self.owns_cgroup {
            return Ok(());
        }
        self.set_param_bool(CGROUP_CLONE_CHILDREN, false)
    }

    pub fn set_children_limit(&self, limit: i64) -> Result<()> {
        if !self.owns_cgroup {
            return Ok(());
        }
        self.set_param_int(CGROUP_CHILDREN_LIMIT, limit)
    }

    pub fn get_children_limit(&self) -> Result<i64> {
        self.get_param_int(CGROUP_CHILDREN_LIMIT)
    }

    /// Registers an eventfd notification against one of this cgroup's
    /// control files.
    pub fn register_notification(
        &self,
        cgroup_file: &str,
        args: &str,
        callback: EventCallback,
    ) -> Result<Handle> {
        self.notifications
            .register(&self.cgroup_path, cgroup_file, args, callback)
    }

    pub fn populate_machine_spec(&self, spec: &mut MachineSpec) {
        spec.virtual_roots.push(CgroupVirtualRoot {
            hierarchy: self.hierarchy,
            root: self.hierarchy_path.clone(),
        });
    }
}
