//! Discovery of cgroup hierarchies and resolution of container names to
//! filesystem paths.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use nix::mount::MsFlags;
use nix::unistd::Pid;

use super::controller::CgroupController;
use super::{CgroupHierarchy, HIERARCHIES};
use crate::error::{Error, ErrorKind, Result};
use crate::kernel::KernelOps;
use crate::notifications::EventFdNotifications;
use crate::spec_types::{CgroupMount, CgroupMountPoint, MachineSpec};

#[derive(Debug, Default)]
struct MountTable {
    /// Hierarchy to mount point.
    mount_points: HashMap<CgroupHierarchy, PathBuf>,
    /// Hierarchies that own directory lifecycle at their mount point. When
    /// several hierarchies co-mount on one path, only the first registered
    /// one creates and removes directories; the rest attach to them.
    owned: Vec<CgroupHierarchy>,
}

impl MountTable {
    fn insert(&mut self, hierarchy: CgroupHierarchy, mount_point: PathBuf) {
        if self.mount_points.contains_key(&hierarchy) {
            return;
        }
        let comounted = self.mount_points.values().any(|p| *p == mount_point);
        if !comounted {
            self.owned.push(hierarchy);
        }
        self.mount_points.insert(hierarchy, mount_point);
    }
}

/// Resolves logical hierarchy identifiers to filesystem paths and answers
/// which hierarchies are available on this machine.
pub struct CgroupFactory {
    table: RwLock<MountTable>,
    kernel: Arc<dyn KernelOps>,
}

impl CgroupFactory {
    /// Auto-detects the mounted cgroup hierarchies from this process's mount
    /// namespace.
    pub fn detect(kernel: Arc<dyn KernelOps>) -> Result<Self> {
        let mountinfo = procfs::process::Process::myself()
            .and_then(|p| p.mountinfo())
            .map_err(|err| {
                Error::internal(format!("failed to read mountinfo from /proc/self: {err}"))
            })?;

        let mut table = MountTable::default();
        for mount in mountinfo.into_iter().filter(|m| m.fs_type == "cgroup") {
            // The mounted subsystems are listed in the superblock options.
            for hierarchy in HIERARCHIES {
                if mount.super_options.contains_key(hierarchy.as_ref()) {
                    table.insert(*hierarchy, mount.mount_point.clone());
                }
            }
        }

        tracing::debug!(?table, "detected cgroup hierarchies");
        Ok(Self {
            table: RwLock::new(table),
            kernel,
        })
    }

    /// Builds a factory from an explicit mount table. The first hierarchy
    /// listed for a given path owns it.
    pub fn from_mounts(
        mounts: &[(CgroupHierarchy, PathBuf)],
        kernel: Arc<dyn KernelOps>,
    ) -> Self {
        let mut table = MountTable::default();
        for (hierarchy, mount_point) in mounts {
            table.insert(*hierarchy, mount_point.clone());
        }
        Self {
            table: RwLock::new(table),
            kernel,
        }
    }

    pub fn is_mounted(&self, hierarchy: CgroupHierarchy) -> bool {
        self.table
            .read()
            .unwrap()
            .mount_points
            .contains_key(&hierarchy)
    }

    pub fn owns_cgroup(&self, hierarchy: CgroupHierarchy) -> bool {
        self.table.read().unwrap().owned.contains(&hierarchy)
    }

    pub fn hierarchy_name(&self, hierarchy: CgroupHierarchy) -> &'static str {
        hierarchy.name()
    }

    pub fn mount_point(&self, hierarchy: CgroupHierarchy) -> Result<PathBuf> {
        self.table
            .read()
            .unwrap()
            .mount_points
            .get(&hierarchy)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("cgroup hierarchy {hierarchy} is not mounted"))
            })
    }

    /// Container names are absolute and cleaned by the time they reach the
    /// factory, so mapping one under a mount point is a plain join of the
    /// name without its leading slash.
    fn cgroup_path(&self, hierarchy: CgroupHierarchy, container_name: &str) -> Result<PathBuf> {
        let mount_point = self.mount_point(hierarchy)?;
        Ok(mount_point.join(container_name.trim_start_matches('/')))
    }

    /// Returns the path of the container's existing cgroup in the hierarchy.
    pub fn get(&self, hierarchy: CgroupHierarchy, container_name: &str) -> Result<PathBuf> {
        let path = self.cgroup_path(hierarchy, container_name)?;
        if !path.is_dir() {
            return Err(Error::not_found(format!(
                "container \"{container_name}\" has no {hierarchy} cgroup at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Creates the container's cgroup directory in an owned hierarchy. For
    /// attach-only hierarchies this behaves like [`CgroupFactory::get`].
    pub fn create(&self, hierarchy: CgroupHierarchy, container_name: &str) -> Result<PathBuf> {
        if !self.owns_cgroup(hierarchy) {
            return self.get(hierarchy, container_name);
        }

        let path = self.cgroup_path(hierarchy, container_name)?;
        if path.exists() {
            return Err(Error::already_exists(format!(
                "{hierarchy} cgroup already exists at {}",
                path.display()
            )));
        }
        fs::create_dir_all(&path).map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::FailedPrecondition,
            };
            Error::new(
                kind,
                format!("failed to create cgroup at {}: {err}", path.display()),
            )
        })?;
        Ok(path)
    }

    /// Detects the cgroup a task belongs to in the given hierarchy by
    /// parsing its cgroup membership file. A tid of 0 denotes the calling
    /// task.
    pub fn detect_cgroup_path(&self, tid: Pid, hierarchy: CgroupHierarchy) -> Result<String> {
        let proc_path = if tid.as_raw() == 0 {
            PathBuf::from("/proc/self/cgroup")
        } else {
            PathBuf::from(format!("/proc/{}/cgroup", tid.as_raw()))
        };
        let contents = fs::read_to_string(&proc_path).map_err(|err| {
            Error::not_found(format!("failed to read {}: {err}", proc_path.display()))
        })?;

        find_membership(&contents, hierarchy.as_ref()).ok_or_else(|| {
            Error::not_found(format!(
                "task {} is not in any {hierarchy} cgroup",
                tid.as_raw()
            ))
        })
    }

    /// Mounts the requested hierarchies if they are not already mounted.
    /// Already-mounted hierarchies are skipped, making the call idempotent.
    pub fn mount(&self, mount: &CgroupMount) -> Result<()> {
        let missing: Vec<CgroupHierarchy> = mount
            .hierarchies
            .iter()
            .copied()
            .filter(|h| !self.is_mounted(*h))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&mount.mount_path).map_err(|err| {
            Error::failed_precondition(format!(
                "failed to create mount point {}: {err}",
                mount.mount_path.display()
            ))
        })?;

        let data = missing
            .iter()
            .map(|h| h.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.kernel
            .mount(
                Some(Path::new("cgroup")),
                &mount.mount_path,
                Some("cgroup"),
                MsFlags::empty(),
                Some(data.as_str()),
            )
            .map_err(|err| {
                Error::failed_precondition(format!(
                    "failed to mount {data} at {}: {err}",
                    mount.mount_path.display()
                ))
            })?;

        let mut table = self.table.write().unwrap();
        for hierarchy in missing {
            table.insert(hierarchy, mount.mount_path.clone());
        }
        Ok(())
    }

    /// Stamps the observed mount points into the machine spec.
    pub fn populate_machine_spec(&self, spec: &mut MachineSpec) {
        let table = self.table.read().unwrap();
        let mut mounts: Vec<_> = table
            .mount_points
            .iter()
            .map(|(hierarchy, mount_point)| CgroupMountPoint {
                hierarchy: *hierarchy,
                mount_point: mount_point.clone(),
            })
            .collect();
        mounts.sort_by_key(|m| m.hierarchy);
        spec.cgroup_mounts.extend(mounts);
    }

    pub(crate) fn kernel(&self) -> &Arc<dyn KernelOps> {
        &self.kernel
    }
}

/// Returns the cgroup path from the first membership line whose subsystem
/// list contains `subsystem`. Lines have the form
/// `<id>:<subsystems_csv>:<path>`.
fn find_membership(contents: &str, subsystem: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let subsystems = fields.next()?;
        let path = fields.next()?;
        subsystems
            .split(',')
            .any(|s| s == subsystem)
            .then(|| path.to_string())
    })
}

/// Creates [`CgroupController`]s for one hierarchy, wiring them to the
/// notification machinery.
pub struct ControllerFactory {
    hierarchy: CgroupHierarchy,
    cgroups: Arc<CgroupFactory>,
    notifications: Arc<EventFdNotifications>,
    /// Controllers attach to cgroups another owner creates and removes.
    attach_only: bool,
}

impl ControllerFactory {
    pub fn new(
        hierarchy: CgroupHierarchy,
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Self {
        Self {
            hierarchy,
            cgroups,
            notifications,
            attach_only: false,
        }
    }

    /// A factory whose controllers never own directory lifecycle, even in
    /// an owned hierarchy. Used when another component (the freezer
    /// controller) creates and removes the same cgroups.
    pub fn new_attach_only(
        hierarchy: CgroupHierarchy,
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Self {
        Self {
            hierarchy,
            cgroups,
            notifications,
            attach_only: true,
        }
    }

    pub fn hierarchy(&self) -> CgroupHierarchy {
        self.hierarchy
    }

    pub fn is_mounted(&self) -> bool {
        self.cgroups.is_mounted(self.hierarchy)
    }

    /// Attaches a controller to an existing cgroup.
    pub fn get(&self, container_name: &str) -> Result<CgroupController> {
        let cgroup_path = self.cgroups.get(self.hierarchy, container_name)?;
        Ok(self.controller(container_name, cgroup_path))
    }

    /// Creates the cgroup (for owned hierarchies) and returns its
    /// controller. Attach-only factories attach to the existing cgroup
    /// instead.
    pub fn create(&self, container_name: &str) -> Result<CgroupController> {
        let cgroup_path = if self.attach_only {
            self.cgroups.get(self.hierarchy, container_name)?
        } else {
            self.cgroups.create(self.hierarchy, container_name)?
        };
        Ok(self.controller(container_name, cgroup_path))
    }

    pub fn exists(&self, container_name: &str) -> bool {
        self.cgroups.get(self.hierarchy, container_name).is_ok()
    }

    pub fn detect(&self, tid: Pid) -> Result<String> {
        self.cgroups.detect_cgroup_path(tid, self.hierarchy)
    }

    fn controller(&self, container_name: &str, cgroup_path: PathBuf) -> CgroupController {
        CgroupController::new(
            self.hierarchy,
            container_name.to_string(),
            cgroup_path,
            !self.attach_only && self.cgroups.owns_cgroup(self.hierarchy),
            Arc::clone(self.cgroups.kernel()),
            Arc::clone(&self.notifications),
        )
    }
}
