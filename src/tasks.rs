//! Task tracking: the per-container authority for task membership and child
//! enumeration.
//!
//! Each container maps 1-to-1 onto a cgroup in a canonical tasks hierarchy.
//! The job hierarchy is preferred when mounted; freezer is the fallback.
//! Machines with neither cannot track tasks and are refused.

use std::collections::BTreeSet;
use std::sync::Arc;

use nix::unistd::{Gid, Pid, Uid};

use crate::cgroups::{CgroupController, CgroupFactory, CgroupHierarchy, ControllerFactory};
use crate::error::{Error, Result};
use crate::notifications::EventFdNotifications;
use crate::spec_types::{ContainerSpec, ListPolicy, MachineSpec};

/// Creates new [`TasksHandler`]s and attaches to existing ones. Also answers
/// whether a container exists and which container a task runs in.
pub struct TasksHandlerFactory {
    controllers: ControllerFactory,
    backend: CgroupHierarchy,
}

impl TasksHandlerFactory {
    pub fn new(
        cgroups: Arc<CgroupFactory>,
        notifications: Arc<EventFdNotifications>,
    ) -> Result<Self> {
        // When freezer doubles as the tasks hierarchy, the container's
        // freezer controller owns directory lifecycle and tasks handlers
        // only attach.
        let (backend, controllers) = if cgroups.is_mounted(CgroupHierarchy::Job) {
            (
                CgroupHierarchy::Job,
                ControllerFactory::new(CgroupHierarchy::Job, cgroups, notifications),
            )
        } else if cgroups.is_mounted(CgroupHierarchy::Freezer) {
            (
                CgroupHierarchy::Freezer,
                ControllerFactory::new_attach_only(
                    CgroupHierarchy::Freezer,
                    cgroups,
                    notifications,
                ),
            )
        } else {
            return Err(Error::not_found(
                "a canonical tasks cgroup hierarchy is required (job or freezer), \
                 none were found",
            ));
        };

        tracing::debug!(%backend, "tasks handlers backed by cgroup hierarchy");
        Ok(Self {
            controllers,
            backend,
        })
    }

    pub fn backend(&self) -> CgroupHierarchy {
        self.backend
    }

    /// Creates the tasks cgroup for a new container.
    pub fn create(self: &Arc<Self>, container_name: &str, _spec: &ContainerSpec) -> Result<TasksHandler> {
        let controller = self.controllers.create(container_name)?;
        Ok(TasksHandler {
            container_name: container_name.to_string(),
            controller,
            factory: Arc::clone(self),
        })
    }

    /// Attaches to the tasks cgroup of an existing container.
    pub fn get(self: &Arc<Self>, container_name: &str) -> Result<TasksHandler> {
        let controller = self.controllers.get(container_name)?;
        Ok(TasksHandler {
            container_name: container_name.to_string(),
            controller,
            factory: Arc::clone(self),
        })
    }

    /// Whether the container exists. Names must be absolute and resolved.
    pub fn exists(&self, container_name: &str) -> bool {
        self.controllers.exists(container_name)
    }

    /// Detects which container the given task runs in. A tid of 0 denotes
    /// the calling task.
    pub fn detect(&self, tid: Pid) -> Result<String> {
        self.controllers.detect(tid)
    }
}

/// Owns task handling for one container.
pub struct TasksHandler {
    container_name: String,
    controller: CgroupController,
    factory: Arc<TasksHandlerFactory>,
}

impl TasksHandler {
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Removes the underlying cgroup. Consumes the handler on success.
    pub fn destroy(self) -> Result<()> {
        self.controller.destroy()
    }

    /// Starts tracking the given tids as part of this container. A tid of 0
    /// is shorthand for the calling task. A partial failure leaves the
    /// container in an undefined intermediate state.
    pub fn track_tasks(&self, tids: &[Pid]) -> Result<()> {
        for tid in tids {
            self.controller.enter(*tid)?;
        }
        Ok(())
    }

    /// Delegates the tasks cgroup so the user may track tasks and create
    /// child containers themselves.
    pub fn delegate(&self, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.controller.delegate(uid, gid)
    }

    pub fn set_children_limit(&self, limit: i64) -> Result<()> {
        self.controller.set_children_limit(limit)
    }

    /// Lists child containers by absolute name. `Recursive` walks the whole
    /// subtree and returns a sorted list.
    pub fn list_subcontainers(&self, policy: ListPolicy) -> Result<Vec<String>> {
        let mut subcontainers: Vec<String> = self
            .controller
            .get_subcontainers()?
            .into_iter()
            .map(|child| join_container_name(&self.container_name, &child))
            .collect();

        if policy == ListPolicy::Recursive {
            let mut to_check = std::mem::take(&mut subcontainers);
            while let Some(current) = to_check.pop() {
                let handler = self.factory.get(&current)?;
                let children = handler.list_subcontainers(ListPolicy::SelfOnly)?;
                subcontainers.push(current);
                to_check.extend(children);
            }
            subcontainers.sort();
        }

        Ok(subcontainers)
    }

    pub fn list_processes(&self, policy: ListPolicy) -> Result<Vec<Pid>> {
        self.list_tasks(policy, TaskFile::Processes)
    }

    pub fn list_threads(&self, policy: ListPolicy) -> Result<Vec<Pid>> {
        self.list_tasks(policy, TaskFile::Threads)
    }

    fn list_tasks(&self, policy: ListPolicy, which: TaskFile) -> Result<Vec<Pid>> {
        let own = match which {
            TaskFile::Processes => self.controller.get_processes()?,
            TaskFile::Threads => self.controller.get_threads()?,
        };
        if policy == ListPolicy::SelfOnly {
            return Ok(own);
        }

        // Tasks may move between containers between queries, so the union
        // is deduplicated instead of assuming disjoint sets.
        let mut unique: BTreeSet<i32> = own.iter().map(|pid| pid.as_raw()).collect();
        for subcontainer in self.list_subcontainers(ListPolicy::Recursive)? {
            let handler = self.factory.get(&subcontainer)?;
            let tasks = match which {
                TaskFile::Processes => handler.list_processes(ListPolicy::SelfOnly)?,
                TaskFile::Threads => handler.list_threads(ListPolicy::SelfOnly)?,
            };
            unique.extend(tasks.iter().map(|pid| pid.as_raw()));
        }

        Ok(unique.into_iter().map(Pid::from_raw).collect())
    }

    pub fn populate_machine_spec(&self, spec: &mut MachineSpec) {
        self.controller.populate_machine_spec(spec);
    }
}

#[derive(Clone, Copy)]
enum TaskFile {
    Processes,
    Threads,
}

/// Makes a child name absolute by appending the subdirectory name to the
/// parent container's name.
fn join_container_name(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
