//! The per-container handle.

use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::api::{self, ApiContext};
use crate::error::{Error, ErrorKind, Result};
use crate::freezer::FreezerController;
use crate::namespaces::NamespaceHandler;
use crate::notifications::{EventCallback, Handle};
use crate::resources::{resource_in_spec, ResourceHandler};
use crate::spec_types::{
    ContainerSpec, EventSpec, ListPolicy, RunSpec, StatsType, UpdatePolicy,
};
use crate::stats::ContainerStats;
use crate::tasks::TasksHandler;

/// Callback invoked on every notification delivery: the container's name
/// and the counter value, or a `Cancelled` error when the registration is
/// torn down. Held by shared ownership so concurrent deliveries and
/// container teardown race safely.
pub type ContainerEventCallback = Arc<dyn Fn(&str, Result<u64>) + Send + Sync>;

/// A resource-isolated execution context on this host.
///
/// A container can be destroyed "under you" by another process, so every
/// operation re-checks existence before acting.
pub struct Container {
    name: String,
    tasks: TasksHandler,
    freezer: FreezerController,
    ctx: Arc<ApiContext>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("name", &self.name).finish()
    }
}

enum TaskKind {
    Processes,
    Threads,
}

impl Container {
    pub(crate) fn new(
        name: String,
        tasks: TasksHandler,
        freezer: FreezerController,
        ctx: Arc<ApiContext>,
    ) -> Self {
        Self {
            name,
            tasks,
            freezer,
            ctx,
        }
    }

    /// The container's absolute, canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applies a configuration change. `Diff` may only touch resources the
    /// container isolates; `Replace` must re-specify all of them.
    pub fn update(&self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        self.assert_exists()?;

        let mut handlers = self.resource_handlers()?;

        let used: Vec<usize> = handlers
            .iter()
            .enumerate()
            .filter(|(_, handler)| resource_in_spec(handler.kind(), spec))
            .map(|(index, _)| index)
            .collect();
        let isolated_count = handlers
            .iter()
            .filter(|h| h.container_name() == self.name)
            .count();
        let isolated_and_used_count = handlers
            .iter()
            .filter(|h| h.container_name() == self.name && resource_in_spec(h.kind(), spec))
            .count();

        // A resource in the spec that is not isolated here would silently
        // configure an ancestor.
        if isolated_and_used_count != used.len() {
            return Err(Error::invalid_argument(
                "must not specify an update to a resource that is not being isolated",
            ));
        }
        if policy == UpdatePolicy::Replace && isolated_count != used.len() {
            return Err(Error::invalid_argument(
                "a replace update must specify all resources being isolated",
            ));
        }

        for index in used {
            handlers[index].update(spec, policy)?;
        }
        Ok(())
    }

    /// Moves the given tasks into this container. A tid of 0 denotes the
    /// calling task.
    pub fn enter(&self, tids: &[Pid]) -> Result<()> {
        self.assert_exists()?;

        let namespace_handler = self.namespace_handler()?;
        if namespace_handler.is_different_virtual_host(tids)? {
            return Err(Error::failed_precondition(
                "a container in a different virtual host cannot be entered",
            ));
        }

        let handlers = self.resource_handlers()?;
        self.enter_into(tids, &handlers)
    }

    /// Starts a command inside the container and returns its pid. The
    /// caller's thread is never moved; a helper thread enters the container
    /// and creates the payload from there.
    pub fn run(&self, command: &[String], spec: &RunSpec) -> Result<Pid> {
        self.assert_exists()?;
        if command.is_empty() {
            return Err(Error::invalid_argument("command must not be empty"));
        }

        let handlers = self.resource_handlers()?;
        let namespace_handler = self.namespace_handler()?;

        std::thread::scope(|scope| {
            scope
                .spawn(|| -> Result<Pid> {
                    self.enter_into(&[Pid::from_raw(0)], &handlers)?;
                    namespace_handler.run(command, spec)
                })
                .join()
                .map_err(|_| Error::internal("container enter thread panicked"))?
        })
    }

    /// Enters the calling thread into the container and replaces the
    /// process image. Only returns on failure.
    pub fn exec(&self, command: &[String]) -> Result<()> {
        self.assert_exists()?;
        if command.is_empty() {
            return Err(Error::invalid_argument("no command provided"));
        }

        let handlers = self.resource_handlers()?;
        self.enter_into(&[Pid::from_raw(0)], &handlers)?;

        let namespace_handler = self.namespace_handler()?;
        namespace_handler.exec(command)?;
        Err(Error::internal("exec failed for an unknown reason"))
    }

    /// Reads back the container's current configuration.
    pub fn spec(&self) -> Result<ContainerSpec> {
        self.assert_exists()?;

        let mut spec = ContainerSpec::default();
        for handler in self.resource_handlers()? {
            if handler.container_name() == self.name {
                handler.spec(&mut spec)?;
            }
        }
        Ok(spec)
    }

    pub fn stats(&self, stats_type: StatsType) -> Result<ContainerStats> {
        self.assert_exists()?;

        let mut stats = ContainerStats::default();
        for handler in self.resource_handlers()? {
            if handler.container_name() == self.name {
                handler.stats(stats_type, &mut stats)?;
            }
        }
        Ok(stats)
    }

    /// Suspends all tasks in the container.
    pub fn pause(&self) -> Result<()> {
        self.freezer.freeze().map_err(map_freezer_unsupported)
    }

    /// Resumes all tasks in the container.
    pub fn resume(&self) -> Result<()> {
        self.freezer.unfreeze().map_err(map_freezer_unsupported)
    }

    /// Lists child containers, sorted by name.
    pub fn list_subcontainers(&self, policy: ListPolicy) -> Result<Vec<Container>> {
        self.assert_exists()?;

        let mut subcontainers = Vec::new();
        for name in self.tasks.list_subcontainers(policy)? {
            subcontainers.push(api::get_container(&self.ctx, &name)?);
        }
        subcontainers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subcontainers)
    }

    pub fn list_processes(&self, policy: ListPolicy) -> Result<Vec<Pid>> {
        self.assert_exists()?;
        self.tasks.list_processes(policy)
    }

    pub fn list_threads(&self, policy: ListPolicy) -> Result<Vec<Pid>> {
        self.assert_exists()?;
        self.tasks.list_threads(policy)
    }

    /// Sends SIGKILL to everything in the container until it is empty:
    /// first the processes, then any tourist threads that remain. Gives up
    /// after a bounded number of rounds.
    pub fn kill_all(&self) -> Result<()> {
        self.assert_exists()?;

        self.kill_tasks(TaskKind::Processes)?;
        self.kill_tasks(TaskKind::Threads)
    }

    /// Registers a notification for the given event. Resource handlers are
    /// scanned in a fixed order; the first one that accepts the event wins.
    pub fn register_notification(
        &self,
        event: &EventSpec,
        callback: ContainerEventCallback,
    ) -> Result<Handle> {
        self.assert_exists()?;

        let name = self.name.clone();
        let wrapped: EventCallback = Arc::new(move |delivery| callback(&name, delivery));

        for handler in self.resource_handlers()? {
            match handler.register_notification(event, Arc::clone(&wrapped)) {
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                result => return result,
            }
        }
        Err(Error::invalid_argument(
            "unable to register any notification for the specified event",
        ))
    }

    pub fn unregister_notification(&self, handle: Handle) -> Result<()> {
        self.assert_exists()?;

        if !self.ctx.active.remove(handle) {
            return Err(Error::invalid_argument(format!(
                "no registered notification with handle {handle}"
            )));
        }
        Ok(())
    }

    /// Pid of the container's init process.
    pub fn get_init_pid(&self) -> Result<Pid> {
        self.namespace_handler()?.get_init_pid()
    }

    /// Destroys the container on-host: kills everything in it, removes its
    /// resource cgroups, then its tasks cgroup, then its freezer cgroup.
    pub(crate) fn destroy(self) -> Result<()> {
        self.assert_exists()?;
        self.kill_all()?;

        for handler in self.resource_handlers()?.into_iter().rev() {
            // Resources attached to an ancestor are not this container's to
            // destroy.
            if handler.container_name() == self.name {
                handler.destroy()?;
            }
        }

        self.tasks.destroy()?;
        self.freezer.destroy()
    }

    fn enter_into(&self, tids: &[Pid], handlers: &[Box<dyn ResourceHandler>]) -> Result<()> {
        for tid in tids {
            self.freezer.enter(*tid)?;
        }
        self.tasks.track_tasks(tids)?;
        for handler in handlers {
            handler.enter(tids)?;
        }
        Ok(())
    }

    fn resource_handlers(&self) -> Result<Vec<Box<dyn ResourceHandler>>> {
        api::resource_handlers_for(&self.ctx, &self.name)
    }

    fn namespace_handler(&self) -> Result<Box<dyn NamespaceHandler>> {
        api::get_with_ancestors(&self.name, |name| self.ctx.namespaces.get(name))
    }

    fn list_own_tasks(&self, kind: &TaskKind) -> Result<Vec<Pid>> {
        match kind {
            TaskKind::Processes => self.tasks.list_processes(ListPolicy::SelfOnly),
            TaskKind::Threads => self.tasks.list_threads(ListPolicy::SelfOnly),
        }
    }

    fn kill_tasks(&self, kind: TaskKind) -> Result<()> {
        let mut tries_remaining = self.ctx.kill_retries;
        while tries_remaining > 0 {
            let tasks = self.list_own_tasks(&kind)?;
            if tasks.is_empty() {
                return Ok(());
            }

            for tid in tasks {
                if let Err(err) = self.ctx.kernel.kill(tid, Signal::SIGKILL) {
                    tracing::debug!(tid = tid.as_raw(), "kill failed: {err}");
                }
            }

            tries_remaining -= 1;
            self.ctx.kernel.usleep(self.ctx.kill_delay);
        }

        let remaining = self.list_own_tasks(&kind)?;
        if !remaining.is_empty() {
            let what = match kind {
                TaskKind::Processes => "processes",
                TaskKind::Threads => "threads",
            };
            return Err(Error::failed_precondition(format!(
                "expected container \"{}\" to have no {what}, has {}; some may be unkillable",
                self.name,
                remaining.len()
            )));
        }
        Ok(())
    }

    fn assert_exists(&self) -> Result<()> {
        if !self.ctx.tasks.exists(&self.name) {
            return Err(Error::not_found(format!(
                "container \"{}\" does not exist",
                self.name
            )));
        }
        Ok(())
    }
}

fn map_freezer_unsupported(err: Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::failed_precondition("pause and resume are not supported on this machine")
    } else {
        err
    }
}
