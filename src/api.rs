//! The top-level container API: name resolution, lifecycle orchestration,
//! and machine initialization.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{Gid, Pid, Uid};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cgroups::{CgroupFactory, CgroupHierarchy};
use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};
use crate::freezer::{FreezerController, FreezerControllerFactory};
use crate::kernel::{KernelOps, LinuxKernelOps};
use crate::namespaces::{self, NamespaceHandlerFactory};
use crate::notifications::{ActiveNotifications, EventFdNotifications};
use crate::resources::{
    resource_in_spec, BlockIoHandlerFactory, CpuHandlerFactory, DeviceHandlerFactory,
    FilesystemHandlerFactory, MemoryHandlerFactory, MonitoringHandlerFactory,
    NetworkHandlerFactory, ResourceHandler, ResourceHandlerFactory, ResourceKind,
};
use crate::spec_types::{ContainerSpec, InitSpec, ListPolicy, MachineSpec};
use crate::tasks::{TasksHandler, TasksHandlerFactory};

const DEFAULT_KILL_RETRIES: u32 = 3;
const DEFAULT_KILL_DELAY: Duration = Duration::from_millis(250);

/// Valid names are built from `[a-zA-Z0-9_.\-/]` only.
static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.\-/]+$").unwrap());
/// No path component may start with a non-alphanumeric character.
static BAD_COMPONENT_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[^a-zA-Z0-9]").unwrap());

pub(crate) struct ApiContext {
    pub(crate) kernel: Arc<dyn KernelOps>,
    pub(crate) cgroups: Arc<CgroupFactory>,
    pub(crate) active: Arc<ActiveNotifications>,
    pub(crate) tasks: Arc<TasksHandlerFactory>,
    pub(crate) freezer: FreezerControllerFactory,
    pub(crate) resources: BTreeMap<ResourceKind, Box<dyn ResourceHandlerFactory>>,
    pub(crate) namespaces: Arc<dyn NamespaceHandlerFactory>,
    pub(crate) kill_retries: u32,
    pub(crate) kill_delay: Duration,
}

/// Creates, inspects, and destroys containers. Reentrant from multiple
/// threads; all asynchronous activity stays on the notification listener's
/// worker thread.
pub struct ContainerApi {
    ctx: Arc<ApiContext>,
}

impl ContainerApi {
    /// Auto-detects the machine's cgroup hierarchies. The machine must
    /// already be initialized (see [`ContainerApi::init_machine`]).
    pub fn new() -> Result<Self> {
        let kernel: Arc<dyn KernelOps> = Arc::new(LinuxKernelOps);
        let cgroups = Arc::new(CgroupFactory::detect(Arc::clone(&kernel))?);
        Self::with_factory(cgroups, kernel)
    }

    /// Builds an API over an explicit cgroup factory. Exposed so embedders
    /// and tests can supply synthetic mount tables and kernel ops.
    pub fn with_factory(cgroups: Arc<CgroupFactory>, kernel: Arc<dyn KernelOps>) -> Result<Self> {
        let active = Arc::new(ActiveNotifications::default());
        let notifications = Arc::new(EventFdNotifications::new(
            Arc::clone(&active),
            Arc::clone(&kernel),
        )?);

        let mut resources: BTreeMap<ResourceKind, Box<dyn ResourceHandlerFactory>> =
            BTreeMap::new();
        register_resource(
            &mut resources,
            CpuHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            MemoryHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            BlockIoHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            NetworkHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            MonitoringHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            FilesystemHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;
        register_resource(
            &mut resources,
            DeviceHandlerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
                .map(|f| Box::new(f) as Box<dyn ResourceHandlerFactory>),
        )?;

        let tasks = Arc::new(TasksHandlerFactory::new(
            Arc::clone(&cgroups),
            Arc::clone(&notifications),
        )?);

        // With a job hierarchy the tasks handler does not need freezer
        // backing, and without a freezer hierarchy there is nothing to
        // freeze with; both cases get stub controllers.
        let freezer = if cgroups.is_mounted(CgroupHierarchy::Job)
            || !cgroups.is_mounted(CgroupHierarchy::Freezer)
        {
            FreezerControllerFactory::stub(Arc::clone(&kernel))
        } else {
            FreezerControllerFactory::new(Arc::clone(&cgroups), Arc::clone(&notifications))
        };

        Ok(Self {
            ctx: Arc::new(ApiContext {
                kernel,
                cgroups,
                active,
                tasks,
                freezer,
                resources,
                namespaces: namespaces::default_factory(),
                kill_retries: DEFAULT_KILL_RETRIES,
                kill_delay: DEFAULT_KILL_DELAY,
            }),
        })
    }

    /// Attaches to an existing container.
    pub fn get(&self, container_name: &str) -> Result<Container> {
        let resolved = self.resolve_container_name(container_name)?;
        if !self.ctx.tasks.exists(&resolved) {
            return Err(Error::not_found(format!(
                "can't get non-existent container \"{resolved}\""
            )));
        }
        get_container(&self.ctx, &resolved)
    }

    /// Creates a new container. All-or-nothing: every cgroup created on a
    /// failure path is destroyed again before the error is returned.
    pub fn create(&self, container_name: &str, spec: &ContainerSpec) -> Result<Container> {
        if container_name.is_empty() {
            return Err(Error::invalid_argument("container name is missing"));
        }
        let resolved = self.resolve_container_name(container_name)?;
        if self.ctx.tasks.exists(&resolved) {
            return Err(Error::already_exists(format!(
                "can't create existing container \"{resolved}\""
            )));
        }

        tracing::info!(name = %resolved, "creating container");

        // The freezer cgroup comes first: on machines without a job
        // hierarchy the tasks handler attaches to it.
        let freezer = self.ctx.freezer.create(&resolved)?;
        let tasks = match self.ctx.tasks.create(&resolved, spec) {
            Ok(tasks) => tasks,
            Err(err) => {
                rollback_create(freezer, None, Vec::new());
                return Err(err);
            }
        };

        let mut handlers: Vec<Box<dyn ResourceHandler>> = Vec::new();
        for factory in self.ctx.resources.values() {
            if !resource_in_spec(factory.kind(), spec) {
                continue;
            }
            match factory.create(&resolved, spec) {
                Ok(handler) => handlers.push(handler),
                Err(err) => {
                    rollback_create(freezer, Some(tasks), handlers);
                    return Err(err);
                }
            }
        }

        let uid = spec.owner.map(Uid::from_raw);
        let gid = spec.owner_group.map(Gid::from_raw);
        if uid.is_some() || gid.is_some() {
            let delegated = freezer
                .delegate(uid, gid)
                .and_then(|_| tasks.delegate(uid, gid))
                .and_then(|_| handlers.iter().try_for_each(|h| h.delegate(uid, gid)));
            if let Err(err) = delegated {
                rollback_create(freezer, Some(tasks), handlers);
                return Err(err);
            }
        }

        if let Some(limit) = spec.children_limit {
            match tasks.set_children_limit(limit) {
                // Not every tasks hierarchy carries the children-limit
                // control file.
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    tracing::debug!(name = %resolved, "children limit not supported: {err}");
                }
                Err(err) => {
                    rollback_create(freezer, Some(tasks), handlers);
                    return Err(err);
                }
                Ok(()) => {}
            }
        }

        if spec.virtual_host.is_some() {
            if let Err(err) = self.create_namespace_scope(&resolved, spec, &freezer, &tasks) {
                rollback_create(freezer, Some(tasks), handlers);
                return Err(err);
            }
        }

        // The handlers were only needed to set up the cgroups; the
        // container re-acquires them per operation.
        drop(handlers);

        Ok(Container::new(resolved, tasks, freezer, Arc::clone(&self.ctx)))
    }

    /// Destroys a container and its whole subtree, children before parents.
    /// On partial failure the remaining containers are released in memory
    /// but stay on the host; the error names the failing subtree.
    pub fn destroy(&self, container: Container) -> Result<()> {
        let subcontainers = container.list_subcontainers(ListPolicy::Recursive)?;

        // Recursive listings sort parents before children; destroying in
        // reverse removes every child before its parent.
        for subcontainer in subcontainers.into_iter().rev() {
            let name = subcontainer.name().to_string();
            subcontainer.destroy().map_err(|err| {
                Error::new(
                    err.kind(),
                    format!("failed to destroy subcontainer \"{name}\": {}", err.message()),
                )
            })?;
        }

        container.destroy()
    }

    /// Detects the container the given task runs in. A tid of 0 denotes
    /// the calling task.
    pub fn detect(&self, tid: Pid) -> Result<String> {
        self.ctx.tasks.detect(tid)
    }

    /// Whether a resolved container name exists on this host.
    pub fn exists(&self, container_name: &str) -> Result<bool> {
        let resolved = self.resolve_container_name(container_name)?;
        Ok(self.ctx.tasks.exists(&resolved))
    }

    /// Mounts the hierarchies the machine needs and runs every factory's
    /// initialization hook. Called once at machine boot; idempotent.
    pub fn init_machine(&self, spec: &InitSpec) -> Result<()> {
        for mount in &spec.cgroup_mounts {
            self.ctx.cgroups.mount(mount)?;
        }
        for factory in self.ctx.resources.values() {
            factory.init_machine(spec)?;
        }
        self.ctx.namespaces.init_machine(spec)
    }

    /// Resolves a container name to its absolute canonical form. Relative
    /// names are resolved against the calling task's current container.
    pub fn resolve_container_name(&self, container_name: &str) -> Result<String> {
        // Character validation comes first so a malformed name is reported
        // as such even when the current container cannot be detected.
        validate_name_characters(container_name)?;
        if container_name.starts_with('/') {
            resolve_name(container_name, "/")
        } else {
            let current = self.detect(Pid::from_raw(0))?;
            resolve_name(container_name, &current)
        }
    }

    fn create_namespace_scope(
        &self,
        resolved: &str,
        spec: &ContainerSpec,
        freezer: &FreezerController,
        tasks: &TasksHandler,
    ) -> Result<()> {
        let handlers = resource_handlers_for(&self.ctx, resolved)?;

        let mut machine = MachineSpec::default();
        for handler in &handlers {
            handler.populate_machine_spec(&mut machine)?;
        }
        freezer.populate_machine_spec(&mut machine);
        tasks.populate_machine_spec(&mut machine);
        self.ctx.cgroups.populate_machine_spec(&mut machine);

        // The scope must be created from inside the new container so the
        // payload is accounted there; a helper thread enters instead of
        // moving the caller.
        std::thread::scope(|scope| {
            scope
                .spawn(|| -> Result<()> {
                    let current = [Pid::from_raw(0)];
                    for tid in current {
                        freezer.enter(tid)?;
                    }
                    tasks.track_tasks(&current)?;
                    for handler in &handlers {
                        handler.enter(&current)?;
                    }
                    self.ctx
                        .namespaces
                        .create(resolved, spec, &machine)
                        .map(|_| ())
                })
                .join()
                .map_err(|_| Error::internal("namespace setup thread panicked"))?
        })
    }
}

fn register_resource(
    resources: &mut BTreeMap<ResourceKind, Box<dyn ResourceHandlerFactory>>,
    factory: Result<Box<dyn ResourceHandlerFactory>>,
) -> Result<()> {
    match factory {
        Ok(factory) => {
            resources.insert(factory.kind(), factory);
            Ok(())
        }
        // A missing hierarchy only disables that resource.
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::debug!("resource unavailable on this machine: {err}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn rollback_create(
    freezer: FreezerController,
    tasks: Option<TasksHandler>,
    handlers: Vec<Box<dyn ResourceHandler>>,
) {
    // Rollback failures are logged but never mask the original error.
    for handler in handlers.into_iter().rev() {
        if let Err(err) = handler.destroy() {
            tracing::warn!("failed to roll back resource handler: {err}");
        }
    }
    if let Some(tasks) = tasks {
        if let Err(err) = tasks.destroy() {
            tracing::warn!("failed to roll back tasks handler: {err}");
        }
    }
    if let Err(err) = freezer.destroy() {
        tracing::warn!("failed to roll back freezer controller: {err}");
    }
}

/// Attaches to a container that is known to exist under its resolved name.
pub(crate) fn get_container(ctx: &Arc<ApiContext>, resolved_name: &str) -> Result<Container> {
    let freezer = ctx.freezer.get(resolved_name)?;
    let tasks = ctx.tasks.get(resolved_name)?;
    Ok(Container::new(
        resolved_name.to_string(),
        tasks,
        freezer,
        Arc::clone(ctx),
    ))
}

/// Walks from the container toward the root until the lookup succeeds. A
/// container that does not isolate a resource uses its nearest ancestor's
/// handler; only `/` having none is fatal.
pub(crate) fn get_with_ancestors<T>(
    container_name: &str,
    lookup: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    let mut current = container_name.to_string();
    loop {
        match lookup(&current) {
            Err(err) if err.kind() == ErrorKind::NotFound && current != "/" => {
                current = parent_name(&current);
            }
            result => return result,
        }
    }
}

/// One handler per registered resource factory, each attached at this
/// container or its nearest isolating ancestor.
pub(crate) fn resource_handlers_for(
    ctx: &Arc<ApiContext>,
    container_name: &str,
) -> Result<Vec<Box<dyn ResourceHandler>>> {
    let mut handlers = Vec::with_capacity(ctx.resources.len());
    for factory in ctx.resources.values() {
        handlers.push(get_with_ancestors(container_name, |name| {
            factory.get(name)
        })?);
    }
    Ok(handlers)
}

fn parent_name(container_name: &str) -> String {
    match container_name.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => container_name[..index].to_string(),
    }
}

fn validate_name_characters(container_name: &str) -> Result<()> {
    if container_name.is_empty() {
        return Err(Error::invalid_argument("container name is missing"));
    }
    if !VALID_NAME.is_match(container_name) {
        return Err(Error::invalid_argument(format!(
            "invalid characters in container name \"{container_name}\""
        )));
    }
    Ok(())
}

/// Resolves a container name against the current container, producing the
/// absolute canonical form.
pub(crate) fn resolve_name(container_name: &str, current_container: &str) -> Result<String> {
    validate_name_characters(container_name)?;

    let absolute = if container_name.starts_with('/') {
        container_name.to_string()
    } else {
        format!(
            "{}/{container_name}",
            current_container.trim_end_matches('/')
        )
    };

    let cleaned = path_clean::clean(&absolute);

    if BAD_COMPONENT_START.is_match(&cleaned) {
        return Err(Error::invalid_argument(format!(
            "part of the container name \"{container_name}\" starts with a \
             non-alphanumeric character"
        )));
    }

    Ok(cleaned)
}
