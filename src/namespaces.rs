//! The namespace collaborator: creating namespace scopes and running
//! commands inside containers.
//!
//! corral itself never forks; it enters the calling thread into the target
//! container and then hands process creation to a [`NamespaceHandler`]. The
//! null implementation runs commands in the host's namespaces, for machines
//! where namespace isolation is not in use.

use std::ffi::CString;
use std::process::{Command, Stdio};
use std::sync::Arc;

use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::spec_types::{ContainerSpec, FdPolicy, InitSpec, MachineSpec, RunSpec};

pub trait NamespaceHandler: Send + Sync {
    fn container_name(&self) -> &str;

    /// Creates the payload process inside the container's namespace scope.
    /// The calling thread has already been entered into the container.
    /// Returns the child pid.
    fn run(&self, command: &[String], spec: &RunSpec) -> Result<Pid>;

    /// Replaces the calling process image. Does not return on success.
    fn exec(&self, command: &[String]) -> Result<()>;

    /// Pid of the namespace scope's init process.
    fn get_init_pid(&self) -> Result<Pid>;

    /// Whether any of the given tids live in a different namespace scope
    /// than this container.
    fn is_different_virtual_host(&self, tids: &[Pid]) -> Result<bool>;
}

impl std::fmt::Debug for dyn NamespaceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceHandler")
            .field("container_name", &self.container_name())
            .finish()
    }
}

pub trait NamespaceHandlerFactory: Send + Sync {
    /// Creates the namespace scope for a new container. The caller provides
    /// the observed machine layout so the scope can map cgroup roots.
    fn create(
        &self,
        container_name: &str,
        spec: &ContainerSpec,
        machine: &MachineSpec,
    ) -> Result<Box<dyn NamespaceHandler>>;

    /// Attaches to the namespace scope of an existing container. Returns
    /// `NotFound` when the container has no scope of its own.
    fn get(&self, container_name: &str) -> Result<Box<dyn NamespaceHandler>>;

    fn init_machine(&self, _spec: &InitSpec) -> Result<()> {
        Ok(())
    }
}

/// Runs containers without namespace isolation.
#[derive(Default)]
pub struct NullNamespaceHandlerFactory;

impl NamespaceHandlerFactory for NullNamespaceHandlerFactory {
    fn create(
        &self,
        container_name: &str,
        _spec: &ContainerSpec,
        _machine: &MachineSpec,
    ) -> Result<Box<dyn NamespaceHandler>> {
        Ok(Box::new(NullNamespaceHandler {
            container_name: container_name.to_string(),
        }))
    }

    fn get(&self, container_name: &str) -> Result<Box<dyn NamespaceHandler>> {
        if container_name == "/" {
            return Ok(Box::new(NullNamespaceHandler {
                container_name: container_name.to_string(),
            }));
        }
        // Only the root scope exists without namespaces; the ancestor walk
        // in the container layer lands on it.
        Err(Error::not_found(format!(
            "container \"{container_name}\" has no namespace scope"
        )))
    }
}

pub struct NullNamespaceHandler {
    container_name: String,
}

impl NamespaceHandler for NullNamespaceHandler {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn run(&self, command: &[String], spec: &RunSpec) -> Result<Pid> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::invalid_argument("command must not be empty"))?;

        let mut child = Command::new(program);
        child.args(args);
        if spec.fd_policy == Some(FdPolicy::Detached) {
            child
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        let child = child.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::not_found(format!("command \"{program}\" not found: {err}"))
            }
            _ => Error::internal(format!("failed to spawn \"{program}\": {err}")),
        })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn exec(&self, command: &[String]) -> Result<()> {
        let argv: Vec<CString> = command
            .iter()
            .map(|arg| {
                CString::new(arg.as_str()).map_err(|_| {
                    Error::invalid_argument(format!("argument \"{arg}\" contains a NUL byte"))
                })
            })
            .collect::<Result<_>>()?;
        let program = argv
            .first()
            .ok_or_else(|| Error::invalid_argument("command must not be empty"))?;

        // Only returns on failure.
        let err = nix::unistd::execvp(program, &argv).unwrap_err();
        Err(Error::internal(format!(
            "exec of \"{}\" failed: {err}",
            command[0]
        )))
    }

    fn get_init_pid(&self) -> Result<Pid> {
        // Without a namespace scope of its own, the container shares the
        // host's init.
        Ok(Pid::from_raw(1))
    }

    fn is_different_virtual_host(&self, _tids: &[Pid]) -> Result<bool> {
        Ok(false)
    }
}

pub(crate) fn default_factory() -> Arc<dyn NamespaceHandlerFactory> {
    Arc::new(NullNamespaceHandlerFactory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_null_factory_only_has_root_scope() {
        let factory = NullNamespaceHandlerFactory;
        factory.get("/").unwrap();
        let err = factory.get("/test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_run_spawns_and_returns_pid() {
        let factory = NullNamespaceHandlerFactory;
        let handler = factory
            .create("/test", &ContainerSpec::default(), &MachineSpec::default())
            .unwrap();

        let pid = handler
            .run(
                &["true".to_string()],
                &RunSpec {
                    fd_policy: Some(FdPolicy::Detached),
                },
            )
            .unwrap();
        assert!(pid.as_raw() > 0);
        // Reap the child so the test process stays tidy.
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn test_run_missing_binary() {
        let factory = NullNamespaceHandlerFactory;
        let handler = factory
            .create("/test", &ContainerSpec::default(), &MachineSpec::default())
            .unwrap();

        let err = handler
            .run(
                &["corral-test-no-such-binary".to_string()],
                &RunSpec::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_is_different_virtual_host_is_false() {
        let factory = NullNamespaceHandlerFactory;
        let handler = factory
            .create("/test", &ContainerSpec::default(), &MachineSpec::default())
            .unwrap();
        assert!(!handler
            .is_different_virtual_host(&[Pid::from_raw(1)])
            .unwrap());
    }
}
