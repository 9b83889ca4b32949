//! An interface trait over the process-level kernel primitives the rest of
//! corral needs, so that the higher layers can be exercised without root and
//! without sending real signals.
//!
//! Control-file reads and writes deliberately live in [`crate::common`]
//! instead: those operate on paths the tests point at temporary directories.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Pid, Uid};

pub mod linux;
pub mod test;

pub use linux::LinuxKernelOps;
pub use test::TestKernelOps;

/// Mixing nix::Error and std::io::Error makes error handling around raw
/// syscalls awkward; this keeps both without flattening them early.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, SyscallError>;

/// Kernel functionality required for container management.
pub trait KernelOps: Send + Sync {
    /// Sends a signal to the task with the given tid.
    fn kill(&self, tid: Pid, signal: Signal) -> Result<()>;

    /// Sleeps for the given duration.
    fn usleep(&self, delay: Duration);

    /// Returns the caller's thread id.
    fn gettid(&self) -> Pid;

    /// Changes ownership of a path. A `None` half leaves that half untouched.
    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()>;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;

    /// Creates a close-on-exec, non-blocking eventfd with an initial value
    /// of zero.
    fn eventfd(&self) -> Result<OwnedFd>;

    /// Consumes an eventfd counter, re-arming the descriptor.
    fn read_counter(&self, fd: BorrowedFd<'_>) -> Result<u64>;

    /// Whether the path is accessible at all (`access(2)` with `F_OK`).
    fn path_exists(&self, path: &Path) -> bool;
}
