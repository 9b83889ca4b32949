//! A recording kernel-ops implementation for tests.
//!
//! Signal and ownership calls are captured instead of performed; eventfd and
//! counter reads go to the real kernel since they need no privileges. A kill
//! hook lets tests simulate tasks exiting in response to signals.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Pid, Uid};

use super::{KernelOps, LinuxKernelOps, Result, SyscallError};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChownArgs {
    pub path: PathBuf,
    pub owner: Option<Uid>,
    pub group: Option<Gid>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

type KillHook = Box<dyn Fn(Pid, Signal) + Send + Sync>;

#[derive(Default)]
pub struct TestKernelOps {
    real: LinuxKernelOps,
    kills: Mutex<Vec<(Pid, Signal)>>,
    sleeps: Mutex<Vec<Duration>>,
    chowns: Mutex<Vec<ChownArgs>>,
    mounts: Mutex<Vec<MountArgs>>,
    kill_hook: Mutex<Option<KillHook>>,
    fail_chown: Mutex<bool>,
}

impl TestKernelOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_kill_args(&self) -> Vec<(Pid, Signal)> {
        self.kills.lock().unwrap().clone()
    }

    pub fn get_sleep_args(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn get_chown_args(&self) -> Vec<ChownArgs> {
        self.chowns.lock().unwrap().clone()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mounts.lock().unwrap().clone()
    }

    /// Runs the hook after each recorded kill, so tests can make "tasks" die
    /// by rewriting the fixture task files.
    pub fn set_kill_hook(&self, hook: impl Fn(Pid, Signal) + Send + Sync + 'static) {
        *self.kill_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_fail_chown(&self, fail: bool) {
        *self.fail_chown.lock().unwrap() = fail;
    }
}

impl KernelOps for TestKernelOps {
    fn kill(&self, tid: Pid, signal: Signal) -> Result<()> {
        self.kills.lock().unwrap().push((tid, signal));
        if let Some(hook) = self.kill_hook.lock().unwrap().as_ref() {
            hook(tid, signal);
        }
        Ok(())
    }

    fn usleep(&self, delay: Duration) {
        self.sleeps.lock().unwrap().push(delay);
    }

    fn gettid(&self) -> Pid {
        self.real.gettid()
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        if *self.fail_chown.lock().unwrap() {
            return Err(SyscallError::Nix(nix::errno::Errno::EPERM));
        }
        self.chowns.lock().unwrap().push(ChownArgs {
            path: path.to_path_buf(),
            owner,
            group,
        });
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        self.mounts.lock().unwrap().push(MountArgs {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
            flags,
            data: data.map(String::from),
        });
        Ok(())
    }

    fn eventfd(&self) -> Result<OwnedFd> {
        self.real.eventfd()
    }

    fn read_counter(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        self.real.read_counter(fd)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.real.path_exists(path)
    }
}
