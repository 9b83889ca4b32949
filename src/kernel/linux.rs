use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::mount::MsFlags;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, AccessFlags, Gid, Pid, Uid};

use super::{KernelOps, Result};

/// The production implementation, backed by the host kernel.
#[derive(Default)]
pub struct LinuxKernelOps;

impl KernelOps for LinuxKernelOps {
    fn kill(&self, tid: Pid, sig: Signal) -> Result<()> {
        signal::kill(tid, sig)?;
        Ok(())
    }

    fn usleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }

    fn gettid(&self) -> Pid {
        unistd::gettid()
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        unistd::chown(path, owner, group)?;
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
        nix::mount::mount(source, target, fstype, flags, data)?;
        Ok(())
    }

    fn eventfd(&self) -> Result<OwnedFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn read_counter(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = unistd::read(fd.as_raw_fd(), &mut buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short eventfd read of {n} bytes"),
            )
            .into());
        }
        Ok(u64::from_ne_bytes(buf))
    }

    fn path_exists(&self, path: &Path) -> bool {
        unistd::access(path, AccessFlags::F_OK).is_ok()
    }
}
