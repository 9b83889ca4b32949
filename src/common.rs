//! Reading and writing cgroup control files.
//!
//! A control file delivers a complete snapshot per open and accepts one
//! token per write, so every interaction is a single open followed by a
//! single read or write. Which step failed decides how the failure is
//! classified: a file that cannot be opened has disappeared with its
//! cgroup, a file that rejects a write exists but the kernel refused the
//! value, and an unreadable file is in a state the caller cannot work
//! with. [`ControlFileError`] carries that step so the error layer and the
//! event-control protocol can branch on it.

use std::fmt::{self, Display};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";
pub const CGROUP_CLONE_CHILDREN: &str = "cgroup.clone_children";
pub const CGROUP_CHILDREN_LIMIT: &str = "cgroup.children_limit";
pub const CGROUP_EVENT_CONTROL: &str = "cgroup.event_control";

/// The step of a control-file interaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFileOp {
    Open,
    Write,
    Read,
}

impl Display for ControlFileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlFileOp::Open => "open",
            ControlFileOp::Write => "write to",
            ControlFileOp::Read => "read",
        };
        f.write_str(name)
    }
}

/// A failed control-file interaction, tagged with the step that failed and
/// the path it failed on.
#[derive(Debug, thiserror::Error)]
#[error("failed to {op} {}: {err}", .path.display())]
pub struct ControlFileError {
    op: ControlFileOp,
    path: PathBuf,
    #[source]
    err: std::io::Error,
}

impl ControlFileError {
    pub(crate) fn new(op: ControlFileOp, path: &Path, err: std::io::Error) -> Self {
        Self {
            op,
            path: path.to_path_buf(),
            err,
        }
    }

    pub fn op(&self) -> ControlFileOp {
        self.op
    }

    /// Raw errno of the underlying failure, when the kernel reported one.
    pub fn os_error(&self) -> Option<i32> {
        self.err.raw_os_error()
    }
}

/// Writes a single token. Control files are created by the kernel together
/// with their cgroup, never by corral, so a missing file fails the open.
pub fn write_control_file<P: AsRef<Path>, T: ToString>(
    path: P,
    value: T,
) -> Result<(), ControlFileError> {
    let path = path.as_ref();

    OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| ControlFileError::new(ControlFileOp::Open, path, err))?
        .write_all(value.to_string().as_bytes())
        .map_err(|err| ControlFileError::new(ControlFileOp::Write, path, err))?;

    Ok(())
}

/// Reads the file's complete snapshot in one pass.
pub fn read_control_file<P: AsRef<Path>>(path: P) -> Result<String, ControlFileError> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|err| ControlFileError::new(ControlFileOp::Read, path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::set_fixture;

    #[test]
    fn test_write_requires_existing_file() {
        let tmp = tempfile::tempdir().unwrap();

        let err = write_control_file(tmp.path().join("cpu.shares"), 1024).unwrap_err();
        assert_eq!(err.op(), ControlFileOp::Open);
        assert_eq!(err.os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "cpu.shares", "").unwrap();

        write_control_file(tmp.path().join("cpu.shares"), 1024).unwrap();
        assert_eq!(
            read_control_file(tmp.path().join("cpu.shares")).unwrap(),
            "1024"
        );
    }

    #[test]
    fn test_read_missing_file_is_a_read_failure() {
        let tmp = tempfile::tempdir().unwrap();

        let err = read_control_file(tmp.path().join("tasks")).unwrap_err();
        assert_eq!(err.op(), ControlFileOp::Read);
    }

    #[test]
    fn test_error_message_names_step_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("memory.limit_in_bytes");

        let err = write_control_file(&path, -1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("open"));
        assert!(message.contains(path.to_str().unwrap()));
    }
}
