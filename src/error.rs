use std::fmt;

use crate::common::{ControlFileError, ControlFileOp};

/// The closed set of error kinds surfaced by the public API.
///
/// Every failure in the crate maps to exactly one of these; callers are
/// expected to branch on the kind and treat the message as diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    OutOfRange,
    PermissionDenied,
    Cancelled,
    Internal,
    Unimplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
            ErrorKind::Unimplemented => "unimplemented",
        };
        f.write_str(name)
    }
}

/// Error type carrying a kind from the closed set and a message naming the
/// offending path or operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }
}

// Kernel rejections on control files classify by the failed step: a file
// that cannot be opened has disappeared, a file that rejects the write
// exists but the kernel refused the value, and an unreadable file is in a
// state the caller cannot work with.
impl From<ControlFileError> for Error {
    fn from(err: ControlFileError) -> Self {
        let kind = match err.op() {
            ControlFileOp::Open => ErrorKind::NotFound,
            ControlFileOp::Write => ErrorKind::Unavailable,
            ControlFileOp::Read => ErrorKind::FailedPrecondition,
        };
        Error::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;

    use super::*;

    fn control_file_error(op: ControlFileOp, errno: i32) -> ControlFileError {
        ControlFileError::new(
            op,
            Path::new("/dev/cgroup/memory/test/tasks"),
            io::Error::from_raw_os_error(errno),
        )
    }

    #[test]
    fn test_control_file_error_kinds() {
        let open = control_file_error(ControlFileOp::Open, libc::ENOENT);
        assert_eq!(Error::from(open).kind(), ErrorKind::NotFound);

        let write = control_file_error(ControlFileOp::Write, libc::EINVAL);
        assert_eq!(Error::from(write).kind(), ErrorKind::Unavailable);

        let read = control_file_error(ControlFileOp::Read, libc::EIO);
        assert_eq!(Error::from(read).kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn test_message_mentions_path() {
        let err = Error::from(ControlFileError::new(
            ControlFileOp::Open,
            Path::new("/dev/cgroup/cpu/test/cpu.shares"),
            io::Error::from_raw_os_error(libc::ENOENT),
        ));
        assert!(err.message().contains("/dev/cgroup/cpu/test/cpu.shares"));
    }
}
