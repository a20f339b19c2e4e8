use crate::handoff::HandoffError;
use nix::{errno::Errno, unistd::Pid};
use std::{
    error::Error,
    fmt,
    fmt::{Display, Formatter},
    io,
    os::unix::io::RawFd,
};

/// Why a check stopped before reaching a verdict.
#[derive(Debug)]
pub enum CheckError {
    /// The duplication primitive itself failed.
    Primitive {
        remote_fd: RawFd,
        remote_pid: Pid,
        err: Errno,
    },
    /// Process or pipe plumbing around the primitive failed.
    Ipc { op: &'static str, err: Errno },
    Handoff(HandoffError),
    Io(io::Error),
    /// A growth tolerance was requested but a sample was unavailable.
    CounterUnavailable,
    Growth {
        before: u64,
        after: u64,
        tolerance: u64,
    },
    /// Only produced when mismatches are treated as failures.
    NotLinked,
}

impl CheckError {
    pub fn ipc(op: &'static str) -> impl FnOnce(Errno) -> CheckError {
        move |err| CheckError::Ipc { op, err }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckError::NotLinked => 2,
            _ => 1,
        }
    }
}

impl Display for CheckError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Primitive {
                remote_fd,
                remote_pid,
                err,
            } => write!(
                f,
                "dup_remote_fd({}, {}) failed: {}",
                remote_fd,
                remote_pid,
                err.desc()
            ),
            CheckError::Ipc { op, err } => write!(f, "{}: {}", op, err.desc()),
            CheckError::Handoff(e) => write!(f, "{}", e),
            CheckError::Io(e) => write!(f, "{}", e),
            CheckError::CounterUnavailable => {
                write!(f, "open file count unavailable, can't apply growth tolerance")
            }
            CheckError::Growth {
                before,
                after,
                tolerance,
            } => write!(
                f,
                "open file count grew from {} to {} (more than {})",
                before, after, tolerance
            ),
            CheckError::NotLinked => write!(f, "stolen fd does not share the original's content"),
        }
    }
}

impl Error for CheckError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckError::Handoff(e) => Some(e),
            CheckError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HandoffError> for CheckError {
    fn from(e: HandoffError) -> Self {
        CheckError::Handoff(e)
    }
}

impl From<io::Error> for CheckError {
    fn from(e: io::Error) -> Self {
        CheckError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_failure_names_target() {
        let e = CheckError::Primitive {
            remote_fd: 42,
            remote_pid: Pid::from_raw(1234),
            err: Errno::EPERM,
        };
        let s = e.to_string();
        assert!(s.starts_with("dup_remote_fd(42, 1234) failed: "), "{}", s);
        assert_eq!(1, e.exit_code());
    }

    #[test]
    fn mismatch_has_its_own_exit_code() {
        assert_eq!(2, CheckError::NotLinked.exit_code());
        assert_eq!(1, CheckError::CounterUnavailable.exit_code());
    }

    #[test]
    fn ipc_helper_tags_operation() {
        let e = CheckError::ipc("fork")(Errno::EAGAIN);
        assert!(e.to_string().starts_with("fork: "));
    }
}
