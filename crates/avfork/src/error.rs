// Error type for spawning and waiting on children.

use avfork_syscall::SyscallError;
use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// A syscall made by the parent failed.
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: SyscallError,
    },

    /// The child was created but could not exec the program.
    #[error("failed to execute '{program}': {source}")]
    Exec {
        program: String,
        #[source]
        source: SyscallError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background wait task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SpawnError {
    /// Wrap a failed parent-side syscall, for use with `map_err`.
    pub fn syscall(op: &'static str) -> impl FnOnce(SyscallError) -> SpawnError {
        move |source| SpawnError::Syscall { op, source }
    }

    /// The errno behind this error, if it came from the kernel.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SpawnError::Syscall { source, .. } | SpawnError::Exec { source, .. } => {
                Some(source.errno())
            }
            SpawnError::Io(err) => err.raw_os_error().map(Errno::from_raw),
            SpawnError::InvalidArgument(_) | SpawnError::Join(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_error_names_program() {
        let err = SpawnError::Exec {
            program: "missing-tool".into(),
            source: SyscallError::from_raw(libc::ENOENT),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing-tool"));
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn syscall_helper_keeps_op() {
        let err = SpawnError::syscall("pipe2")(SyscallError::from_raw(libc::EMFILE));
        assert!(err.to_string().starts_with("pipe2 failed"));
        assert_eq!(err.errno(), Some(Errno::EMFILE));
    }

    #[test]
    fn io_errors_expose_errno() {
        let err = SpawnError::from(std::io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(err.errno(), Some(Errno::EBADF));
        assert_eq!(SpawnError::InvalidArgument("x".into()).errno(), None);
    }
}
