// Error type shared by every syscall wrapper.

use nix::errno::Errno;
use std::fmt;
use std::os::raw::c_long;

/// An error returned by a failed syscall, carrying the raw errno.
///
/// Formatting a `SyscallError` never allocates: the description is a static
/// string, so it can be written to a raw fd from inside the vfork child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallError {
    errno: Errno,
}

impl SyscallError {
    pub const fn new(errno: Errno) -> Self {
        Self { errno }
    }

    /// Build from a raw errno value such as `libc::ENOENT`.
    pub fn from_raw(errno: i32) -> Self {
        Self {
            errno: Errno::from_raw(errno),
        }
    }

    /// The errno of the calling thread.
    pub fn last() -> Self {
        Self {
            errno: Errno::last(),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn raw_errno(&self) -> i32 {
        self.errno as i32
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno {}: {}", self.raw_errno(), self.errno.desc())
    }
}

impl std::error::Error for SyscallError {}

impl From<Errno> for SyscallError {
    fn from(errno: Errno) -> Self {
        Self::new(errno)
    }
}

impl From<SyscallError> for std::io::Error {
    fn from(err: SyscallError) -> Self {
        std::io::Error::from_raw_os_error(err.raw_errno())
    }
}

/// Convert the return value of a libc call into a `Result`.
///
/// A negative value means the call failed and errno holds the reason.
pub fn to_result(ret: c_long) -> Result<c_long, SyscallError> {
    if ret < 0 {
        Err(SyscallError::last())
    } else {
        Ok(ret)
    }
}

/// Call `f` again for as long as it fails with `EINTR`.
pub fn autorestart<T, F>(mut f: F) -> Result<T, SyscallError>
where
    F: FnMut() -> Result<T, SyscallError>,
{
    loop {
        match f() {
            Err(err) if err.errno() == Errno::EINTR => continue,
            ret => break ret,
        }
    }
}

/// Block form of [`autorestart`]: `autorestart!({ fd.read(&mut buf) })`.
#[macro_export]
macro_rules! autorestart {
    ( { $( $tt:tt )* } ) => {
        $crate::error::autorestart(|| { $( $tt )* })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autorestart_retries_on_eintr() {
        let mut cnt = 0;

        let result = autorestart(|| {
            if cnt == 0 {
                cnt = 1;
                Err(SyscallError::from_raw(libc::EINTR))
            } else {
                Ok(1)
            }
        });

        assert_eq!(result, Ok(1));
        assert_eq!(cnt, 1);
    }

    #[test]
    fn autorestart_macro_retries_on_eintr() {
        let mut cnt = 0;

        let result = crate::autorestart!({
            cnt += 1;
            if cnt < 3 {
                Err(SyscallError::from_raw(libc::EINTR))
            } else {
                Ok(cnt)
            }
        });

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn autorestart_passes_other_errors_through() {
        let mut calls = 0;
        let result: Result<(), _> = autorestart(|| {
            calls += 1;
            Err(SyscallError::from_raw(libc::EAGAIN))
        });

        assert_eq!(result.unwrap_err().raw_errno(), libc::EAGAIN);
        assert_eq!(calls, 1);
    }

    #[test]
    fn display_contains_errno_and_description() {
        let err = SyscallError::from_raw(libc::ENOENT);
        let msg = err.to_string();
        assert!(msg.starts_with("Errno 2: "));
        assert!(msg.len() > "Errno 2: ".len());
    }

    #[test]
    fn converts_into_io_error() {
        let err: std::io::Error = SyscallError::from_raw(libc::EACCES).into();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn to_result_maps_negative_to_errno() {
        assert_eq!(to_result(5), Ok(5));

        let ret = unsafe { libc::close(-1) };
        let err = to_result(ret as c_long).unwrap_err();
        assert_eq!(err.errno(), Errno::EBADF);
    }
}
