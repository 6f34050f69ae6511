// Reaping children: waitid(2) and pidfd_open(2).

use crate::error::{to_result, SyscallError};
use crate::fd::{FdBox, FromRaw};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::c_int;

/// How a child terminated, as reported by `waitid`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pid: i32,
    /// real uid of the child when it exited
    uid: u32,
    /// `si_code`: one of `CLD_EXITED`, `CLD_KILLED`, `CLD_DUMPED`
    code: c_int,
    /// exit status for `CLD_EXITED`, signal number otherwise
    status: c_int,
    /// user time consumed, in clock ticks
    utime: i64,
    /// system time consumed, in clock ticks
    stime: i64,
}

impl ExitInfo {
    /// # Safety
    /// `info` must have been filled in by a successful `waitid` with `WEXITED`.
    unsafe fn from_siginfo(info: &libc::siginfo_t) -> ExitInfo {
        ExitInfo {
            pid: info.si_pid(),
            uid: info.si_uid(),
            code: info.si_code,
            status: info.si_status(),
            utime: info.si_utime() as i64,
            stime: info.si_stime() as i64,
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid)
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn utime(&self) -> i64 {
        self.utime
    }

    pub fn stime(&self) -> i64 {
        self.stime
    }

    /// The exit status if the child terminated normally.
    pub fn exit_status(&self) -> Option<c_int> {
        (self.code == libc::CLD_EXITED).then_some(self.status)
    }

    /// The signal that terminated the child, if any.
    pub fn term_sig(&self) -> Option<c_int> {
        (self.code == libc::CLD_KILLED || self.code == libc::CLD_DUMPED).then_some(self.status)
    }

    pub fn term_signal(&self) -> Option<Signal> {
        self.term_sig().and_then(|sig| Signal::try_from(sig).ok())
    }

    pub fn core_dumped(&self) -> bool {
        self.code == libc::CLD_DUMPED
    }

    pub fn success(&self) -> bool {
        self.exit_status() == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.exit_status() {
            return write!(f, "exit status: {status}");
        }
        match self.term_signal() {
            Some(sig) => write!(f, "signal: {} ({})", self.status, sig.as_str())?,
            None => write!(f, "signal: {}", self.status)?,
        }
        if self.core_dumped() {
            write!(f, " (core dumped)")?;
        }
        Ok(())
    }
}

/// Wait for `pid` to exit and reap it.
///
/// With `nohang`, returns `Ok(None)` if the child is still running.
pub fn waitid_pid(pid: Pid, nohang: bool) -> Result<Option<ExitInfo>, SyscallError> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let mut options = libc::WEXITED;
    if nohang {
        options |= libc::WNOHANG;
    }

    Errno::result(unsafe { libc::waitid(libc::P_PID, pid.as_raw() as libc::id_t, &mut info, options) })?;

    if unsafe { info.si_pid() } == 0 {
        return Ok(None);
    }
    Ok(Some(unsafe { ExitInfo::from_siginfo(&info) }))
}

/// Block until `pid` has exited, leaving it waitable (`WNOWAIT`).
///
/// The child stays a zombie, so a later `waitid_pid` still gets its status.
pub fn waitid_pid_nowait(pid: Pid) -> Result<(), SyscallError> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    Errno::result(unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOWAIT,
        )
    })?;
    Ok(())
}

/// Open a pidfd for `pid`. The fd is always close-on-exec and becomes readable
/// once the process exits.
///
/// Fails with `ENOSYS` on kernels older than 5.3.
pub fn pidfd_open(pid: Pid) -> Result<FdBox, SyscallError> {
    let fd = to_result(unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) })?;
    Ok(unsafe { FdBox::from_raw(fd as c_int) })
}
