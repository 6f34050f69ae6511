// Signal mask and disposition helpers.

use crate::error::SyscallError;
use nix::sys::signal::SigSet;
use std::os::raw::c_int;

pub use nix::sys::signal::SigmaskHow as SigprocmaskHow;

/// Number of signals on Linux, including the real-time range.
const NSIG: c_int = 65;

pub fn sigemptyset() -> SigSet {
    SigSet::empty()
}

pub fn sigfillset() -> SigSet {
    SigSet::all()
}

///  * `new_set` - if `Some(set)`, the mask is changed according to `how`.
///
/// Returns the old mask of the calling thread.
pub fn sigprocmask(how: SigprocmaskHow, new_set: Option<&SigSet>) -> Result<SigSet, SyscallError> {
    let mut old_set = SigSet::empty();
    nix::sys::signal::sigprocmask(how, new_set, Some(&mut old_set))?;
    Ok(old_set)
}

/// Put every caught signal back to `SIG_DFL`. Ignored signals stay ignored,
/// matching what `execve` would do anyway.
///
/// Handlers installed by the parent must never run inside the vfork child,
/// since they would operate on the parent's memory.
pub fn reset_signal_handlers() {
    for sig in 1..NSIG {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }

        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        // glibc reserves a couple of real-time signals and reports EINVAL for them
        if unsafe { libc::sigaction(sig, std::ptr::null(), &mut old) } != 0 {
            continue;
        }
        if old.sa_sigaction == libc::SIG_DFL || old.sa_sigaction == libc::SIG_IGN {
            continue;
        }

        let mut dfl: libc::sigaction = unsafe { std::mem::zeroed() };
        dfl.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigaction(sig, &dfl, std::ptr::null_mut());
        }
    }
}
