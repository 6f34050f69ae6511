// avfork-syscall: Foundation layer for avfork.
// This crate has ZERO dependencies on other avfork crates. Every function in it
// is async-signal-safe and performs no heap allocation, so all of it may be
// called from the callback of `avfork`, where the child shares the parent's
// address space.

pub mod error;
pub mod exec;
pub mod fd;
pub mod macros;
pub mod process;
pub mod signal;
pub mod wait;

// Re-export commonly used items at crate root
pub use error::{autorestart, to_result, SyscallError};
pub use exec::{
    execve, execveat, execvel, fexecvel, CStrArray, ExecveAtFlags, ExecvelCandidate,
    FexecvelCandidate, Filename, FILENAME_MAX, PATH_MAX,
};
pub use fd::{
    AccessMode, Fd, FdBasicOp, FdBox, FdFlags, FdPath, FdPathBox, FdPathMode, FromRaw, Mode,
    AT_FDCWD, STDERR, STDIN, STDOUT,
};
pub use macros::unwrap;
pub use process::{
    chdir, exit, get_pagesz, getpid, getpriority, prlimit, sched_getparam, sched_getscheduler,
    sched_setparam, sched_setscheduler, setgroups, setpriority, setresgid, setresuid, Priority,
    PriorityWhichAndWho, PrlimitResource, Rlimit, SchedPolicy, RLIM_INFINITY,
};
pub use signal::{reset_signal_handlers, sigemptyset, sigfillset, sigprocmask, SigprocmaskHow};
pub use wait::{pidfd_open, waitid_pid, waitid_pid_nowait, ExitInfo};

pub use nix::sys::signal::{SigSet, Signal};
pub use nix::unistd::Pid;
pub use std::ffi::CStr;
pub use std::os::raw::{c_char, c_int, c_void};
