// Process attribute syscalls: working directory, credentials, resource limits,
// nice values and scheduling policy.
//
// Credential changes go through the raw syscall instead of the libc wrapper.
// glibc broadcasts `setresuid` and friends to every thread it knows about,
// which would reach the parent's threads from inside a vfork child.

use crate::error::{to_result, SyscallError};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::ffi::CStr;
use std::os::raw::{c_int, c_long};

pub use libc::{gid_t, uid_t};

/// Check manpage for chdir for more documentation.
pub fn chdir(pathname: &CStr) -> Result<(), SyscallError> {
    Errno::result(unsafe { libc::chdir(pathname.as_ptr()) })?;
    Ok(())
}

pub fn getpid() -> Pid {
    Pid::from_raw(unsafe { libc::getpid() })
}

pub fn get_pagesz() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

pub fn setresuid(ruid: uid_t, euid: uid_t, suid: uid_t) -> Result<(), SyscallError> {
    to_result(unsafe { libc::syscall(libc::SYS_setresuid, ruid, euid, suid) })?;
    Ok(())
}

pub fn setresgid(rgid: gid_t, egid: gid_t, sgid: gid_t) -> Result<(), SyscallError> {
    to_result(unsafe { libc::syscall(libc::SYS_setresgid, rgid, egid, sgid) })?;
    Ok(())
}

pub fn setgroups(list: &[gid_t]) -> Result<(), SyscallError> {
    to_result(unsafe { libc::syscall(libc::SYS_setgroups, list.len(), list.as_ptr()) })?;
    Ok(())
}

/// Terminate the calling process immediately, without running atexit handlers
/// or flushing stdio buffers that are shared with the parent.
pub fn exit(status: c_int) -> ! {
    unsafe { libc::_exit(status) }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    /// the standard round-robin time-sharing policy
    Other,
    /// for "batch" style execution of processes
    Batch,
    /// for running very low priority background jobs
    Idle,
    /// real-time first-in, first-out policy with the given static priority
    Fifo(c_int),
    /// real-time round-robin policy with the given static priority
    RoundRobin(c_int),
}

impl SchedPolicy {
    fn as_raw(&self) -> (c_int, c_int) {
        match *self {
            SchedPolicy::Other => (libc::SCHED_OTHER, 0),
            SchedPolicy::Batch => (libc::SCHED_BATCH, 0),
            SchedPolicy::Idle => (libc::SCHED_IDLE, 0),
            SchedPolicy::Fifo(prio) => (libc::SCHED_FIFO, prio),
            SchedPolicy::RoundRobin(prio) => (libc::SCHED_RR, prio),
        }
    }
}

pub fn sched_getparam(pid: Pid) -> Result<c_int, SyscallError> {
    let mut param = libc::sched_param { sched_priority: 0 };
    Errno::result(unsafe { libc::sched_getparam(pid.as_raw(), &mut param) })?;
    Ok(param.sched_priority)
}

pub fn sched_setparam(pid: Pid, priority: c_int) -> Result<(), SyscallError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    Errno::result(unsafe { libc::sched_setparam(pid.as_raw(), &param) })?;
    Ok(())
}

/// Policies this crate does not model (e.g. `SCHED_DEADLINE`) are reported
/// as `EOPNOTSUPP`.
pub fn sched_getscheduler(pid: Pid) -> Result<SchedPolicy, SyscallError> {
    let policy = Errno::result(unsafe { libc::sched_getscheduler(pid.as_raw()) })?;

    Ok(match policy {
        libc::SCHED_OTHER => SchedPolicy::Other,
        libc::SCHED_BATCH => SchedPolicy::Batch,
        libc::SCHED_IDLE => SchedPolicy::Idle,
        libc::SCHED_FIFO => SchedPolicy::Fifo(sched_getparam(pid)?),
        libc::SCHED_RR => SchedPolicy::RoundRobin(sched_getparam(pid)?),
        _ => return Err(SyscallError::new(Errno::EOPNOTSUPP)),
    })
}

pub fn sched_setscheduler(pid: Pid, policy: &SchedPolicy) -> Result<(), SyscallError> {
    let (policy, priority) = policy.as_raw();
    let param = libc::sched_param {
        sched_priority: priority,
    };
    Errno::result(unsafe { libc::sched_setscheduler(pid.as_raw(), policy, &param) })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Resource limits
// ---------------------------------------------------------------------------

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrlimitResource {
    /// The maximum size of process's virtual memory (address space) in bytes,
    /// rounded down to the system page size.
    As = libc::RLIMIT_AS as i32,
    /// The maximum size of a core file in bytes, 0 disables core dumps.
    Core = libc::RLIMIT_CORE as i32,
    /// CPU time in seconds. `SIGXCPU` at the soft limit, `SIGKILL` at the hard limit.
    Cpu = libc::RLIMIT_CPU as i32,
    /// The maximum size of the data segment.
    Data = libc::RLIMIT_DATA as i32,
    /// The maximum size in bytes of files that the process may create.
    Fsize = libc::RLIMIT_FSIZE as i32,
    /// Combined number of `flock` locks and `fcntl` leases.
    Locks = libc::RLIMIT_LOCKS as i32,
    /// Bytes that may be locked in RAM.
    Memlock = libc::RLIMIT_MEMLOCK as i32,
    /// Bytes allocated for POSIX message queues of the real uid.
    Msgqueue = libc::RLIMIT_MSGQUEUE as i32,
    /// Ceiling to which the nice value can be raised.
    Nice = libc::RLIMIT_NICE as i32,
    /// One greater than the maximum fd number that can be opened.
    Nofile = libc::RLIMIT_NOFILE as i32,
    /// Number of extant processes for the real uid.
    Nproc = libc::RLIMIT_NPROC as i32,
    /// Resident set size. Only honoured by ancient kernels.
    Rss = libc::RLIMIT_RSS as i32,
    /// Ceiling on the real-time priority.
    Rtprio = libc::RLIMIT_RTPRIO as i32,
    /// Microseconds of CPU a real-time task may use without blocking.
    Rttime = libc::RLIMIT_RTTIME as i32,
    /// Number of signals that may be queued for the real uid.
    Sigpending = libc::RLIMIT_SIGPENDING as i32,
    /// The maximum size of the process stack in bytes.
    Stack = libc::RLIMIT_STACK as i32,
}

impl PrlimitResource {
    pub const ALL: [PrlimitResource; 16] = [
        PrlimitResource::As,
        PrlimitResource::Core,
        PrlimitResource::Cpu,
        PrlimitResource::Data,
        PrlimitResource::Fsize,
        PrlimitResource::Locks,
        PrlimitResource::Memlock,
        PrlimitResource::Msgqueue,
        PrlimitResource::Nice,
        PrlimitResource::Nofile,
        PrlimitResource::Nproc,
        PrlimitResource::Rss,
        PrlimitResource::Rtprio,
        PrlimitResource::Rttime,
        PrlimitResource::Sigpending,
        PrlimitResource::Stack,
    ];

    /// Short name as printed by `ulimit -a`-like tools.
    pub fn name(&self) -> &'static str {
        match self {
            PrlimitResource::As => "as",
            PrlimitResource::Core => "core",
            PrlimitResource::Cpu => "cpu",
            PrlimitResource::Data => "data",
            PrlimitResource::Fsize => "fsize",
            PrlimitResource::Locks => "locks",
            PrlimitResource::Memlock => "memlock",
            PrlimitResource::Msgqueue => "msgqueue",
            PrlimitResource::Nice => "nice",
            PrlimitResource::Nofile => "nofile",
            PrlimitResource::Nproc => "nproc",
            PrlimitResource::Rss => "rss",
            PrlimitResource::Rtprio => "rtprio",
            PrlimitResource::Rttime => "rttime",
            PrlimitResource::Sigpending => "sigpending",
            PrlimitResource::Stack => "stack",
        }
    }
}

pub const RLIM_INFINITY: u64 = u64::MAX;

/// Layout-compatible with the kernel's `struct rlimit64`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rlimit {
    /// soft limit
    pub cur: u64,
    /// hard limit
    pub max: u64,
}

impl Rlimit {
    pub const fn new(cur: u64, max: u64) -> Self {
        Self { cur, max }
    }
}

/// Get and optionally set a resource limit of `pid` (`None` for the caller).
///
///  * `new_limit` - if `Some`, it replaces the current limit.
///
/// Returns the old limit.
pub fn prlimit(
    pid: Option<Pid>,
    resource: PrlimitResource,
    new_limit: Option<&Rlimit>,
) -> Result<Rlimit, SyscallError> {
    let pid = pid.map(|pid| pid.as_raw()).unwrap_or(0);
    let new_ptr = match new_limit {
        Some(limit) => limit as *const Rlimit,
        None => std::ptr::null(),
    };
    let mut old = Rlimit::new(0, 0);

    to_result(unsafe {
        libc::syscall(
            libc::SYS_prlimit64,
            pid,
            resource as c_int,
            new_ptr,
            &mut old as *mut Rlimit,
        )
    })?;

    Ok(old)
}

// ---------------------------------------------------------------------------
// Nice values
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PriorityWhichAndWho {
    Process(Pid),
    ProcessGroup(Pid),
    User(uid_t),
}

impl PriorityWhichAndWho {
    fn as_raw(&self) -> (c_int, c_long) {
        match *self {
            PriorityWhichAndWho::Process(pid) => (libc::PRIO_PROCESS as c_int, pid.as_raw() as c_long),
            PriorityWhichAndWho::ProcessGroup(pgid) => (libc::PRIO_PGRP as c_int, pgid.as_raw() as c_long),
            PriorityWhichAndWho::User(uid) => (libc::PRIO_USER as c_int, uid as c_long),
        }
    }
}

/// A nice value in `-20..=19`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Priority {
    prio: c_int,
}

impl Priority {
    pub const fn new(prio: c_int) -> Option<Priority> {
        if prio >= -20 && prio <= 19 {
            Some(Priority { prio })
        } else {
            None
        }
    }

    pub const fn get_prio(&self) -> c_int {
        self.prio
    }
}

/// The raw syscall returns `20 - nice` so that success is never negative.
pub fn getpriority(which_and_who: PriorityWhichAndWho) -> Result<Priority, SyscallError> {
    let (which, who) = which_and_who.as_raw();
    let knice = to_result(unsafe { libc::syscall(libc::SYS_getpriority, which, who) })?;
    Ok(Priority {
        prio: (20 - knice) as c_int,
    })
}

pub fn setpriority(which_and_who: PriorityWhichAndWho, prio: Priority) -> Result<(), SyscallError> {
    let (which, who) = which_and_who.as_raw();
    to_result(unsafe { libc::syscall(libc::SYS_setpriority, which, who, prio.get_prio()) })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getpid_matches_std() {
        assert_eq!(getpid().as_raw() as u32, std::process::id());
    }

    #[test]
    fn page_size_is_power_of_two() {
        let size = get_pagesz();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn prlimit_reads_and_rewrites_nofile() {
        let current = prlimit(None, PrlimitResource::Nofile, None).unwrap();
        assert!(current.cur <= current.max);

        let old = prlimit(None, PrlimitResource::Nofile, Some(&current)).unwrap();
        assert_eq!(old, current);
    }

    #[test]
    fn prlimit_rejects_soft_above_hard() {
        let current = prlimit(None, PrlimitResource::Core, None).unwrap();
        if current.max == RLIM_INFINITY {
            return;
        }
        let bad = Rlimit::new(current.max + 1, current.max);
        let err = prlimit(None, PrlimitResource::Core, Some(&bad)).unwrap_err();
        assert_eq!(err.raw_errno(), libc::EINVAL);
    }

    #[test]
    fn resource_names_are_unique() {
        let mut names: Vec<_> = PrlimitResource::ALL.iter().map(|r| r.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PrlimitResource::ALL.len());
    }

    #[test]
    fn priority_bounds() {
        assert!(Priority::new(-20).is_some());
        assert!(Priority::new(19).is_some());
        assert!(Priority::new(-21).is_none());
        assert!(Priority::new(20).is_none());
        assert_eq!(Priority::new(5).unwrap().get_prio(), 5);
    }

    #[test]
    fn getpriority_matches_libc() {
        let prio = getpriority(PriorityWhichAndWho::Process(Pid::from_raw(0))).unwrap();
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
        assert_eq!(prio.get_prio(), nice);
    }

    #[test]
    fn setpriority_to_current_value() {
        let me = PriorityWhichAndWho::Process(Pid::from_raw(0));
        let prio = getpriority(me).unwrap();
        setpriority(me, prio).unwrap();
        assert_eq!(getpriority(me).unwrap(), prio);
    }

    #[test]
    fn sched_getscheduler_of_self() {
        let policy = sched_getscheduler(Pid::from_raw(0)).unwrap();
        if let SchedPolicy::Fifo(prio) | SchedPolicy::RoundRobin(prio) = policy {
            assert!(prio > 0);
        }
    }

    #[test]
    fn chdir_to_missing_directory_fails() {
        let err = chdir(c"/nonexistent/avfork/dir").unwrap_err();
        assert_eq!(err.raw_errno(), libc::ENOENT);
    }
}
