// The low-level spawn primitive.
//
// `avfork` clones the calling process with CLONE_VM | CLONE_VFORK onto a
// caller-provided stack. The child shares the parent's memory and runs a Rust
// callback; the calling thread stays suspended until the child execs or
// exits, so the callback may borrow from the caller's frame. Everything the
// callback does must be async-signal-safe: no allocation, no locks, no
// unwinding. The wrappers in `avfork_syscall` are all usable there.

use crate::stack::StackObjectAllocator;
use avfork_syscall::{
    exit, reset_signal_handlers, sigfillset, sigprocmask, Fd, FdBox, FdFlags, SigSet,
    SigprocmaskHow, SyscallError,
};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// Exit status used when the child callback panics.
pub const PANIC_EXIT_STATUS: c_int = 127;

struct ChildContext<F> {
    f: F,
    report: Fd,
    old_mask: SigSet,
}

/// Object space `avfork` needs on the stack for a callback of type `F`.
pub const fn context_size<F>() -> usize {
    mem::size_of::<ChildContext<F>>() + mem::align_of::<ChildContext<F>>()
}

/// Entry point of the child. Never returns.
extern "C" fn trampoline<F>(arg: *mut c_void) -> c_int
where
    F: FnMut(Fd, &mut SigSet) -> c_int,
{
    // SAFETY: arg is the context avfork placed on this stack; the parent does
    // not touch it until we exec or exit.
    let ctx = unsafe { &mut *(arg as *mut ChildContext<F>) };

    reset_signal_handlers();

    // Last resort only: see the `# Panics` section of `avfork`.
    let status = panic::catch_unwind(AssertUnwindSafe(|| (ctx.f)(ctx.report, &mut ctx.old_mask)));
    match status {
        Ok(status) => exit(status),
        Err(payload) => {
            // freeing the payload would touch the parent's allocator state
            mem::forget(payload);
            avfork_syscall::errx!(PANIC_EXIT_STATUS, "avfork: child callback panicked")
        }
    }
}

/// Spawn a child running `f` on the stack behind `allocator`.
///
/// `f` receives the write end of an `O_CLOEXEC` report pipe and the signal
/// mask the caller had before all signals were blocked for the clone. It runs
/// with every signal blocked and every caught signal reset to `SIG_DFL`; it
/// should restore the mask right before `execve`. Its return value becomes
/// the child's exit status.
///
/// Returns the read end of the report pipe and the child's pid. By the time
/// this returns the child has exec'd or exited, so the read end yields
/// whatever the child reported followed by EOF.
///
/// # Panics
///
/// `f` must not panic. The panic hook and the unwinder run in the child,
/// allocate, and take the stderr lock, all in memory shared with the parent;
/// if another parent thread held the allocator lock at clone time the child
/// deadlocks and the calling thread stays suspended with it. A panic that
/// does get caught exits the child with `PANIC_EXIT_STATUS` and is never
/// propagated to the caller.
pub fn avfork<F>(
    allocator: &mut StackObjectAllocator<'_>,
    f: F,
) -> Result<(FdBox, Pid), SyscallError>
where
    F: FnMut(Fd, &mut SigSet) -> c_int,
{
    let (read_end, write_end) = FdBox::pipe2(FdFlags::O_CLOEXEC)?;

    let old_mask = sigprocmask(SigprocmaskHow::SIG_SETMASK, Some(&sigfillset()))?;

    let ctx = ChildContext {
        f,
        report: *write_end,
        old_mask,
    };
    let ctx = match allocator.alloc_obj(ctx) {
        Ok(ctx) => ctx as *mut ChildContext<F>,
        Err(ctx) => {
            drop(ctx);
            restore_mask(&old_mask);
            return Err(SyscallError::new(Errno::ENOMEM));
        }
    };
    let stack_top = allocator.stack_top();

    let pid = unsafe {
        libc::clone(
            trampoline::<F>,
            stack_top,
            libc::CLONE_VM | libc::CLONE_VFORK | libc::SIGCHLD,
            ctx as *mut c_void,
        )
    };
    let clone_err = (pid < 0).then(SyscallError::last);

    // The child has exec'd or exited, so the context is ours again.
    unsafe { ptr::drop_in_place(ctx) };
    restore_mask(&old_mask);
    drop(write_end);

    if let Some(err) = clone_err {
        return Err(err);
    }

    tracing::trace!(pid, "avfork child started");
    Ok((read_end, Pid::from_raw(pid)))
}

fn restore_mask(old_mask: &SigSet) {
    // Only fails for an invalid `how`, which SIG_SETMASK is not.
    let _ = sigprocmask(SigprocmaskHow::SIG_SETMASK, Some(old_mask));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;
    use avfork_syscall::{execve, waitid_pid, CStrArray, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run<F>(f: F) -> (FdBox, Pid)
    where
        F: FnMut(Fd, &mut SigSet) -> c_int,
    {
        let mut stack = Stack::new();
        let mut alloc = stack.reserve(64 * 1024, context_size::<F>()).unwrap();
        avfork(&mut alloc, f).unwrap()
    }

    fn exit_status(pid: Pid) -> Option<c_int> {
        waitid_pid(pid, false).unwrap().unwrap().exit_status()
    }

    #[test]
    fn child_shares_memory_with_parent() {
        let mut value = 0;
        let (_report, pid) = run(|_, _| {
            value = 42;
            0
        });
        assert_eq!(value, 42);
        assert_eq!(exit_status(pid), Some(0));
    }

    #[test]
    fn return_value_is_exit_status() {
        let (_report, pid) = run(|_, _| 9);
        assert_eq!(exit_status(pid), Some(9));
    }

    #[test]
    fn report_pipe_carries_child_data() {
        let (report, pid) = run(|fd, _| {
            let _ = fd.write(&libc::ENOENT.to_ne_bytes());
            127
        });

        let mut buf = [0u8; 8];
        let n = report.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(c_int::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]), libc::ENOENT);
        assert_eq!(report.read(&mut buf).unwrap(), 0);
        assert_eq!(exit_status(pid), Some(127));
    }

    #[test]
    fn report_pipe_closes_on_exec() {
        const ARGV: CStrArray = avfork_syscall::CStrArray!("true");
        const ENVP: CStrArray = avfork_syscall::CStrArray!("A=B");

        let (report, pid) = run(|_, old_mask| {
            let _ = sigprocmask(SigprocmaskHow::SIG_SETMASK, Some(old_mask));
            let err = execve(c"/bin/true", &ARGV, &ENVP);
            err.raw_errno()
        });

        let mut buf = [1u8; 1];
        assert_eq!(report.read(&mut buf).unwrap(), 0);
        assert!(report.is_cloexec().unwrap());
        assert_eq!(exit_status(pid), Some(0));
    }

    #[test]
    fn child_runs_with_signals_blocked_and_gets_old_mask() {
        let mut blocked_in_child = false;
        let mut usr1_in_old_mask = true;
        let (_report, pid) = run(|_, old_mask| {
            let current = sigprocmask(SigprocmaskHow::SIG_BLOCK, None).unwrap_or_else(|_| SigSet::empty());
            blocked_in_child = current.contains(Signal::SIGTERM);
            usr1_in_old_mask = old_mask.contains(Signal::SIGUSR1);
            0
        });
        exit_status(pid);

        assert!(blocked_in_child);
        assert!(!usr1_in_old_mask);
    }

    #[test]
    fn parent_mask_is_restored() {
        let before = sigprocmask(SigprocmaskHow::SIG_BLOCK, None).unwrap();
        let (_report, pid) = run(|_, _| 0);
        let after = sigprocmask(SigprocmaskHow::SIG_BLOCK, None).unwrap();
        exit_status(pid);

        assert_eq!(before.contains(Signal::SIGTERM), after.contains(Signal::SIGTERM));
        assert_eq!(before.contains(Signal::SIGCHLD), after.contains(Signal::SIGCHLD));
    }

    #[test]
    fn context_is_dropped_once() {
        struct Counted<'a>(&'a AtomicUsize);
        impl Drop for Counted<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = AtomicUsize::new(0);
        let guard = Counted(&drops);
        let (_report, pid) = run(move |_, _| {
            let _ = &guard;
            0
        });
        exit_status(pid);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocator_too_small_is_enomem() {
        let mut stack = Stack::new();
        let mut alloc = stack.reserve(64 * 1024, 0).unwrap();
        let big = [0u8; 256];
        let err = avfork(&mut alloc, move |_, _| big[0] as c_int).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOMEM);
    }

    #[test]
    fn stack_can_be_reused() {
        let mut stack = Stack::new();
        for i in 0..5 {
            let mut alloc = stack.reserve(64 * 1024, 64).unwrap();
            let (_report, pid) = avfork(&mut alloc, move |_, _| i).unwrap();
            assert_eq!(exit_status(pid), Some(i));
        }
    }
}
