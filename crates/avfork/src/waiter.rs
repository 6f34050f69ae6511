// Asynchronous exit waiting for a single child.
//
// The fast path registers a pidfd with the tokio reactor and reaps with a
// non-blocking waitid once it turns readable. Kernels without pidfd_open
// (before 5.3) get a blocking thread that waits with WNOWAIT, so the status
// is never consumed anywhere but here.

use crate::error::SpawnError;
use avfork_syscall::{autorestart, pidfd_open, waitid_pid, waitid_pid_nowait, ExitInfo, SyscallError};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ExitWaiter {
    pid: Pid,
    /// pidfd not yet registered with the reactor
    pidfd: Option<OwnedFd>,
    registered: Option<AsyncFd<OwnedFd>>,
    /// blocking fallback still in flight from a cancelled `wait`
    blocking: Option<JoinHandle<Result<(), SyscallError>>>,
    status: Option<ExitInfo>,
}

impl ExitWaiter {
    /// Prepare to wait for `pid`, which must be an unreaped child of this
    /// process. Does not need a runtime; registration happens on first `wait`.
    pub fn new(pid: Pid) -> ExitWaiter {
        let pidfd = match pidfd_open(pid) {
            Ok(fd) => Some(fd.into_owned_fd()),
            Err(err) => {
                tracing::debug!(%pid, "pidfd_open unavailable ({err}), using blocking wait");
                None
            }
        };

        ExitWaiter {
            pid,
            pidfd,
            registered: None,
            blocking: None,
            status: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The exit status, if the child has already been reaped.
    pub fn status(&self) -> Option<ExitInfo> {
        self.status
    }

    /// Whether the fast pidfd path is in use.
    pub fn uses_pidfd(&self) -> bool {
        self.pidfd.is_some() || self.registered.is_some()
    }

    /// Reap the child if it has exited, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitInfo>, SpawnError> {
        if self.status.is_some() {
            return Ok(self.status);
        }

        let status = waitid_pid(self.pid, true).map_err(SpawnError::syscall("waitid"))?;
        if let Some(info) = status {
            self.reaped(info);
        }
        Ok(status)
    }

    /// Wait for the child to exit and reap it. The result is cached, so this
    /// may be called again afterwards. Cancel safe.
    pub async fn wait(&mut self) -> Result<ExitInfo, SpawnError> {
        if let Some(info) = self.status {
            return Ok(info);
        }

        if let Some(fd) = self.pidfd.take() {
            // SAFETY: the OwnedFd moves into the AsyncFd, so the descriptor
            // stays open and unchanged until the registration is dropped.
            match unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE) } {
                Ok(registered) => self.registered = Some(registered),
                Err(err) => {
                    let (_fd, cause) = err.into_parts();
                    tracing::warn!(pid = %self.pid, "failed to register pidfd ({cause}), using blocking wait");
                }
            }
        }

        if self.registered.is_some() {
            return self.wait_pidfd().await;
        }
        self.wait_blocking().await
    }

    async fn wait_pidfd(&mut self) -> Result<ExitInfo, SpawnError> {
        loop {
            let Some(registered) = self.registered.as_ref() else {
                return self.wait_blocking().await;
            };

            let status = {
                let mut guard = registered.readable().await?;
                let status = waitid_pid(self.pid, true).map_err(SpawnError::syscall("waitid"))?;
                if status.is_none() {
                    guard.clear_ready();
                }
                status
            };

            if let Some(info) = status {
                self.reaped(info);
                return Ok(info);
            }
        }
    }

    async fn wait_blocking(&mut self) -> Result<ExitInfo, SpawnError> {
        loop {
            let pid = self.pid;
            let handle = self
                .blocking
                .get_or_insert_with(|| tokio::task::spawn_blocking(move || autorestart(|| waitid_pid_nowait(pid))));
            let result = handle.await;
            self.blocking = None;
            result?.map_err(SpawnError::syscall("waitid"))?;

            if let Some(info) = self.try_wait()? {
                return Ok(info);
            }
        }
    }

    fn reaped(&mut self, info: ExitInfo) {
        tracing::debug!(pid = %self.pid, %info, "child reaped");
        self.status = Some(info);
        self.registered = None;
        self.pidfd = None;
    }
}

impl Drop for ExitWaiter {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Ok(Some(_)) = waitid_pid(self.pid, true) {
            return;
        }

        // Still running: reap it in the background so it does not linger as a zombie.
        let pid = self.pid;
        let reap = move || {
            let _ = autorestart(|| waitid_pid(pid, false));
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => {
                std::thread::spawn(reap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use std::time::Duration;

    fn fork_child(status: i32, sleep_ms: u64) -> Pid {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            if sleep_ms > 0 {
                unsafe { libc::usleep((sleep_ms * 1000) as libc::useconds_t) };
            }
            avfork_syscall::exit(status);
        }
        Pid::from_raw(pid)
    }

    fn fork_sleeper() -> Pid {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            loop {
                unsafe { libc::pause() };
            }
        }
        Pid::from_raw(pid)
    }

    #[tokio::test]
    async fn wait_returns_exit_status() {
        let mut waiter = ExitWaiter::new(fork_child(4, 50));
        let info = waiter.wait().await.unwrap();
        assert_eq!(info.exit_status(), Some(4));

        // cached
        assert_eq!(waiter.wait().await.unwrap(), info);
        assert_eq!(waiter.try_wait().unwrap(), Some(info));
    }

    #[tokio::test]
    async fn try_wait_before_exit_is_none() {
        let pid = fork_sleeper();
        let mut waiter = ExitWaiter::new(pid);
        assert_eq!(waiter.try_wait().unwrap(), None);

        kill(pid, Signal::SIGKILL).unwrap();
        let info = waiter.wait().await.unwrap();
        assert_eq!(info.term_signal(), Some(Signal::SIGKILL));
    }

    #[tokio::test]
    async fn wait_is_cancel_safe() {
        let pid = fork_sleeper();
        let mut waiter = ExitWaiter::new(pid);

        let timed_out = tokio::time::timeout(Duration::from_millis(50), waiter.wait()).await;
        assert!(timed_out.is_err());

        kill(pid, Signal::SIGTERM).unwrap();
        let info = waiter.wait().await.unwrap();
        assert_eq!(info.term_signal(), Some(Signal::SIGTERM));
    }

    #[tokio::test]
    async fn pidfd_is_registered_with_the_reactor() {
        let pid = fork_sleeper();
        let mut waiter = ExitWaiter::new(pid);
        if !waiter.uses_pidfd() {
            // kernel without pidfd_open
            kill(pid, Signal::SIGKILL).unwrap();
            waiter.wait().await.unwrap();
            return;
        }

        let timed_out = tokio::time::timeout(Duration::from_millis(20), waiter.wait()).await;
        assert!(timed_out.is_err());
        assert!(waiter.pidfd.is_none());
        assert!(waiter.registered.is_some());

        kill(pid, Signal::SIGKILL).unwrap();
        let info = waiter.wait().await.unwrap();
        assert_eq!(info.term_signal(), Some(Signal::SIGKILL));
        assert!(waiter.registered.is_none());
    }

    #[tokio::test]
    async fn blocking_fallback_reaps() {
        let mut waiter = ExitWaiter::new(fork_child(6, 20));
        waiter.pidfd = None;
        assert!(!waiter.uses_pidfd());

        let info = waiter.wait().await.unwrap();
        assert_eq!(info.exit_status(), Some(6));
    }

    #[test]
    fn new_needs_no_runtime() {
        let pid = fork_child(0, 0);
        let mut waiter = ExitWaiter::new(pid);
        let info = loop {
            if let Some(info) = waiter.try_wait().unwrap() {
                break info;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(info.success());
    }

    #[test]
    fn drop_reaps_running_child() {
        let pid = fork_sleeper();
        drop(ExitWaiter::new(pid));
        kill(pid, Signal::SIGKILL).unwrap();

        // the background reaper consumes the status
        let mut reaped = false;
        for _ in 0..200 {
            if kill(pid, None).is_err() {
                reaped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(reaped);
    }
}
