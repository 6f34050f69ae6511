// A spawned child and its stdio pipes.

use crate::error::SpawnError;
use crate::waiter::ExitWaiter;
use avfork_syscall::{ExitInfo, FdBox, Signal};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

/// Parent end of the child's stdin.
#[derive(Debug)]
pub struct ChildStdin {
    fd: FdBox,
}

/// Parent end of the child's stdout.
#[derive(Debug)]
pub struct ChildStdout {
    fd: FdBox,
}

/// Parent end of the child's stderr.
#[derive(Debug)]
pub struct ChildStderr {
    fd: FdBox,
}

impl ChildStdin {
    pub(crate) fn new(fd: FdBox) -> Self {
        Self { fd }
    }

    /// Register with the tokio reactor. Must be called inside a runtime.
    pub fn into_async(self) -> io::Result<pipe::Sender> {
        pipe::Sender::from_owned_fd(self.fd.into_owned_fd())
    }
}

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.fd.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

macro_rules! impl_child_reader {
    ($t:ident) => {
        impl $t {
            pub(crate) fn new(fd: FdBox) -> Self {
                Self { fd }
            }

            /// Register with the tokio reactor. Must be called inside a runtime.
            pub fn into_async(self) -> io::Result<pipe::Receiver> {
                pipe::Receiver::from_owned_fd(self.fd.into_owned_fd())
            }
        }

        impl Read for $t {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                Ok(self.fd.read(buf)?)
            }
        }
    };
}

impl_child_reader!(ChildStdout);
impl_child_reader!(ChildStderr);

/// Everything a child produced, as collected by `Child::wait_with_output`.
#[derive(Debug, Clone)]
pub struct Output {
    pub status: ExitInfo,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug)]
pub struct Child {
    pid: Pid,
    waiter: ExitWaiter,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl Child {
    pub(crate) fn new(
        pid: Pid,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) -> Self {
        Self {
            pid,
            waiter: ExitWaiter::new(pid),
            stdin,
            stdout,
            stderr,
        }
    }

    pub fn id(&self) -> Pid {
        self.pid
    }

    /// Close stdin, then wait for the child to exit. The status is cached.
    pub async fn wait(&mut self) -> Result<ExitInfo, SpawnError> {
        drop(self.stdin.take());
        self.waiter.wait().await
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitInfo>, SpawnError> {
        self.waiter.try_wait()
    }

    /// Send `signal` to the child. A no-op once the child has been reaped,
    /// since its pid may belong to someone else by then.
    pub fn signal(&self, signal: Signal) -> Result<(), SpawnError> {
        if self.waiter.status().is_some() {
            return Ok(());
        }
        nix::sys::signal::kill(self.pid, signal)
            .map_err(|errno| SpawnError::syscall("kill")(errno.into()))
    }

    pub fn kill(&self) -> Result<(), SpawnError> {
        self.signal(Signal::SIGKILL)
    }

    pub fn take_stdin_async(&mut self) -> io::Result<Option<pipe::Sender>> {
        self.stdin.take().map(ChildStdin::into_async).transpose()
    }

    pub fn take_stdout_async(&mut self) -> io::Result<Option<pipe::Receiver>> {
        self.stdout.take().map(ChildStdout::into_async).transpose()
    }

    pub fn take_stderr_async(&mut self) -> io::Result<Option<pipe::Receiver>> {
        self.stderr.take().map(ChildStderr::into_async).transpose()
    }

    /// Drain stdout and stderr concurrently, then wait for the child.
    pub async fn wait_with_output(mut self) -> Result<Output, SpawnError> {
        drop(self.stdin.take());
        let stdout = self.take_stdout_async()?;
        let stderr = self.take_stderr_async()?;

        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let status = self.wait().await?;

        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

async fn read_all(reader: Option<pipe::Receiver>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
