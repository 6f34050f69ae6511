// File descriptor wrappers.
//
// `Fd` and `FdPath` are plain `Copy` handles that can be passed into the vfork
// child freely. `FdBox` and `FdPathBox` own their descriptor and close it on drop.

use crate::error::SyscallError;
use nix::errno::Errno;
use std::ffi::CStr;
use std::io::{Read, Write};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::raw::{c_int, c_void};

pub use nix::fcntl::OFlag as FdFlags;
pub use nix::sys::stat::Mode;

/// Access mode passed to `open`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly = libc::O_RDONLY,
    WriteOnly = libc::O_WRONLY,
    ReadWrite = libc::O_RDWR,
}

/// What an `O_PATH` descriptor is allowed to refer to.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdPathMode {
    AnyPath = 0,
    Directory = libc::O_DIRECTORY,
    Symlink = libc::O_NOFOLLOW,
}

pub trait FromRaw {
    /// # Safety
    ///  * `fd` - must be a valid, open fd that is not owned by anything else
    unsafe fn from_raw(fd: c_int) -> Self;
}

pub trait FdBasicOp {
    type BoxedFd: FromRaw;

    fn get_fd(&self) -> c_int;

    /// Duplicate onto `newfd`. See `dup3(2)`.
    fn dup3(&self, newfd: c_int, flags: FdFlags) -> Result<Self::BoxedFd, SyscallError> {
        let fd = Errno::result(unsafe { libc::dup3(self.get_fd(), newfd, flags.bits()) })?;
        Ok(unsafe { Self::BoxedFd::from_raw(fd) })
    }

    /// Duplicate onto the lowest free descriptor. See `dup(2)`.
    fn dup(&self) -> Result<Self::BoxedFd, SyscallError> {
        let fd = Errno::result(unsafe { libc::dup(self.get_fd()) })?;
        Ok(unsafe { Self::BoxedFd::from_raw(fd) })
    }
}

macro_rules! impl_as_raw_fd_for {
    ($t:ident) => {
        impl AsRawFd for $t {
            fn as_raw_fd(&self) -> RawFd {
                self.get_fd()
            }
        }
    };
}

fn openat_raw(
    dirfd: FdPath,
    pathname: &CStr,
    flags: c_int,
    mode: libc::mode_t,
) -> Result<c_int, SyscallError> {
    let fd = unsafe { libc::openat(dirfd.get_fd(), pathname.as_ptr(), flags, mode as libc::c_uint) };
    Ok(Errno::result(fd)?)
}

fn close_raw(fd: c_int) {
    let ret = unsafe { libc::close(fd) };
    debug_assert!(
        ret == 0 || Errno::last() != Errno::EBADF,
        "closed an invalid fd {fd}"
    );
}

// ---------------------------------------------------------------------------
// Fd / FdBox
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fd {
    fd: c_int,
}

impl FromRaw for Fd {
    unsafe fn from_raw(fd: c_int) -> Fd {
        Fd { fd }
    }
}

impl FdBasicOp for Fd {
    type BoxedFd = FdBox;

    fn get_fd(&self) -> c_int {
        self.fd
    }
}
impl_as_raw_fd_for!(Fd);

impl Fd {
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize, SyscallError> {
        let ret = unsafe {
            libc::read(self.fd, buffer.as_mut_ptr() as *mut c_void, buffer.len())
        };
        Ok(Errno::result(ret)? as usize)
    }

    pub fn write(&self, buffer: &[u8]) -> Result<usize, SyscallError> {
        let ret = unsafe {
            libc::write(self.fd, buffer.as_ptr() as *const c_void, buffer.len())
        };
        Ok(Errno::result(ret)? as usize)
    }

    /// Set or clear `FD_CLOEXEC`.
    pub fn set_cloexec(&self, cloexec: bool) -> Result<(), SyscallError> {
        let flag = if cloexec { libc::FD_CLOEXEC } else { 0 };
        Errno::result(unsafe { libc::fcntl(self.fd, libc::F_SETFD, flag) })?;
        Ok(())
    }

    pub fn is_cloexec(&self) -> Result<bool, SyscallError> {
        let flags = Errno::result(unsafe { libc::fcntl(self.fd, libc::F_GETFD) })?;
        Ok(flags & libc::FD_CLOEXEC != 0)
    }
}

/// So that `write!` and `writeln!` work on a raw fd without allocating.
impl Write for Fd {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(Fd::write(self, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(Fd::read(self, buf)?)
    }
}

#[derive(Debug)]
pub struct FdBox {
    fd: Fd,
}

impl FromRaw for FdBox {
    unsafe fn from_raw(fd: c_int) -> FdBox {
        FdBox { fd: Fd::from_raw(fd) }
    }
}
impl_as_raw_fd_for!(FdBox);

impl AsFd for FdBox {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.get_fd()) }
    }
}

impl FdBox {
    /// Open an existing file. `dirfd` can be `AT_FDCWD`.
    ///
    /// Check manpage for openat for more documentation.
    pub fn openat(
        dirfd: FdPath,
        pathname: &CStr,
        access: AccessMode,
        flags: FdFlags,
    ) -> Result<FdBox, SyscallError> {
        let fd = openat_raw(dirfd, pathname, access as c_int | flags.bits(), 0)?;
        Ok(unsafe { FdBox::from_raw(fd) })
    }

    /// Create a file.
    ///
    ///  * `readable` - whether the returned fd will be readable
    ///  * `tmpfile` - pass `O_TMPFILE` (`pathname` names a directory) instead of `O_CREAT`
    ///  * `exclusive` - pass `O_EXCL`
    pub fn creatat(
        dirfd: FdPath,
        pathname: &CStr,
        readable: bool,
        flags: FdFlags,
        tmpfile: bool,
        exclusive: bool,
        mode: Mode,
    ) -> Result<FdBox, SyscallError> {
        let mut flags = flags.bits();
        if exclusive {
            flags |= libc::O_EXCL;
        }
        flags |= if readable { libc::O_RDWR } else { libc::O_WRONLY };
        flags |= if tmpfile { libc::O_TMPFILE } else { libc::O_CREAT };

        let fd = openat_raw(dirfd, pathname, flags, mode.bits())?;
        Ok(unsafe { FdBox::from_raw(fd) })
    }

    /// Returns (read end, write end).
    pub fn pipe2(flags: FdFlags) -> Result<(FdBox, FdBox), SyscallError> {
        let mut pipefd: [c_int; 2] = [-1, -1];

        Errno::result(unsafe { libc::pipe2(pipefd.as_mut_ptr(), flags.bits()) })?;

        Ok(unsafe { (FdBox::from_raw(pipefd[0]), FdBox::from_raw(pipefd[1])) })
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        let fd = self.fd.fd;
        std::mem::forget(self);
        unsafe { OwnedFd::from_raw_fd(fd) }
    }
}

impl From<OwnedFd> for FdBox {
    fn from(fd: OwnedFd) -> Self {
        unsafe { FdBox::from_raw(fd.into_raw_fd()) }
    }
}

impl Drop for FdBox {
    fn drop(&mut self) {
        close_raw(self.fd.fd);
    }
}

impl Deref for FdBox {
    type Target = Fd;

    fn deref(&self) -> &Self::Target {
        &self.fd
    }
}

// ---------------------------------------------------------------------------
// FdPath / FdPathBox
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FdPath {
    fd: c_int,
}

impl FromRaw for FdPath {
    /// # Safety
    ///  * `fd` - must be opened with `O_PATH`, or be `AT_FDCWD`
    unsafe fn from_raw(fd: c_int) -> FdPath {
        FdPath { fd }
    }
}

impl FdBasicOp for FdPath {
    type BoxedFd = FdPathBox;

    fn get_fd(&self) -> c_int {
        self.fd
    }
}
impl_as_raw_fd_for!(FdPath);

impl FdPath {
    /// Pre condition: self refers to a directory.
    pub fn fchdir(&self) -> Result<(), SyscallError> {
        Errno::result(unsafe { libc::fchdir(self.fd) })?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct FdPathBox {
    fd: FdPath,
}

impl FromRaw for FdPathBox {
    unsafe fn from_raw(fd: c_int) -> FdPathBox {
        FdPathBox { fd: FdPath::from_raw(fd) }
    }
}
impl_as_raw_fd_for!(FdPathBox);

impl AsFd for FdPathBox {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.get_fd()) }
    }
}

impl FdPathBox {
    pub fn openat(
        dirfd: FdPath,
        pathname: &CStr,
        mode: FdPathMode,
        cloexec: bool,
    ) -> Result<FdPathBox, SyscallError> {
        let mut flags = libc::O_PATH | mode as c_int;
        if cloexec {
            flags |= libc::O_CLOEXEC;
        }

        let fd = openat_raw(dirfd, pathname, flags, 0)?;
        Ok(unsafe { FdPathBox::from_raw(fd) })
    }
}

impl Drop for FdPathBox {
    fn drop(&mut self) {
        close_raw(self.fd.fd);
    }
}

impl Deref for FdPathBox {
    type Target = FdPath;

    fn deref(&self) -> &Self::Target {
        &self.fd
    }
}

pub const AT_FDCWD: FdPath = FdPath { fd: libc::AT_FDCWD };
pub const STDIN: Fd = Fd { fd: 0 };
pub const STDOUT: Fd = Fd { fd: 1 };
pub const STDERR: Fd = Fd { fd: 2 };
