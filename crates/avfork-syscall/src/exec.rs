// execve family, including a PATH search that needs no heap.

use crate::error::SyscallError;
use crate::fd::{FdBasicOp, FdPath};
use nix::errno::Errno;
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_long};

pub use nix::fcntl::AtFlags as ExecveAtFlags;

/// Including the null byte.
///
/// linux/limits.h says 4096, but filesystems do not actually enforce that, so
/// leave some headroom.
pub const PATH_MAX: usize = 5 * 4096;

/// Not including the null byte.
pub const FILENAME_MAX: usize = 255;

/// A null-terminated array of pointers to C strings, as taken by `execve`.
#[derive(Copy, Clone, Debug)]
pub struct CStrArray<'a> {
    arr: &'a [*const c_char],
}

/// Build a `CStrArray` from string literals: `CStrArray!("ls", "-l")`.
#[macro_export]
macro_rules! CStrArray {
    ( $( $s:literal ),* $(,)? ) => {
        unsafe {
            $crate::exec::CStrArray::from_raw(&[
                $( ::std::concat!($s, "\0").as_ptr() as *const $crate::c_char, )*
                ::std::ptr::null(),
            ])
        }
    };
}

impl<'a> CStrArray<'a> {
    /// # Safety
    /// Every element but the last must point to a valid C string, and the last
    /// must be null.
    pub const unsafe fn from_raw(arr: &'a [*const c_char]) -> CStrArray<'a> {
        CStrArray { arr }
    }

    /// Returns `None` unless the last element is null.
    pub fn new(arr: &'a [*const c_char]) -> Option<CStrArray<'a>> {
        match arr.last() {
            Some(last) if last.is_null() => Some(CStrArray { arr }),
            _ => None,
        }
    }

    pub const fn as_ptr(&self) -> *const *const c_char {
        self.arr.as_ptr()
    }

    /// Number of strings, not counting the terminator.
    pub fn len(&self) -> usize {
        self.arr.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Only returns on failure.
pub fn execve(pathname: &CStr, argv: &CStrArray, envp: &CStrArray) -> SyscallError {
    unsafe {
        libc::execve(pathname.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    SyscallError::last()
}

/// Only returns on failure. Check `man 2 execveat` for more info.
pub fn execveat(
    dirfd: FdPath,
    pathname: &CStr,
    argv: &CStrArray,
    envp: &CStrArray,
    flags: ExecveAtFlags,
) -> SyscallError {
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            dirfd.get_fd() as c_long,
            pathname.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            flags.bits() as c_long,
        );
    }
    SyscallError::last()
}

/// A single path component.
#[derive(Copy, Clone, Debug)]
pub struct Filename<'a> {
    filename: &'a CStr,
}

impl<'a> Filename<'a> {
    /// `filename` must be non-empty, contain no slash, and be at most
    /// `FILENAME_MAX` bytes.
    pub fn new(filename: &'a CStr) -> Option<Filename<'a>> {
        let bytes = filename.to_bytes();
        if bytes.is_empty() || bytes.len() > FILENAME_MAX || bytes.contains(&b'/') {
            return None;
        }

        Some(Filename { filename })
    }

    pub fn as_cstr(&self) -> &'a CStr {
        self.filename
    }

    pub fn to_bytes(&self) -> &'a [u8] {
        self.filename.to_bytes()
    }

    pub fn len(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_bytes().is_empty()
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ExecvelCandidate<'a> {
    filename: Filename<'a>,
    paths: &'a [&'a str],
}

impl<'a> ExecvelCandidate<'a> {
    /// `paths` must not be empty, no element may be empty, and every
    /// `path/filename\0` must fit in `PATH_MAX`.
    pub fn new(filename: Filename<'a>, paths: &'a [&'a str]) -> Option<ExecvelCandidate<'a>> {
        if paths.is_empty() {
            return None;
        }

        for path in paths {
            // slash and null byte
            let size = filename.len() + path.len() + 2;
            if path.is_empty() || size > PATH_MAX {
                return None;
            }
        }

        Some(ExecvelCandidate { filename, paths })
    }

    pub fn filename(&self) -> &Filename<'a> {
        &self.filename
    }

    pub fn paths(&self) -> &'a [&'a str] {
        self.paths
    }
}

/// What a failed exec attempt means for the rest of the search.
enum SearchStep {
    Continue,
    Denied,
    Stop(SyscallError),
}

fn classify(err: SyscallError) -> SearchStep {
    match err.errno() {
        // Remember that we found something but were denied access, and keep looking.
        Errno::EACCES => SearchStep::Denied,
        // Missing or not executable by us: try the next directory. AFS and
        // similar filesystems report the odd ones.
        Errno::ENOENT | Errno::ESTALE | Errno::ENOTDIR | Errno::ENODEV | Errno::ETIMEDOUT => {
            SearchStep::Continue
        }
        _ => SearchStep::Stop(err),
    }
}

fn search_exhausted(got_eacces: bool) -> SyscallError {
    if got_eacces {
        SyscallError::new(Errno::EACCES)
    } else {
        SyscallError::new(Errno::ENOENT)
    }
}

/// Search `candidate`'s paths for the file, like the shell does.
///
/// If permission is denied for a file, the search continues; if nothing else is
/// found the result is `EACCES`. Only returns on failure.
pub fn execvel(candidate: &ExecvelCandidate, argv: &CStrArray, envp: &CStrArray) -> SyscallError {
    // Zeroing PATH_MAX bytes would fault in five pages that are mostly unused.
    let mut buffer = MaybeUninit::<[u8; PATH_MAX]>::uninit();
    let buffer = buffer.as_mut_ptr() as *mut u8;

    let filename = candidate.filename().to_bytes();
    let mut got_eacces = false;

    for path in candidate.paths() {
        let path = path.as_bytes();

        // SAFETY: ExecvelCandidate::new checked that path, slash, filename and
        // terminator fit in PATH_MAX.
        unsafe {
            std::ptr::copy_nonoverlapping(path.as_ptr(), buffer, path.len());
            buffer.add(path.len()).write(b'/');
            std::ptr::copy_nonoverlapping(filename.as_ptr(), buffer.add(path.len() + 1), filename.len());
            buffer.add(path.len() + 1 + filename.len()).write(0);

            libc::execve(buffer as *const c_char, argv.as_ptr(), envp.as_ptr());
        }

        match classify(SyscallError::last()) {
            SearchStep::Continue => continue,
            SearchStep::Denied => got_eacces = true,
            SearchStep::Stop(err) => return err,
        }
    }

    search_exhausted(got_eacces)
}

#[derive(Copy, Clone, Debug)]
pub struct FexecvelCandidate<'a> {
    filename: Filename<'a>,
    paths: &'a [FdPath],
}

impl<'a> FexecvelCandidate<'a> {
    /// `paths` must not be empty.
    pub fn new(filename: Filename<'a>, paths: &'a [FdPath]) -> Option<FexecvelCandidate<'a>> {
        if paths.is_empty() {
            return None;
        }

        Some(FexecvelCandidate { filename, paths })
    }

    pub fn filename(&self) -> &Filename<'a> {
        &self.filename
    }

    pub fn paths(&self) -> &'a [FdPath] {
        self.paths
    }
}

/// Same as `execvel`, with directories given as `O_PATH` fds.
pub fn fexecvel(candidate: &FexecvelCandidate, argv: &CStrArray, envp: &CStrArray) -> SyscallError {
    let filename = candidate.filename().as_cstr();
    let mut got_eacces = false;

    for dirfd in candidate.paths() {
        let err = execveat(*dirfd, filename, argv, envp, ExecveAtFlags::empty());

        match classify(err) {
            SearchStep::Continue => continue,
            SearchStep::Denied => got_eacces = true,
            SearchStep::Stop(err) => return err,
        }
    }

    search_exhausted(got_eacces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{FdPathBox, FdPathMode, AT_FDCWD};
    use crate::macros::tests::run_forked;

    const PATHS: [&str; 2] = ["/bin", "/usr/bin"];

    #[test]
    fn filename_validation() {
        assert!(Filename::new(c"echo").is_some());
        assert!(Filename::new(c"").is_none());
        assert!(Filename::new(c"bin/echo").is_none());

        let long = std::ffi::CString::new(vec![b'a'; FILENAME_MAX + 1]).unwrap();
        assert!(Filename::new(&long).is_none());
        let max = std::ffi::CString::new(vec![b'a'; FILENAME_MAX]).unwrap();
        assert!(Filename::new(&max).is_some());
    }

    #[test]
    fn candidate_validation() {
        let filename = Filename::new(c"echo").unwrap();
        assert!(ExecvelCandidate::new(filename, &[]).is_none());
        assert!(ExecvelCandidate::new(filename, &["/bin", ""]).is_none());
        assert!(ExecvelCandidate::new(filename, &PATHS).is_some());

        let huge = "x".repeat(PATH_MAX);
        let paths = [huge.as_str()];
        assert!(ExecvelCandidate::new(filename, &paths).is_none());
    }

    #[test]
    fn cstr_array_requires_terminator() {
        let hello = c"hello";
        let arr = [hello.as_ptr()];
        assert!(CStrArray::new(&arr).is_none());

        let arr = [hello.as_ptr(), std::ptr::null()];
        let array = CStrArray::new(&arr).unwrap();
        assert_eq!(array.len(), 1);

        let empty: [*const c_char; 0] = [];
        assert!(CStrArray::new(&empty).is_none());
    }

    #[test]
    fn cstr_array_macro() {
        const ARGV: CStrArray = CStrArray!("echo", "Hello");
        assert_eq!(ARGV.len(), 2);
        let first = unsafe { CStr::from_ptr(*ARGV.as_ptr()) };
        assert_eq!(first.to_bytes(), b"echo");
    }

    #[test]
    fn execvel_runs_program_from_path() {
        let status = run_forked(|| {
            let candidate = ExecvelCandidate::new(Filename::new(c"true").unwrap(), &PATHS).unwrap();
            let err = execvel(&candidate, &CStrArray!("true"), &CStrArray!("A=B"));
            crate::errx!(1, "{}", err);
        });
        assert_eq!(status, 0);
    }

    #[test]
    fn execvel_reports_enoent() {
        let status = run_forked(|| {
            let candidate =
                ExecvelCandidate::new(Filename::new(c"no-such-avfork-binary").unwrap(), &PATHS)
                    .unwrap();
            let err = execvel(&candidate, &CStrArray!("x"), &CStrArray!());
            err.raw_errno()
        });
        assert_eq!(status, libc::ENOENT);
    }

    #[test]
    fn execvel_reports_eacces_after_full_search() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("not-executable");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let dir_str = dir.path().to_str().unwrap().to_string();

        let status = run_forked(|| {
            let paths = [dir_str.as_str(), "/nonexistent-avfork-dir"];
            let candidate =
                ExecvelCandidate::new(Filename::new(c"not-executable").unwrap(), &paths).unwrap();
            let err = execvel(&candidate, &CStrArray!("x"), &CStrArray!());
            err.raw_errno()
        });
        // root still needs at least one execute bit, so this holds in CI containers too
        assert_eq!(status, libc::EACCES);
    }

    #[test]
    fn fexecvel_runs_program_from_dirfd() {
        let dirs = [
            FdPathBox::openat(AT_FDCWD, c"/bin", FdPathMode::AnyPath, true).unwrap(),
            FdPathBox::openat(AT_FDCWD, c"/usr/bin", FdPathMode::AnyPath, true).unwrap(),
        ];
        let paths = [*dirs[0], *dirs[1]];

        let status = run_forked(|| {
            let candidate = FexecvelCandidate::new(Filename::new(c"true").unwrap(), &paths).unwrap();
            let err = fexecvel(&candidate, &CStrArray!("true"), &CStrArray!("A=B"));
            crate::errx!(1, "{}", err);
        });
        assert_eq!(status, 0);
    }

    #[test]
    fn fexecvel_requires_paths() {
        let filename = Filename::new(c"true").unwrap();
        assert!(FexecvelCandidate::new(filename, &[]).is_none());
    }
}
