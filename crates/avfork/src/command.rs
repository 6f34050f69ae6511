// Process builder on top of `avfork`.
//
// Every string, pointer array and pipe is prepared in the parent. The child
// only issues syscalls, in this order: stdio redirection, working directory,
// supplementary groups, gid, uid, resource limits, nice value, scheduling
// policy, user hooks, signal mask restore, exec. If any step fails the child
// writes its errno to the report pipe and exits with `EXEC_FAILED_STATUS`.

use crate::avfork::{avfork, context_size};
use crate::child::{Child, ChildStderr, ChildStdin, ChildStdout, Output};
use crate::error::SpawnError;
use crate::settings::{SpawnSettings, MIN_STACK_SIZE};
use crate::stack::Stack;
use crate::stack_pool::StackPool;
use avfork_syscall::{
    autorestart, chdir, execve, execvel, prlimit, sched_setscheduler, setgroups, setpriority,
    setresgid, setresuid, sigprocmask, waitid_pid, AccessMode, CStrArray, ExecvelCandidate,
    ExitInfo, Fd, FdBasicOp, FdBox, FdFlags, Filename, Priority, PriorityWhichAndWho,
    PrlimitResource, Rlimit, SchedPolicy, SigSet, SigprocmaskHow, SyscallError, AT_FDCWD,
};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Exit status of a child that failed before or during exec.
pub const EXEC_FAILED_STATUS: c_int = 127;

/// Search path used when the child environment has no `PATH`.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

type PreExecHook = Box<dyn FnMut() -> Result<(), SyscallError> + Send + Sync>;

/// What the child's stdin, stdout or stderr is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// Share the parent's descriptor.
    Inherit,
    /// `/dev/null`.
    Null,
    /// A new pipe; the parent end shows up on `Child`.
    Piped,
}

impl Stdio {
    /// Returns (child end, parent end).
    fn setup(self, child_reads: bool) -> Result<(Option<FdBox>, Option<FdBox>), SpawnError> {
        match self {
            Stdio::Inherit => Ok((None, None)),
            Stdio::Null => {
                let access = if child_reads {
                    AccessMode::ReadOnly
                } else {
                    AccessMode::WriteOnly
                };
                let fd = FdBox::openat(AT_FDCWD, c"/dev/null", access, FdFlags::O_CLOEXEC)
                    .map_err(SpawnError::syscall("open /dev/null"))?;
                Ok((Some(fd), None))
            }
            Stdio::Piped => {
                let (read_end, write_end) =
                    FdBox::pipe2(FdFlags::O_CLOEXEC).map_err(SpawnError::syscall("pipe2"))?;
                if child_reads {
                    Ok((Some(read_end), Some(write_end)))
                } else {
                    Ok((Some(write_end), Some(read_end)))
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct CommandEnv {
    clear: bool,
    /// `None` removes the variable
    vars: BTreeMap<OsString, Option<OsString>>,
}

impl CommandEnv {
    fn capture(&self) -> BTreeMap<OsString, OsString> {
        let mut result: BTreeMap<OsString, OsString> = if self.clear {
            BTreeMap::new()
        } else {
            std::env::vars_os().collect()
        };
        for (key, value) in &self.vars {
            match value {
                Some(value) => result.insert(key.clone(), value.clone()),
                None => result.remove(key),
            };
        }
        result
    }
}

pub struct Command {
    program: CString,
    /// argv, program name included
    args: Vec<CString>,
    env: CommandEnv,
    cwd: Option<CString>,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    groups: Option<Vec<libc::gid_t>>,
    rlimits: Vec<(PrlimitResource, Rlimit)>,
    priority: Option<Priority>,
    sched_policy: Option<SchedPolicy>,
    stack_size: Option<usize>,
    pre_exec: Vec<PreExecHook>,
    saw_nul: bool,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("rlimits", &self.rlimits)
            .field("pre_exec", &self.pre_exec.len())
            .finish_non_exhaustive()
    }
}

fn os2c(s: &OsStr, saw_nul: &mut bool) -> CString {
    CString::new(s.as_bytes()).unwrap_or_else(|_| {
        *saw_nul = true;
        CString::from(c"<string-with-nul>")
    })
}

impl Command {
    pub fn new(program: impl AsRef<OsStr>) -> Command {
        let mut saw_nul = false;
        let program = os2c(program.as_ref(), &mut saw_nul);
        Command {
            args: vec![program.clone()],
            program,
            env: CommandEnv::default(),
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            uid: None,
            gid: None,
            groups: None,
            rlimits: Vec::new(),
            priority: None,
            sched_policy: None,
            stack_size: None,
            pre_exec: Vec::new(),
            saw_nul,
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Command {
        let arg = os2c(arg.as_ref(), &mut self.saw_nul);
        self.args.push(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env(&mut self, key: impl AsRef<OsStr>, val: impl AsRef<OsStr>) -> &mut Command {
        self.env
            .vars
            .insert(key.as_ref().to_owned(), Some(val.as_ref().to_owned()));
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Command
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, val) in vars {
            self.env(key, val);
        }
        self
    }

    pub fn env_remove(&mut self, key: impl AsRef<OsStr>) -> &mut Command {
        self.env.vars.insert(key.as_ref().to_owned(), None);
        self
    }

    /// Start the child from an empty environment.
    pub fn env_clear(&mut self) -> &mut Command {
        self.env.clear = true;
        self.env.vars.clear();
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Command {
        self.cwd = Some(os2c(dir.as_ref().as_os_str(), &mut self.saw_nul));
        self
    }

    pub fn stdin(&mut self, cfg: Stdio) -> &mut Command {
        self.stdin = Some(cfg);
        self
    }

    pub fn stdout(&mut self, cfg: Stdio) -> &mut Command {
        self.stdout = Some(cfg);
        self
    }

    pub fn stderr(&mut self, cfg: Stdio) -> &mut Command {
        self.stderr = Some(cfg);
        self
    }

    /// Run the child with this real, effective and saved uid.
    pub fn uid(&mut self, uid: libc::uid_t) -> &mut Command {
        self.uid = Some(uid);
        self
    }

    /// Run the child with this real, effective and saved gid.
    pub fn gid(&mut self, gid: libc::gid_t) -> &mut Command {
        self.gid = Some(gid);
        self
    }

    /// Replace the supplementary group list.
    pub fn groups(&mut self, groups: &[libc::gid_t]) -> &mut Command {
        self.groups = Some(groups.to_vec());
        self
    }

    pub fn rlimit(&mut self, resource: PrlimitResource, limit: Rlimit) -> &mut Command {
        self.rlimits.retain(|(r, _)| *r != resource);
        self.rlimits.push((resource, limit));
        self
    }

    /// Nice value of the child.
    pub fn priority(&mut self, priority: Priority) -> &mut Command {
        self.priority = Some(priority);
        self
    }

    pub fn sched_policy(&mut self, policy: SchedPolicy) -> &mut Command {
        self.sched_policy = Some(policy);
        self
    }

    /// Call stack for the child, in bytes. Never less than `MIN_STACK_SIZE`.
    pub fn stack_size(&mut self, size: usize) -> &mut Command {
        self.stack_size = Some(size);
        self
    }

    /// Run `f` in the child right before exec.
    ///
    /// # Safety
    /// `f` runs in a vfork child that shares memory with the parent and has
    /// every signal blocked. It must not allocate, take locks or panic; it
    /// should stick to the functions in `avfork_syscall`. Report failures by
    /// returning an error instead of panicking: a panic runs the panic hook in
    /// the child, which allocates and locks stderr and can deadlock the spawn
    /// (see `avfork`). A caught panic fails the spawn with exit status 127.
    pub unsafe fn pre_exec<F>(&mut self, f: F) -> &mut Command
    where
        F: FnMut() -> Result<(), SyscallError> + Send + Sync + 'static,
    {
        self.pre_exec.push(Box::new(f));
        self
    }

    pub fn get_program(&self) -> &CStr {
        &self.program
    }

    /// Spawn the child. Stdio not configured otherwise is inherited.
    pub fn spawn(&mut self) -> Result<Child, SpawnError> {
        self.spawn_inner(Stdio::Inherit, Stdio::Inherit)
    }

    /// Spawn the child with inherited stdio and wait for it.
    pub async fn status(&mut self) -> Result<ExitInfo, SpawnError> {
        self.spawn_inner(Stdio::Inherit, Stdio::Inherit)?.wait().await
    }

    /// Spawn the child with stdout and stderr captured and stdin at
    /// `/dev/null` (unless configured otherwise), and collect everything.
    pub async fn output(&mut self) -> Result<Output, SpawnError> {
        self.spawn_inner(Stdio::Null, Stdio::Piped)?
            .wait_with_output()
            .await
    }

    fn spawn_inner(&mut self, default_in: Stdio, default_out: Stdio) -> Result<Child, SpawnError> {
        if self.saw_nul {
            return Err(SpawnError::InvalidArgument("nul byte found in provided data".into()));
        }

        let env = self.env.capture();
        let envp_storage = env
            .iter()
            .map(|(key, value)| env_entry(key, value))
            .collect::<Result<Vec<_>, _>>()?;
        let envp_ptrs = ptr_array(&envp_storage);
        let argv_ptrs = ptr_array(&self.args);
        let (Some(envp), Some(argv)) = (CStrArray::new(&envp_ptrs), CStrArray::new(&argv_ptrs)) else {
            return Err(SpawnError::InvalidArgument("unterminated argument array".into()));
        };

        let path_var = env
            .get(OsStr::new("PATH"))
            .map(|path| path.as_bytes())
            .unwrap_or(DEFAULT_PATH.as_bytes());
        let search_dirs = split_search_path(path_var)?;
        let target = exec_target(&self.program, &search_dirs)?;

        let (child_stdin, parent_stdin) = self.stdin.unwrap_or(default_in).setup(true)?;
        let (child_stdout, parent_stdout) = self.stdout.unwrap_or(default_out).setup(false)?;
        let (child_stderr, parent_stderr) = self.stderr.unwrap_or(default_out).setup(false)?;

        let plan = ChildPlan {
            stdio: [
                child_stdin.as_deref().copied(),
                child_stdout.as_deref().copied(),
                child_stderr.as_deref().copied(),
            ],
            cwd: self.cwd.as_deref(),
            groups: self.groups.as_deref(),
            uid: self.uid,
            gid: self.gid,
            rlimits: &self.rlimits,
            priority: self.priority,
            sched_policy: self.sched_policy,
            target,
            argv: &argv,
            envp: &envp,
        };
        let hooks = &mut self.pre_exec;

        let stack_size = self
            .stack_size
            .unwrap_or(SpawnSettings::global().stack_size)
            .max(MIN_STACK_SIZE);
        let mut stack = StackPool::global().checkout();

        let (report, pid) = avfork_on(&mut stack, stack_size, |report: Fd, old_mask: &mut SigSet| {
            let err = match exec_child(&plan, hooks.as_mut_slice(), old_mask) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            let _ = report.write(&err.raw_errno().to_ne_bytes());
            EXEC_FAILED_STATUS
        })
        .map_err(SpawnError::syscall("avfork"))?;

        drop((child_stdin, child_stdout, child_stderr));
        drop(stack);

        let program = self.program.to_string_lossy().into_owned();
        if let Some(source) = read_report(&report, pid)? {
            tracing::debug!(%pid, %program, "child failed to exec: {source}");
            return Err(SpawnError::Exec { program, source });
        }

        tracing::debug!(%pid, %program, "spawned child");
        Ok(Child::new(
            pid,
            parent_stdin.map(ChildStdin::new),
            parent_stdout.map(ChildStdout::new),
            parent_stderr.map(ChildStderr::new),
        ))
    }
}

/// Read the child's errno, if it reported one. A reported failure means the
/// child has exited, so it is reaped here.
fn read_report(report: &FdBox, pid: Pid) -> Result<Option<SyscallError>, SpawnError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = autorestart(|| report.read(&mut buf[filled..]))
            .map_err(SpawnError::syscall("read"))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    match filled {
        0 => Ok(None),
        4 => {
            reap_failed_child(pid);
            Ok(Some(SyscallError::from_raw(c_int::from_ne_bytes(buf))))
        }
        _ => {
            reap_failed_child(pid);
            Err(SpawnError::syscall("read")(SyscallError::new(Errno::EIO)))
        }
    }
}

/// Reap a child that reported a failure and has already exited.
fn reap_failed_child(pid: Pid) -> Option<ExitInfo> {
    match autorestart(|| waitid_pid(pid, false)) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(%pid, "failed to reap child after exec failure: {err}");
            None
        }
    }
}

fn avfork_on<F>(stack: &mut Stack, stack_size: usize, f: F) -> Result<(FdBox, Pid), SyscallError>
where
    F: FnMut(Fd, &mut SigSet) -> c_int,
{
    let mut allocator = stack.reserve(stack_size, context_size::<F>())?;
    avfork(&mut allocator, f)
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString, SpawnError> {
    let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    CString::new(entry).map_err(|_| {
        SpawnError::InvalidArgument(format!("nul byte in environment variable {key:?}"))
    })
}

fn ptr_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Split a `PATH` value. An empty entry means the current directory.
fn split_search_path(path: &[u8]) -> Result<Vec<&str>, SpawnError> {
    path.split(|b| *b == b':')
        .map(|dir| match dir {
            b"" => Ok("."),
            dir => std::str::from_utf8(dir)
                .map_err(|_| SpawnError::InvalidArgument("PATH is not valid UTF-8".into())),
        })
        .collect()
}

#[derive(Clone, Copy)]
enum ExecTarget<'a> {
    Path(&'a CStr),
    Search(ExecvelCandidate<'a>),
}

fn exec_target<'a>(program: &'a CStr, search_dirs: &'a [&'a str]) -> Result<ExecTarget<'a>, SpawnError> {
    if program.to_bytes().contains(&b'/') {
        return Ok(ExecTarget::Path(program));
    }

    let filename = Filename::new(program).ok_or_else(|| {
        SpawnError::InvalidArgument(format!("invalid program name {program:?}"))
    })?;
    let candidate = ExecvelCandidate::new(filename, search_dirs)
        .ok_or_else(|| SpawnError::InvalidArgument("PATH entry too long".into()))?;
    Ok(ExecTarget::Search(candidate))
}

/// Everything the child needs, borrowed from the parent's frame.
struct ChildPlan<'a> {
    stdio: [Option<Fd>; 3],
    cwd: Option<&'a CStr>,
    groups: Option<&'a [libc::gid_t]>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    rlimits: &'a [(PrlimitResource, Rlimit)],
    priority: Option<Priority>,
    sched_policy: Option<SchedPolicy>,
    target: ExecTarget<'a>,
    argv: &'a CStrArray<'a>,
    envp: &'a CStrArray<'a>,
}

fn redirect(fd: Fd, target: c_int) -> Result<(), SyscallError> {
    if fd.get_fd() == target {
        return fd.set_cloexec(false);
    }
    // The duplicate must outlive the child's exec.
    std::mem::forget(fd.dup3(target, FdFlags::empty())?);
    Ok(())
}

/// Runs in the vfork child. Only returns on failure.
fn exec_child(
    plan: &ChildPlan<'_>,
    hooks: &mut [PreExecHook],
    old_mask: &SigSet,
) -> Result<Infallible, SyscallError> {
    for (target, fd) in plan.stdio.iter().enumerate() {
        if let Some(fd) = fd {
            redirect(*fd, target as c_int)?;
        }
    }

    if let Some(cwd) = plan.cwd {
        chdir(cwd)?;
    }
    if let Some(groups) = plan.groups {
        setgroups(groups)?;
    }
    if let Some(gid) = plan.gid {
        setresgid(gid, gid, gid)?;
    }
    if let Some(uid) = plan.uid {
        setresuid(uid, uid, uid)?;
    }
    for (resource, limit) in plan.rlimits {
        prlimit(None, *resource, Some(limit))?;
    }

    let this = Pid::from_raw(0);
    if let Some(priority) = plan.priority {
        setpriority(PriorityWhichAndWho::Process(this), priority)?;
    }
    if let Some(policy) = &plan.sched_policy {
        sched_setscheduler(this, policy)?;
    }

    for hook in hooks {
        hook()?;
    }

    sigprocmask(SigprocmaskHow::SIG_SETMASK, Some(old_mask))?;

    Err(match plan.target {
        ExecTarget::Path(path) => execve(path, plan.argv, plan.envp),
        ExecTarget::Search(candidate) => execvel(&candidate, plan.argv, plan.envp),
    })
}
