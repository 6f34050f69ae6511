// avfork: Process spawning for Linux.
// Children are started with a vfork-style clone on cached, guard-paged stacks
// and awaited asynchronously through pidfds on the tokio runtime.

pub mod avfork;
pub mod child;
pub mod command;
pub mod error;
pub mod invoker;
pub mod settings;
pub mod stack;
pub mod stack_pool;
pub mod trace;
pub mod waiter;

// Re-export commonly used items at crate root
pub use crate::avfork::{avfork, context_size, PANIC_EXIT_STATUS};
pub use child::{Child, ChildStderr, ChildStdin, ChildStdout, Output};
pub use command::{Command, Stdio, EXEC_FAILED_STATUS};
pub use error::SpawnError;
pub use invoker::{
    shell_split, ProcessCancelledError, ProcessDataReceivedEventArgs, ProcessExitCodeError,
    ProcessInvoker,
};
pub use settings::SpawnSettings;
pub use stack::{Stack, StackObjectAllocator};
pub use stack_pool::{PooledStack, StackPool};
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter};
pub use waiter::ExitWaiter;

pub use avfork_syscall::{
    ExitInfo, Pid, Priority, PriorityWhichAndWho, PrlimitResource, Rlimit, SchedPolicy, Signal,
    SyscallError,
};
