// Injectable trace writers for the process invoker.

use std::fmt;

/// Sink for per-invocation progress messages.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("##[warning]{message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("##[error]{message}"));
    }
}

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceLevel::Verbose => write!(f, "VERB"),
            TraceLevel::Info => write!(f, "INFO"),
            TraceLevel::Warning => write!(f, "WARN"),
            TraceLevel::Error => write!(f, "ERR "),
        }
    }
}

/// A named trace source that forwards to the `tracing` crate, and optionally
/// echoes every line to stdout.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    name: String,
    print_to_stdout: bool,
}

impl TracingTraceWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            print_to_stdout: false,
        }
    }

    pub fn with_stdout(mut self, print_to_stdout: bool) -> Self {
        self.print_to_stdout = print_to_stdout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self, level: TraceLevel, message: &str) {
        let name = &self.name;
        match level {
            TraceLevel::Error => tracing::error!(source = %name, "{}", message),
            TraceLevel::Warning => tracing::warn!(source = %name, "{}", message),
            TraceLevel::Info => tracing::info!(source = %name, "{}", message),
            TraceLevel::Verbose => tracing::debug!(source = %name, "{}", message),
        }

        if self.print_to_stdout {
            println!("[{name}] {level}: {message}");
        }
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        self.trace(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceLevel::Error, message);
    }
}

/// A no-op trace writer that discards all messages. Useful for tests.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// A trace writer that collects all messages into a `Vec`.
#[derive(Debug)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// Whether any collected message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|(_, msg)| msg.contains(needle))
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Default for CollectingTraceWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.messages.lock().push((TraceLevel::Info, message.to_string()));
    }

    fn verbose(&self, message: &str) {
        self.messages.lock().push((TraceLevel::Verbose, message.to_string()));
    }

    fn warning(&self, message: &str) {
        self.messages.lock().push((TraceLevel::Warning, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.messages.lock().push((TraceLevel::Error, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer() {
        let writer = CollectingTraceWriter::new();
        writer.info("hello");
        writer.warning("warn");
        writer.error("err");
        writer.verbose("verb");
        let msgs = writer.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], (TraceLevel::Info, "hello".into()));
        assert_eq!(msgs[1], (TraceLevel::Warning, "warn".into()));
        assert_eq!(msgs[2], (TraceLevel::Error, "err".into()));
        assert_eq!(msgs[3], (TraceLevel::Verbose, "verb".into()));
        assert!(writer.contains("ver"));

        writer.clear();
        assert!(writer.messages().is_empty());
    }

    struct InfoOnly(CollectingTraceWriter);

    impl TraceWriter for InfoOnly {
        fn info(&self, message: &str) {
            self.0.info(message);
        }

        fn verbose(&self, _message: &str) {}
    }

    #[test]
    fn default_warning_and_error_go_through_info() {
        let writer = InfoOnly(CollectingTraceWriter::new());
        writer.warning("disk low");
        writer.error("boom");
        let msgs = writer.0.messages();
        assert_eq!(msgs[0].1, "##[warning]disk low");
        assert_eq!(msgs[1].1, "##[error]boom");
    }

    #[test]
    fn tracing_writer_does_not_panic() {
        let writer = TracingTraceWriter::new("test").with_stdout(true);
        assert_eq!(writer.name(), "test");
        writer.info("test");
        writer.verbose("test");
        writer.warning("test");
        writer.error("test");
        NullTraceWriter.info("test");
    }
}
