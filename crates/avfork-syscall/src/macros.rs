// Error reporting for code running inside the vfork child, where panicking and
// allocating are both off limits.

use crate::error::SyscallError;

/// Write a formatted message plus newline to stderr, then `_exit(status)`.
#[macro_export]
macro_rules! errx {
    ( $status:expr, $( $arg:tt )* ) => {{
        use ::std::io::Write as _;
        let mut stderr = $crate::fd::STDERR;
        let _ = ::std::writeln!(stderr, $( $arg )*);
        $crate::process::exit($status)
    }};
}

/// Unwrap `result`, or report the error after the formatted message and `_exit(1)`.
#[macro_export]
macro_rules! expect {
    ( $result:expr, $( $arg:tt )* ) => {
        match $result {
            Ok(val) => val,
            Err(err) => $crate::errx!(1, "{}: {}", ::std::format_args!($( $arg )*), err),
        }
    };
}

/// Unwrap `result`, or report the error and `_exit(1)`.
pub fn unwrap<T>(result: Result<T, SyscallError>) -> T {
    match result {
        Ok(val) => val,
        Err(err) => crate::errx!(1, "{}", err),
    }
}
