//! Top-level error reporting for the binary entry point.

use log::error;

/// Logs a fatal startup/runtime error and exits the process with the
/// conventional `EX_SOFTWARE` code, the same way a failed `bind()` or a
/// panic during initialization is reported.
pub fn report_fatal(context: &str, err: &dyn std::error::Error) -> ! {
    error!("{context}: {err}");
    std::process::exit(exitcode::SOFTWARE);
}
