//! Panic hook installation.
//!
//! A panic inside a worker task only unwinds that task; left alone, the
//! process would keep running with one connection silently gone and no
//! trace in the log. The hook logs the panic through the same logger as
//! everything else and then aborts, so an operator watching the process
//! supervisor sees the crash instead of a pool that slowly wedges.

use log::error;
use std::panic;

/// Installs a panic hook that logs via `log::error!` before aborting the process.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        error!("panic at {location}: {message}");
        std::process::exit(exitcode::SOFTWARE);
    }));
}
