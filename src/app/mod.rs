pub mod args;
pub mod config;
pub mod errors;
pub mod logger;
pub mod panic;
pub mod server;
pub mod tls;

pub use config::init_config;
pub use logger::init_logging;
pub use panic::install_panic_hook;
pub use server::run_server;

pub use args::{parse, Args, LogFormat};

pub fn parse_args() -> Result<Args, Box<dyn std::error::Error>> {
    Ok(args::parse())
}
