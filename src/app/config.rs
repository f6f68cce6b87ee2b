use log::error;
use std::io::{self, IsTerminal, Write};

use crate::config::{get_config, Config};
use tokio::runtime::Builder;

use super::args::Args;

pub fn init_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    // Spin up a throwaway runtime to parse the config once, asynchronously,
    // so a parse error can be reported before the real runtime/logger exist.
    {
        let runtime = Builder::new_multi_thread().worker_threads(1).build()?;
        runtime.block_on(async {
            match crate::config::parse(args.config_file.as_str()).await {
                Ok(_) => (),
                Err(err) => {
                    let stdin = io::stdin();
                    if stdin.is_terminal() {
                        eprintln!("Config parse error: {err}");
                        io::stdout().flush().unwrap();
                    } else {
                        error!("Config parse error: {err:?}");
                    }
                    std::process::exit(exitcode::CONFIG);
                }
            };
        });
    }

    Ok(get_config())
}
