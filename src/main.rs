use pgdoor::app;

fn main() {
    let args = match app::parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("Failed to parse arguments: {err}");
            std::process::exit(exitcode::USAGE);
        }
    };

    let config = match app::init_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        println!("Config file {} syntax is ok", args.config_file);
        std::process::exit(0);
    }

    if let Err(err) = app::init_logging(&args, &config) {
        eprintln!("Failed to initialize logging: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }

    app::install_panic_hook();

    if let Err(err) = app::run_server(args, config) {
        app::errors::report_fatal("server exited", err.as_ref());
    }
}
