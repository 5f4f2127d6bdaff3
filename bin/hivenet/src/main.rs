//! Harness command-line entry point.

use color_eyre::eyre::{Result, WrapErr};
use hivenet_cli::{
    args::{Args, Commands},
    config::{self, Config},
    logging, runtime,
};
use tracing::{info, trace};

/// Parses the arguments, loads the optional configuration file, then runs the command.
fn main() -> Result<()> {
    color_eyre::install()?;
    install_tracing_panic_hook();

    let args = Args::new();
    let mut config = match &args.config {
        Some(path) => config::load_config(path).wrap_err("Failed to load configuration file")?,
        None => Config::default(),
    };

    // Command-line flags win over the configuration file.
    if let Some(log_level) = args.log_level {
        config.logging.log_level = log_level;
    }
    if let Some(log_format) = args.log_format {
        config.logging.log_format = log_format;
    }

    // This is a drop guard responsible for flushing any remaining logs when the program terminates.
    // It must be assigned to a binding that is not _, as _ will result in the guard being dropped
    // immediately.
    let _guard = logging::init(config.logging.log_level, config.logging.log_format);

    if let Some(path) = &args.config {
        info!(file = %path.display(), "Loaded configuration");
    }
    trace!("Command-line parameters: {args:?}");

    match &args.command {
        Commands::Genesis(cmd) => {
            cmd.run(&config.testnet, config.logging.log_level)?;
            Ok(())
        }
        Commands::Keys(cmd) => {
            for key in cmd.run()? {
                println!("{}", key.pubkey_hex());
            }
            Ok(())
        }
        Commands::Proxy(cmd) => runtime::run_until_signal(config.runtime, |cancel| cmd.run(cancel)),
    }
}

fn install_tracing_panic_hook() {
    use std::panic;

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg: &str = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "panic"
        };

        tracing::error!(target = "panic", %location, message = %msg, "panic occurred");
        default_hook(info);
    }));
}
