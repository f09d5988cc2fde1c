//! memstream - stream pieced transfers to mpv straight from memory
//!
//! # Usage
//!
//! ```bash
//! # List files and their piece ranges
//! memstream files ~/Videos/show/*.mkv
//!
//! # Play from the second episode on, releasing what has been watched
//! memstream play ~/Videos/show/*.mkv --index 1 --all
//!
//! # Machine-readable output
//! memstream serve ~/Videos/show/*.mkv --json
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;

use memstream::cli::{Cli, Command, ExitCode, Output};
use memstream::commands;
use memstream::config::Config;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let exit_code = run_cli(cli).await;
    std::process::exit(exit_code.into());
}

/// Logs go to stderr so stdout stays parseable; `RUST_LOG` wins over flags.
fn init_logging(cli: &Cli) {
    let default = if cli.verbose {
        "memstream=debug"
    } else if cli.quiet {
        "warn"
    } else {
        "memstream=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli) -> ExitCode {
    let output = Output::new(&cli);
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    match cli.command {
        Command::Files(cmd) => commands::files_cmd(cmd, &config, &output).await,

        Command::Serve(cmd) => commands::serve_cmd(cmd, &config, &output).await,

        Command::Play(cmd) => commands::play_cmd(cmd, &config, &output).await,

        Command::Config(cmd) => {
            commands::config_cmd(cmd, config, cli.config.as_deref(), &output).await
        }
    }
}
