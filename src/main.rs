// Entrypoint for the CLI application.
// - Keeps `main` small: parse arguments, set up logging and Ctrl-C, then
//   hand off to `cli::run`.
// - Chooses the exit code from the error kind.

use anymotion_cli::cli::{run, Cli};
use anymotion_cli::poller::CancelToken;
use anymotion_cli::{ui, Error};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise quiet unless --verbose.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Pipeline commands turn Ctrl-C into a cancellation so no new job is
    // submitted and polling stops; jobs already submitted keep running
    // server-side. A second Ctrl-C exits at once. Other commands keep the
    // default behaviour.
    let cancel = CancelToken::new();
    if cli.command.submits_jobs() {
        let on_interrupt = cancel.clone();
        let installed = ctrlc::set_handler(move || {
            if on_interrupt.is_cancelled() {
                std::process::exit(130);
            }
            on_interrupt.cancel();
        });
        if let Err(e) = installed {
            tracing::warn!(error = %e, "could not install Ctrl-C handler");
        }
    }

    match run(cli, cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            ui::report_error(&err);
            match err.downcast_ref::<Error>() {
                Some(Error::Interrupted { .. }) => ExitCode::from(130),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
