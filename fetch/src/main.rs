use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fetch::cli::Args;
use fetch::config::RunConfiguration;
use fetch::coordinator::Outcome;
use fetch::engine::swarm::SwarmEngine;
use fetch::report::{Lifecycle, StatusSink, TracingSink};
use fetch::signals::SignalStream;
use fetch::{app, logging};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.debug);
    let sink = Arc::new(TracingSink);

    let config = match RunConfiguration::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            sink.lifecycle(&Lifecycle::ConfigFailed {
                reason: e.to_string(),
            });
            return ExitCode::from(Outcome::ConfigFailed.exit_code());
        }
    };

    let signals = match SignalStream::register() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let outcome = app::run(&SwarmEngine, &config, signals, sink).await;
    ExitCode::from(outcome.exit_code())
}
