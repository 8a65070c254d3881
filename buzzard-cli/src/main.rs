mod cli;
mod events;
mod state;

use std::time::Duration;

use buzzard_store::Store;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let store = Store::open_read_only(&cli.database, Duration::from_millis(cli.busy_timeout))?;
    match cli.command {
        Commands::Events(events_commands) => events::run(&store, events_commands)?,
        Commands::State(state_commands) => state::run(&store, state_commands)?,
    };
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buzzard_cli=warn,buzzard_store=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
