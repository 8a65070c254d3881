use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "A cli for inspecting the buzzard coordination store", long_about = None)]
pub struct Cli {
    /// Path of the coordination database
    #[arg(long, env = "BUZZARD_DATABASE", default_value = "/var/lib/buzzard/buzzard.db")]
    pub database: PathBuf,

    /// Milliseconds to wait while the agent holds the write lock
    #[arg(long, env = "BUZZARD_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Used to read the lifecycle event log
    #[command(subcommand)]
    Events(EventsCommands),

    /// Used to read the compacted per-container state
    #[command(subcommand)]
    State(StateCommands),
}

#[derive(Clone, Subcommand, Debug)]
pub enum EventsCommands {
    /// List recorded events ordered by container and time
    List {
        #[arg(long)]
        /// Only show events of this container id
        container: Option<String>,

        #[arg(long)]
        /// Maximum number of events to print
        limit: Option<usize>,
    },
}

#[derive(Clone, Subcommand, Debug)]
pub enum StateCommands {
    /// List the last known action and interfaces of every container
    List,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_events_list_flags() {
        let cli = Cli::parse_from([
            "buzzardctl",
            "--database",
            "/tmp/b.db",
            "events",
            "list",
            "--container",
            "abc",
            "--limit",
            "5",
        ]);
        assert_eq!(cli.database, PathBuf::from("/tmp/b.db"));
        let Commands::Events(EventsCommands::List { container, limit }) = cli.command else {
            panic!("expected events list");
        };
        assert_eq!(container.as_deref(), Some("abc"));
        assert_eq!(limit, Some(5));
    }
}
