use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docsync::model::EventType;

#[derive(Debug, Parser)]
#[command(
    name = "docsync",
    about = "Keep search indexes in sync with remote file stores"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage synchronized resources
    Resource {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Apply pending change events (incremental)
    Sync(SyncArgs),
    /// Rebuild a resource's index from scratch behind its alias
    Rebuild(RebuildArgs),
    /// Write change events for a resource
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Search file names behind a resource's alias
    Search(SearchArgs),
    /// Show resources, aliases and pending events
    Status(StatusArgs),
    /// Read or change tuning settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Resource subcommands --

#[derive(Debug, Subcommand)]
pub enum ResourceAction {
    /// Register a resource
    Add {
        /// Resource identifier
        id: String,
        /// Backend key (nfs or memory)
        #[arg(long, default_value = "nfs")]
        backend: String,
        /// Export directory or bucket name
        #[arg(long)]
        root: String,
        /// Alias to serve the index under (default: docsync-<id>)
        #[arg(long)]
        alias: Option<String>,
    },
    /// Unregister a resource and delete its index
    Remove {
        /// Resource identifier
        id: String,
    },
    /// List registered resources
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Sync --

#[derive(Debug, Parser)]
pub struct SyncArgs {
    /// Sync only this resource
    #[arg(short = 'r', long)]
    pub resource: Option<String>,

    /// Keep running, syncing every SECS seconds until interrupted
    #[arg(long, value_name = "SECS")]
    pub watch: Option<u64>,
}

// -- Rebuild --

#[derive(Debug, Parser)]
pub struct RebuildArgs {
    /// Rebuild only this resource
    #[arg(short = 'r', long)]
    pub resource: Option<String>,
}

// -- Events --

#[derive(Debug, Subcommand)]
pub enum EventsAction {
    /// Append one event as a new producer batch
    Push {
        /// Resource identifier
        resource: String,
        /// Event type (created, deleted, moved-from, moved-to,
        /// folder-moved, reindex)
        #[arg(value_parser = parse_event_type)]
        event_type: EventType,
        /// Resource-relative path; folders end in /*
        #[arg(default_value = "")]
        path: String,
        /// Destination folder for folder-moved
        #[arg(long)]
        to: Option<String>,
        /// Producer name
        #[arg(long, default_value = "cli")]
        producer: String,
    },
}

fn parse_event_type(raw: &str) -> Result<EventType, String> {
    raw.parse().map_err(|e: docsync::Error| e.to_string())
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Resource to search
    #[arg(short = 'r', long)]
    pub resource: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Store a setting
    Set { key: String, value: String },
    /// Print a setting, or every setting when no key is given
    Get { key: Option<String> },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docsync",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_sync_watch() {
        let cli = Cli::parse_from(["docsync", "sync", "--watch", "30"]);
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.watch, Some(30));
                assert!(args.resource.is_none());
            }
            _ => panic!("expected sync command"),
        }
    }

    #[test]
    fn parse_events_push() {
        let cli = Cli::parse_from([
            "docsync",
            "events",
            "push",
            "photos",
            "folder-moved",
            "/a/*",
            "--to",
            "/b/*",
        ]);
        match cli.command {
            Command::Events {
                action:
                    EventsAction::Push {
                        resource,
                        event_type,
                        path,
                        to,
                        producer,
                    },
            } => {
                assert_eq!(resource, "photos");
                assert_eq!(event_type, EventType::FolderMoved);
                assert_eq!(path, "/a/*");
                assert_eq!(to.as_deref(), Some("/b/*"));
                assert_eq!(producer, "cli");
            }
            _ => panic!("expected events push"),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(
            Cli::try_parse_from(["docsync", "events", "push", "r", "renamed"])
                .is_err()
        );
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
