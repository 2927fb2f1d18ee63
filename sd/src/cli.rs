//! CLI command definitions and output helpers

use clap::{Args, Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{Principal, TaskStatus};

/// solverd - admission-controlled LU solve daemon
#[derive(Parser)]
#[command(
    name = "sd",
    about = "Solve dense linear systems with admission control and live progress",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Who the command acts as
#[derive(Debug, Clone, Args)]
pub struct Identity {
    /// Act as this user (omit to act as the local operator)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Grant staff rights to --user
    #[arg(long)]
    pub staff: bool,
}

impl Identity {
    /// Without --user the local operator has staff rights
    pub fn principal(&self) -> Principal {
        match &self.user {
            Some(user) if self.staff => Principal::staff(user.clone()),
            Some(user) => Principal::user(user.clone()),
            None => Principal::staff("operator"),
        }
    }
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit an augmented matrix file (rows of `a_i1 .. a_in b_i`)
    Submit {
        /// Input file
        file: PathBuf,

        /// Submitting user
        #[arg(short, long)]
        user: String,

        /// Reject systems larger than this (capped by limits.max-n)
        #[arg(long)]
        max_n: Option<usize>,

        /// Task name
        #[arg(long)]
        name: Option<String>,

        /// Task description
        #[arg(long)]
        description: Option<String>,

        /// Keep the L, U and P factors as artifacts
        #[arg(long)]
        save_factors: bool,
    },

    /// Run the scheduler and workers until Ctrl-C
    Worker,

    /// Show a task
    Status {
        /// Task ID
        id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Cancel a task
    Cancel {
        /// Task ID
        id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Follow a task's live updates until it finishes
    Watch {
        /// Task ID
        id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Show progress checkpoints of a task
    Progress {
        /// Task ID
        id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Show log lines of a task
    Logs {
        /// Task ID
        id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Show the capacity signal for a replica controller
    Capacity,

    /// List tasks
    List {
        /// Filter by status (pending, queued, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[command(flatten)]
        identity: Identity,
    },
}

/// Output format for status commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

/// Status label colored for terminals
pub fn colored_status(status: TaskStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        TaskStatus::Pending => label.normal(),
        TaskStatus::Queued => label.yellow(),
        TaskStatus::Running => label.cyan(),
        TaskStatus::Completed => label.green(),
        TaskStatus::Failed => label.red(),
        TaskStatus::Cancelled => label.dimmed(),
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("solverd")
        .join("logs")
        .join("solverd.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from(["sd", "submit", "a.txt", "--user", "alice", "--save-factors"]).unwrap();
        match cli.command {
            Command::Submit {
                file,
                user,
                save_factors,
                max_n,
                ..
            } => {
                assert_eq!(file, PathBuf::from("a.txt"));
                assert_eq!(user, "alice");
                assert!(save_factors);
                assert_eq!(max_n, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_parse_list_status_and_format() {
        let cli = Cli::try_parse_from(["sd", "list", "--status", "Queued", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::List { status, identity } => {
                assert_eq!(status, Some(TaskStatus::Queued));
                assert!(identity.principal().is_staff);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_identity_principal() {
        let identity = Identity {
            user: Some("bob".into()),
            staff: false,
        };
        assert_eq!(identity.principal(), Principal::user("bob"));

        let identity = Identity {
            user: Some("ops".into()),
            staff: true,
        };
        assert!(identity.principal().is_staff);
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
