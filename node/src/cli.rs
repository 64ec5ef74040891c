//! # CLI Interface
//!
//! Defines the command-line argument structure for `strata-node` using
//! `clap` derive. Every subcommand works on one log directory.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Strata log node.
///
/// Creates and edits single-writer append-only logs, serves them to peers
/// over TCP and clones them from other nodes, verifying every block.
#[derive(Parser, Debug)]
#[command(
    name = "strata-node",
    about = "Strata verified append-only log node",
    version,
    propagate_version = true
)]
pub struct StrataCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "STRATA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "STRATA_LOG", default_value = "strata_node=info,strata_protocol=info")]
    pub log_level: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new writable log and print its keys.
    Init(DirArgs),
    /// Append blocks: each argument, or each stdin line when none are given.
    Append(AppendArgs),
    /// Print one block to stdout.
    Get(GetArgs),
    /// Show length, byte length, fork and keys.
    Info(InfoArgs),
    /// Cut the log back to a shorter length on a new fork.
    Truncate(TruncateArgs),
    /// Listen on TCP and replicate the log to every connection.
    Serve(ServeArgs),
    /// Download a remote log into a local directory and keep serving it.
    Clone(CloneArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DirArgs {
    /// Directory holding the log.
    #[arg(long, short = 'd', env = "STRATA_DIR")]
    pub dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct AppendArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// Blocks to append, one per argument.
    pub blocks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// Block index.
    pub index: u64,

    /// Fetch from this server when the block is not held locally.
    #[arg(long)]
    pub connect: Option<String>,

    /// Give up on a remote fetch after this many milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct TruncateArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// New length in blocks.
    pub length: u64,

    /// Fork id to move to. Defaults to the current fork plus one.
    #[arg(long)]
    pub fork: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// Address to accept replication connections on.
    #[arg(long, short = 'l', env = "STRATA_LISTEN", default_value = "127.0.0.1:7420")]
    pub listen: String,
}

#[derive(Args, Debug)]
pub struct CloneArgs {
    #[command(flatten)]
    pub log: DirArgs,

    /// Hex-encoded public key of the log to clone.
    #[arg(long, short = 'k')]
    pub key: String,

    /// Server to download from.
    #[arg(long, short = 'c')]
    pub connect: String,

    /// First block to download.
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// End of the range (exclusive). Defaults to the remote length.
    #[arg(long)]
    pub end: Option<u64>,

    /// Download blocks strictly in order.
    #[arg(long)]
    pub linear: bool,

    /// After downloading, also accept connections on this address.
    #[arg(long, short = 'l')]
    pub listen: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        StrataCli::command().debug_assert();
    }

    #[test]
    fn parses_clone_arguments() {
        let cli = StrataCli::try_parse_from([
            "strata-node",
            "clone",
            "--dir",
            "/tmp/copy",
            "--key",
            "ab",
            "--connect",
            "127.0.0.1:7420",
            "--end",
            "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Clone(args) => {
                assert_eq!(args.log.dir, PathBuf::from("/tmp/copy"));
                assert_eq!(args.start, 0);
                assert_eq!(args.end, Some(10));
                assert!(!args.linear);
                assert!(args.listen.is_none());
            }
            other => panic!("parsed as {other:?}"),
        }
        assert_eq!(cli.log_format, LogFormatArg::Pretty);
    }

    #[test]
    fn append_takes_many_blocks() {
        let cli = StrataCli::try_parse_from(["strata-node", "append", "-d", "x", "one", "two"]).unwrap();
        match cli.command {
            Commands::Append(args) => assert_eq!(args.blocks, vec!["one", "two"]),
            other => panic!("parsed as {other:?}"),
        }
    }
}
