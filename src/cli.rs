use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "cacheproxy", about = "Record and replay caching HTTP proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the proxy until interrupted (default).
    Serve,
    /// Compare two recorded bucket files and print one JSON line per record.
    Compare { a: PathBuf, b: PathBuf },
    /// Delete records older than a unix timestamp from every bucket file under DIR.
    Clean {
        dir: PathBuf,
        #[arg(long)]
        before: i64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_optional() {
        let cli = Cli::try_parse_from(["cacheproxy", "--config", "proxy.toml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("proxy.toml")));
    }

    #[test]
    fn parses_clean_subcommand() {
        let cli = Cli::try_parse_from(["cacheproxy", "clean", "store", "--before", "1700000000"])
            .unwrap();
        match cli.command {
            Some(Command::Clean { dir, before }) => {
                assert_eq!(dir, PathBuf::from("store"));
                assert_eq!(before, 1_700_000_000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
