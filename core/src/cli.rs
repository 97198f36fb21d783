//! Command-line interface for aoti-container.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and exercise a pooled model container.
#[derive(Parser, Debug)]
#[command(name = "aoti-container")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the container and print its signature.
    Info {
        /// Path to a YAML config file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run inference once on a JSON input.
    Run {
        /// Path to a YAML config file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to input data file (JSON with "data" and "shape").
        #[arg(short, long)]
        input: PathBuf,

        /// Output format (json, pretty).
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Run the container concurrently from several threads and verify
    /// that every run produces identical output.
    Check {
        /// Path to a YAML config file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of caller threads.
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Runs per thread.
        #[arg(short = 'n', long, default_value_t = 100)]
        iterations: usize,
    },
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "aoti-container",
            "run",
            "--input",
            "x.json",
            "--format",
            "pretty",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { input, format, config } => {
                assert_eq!(input, PathBuf::from("x.json"));
                assert_eq!(format, "pretty");
                assert!(config.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_defaults() {
        let cli = Cli::try_parse_from(["aoti-container", "-v", "check"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Check {
                threads: 4,
                iterations: 100,
                ..
            }
        ));
    }
}
