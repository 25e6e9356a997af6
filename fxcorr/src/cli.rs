use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fxcorr",
    version,
    about = "Distributed FX correlator",
    long_about = "Correlates station recordings described by a control file. \
                  Jobs are scheduled per integration slice over a pool of correlation workers."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the correlation described by a control file
    Run {
        /// Control file (TOML, or JSON with a .json extension)
        control: PathBuf,

        /// Override the number of correlation workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Assign jobs round-robin over workers instead of first-ready
        #[arg(long)]
        deterministic: bool,

        /// Override the output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a control file and print the job plan
    Check {
        /// Control file (TOML, or JSON with a .json extension)
        control: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let args = Args::parse_from([
            "fxcorr",
            "-v",
            "run",
            "n24l1.toml",
            "--workers",
            "4",
            "--deterministic",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Run {
                control,
                workers,
                deterministic,
                output,
            } => {
                assert_eq!(control, PathBuf::from("n24l1.toml"));
                assert_eq!(workers, Some(4));
                assert!(deterministic);
                assert!(output.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["fxcorr", "-v", "-q", "check", "a.toml"]).is_err());
    }
}
