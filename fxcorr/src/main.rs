mod cli;

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Args, Commands};
use fxcorr::Correlator;
use fxcorr::config::{ControlFile, CorrelationConfig, SchedulingMode};
use fxcorr::logging::init_logging;
use fxcorr::scheduler::plan;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _guard = match init_logging(args.verbose, args.quiet, args.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Commands::Run {
            control,
            workers,
            deterministic,
            output,
        } => {
            let mut file = ControlFile::load(&control)?;
            if let Some(workers) = workers {
                file.workers = workers;
            }
            if deterministic {
                file.scheduling = SchedulingMode::Deterministic;
            }
            if let Some(output) = output {
                file.output_file = output;
            }
            let config = CorrelationConfig::from_control(file, base_dir(&control))
                .with_context(|| format!("invalid control file {}", control.display()))?;

            info!(
                experiment = %config.experiment,
                scans = config.scans.len(),
                workers = config.workers,
                "Starting correlation"
            );

            let correlator = Correlator::new(config);
            let terminate = correlator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing jobs in flight");
                    terminate.cancel();
                }
            });

            let report = correlator.run().await?;
            println!("{report}");
            info!("Correlation finished");
        }
        Commands::Check { control, json } => {
            let config = CorrelationConfig::load(&control)
                .with_context(|| format!("invalid control file {}", control.display()))?;
            let jobs = plan(Arc::new(config));

            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in &jobs {
                    let mut line = format!(
                        "{:>6}  {}  {} .. {}  {}",
                        job.slice_nr, job.scan, job.start, job.stop, job.channel
                    );
                    if let Some(cross) = &job.cross_channel {
                        line.push_str(&format!(" x {cross}"));
                    }
                    if let Some(bins) = job.bins {
                        line.push_str(&format!("  bins={bins}"));
                    }
                    if let Some(source) = &job.phase_center {
                        line.push_str(&format!("  source={source}"));
                    }
                    println!("{line}  streams={}", job.streams);
                }
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

fn base_dir(control: &Path) -> &Path {
    control.parent().unwrap_or_else(|| Path::new("."))
}
