//! CLI Entry Point for fishface
//!
//! Provides command-line interface for:
//! - Running a job queue against the simulated rig
//! - Taking a calibration image
//! - Checking the effective configuration
//!
//! # Usage
//!
//! Run a queue:
//! ```bash
//! fishface run --queue config/queue.example.toml
//! ```
//!
//! Check configuration:
//! ```bash
//! fishface --config config/fishface.toml check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fishface::clock::{Clock, Timestamp};
use fishface::config::{FishFaceConfig, DEFAULT_CONFIG_PATH};
use fishface::controller::ControllerStatus;
use fishface::logging;
use fishface::queue_file::QueueFile;
use fishface::system::System;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fishface")]
#[command(about = "FishFace capture-job coordination core", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a job queue on the simulated rig
    Run {
        /// Queue file (TOML, or JSON by extension)
        #[arg(long)]
        queue: PathBuf,

        /// Seconds between status printouts
        #[arg(long, default_value = "5")]
        status_every: u64,
    },

    /// Take one calibration image on the simulated rig
    Calibrate {
        /// Experiment the image belongs to
        #[arg(long)]
        xp_id: i64,

        /// Species tag
        #[arg(long, default_value = "unknown")]
        species: String,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FishFaceConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            queue,
            status_every,
        } => {
            logging::init_from_config(&config)?;
            run_queue(config, queue, Duration::from_secs(status_every.max(1))).await
        }
        Commands::Calibrate { xp_id, species } => {
            logging::init_from_config(&config)?;
            calibrate(config, xp_id, &species).await
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            println!("configuration OK");
            Ok(())
        }
    }
}

async fn run_queue(config: FishFaceConfig, path: PathBuf, status_every: Duration) -> Result<()> {
    let queue = QueueFile::load(&path).with_context(|| format!("reading {}", path.display()))?;
    let (system, rig) = System::start_mock(config, Clock::system());

    let specs = system
        .service()
        .set_queue(queue.xp_id, &queue.species, &queue.jobs)
        .await?;
    info!(xp_id = queue.xp_id, jobs = specs.len(), "queue submitted");

    let mut ticker = tokio::time::interval(status_every);
    loop {
        tokio::select! {
            _ = system.service().wait_idle() => break,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, aborting all jobs");
                system.service().abort_all().await;
                break;
            }
            _ = ticker.tick() => print_status(&system.service().complete_status().await),
        }
    }

    system.shutdown().await;

    println!();
    println!("Experiment {} finished", queue.xp_id);
    for record in rig.store.job_records() {
        let status = record
            .status
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |s| s.status.to_string());
        println!(
            "  job record {:>3}: {:>9}, {} images at {} V",
            record.id,
            status,
            record.images.len(),
            record.request.voltage
        );
    }
    if let Some(reading) = rig.store.latest_power_reading() {
        println!(
            "  power supply at {}: {:.2} V, {:.3} A",
            format_time(reading.timestamp),
            reading.voltage_meas,
            reading.current_meas
        );
    }
    Ok(())
}

async fn calibrate(config: FishFaceConfig, xp_id: i64, species: &str) -> Result<()> {
    let (system, rig) = System::start_mock(config, Clock::system());
    system.camera().capture_calibration_image(xp_id, species).await?;

    // the capture thread retires on its own once the image is taken
    while system.camera().is_running().await {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    system.shutdown().await;

    for image in rig.store.calibration_images() {
        println!(
            "calibration image: {} bytes at {}",
            image.bytes,
            format_time(image.capture_timestamp)
        );
    }
    Ok(())
}

fn print_status(status: &ControllerStatus) {
    match &status.current_job {
        Some(job) => println!(
            "[{}] {} job {}: {}/{} captures left, {} s to go{}",
            format_time(job.reported_at),
            job.status,
            job.cjr_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            job.remaining,
            job.total,
            job.seconds_left,
            if status.staged_job.is_some() {
                ", next job staged"
            } else {
                ""
            }
        ),
        None => println!("no job running"),
    }
    if !status.queue.is_empty() {
        println!("  {} more jobs queued", status.queue.len());
    }
}

fn format_time(ts: Timestamp) -> String {
    ts.to_datetime()
        .map(|dt| dt.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}
