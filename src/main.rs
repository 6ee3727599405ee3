//! CLI Entry Point for scan_daq
//!
//! Provides command-line interface for:
//! - Running a grid scan on simulated hardware, interruptible with Ctrl+C
//! - Printing the coordinate list a configuration produces
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! scan_daq run --config config/scan.toml --output /tmp/scans
//! scan_daq grid --points 16
//! scan_daq config
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use scan_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use scan_daq::hardware::DeviceRegistry;
use scan_daq::presenter::TracingPresenter;
use scan_daq::storage::FileSinkOpener;
use scan_daq::{logging, DaqError, ScanController};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(name = "scan_daq")]
#[command(about = "Grid-scan acquisition with stage moves, frame capture and dataset storage", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one measurement on simulated hardware
    Run {
        /// Output directory (overrides storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Maximum number of grid points (overrides grid.n_points_max)
        #[arg(long)]
        points: Option<u32>,
    },

    /// Print the coordinate list as JSON
    Grid {
        /// Maximum number of grid points (overrides grid.n_points_max)
        #[arg(long)]
        points: Option<u32>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::Run { output, points } => {
            if let Some(output) = output {
                config.storage.output_dir = output;
            }
            override_points(&mut config, points);
            run_scan(config).await
        }
        Commands::Grid { points } => {
            override_points(&mut config, points);
            config.validate()?;
            let coordinates = config.grid.prepare()?;
            println!("{}", serde_json::to_string_pretty(&coordinates)?);
            Ok(())
        }
        Commands::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn override_points(config: &mut AppConfig, points: Option<u32>) {
    if let Some(points) = points {
        config.grid.n_points_max = points;
        config.grid.points = None;
    }
}

async fn run_scan(config: AppConfig) -> Result<()> {
    config.validate()?;
    logging::init_from_config(&config)?;

    println!("🚀 scan_daq - Grid Scan Acquisition");
    println!("🔧 Initializing simulated hardware...");
    let registry = DeviceRegistry::simulated(&config)?;

    let mut controller = match ScanController::new(
        config,
        &registry,
        Arc::new(FileSinkOpener),
        Arc::new(TracingPresenter),
    )
    .await
    {
        Ok(controller) => controller,
        Err(err @ DaqError::DeviceNotConfigured { .. }) => {
            eprintln!("❌ Scan disabled: {err}");
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let run = controller.prepare_measurement().await?;
    println!("📁 Dataset: {}", run.dataset().display());
    println!(
        "▶️  Scanning {} points - Press Ctrl+C to stop after the current step",
        controller.coordinates().len()
    );

    let handle = run.handle();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("\n⏹  Interrupt requested, finishing current step...");
            handle.interrupt();
        }
    });

    let result = controller.execute(run).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            println!();
            println!("✅ Measurement finished");
            println!(
                "   Steps: {}/{}{}",
                report.summary.steps_completed,
                report.summary.total_steps,
                if report.summary.interrupted {
                    " (interrupted)"
                } else {
                    ""
                }
            );
            println!("   Dataset: {}", report.session.path.display());
            Ok(())
        }
        Err(err) => {
            eprintln!();
            eprintln!("❌ Measurement failed: {err}");
            Err(err.into())
        }
    }
}
