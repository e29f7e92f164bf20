//! CLI entry point for the scan engine
//!
//! Runs one scan against mock devices and prints the finished dataset as
//! JSON. Meant for trying configurations and for watching the engine's logs;
//! real instruments plug in through the `scan-core` capability traits.
//!
//! # Usage
//!
//! ```bash
//! scan_runner range --start 0 --step 0.5 --npoints 11 --time 0.1
//! scan_runner time --npoints 5 --delay 1
//! scan_runner continuous --start 0 --end 10
//! scan_runner --config config/scan_engine.toml range --npoints 3
//! ```
//!
//! Ctrl-C stops the scan after the current point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scan_core::{Dataset, Measurable, Preset, Readable, StopLevel};
use scan_engine::{
    builders, logging, EngineConfig, EnvChannel, MemorySink, ScanContext, ScanControl,
    ScanController,
};
use scan_mock::{MockDetector, MockMode, MockMotor, MockSensor, MotorLimits};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scan_runner")]
#[command(about = "Run a scan against mock devices", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML); defaults apply if missing
    #[arg(long, default_value = "config/scan_engine.toml")]
    config: PathBuf,

    /// Use instant mock devices instead of hardware-like timing
    #[arg(long)]
    instant: bool,

    /// Print the dataset on one line
    #[arg(long)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Equidistant step scan of the mock motor
    Range {
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        start: f64,
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        step: f64,
        #[arg(long, default_value_t = 5)]
        npoints: usize,
        /// Counting time per point, seconds
        #[arg(long, default_value_t = 0.1)]
        time: f64,
    },

    /// Count repeatedly without moving
    Time {
        #[arg(long, default_value_t = 5)]
        npoints: usize,
        #[arg(long, default_value_t = 0.1)]
        time: f64,
        /// Pause between points, seconds
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Move the mock motor continuously while counting
    Continuous {
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        start: f64,
        #[arg(long, default_value_t = 5.0, allow_negative_numbers = true)]
        end: f64,
        /// Sweep speed; default is the motor speed divided by the configured divisor
        #[arg(long)]
        speed: Option<f64>,
        /// Interval between points, seconds
        #[arg(long)]
        interval: Option<f64>,
    },
}

struct Bench {
    motor: MockMotor,
    ctx: ScanContext,
    sink: Arc<MemorySink>,
}

fn bench(config: EngineConfig, mode: MockMode) -> Bench {
    let motor = MockMotor::builder("m1")
        .unit("mm")
        .speed(5.0)
        .limits(MotorLimits::hard_stop(-100.0, 100.0))
        .mode(mode)
        .build();
    let detector = MockDetector::with_rate("ctr1", 1000.0).mode(mode);
    let temperature = Arc::new(MockSensor::new("T", "K", 295.0));
    let sink = Arc::new(MemorySink::new("memory"));

    let ctx = ScanContext::new(config)
        .with_detectors(vec![Arc::new(detector) as Arc<dyn Measurable>])
        .with_environment(vec![EnvChannel::Device(temperature.clone())])
        .with_metadata_devices(vec![
            Arc::new(motor.clone()) as Arc<dyn Readable>,
            temperature,
        ])
        .with_sink(sink.clone());
    Bench { motor, ctx, sink }
}

/// Request a stop after the current point on Ctrl-C.
fn stop_on_ctrl_c(control: ScanControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current point");
            control.request_stop(StopLevel::AfterPoint);
        }
    });
}

async fn run(command: Commands, bench: &Bench) -> Result<Option<Dataset>> {
    let ctx = &bench.ctx;
    match command {
        Commands::Range {
            start,
            step,
            npoints,
            time,
        } => {
            let motor = Arc::new(bench.motor.clone());
            let plan = builders::range_scan(vec![motor], &[start], &[step], npoints)?
                .description("range scan of m1")
                .preset(Preset::new().with("t", time))
                .build(ctx)?;
            let mut controller = ScanController::new(plan);
            stop_on_ctrl_c(controller.control());
            let result = controller.run().await;
            finish(result, controller.dataset())
        }
        Commands::Time {
            npoints,
            time,
            delay,
        } => {
            let mut preset = Preset::new().with("t", time);
            if let Some(delay) = delay {
                preset.insert("delay", delay);
            }
            let plan = builders::time_scan(Some(npoints), preset)
                .description("time scan")
                .build(ctx)?;
            let mut controller = ScanController::new(plan);
            stop_on_ctrl_c(controller.control());
            let result = controller.run().await;
            finish(result, controller.dataset())
        }
        Commands::Continuous {
            start,
            end,
            speed,
            interval,
        } => {
            let mut builder = builders::continuous_scan(Arc::new(bench.motor.clone()), start, end)
                .description("continuous scan of m1");
            if let Some(speed) = speed {
                builder = builder.speed(speed);
            }
            if let Some(interval) = interval {
                let interval = Duration::try_from_secs_f64(interval)
                    .context("interval must be a non-negative number of seconds")?;
                builder = builder.timedelta(interval);
            }
            let mut scan = builder.build(ctx)?;
            stop_on_ctrl_c(scan.control());
            let result = scan.run().await;
            finish(result, scan.dataset())
        }
    }
}

// A stop request still yields the points taken so far.
fn finish(
    result: scan_core::ScanResult<()>,
    dataset: Option<&Dataset>,
) -> Result<Option<Dataset>> {
    match result {
        Ok(()) => Ok(dataset.cloned()),
        Err(e) if e.is_cancellation() => {
            warn!("{}", e);
            Ok(dataset.cloned())
        }
        Err(e) => Err(e).context("scan failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init(&config.logging).map_err(anyhow::Error::msg)?;

    let mode = if cli.instant {
        MockMode::Instant
    } else {
        MockMode::Realistic
    };
    let bench = bench(config, mode);
    info!(config = %cli.config.display(), ?mode, "Mock bench ready");

    let Some(dataset) = run(cli.command, &bench).await? else {
        warn!("Scan ended before any data was taken");
        return Ok(());
    };
    info!(
        points = dataset.points.len(),
        sink_datasets = bench.sink.datasets().await.len(),
        "Scan complete"
    );

    let json = if cli.compact {
        serde_json::to_string(&dataset)?
    } else {
        serde_json::to_string_pretty(&dataset)?
    };
    println!("{}", json);
    Ok(())
}
