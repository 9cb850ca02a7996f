//! pcmtrack - PCM ring-buffer position tracking CLI

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pcmtrack::config::{Args, Command, PcmConfig};
use pcmtrack::pcm::{Direction, HwParams, LifecycleController, SampleFormat, Trigger};
use pcmtrack::service::{PeriodEvent, SimulatedService};

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PcmConfig::load(path)?,
        None => PcmConfig::load_default()?,
    };

    // Initialize logging
    init_logging(&args, &config)?;

    // Execute command
    match args.command.unwrap_or_default() {
        Command::Simulate {
            slot,
            direction,
            rate,
            channels,
            format,
            period_bytes,
            periods,
            seconds,
            counter_start,
        } => {
            let params = HwParams::from_periods(channels, rate, format, period_bytes, periods)?;
            cmd_simulate(&config, slot, direction, params, seconds, counter_start)
        }
        Command::Constraints => cmd_constraints(&config),
        Command::Config => cmd_config(&config),
    }
}

fn init_logging(args: &Args, config: &PcmConfig) -> Result<()> {
    let level = args.log_level(&config.log_level);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args
        .log
        .clone()
        .or_else(|| (!config.log_file.is_empty()).then(|| config.log_file.clone()));

    if let Some(log_file) = log_file {
        let file = std::fs::File::create(&log_file)
            .with_context(|| format!("creating log file {}", log_file))?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Run a simulated stream end to end
fn cmd_simulate(
    config: &PcmConfig,
    slot: usize,
    direction: Direction,
    params: HwParams,
    seconds: u64,
    counter_start: u64,
) -> Result<()> {
    println!("pcmtrack - simulated {} stream\n", direction);

    let service = SimulatedService::clocked(counter_start);
    let (event_tx, event_rx) = bounded::<PeriodEvent>(256);
    let controller =
        LifecycleController::from_config(config, Arc::new(service), Arc::new(event_tx))?;

    controller.open(slot, "sim", direction)?;
    controller.configure(slot, &params)?;
    let outcome = controller.prepare(slot)?;
    for warning in &outcome.warnings {
        warn!("Prepare: {}", warning);
    }
    controller.trigger(slot, Trigger::Start)?;

    println!("Stream format: {}", params.pcm_format());
    println!(
        "Ring: {} bytes in {}-byte periods\n",
        outcome.buffer_size, outcome.period_size
    );

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let _ = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    });

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let period = outcome.period_size.max(1);
    let mut last_period = 0;
    let (mut notifications, mut periods) = (0u64, 0u64);

    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        match event_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                notifications += 1;
                // Notifications fire on any movement; count actual boundary crossings
                let current_period = event.pos / period;
                if current_period != last_period {
                    periods += 1;
                    last_period = current_period;
                    debug!("Period boundary at pos {}", event.pos);
                }
                if event.wrapped {
                    info!("Hardware counter wrapped at pos {}", event.pos);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let position = controller.pointer(slot)?;
    println!(
        "Final position: {} bytes ({} frames), {} counter wraps",
        position.pos, position.frames, position.n_overflow
    );
    println!(
        "{} notifications, {} period boundaries crossed",
        notifications, periods
    );

    if let Err(e) = controller.trigger(slot, Trigger::Stop) {
        warn!("Stop trigger failed: {}", e);
    }
    controller.close(slot);
    println!("Stopped.");

    Ok(())
}

/// Show the hardware capability table
fn cmd_constraints(config: &PcmConfig) -> Result<()> {
    let hw = &config.constraints;

    println!("Hardware constraints:\n");
    println!("  Formats:  {}", format_list(&hw.formats));
    println!("  Rate:     {} - {} Hz", hw.rate_min, hw.rate_max);
    println!("  Channels: {} - {}", hw.channels_min, hw.channels_max);
    println!("  Buffer:   up to {} bytes", hw.buffer_bytes_max);
    println!(
        "  Period:   {} - {} bytes",
        hw.period_bytes_min, hw.period_bytes_max
    );
    println!("  Periods:  {} - {}", hw.periods_min, hw.periods_max);
    println!();

    Ok(())
}

fn format_list(formats: &[SampleFormat]) -> String {
    formats
        .iter()
        .map(|f| format!("{:?}", f))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print the effective configuration
fn cmd_config(config: &PcmConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
