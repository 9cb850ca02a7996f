//! CLI argument parsing using clap

use crate::pcm::{Direction, SampleFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pcmtrack - PCM ring-buffer position tracking
///
/// Drives a stream through open/configure/prepare/close against a simulated
/// audio service and reports position updates
#[derive(Parser, Debug)]
#[command(name = "pcmtrack")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated stream and log period notifications
    Simulate {
        /// Stream slot index
        #[arg(long, default_value = "0")]
        slot: usize,

        /// Data-flow direction
        #[arg(short, long, value_enum, default_value = "playback")]
        direction: Direction,

        /// Sample rate in Hz
        #[arg(short, long, default_value = "48000")]
        rate: u32,

        /// Channel count
        #[arg(long, default_value = "2")]
        channels: u16,

        /// Sample format
        #[arg(short, long, value_enum, default_value = "s16-le")]
        format: SampleFormat,

        /// Period size in bytes
        #[arg(long, default_value = "480")]
        period_bytes: usize,

        /// Periods per ring buffer
        #[arg(long, default_value = "4")]
        periods: usize,

        /// Run time in seconds (0 = until Ctrl+C)
        #[arg(short, long, default_value = "3")]
        seconds: u64,

        /// Initial hardware counter value (close to 4294967296 to force a wrap)
        #[arg(long, default_value = "0")]
        counter_start: u64,
    },

    /// Show the hardware capability table
    Constraints,

    /// Print the effective configuration as TOML
    Config,
}

impl Args {
    /// Get the log level based on verbose/quiet flags, falling back to the
    /// configured level
    pub fn log_level(&self, configured: &str) -> String {
        if self.quiet {
            tracing::Level::ERROR.to_string()
        } else {
            match self.verbose {
                0 => configured.to_string(),
                1 => tracing::Level::DEBUG.to_string(),
                _ => tracing::Level::TRACE.to_string(),
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Simulate {
            slot: 0,
            direction: Direction::Playback,
            rate: 48000,
            channels: 2,
            format: SampleFormat::S16Le,
            period_bytes: 480,
            periods: 4,
            seconds: 3,
            counter_start: 0,
        }
    }
}
