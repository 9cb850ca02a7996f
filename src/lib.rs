//! pcmtrack - PCM ring-buffer position tracking
//!
//! Tracks the playback/capture position of streams whose samples move
//! through a hardware-managed ring buffer, and serializes their lifecycle
//! against the periodic position poller.

pub mod chip;
pub mod config;
pub mod error;
pub mod pcm;
pub mod service;

pub use error::{PcmError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
