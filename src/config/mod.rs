//! Command-line and file configuration

mod args;
mod file;

pub use args::{Args, Command};
pub use file::{ConfigError, PcmConfig};
