//! Chip-wide shared state

mod registry;

pub use registry::{ChipRegistry, Interrupt, Slots, MAX_SLOTS};
