//! Collaborators the stream core drives: the remote audio service, its
//! sessions, and the consumer of period notifications

pub mod sim;

use crate::error::Result;
use crate::pcm::{Direction, PcmFormat, PeriodElapsed};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::trace;

pub use sim::{SimOp, SimulatedService};

/// An active data path on the remote audio service
pub trait Session: Send + Sync {
    /// Raw hardware accumulator: bytes read from the down-link ring for
    /// playback, bytes written into the up-link ring for capture
    fn read_consumed(&self, direction: Direction) -> u64;

    /// Push channel count, rate, sample width, and float flag
    fn configure(&self, format: &PcmFormat) -> Result<()>;

    /// Set up the call path for the configured stream
    fn prepare(&self) -> Result<()>;

    /// Stop the data flow
    fn stop(&self) -> Result<()>;

    /// Tear down the call path
    fn teardown(&self) -> Result<()>;

    /// Release the session
    fn close(&self);
}

/// Shared handle to a session
pub type SessionHandle = Arc<dyn Session>;

/// Source of sessions, one per link
pub trait AudioService: Send + Sync {
    /// Acquire a session for the named link
    fn open_session(&self, link: &str) -> Result<SessionHandle>;
}

/// Consumer of period-elapsed notifications (the host audio framework)
pub trait PeriodListener: Send + Sync {
    fn period_elapsed(&self, idx: usize, elapsed: PeriodElapsed);
}

/// Period notification forwarded over a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodEvent {
    /// Slot index of the stream
    pub idx: usize,
    pub pos: u64,
    pub wrapped: bool,
}

impl PeriodListener for Sender<PeriodEvent> {
    fn period_elapsed(&self, idx: usize, elapsed: PeriodElapsed) {
        let event = PeriodEvent {
            idx,
            pos: elapsed.pos,
            wrapped: elapsed.wrapped,
        };
        // Never block the tick thread on a slow consumer
        if self.try_send(event).is_err() {
            trace!("Dropped period event for stream {}", idx);
        }
    }
}
