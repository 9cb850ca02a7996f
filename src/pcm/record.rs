//! Per-stream state held in the chip registry

use crate::error::{PcmError, Result};
use crate::pcm::{Direction, PcmFormat, PeriodicTimer, PositionCell, PositionTracker};
use crate::service::SessionHandle;
use std::sync::Arc;

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opened,
    Configured,
    Prepared,
    Running,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Backing buffer the client transfers samples through
#[derive(Debug)]
pub struct TransferBuffer {
    data: Vec<u8>,
    period_bytes: usize,
}

impl TransferBuffer {
    /// Allocate `buffer_bytes`, failing if it exceeds the preallocated pool
    /// or the allocator refuses
    pub fn allocate(buffer_bytes: usize, period_bytes: usize, max_bytes: usize) -> Result<Self> {
        if buffer_bytes > max_bytes {
            return Err(PcmError::ResourceUnavailable(format!(
                "transfer buffer of {} bytes exceeds {} byte pool",
                buffer_bytes, max_bytes
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(buffer_bytes).map_err(|e| {
            PcmError::ResourceUnavailable(format!("transfer buffer allocation: {}", e))
        })?;
        data.resize(buffer_bytes, 0);

        Ok(Self { data, period_bytes })
    }

    /// Buffer size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }
}

/// Mutable state of one open stream
///
/// The tracker fields (`hw_ptr_base`, `prev_consumed`, `n_overflow`, `pos`)
/// live in `position` so the tick thread can update them without the chip
/// lock. Everything else is only touched under the chip lock.
pub struct StreamRecord {
    pub idx: usize,
    pub link: String,
    pub direction: Direction,
    pub state: StreamState,
    /// Ring size in bytes, 0 until Prepare
    pub buffer_size: u64,
    /// Period size in bytes, 0 until Prepare
    pub period_size: u64,
    /// Channels, rate, width, and float flag recorded at Configure
    pub format: Option<PcmFormat>,
    /// The device session is active
    pub open: bool,
    /// The data-flow session is active
    pub running: bool,
    pub position: Arc<PositionCell>,
    pub timer: Arc<PeriodicTimer>,
    pub session: SessionHandle,
    pub transfer: Option<TransferBuffer>,
}

impl StreamRecord {
    /// Create an opened record anchored at the session's current counter
    pub fn new(idx: usize, link: &str, direction: Direction, session: SessionHandle) -> Self {
        let base = session.read_consumed(direction);
        Self {
            idx,
            link: link.to_string(),
            direction,
            state: StreamState::Opened,
            buffer_size: 0,
            period_size: 0,
            format: None,
            open: true,
            running: false,
            position: Arc::new(PositionCell::new(PositionTracker::new(base, 0))),
            timer: Arc::new(PeriodicTimer::new(format!("pcm{}-{}", idx, direction))),
            session,
            transfer: None,
        }
    }

    /// Snapshot of the tracker fields
    pub fn tracker(&self) -> PositionTracker {
        self.position.load()
    }

    /// Re-sample the hardware counter and restart tracking from offset 0
    ///
    /// Only valid while the timer is stopped.
    pub fn rebase(&mut self) {
        let base = self.session.read_consumed(self.direction);
        self.position
            .store(&PositionTracker::new(base, self.buffer_size));
    }

    /// Forget buffer geometry and format
    pub fn clear_geometry(&mut self) {
        self.transfer = None;
        self.format = None;
        self.buffer_size = 0;
        self.period_size = 0;
        let tracker = self.position.load();
        self.position
            .store(&PositionTracker::new(tracker.hw_ptr_base, 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{AudioService, SimulatedService};

    #[test]
    fn test_transfer_buffer_limits() {
        let buffer = TransferBuffer::allocate(1920, 480, 15360).unwrap();
        assert_eq!(buffer.len(), 1920);
        assert_eq!(buffer.period_bytes(), 480);
        assert!(!buffer.is_empty());

        assert!(matches!(
            TransferBuffer::allocate(16384, 4096, 15360),
            Err(PcmError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_new_record_anchors_at_counter() {
        let service = SimulatedService::manual(4242);
        let session = service.open_session("voice-tx").unwrap();
        let mut record = StreamRecord::new(3, "voice-tx", Direction::Playback, session);

        assert_eq!(record.state, StreamState::Opened);
        assert!(record.open && !record.running);
        let tracker = record.tracker();
        assert_eq!(tracker.hw_ptr_base, 4242);
        assert_eq!(tracker.prev_consumed, 4242);
        assert_eq!(tracker.n_overflow, 0);

        service.set_consumed(Direction::Playback, 5000);
        record.buffer_size = 1920;
        record.rebase();
        assert_eq!(record.tracker(), PositionTracker::new(5000, 1920));

        record.clear_geometry();
        assert_eq!(record.buffer_size, 0);
        assert_eq!(record.tracker().buffer_size, 0);
    }
}
