//! In-process audio service with a simulated ring-buffer counter

use crate::error::{PcmError, Result};
use crate::pcm::{Direction, PcmFormat, COUNTER_SPACE};
use crate::service::{AudioService, Session, SessionHandle};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Service operations that can be counted or scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    Open,
    Configure,
    Prepare,
    Stop,
    Teardown,
    Close,
}

impl SimOp {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            SimOp::Open => "open",
            SimOp::Configure => "configure",
            SimOp::Prepare => "prepare",
            SimOp::Stop => "stop",
            SimOp::Teardown => "teardown",
            SimOp::Close => "close",
        }
    }
}

/// How the simulated counters advance
enum Counter {
    /// Set explicitly by the caller, one value per ring
    Manual([AtomicU64; 2]),
    /// Both rings advance together at the configured byte rate since the last
    /// configure, as in a full-duplex call
    Clocked {
        origin: Mutex<(Instant, u64)>,
        bytes_per_second: AtomicU64,
    },
}

struct SimState {
    counter: Counter,
    busy_links: Mutex<HashSet<String>>,
    failing: [AtomicBool; SimOp::COUNT],
    calls: [AtomicUsize; SimOp::COUNT],
    last_format: Mutex<Option<PcmFormat>>,
}

/// Down-link ring for playback, up-link ring for capture
fn ring(direction: Direction) -> usize {
    match direction {
        Direction::Playback => 0,
        Direction::Capture => 1,
    }
}

impl SimState {
    fn consumed(&self, direction: Direction) -> u64 {
        match &self.counter {
            Counter::Manual(values) => values[ring(direction)].load(Ordering::Acquire),
            Counter::Clocked {
                origin,
                bytes_per_second,
            } => {
                let (since, start) = *origin.lock();
                let rate = bytes_per_second.load(Ordering::Acquire) as u128;
                let advanced = since.elapsed().as_nanos() * rate / 1_000_000_000;
                ((start as u128 + advanced) % COUNTER_SPACE as u128) as u64
            }
        }
    }

    fn call(&self, op: SimOp, link: &str) -> Result<()> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        if self.failing[op.index()].load(Ordering::SeqCst) {
            return Err(PcmError::session(link, op.name(), "simulated failure"));
        }
        Ok(())
    }
}

/// Audio service whose ring counter is either driven by the caller or by
/// the wall clock at the configured byte rate, wrapping at `COUNTER_SPACE`
#[derive(Clone)]
pub struct SimulatedService {
    state: Arc<SimState>,
}

impl SimulatedService {
    fn with_counter(counter: Counter) -> Self {
        Self {
            state: Arc::new(SimState {
                counter,
                busy_links: Mutex::new(HashSet::new()),
                failing: Default::default(),
                calls: Default::default(),
                last_format: Mutex::new(None),
            }),
        }
    }

    /// Counters move only through `set_consumed`/`advance`; both rings start
    /// at `initial`
    pub fn manual(initial: u64) -> Self {
        Self::with_counter(Counter::Manual([
            AtomicU64::new(initial),
            AtomicU64::new(initial),
        ]))
    }

    /// Counter advances in real time once a session is configured
    ///
    /// Starting close to `COUNTER_SPACE` exercises the wrap early.
    pub fn clocked(start: u64) -> Self {
        Self::with_counter(Counter::Clocked {
            origin: Mutex::new((Instant::now(), start % COUNTER_SPACE)),
            bytes_per_second: AtomicU64::new(0),
        })
    }

    /// Set the manual counter of one ring (ignored for a clocked counter)
    pub fn set_consumed(&self, direction: Direction, value: u64) {
        if let Counter::Manual(values) = &self.state.counter {
            values[ring(direction)].store(value, Ordering::Release);
        }
    }

    /// Advance the manual counter of one ring, wrapping at `COUNTER_SPACE`
    pub fn advance(&self, direction: Direction, bytes: u64) {
        if let Counter::Manual(values) = &self.state.counter {
            let counter = &values[ring(direction)];
            let next = (counter.load(Ordering::Acquire) % COUNTER_SPACE + bytes % COUNTER_SPACE)
                % COUNTER_SPACE;
            counter.store(next, Ordering::Release);
        }
    }

    /// Current counter value of one ring
    pub fn consumed(&self, direction: Direction) -> u64 {
        self.state.consumed(direction)
    }

    /// Make an operation fail (or succeed again)
    pub fn set_failing(&self, op: SimOp, failing: bool) {
        self.state.failing[op.index()].store(failing, Ordering::SeqCst);
    }

    /// Number of times an operation was invoked
    pub fn calls(&self, op: SimOp) -> usize {
        self.state.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Format pushed by the last configure
    pub fn last_format(&self) -> Option<PcmFormat> {
        *self.state.last_format.lock()
    }

    /// Check if a session is open on the link
    pub fn is_busy(&self, link: &str) -> bool {
        self.state.busy_links.lock().contains(link)
    }
}

impl AudioService for SimulatedService {
    fn open_session(&self, link: &str) -> Result<SessionHandle> {
        self.state.call(SimOp::Open, link)?;

        if !self.state.busy_links.lock().insert(link.to_string()) {
            return Err(PcmError::ResourceUnavailable(format!(
                "link '{}' already has a session",
                link
            )));
        }
        info!("Simulated session opened on {}", link);

        Ok(Arc::new(SimSession {
            link: link.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct SimSession {
    link: String,
    state: Arc<SimState>,
}

impl Session for SimSession {
    fn read_consumed(&self, direction: Direction) -> u64 {
        self.state.consumed(direction)
    }

    fn configure(&self, format: &PcmFormat) -> Result<()> {
        self.state.call(SimOp::Configure, &self.link)?;
        *self.state.last_format.lock() = Some(*format);

        if let Counter::Clocked {
            origin,
            bytes_per_second,
        } = &self.state.counter
        {
            let now_value = self.state.consumed(Direction::Playback);
            *origin.lock() = (Instant::now(), now_value);
            bytes_per_second.store(format.bytes_per_second(), Ordering::Release);
        }
        debug!("Simulated session {} configured: {}", self.link, format);
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        self.state.call(SimOp::Prepare, &self.link)
    }

    fn stop(&self) -> Result<()> {
        self.state.call(SimOp::Stop, &self.link)
    }

    fn teardown(&self) -> Result<()> {
        self.state.call(SimOp::Teardown, &self.link)
    }

    fn close(&self) {
        self.state.calls[SimOp::Close.index()].fetch_add(1, Ordering::SeqCst);
        self.state.busy_links.lock().remove(&self.link);
        info!("Simulated session closed on {}", self.link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_session_per_link() {
        let service = SimulatedService::manual(0);
        let session = service.open_session("voice-tx").unwrap();
        assert!(service.is_busy("voice-tx"));
        assert!(matches!(
            service.open_session("voice-tx"),
            Err(PcmError::ResourceUnavailable(_))
        ));

        session.close();
        assert!(!service.is_busy("voice-tx"));
        assert!(service.open_session("voice-tx").is_ok());
    }

    #[test]
    fn test_manual_counter_wraps() {
        let service = SimulatedService::manual(COUNTER_SPACE - 10);
        service.advance(Direction::Playback, 30);
        assert_eq!(service.consumed(Direction::Playback), 20);
    }

    #[test]
    fn test_rings_count_independently() {
        let service = SimulatedService::manual(100);
        let session = service.open_session("voice").unwrap();

        service.set_consumed(Direction::Capture, 960);
        assert_eq!(session.read_consumed(Direction::Capture), 960);
        assert_eq!(session.read_consumed(Direction::Playback), 100);

        service.advance(Direction::Playback, 480);
        assert_eq!(session.read_consumed(Direction::Playback), 580);
        assert_eq!(session.read_consumed(Direction::Capture), 960);
    }

    #[test]
    fn test_scripted_failure() {
        let service = SimulatedService::manual(0);
        service.set_failing(SimOp::Open, true);
        assert!(matches!(
            service.open_session("voice-rx"),
            Err(PcmError::SessionFailure { .. })
        ));
        assert!(!service.is_busy("voice-rx"));
        assert_eq!(service.calls(SimOp::Open), 1);
    }

    #[test]
    fn test_clocked_counter_idle_until_configured() {
        let service = SimulatedService::clocked(1000);
        let session = service.open_session("voice-tx").unwrap();
        assert_eq!(session.read_consumed(Direction::Playback), 1000);

        let format = PcmFormat {
            channels: 2,
            sample_rate: 48000,
            sample_width_bits: 16,
            is_float: false,
            frame_bytes: 4,
        };
        session.configure(&format).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(session.read_consumed(Direction::Playback) > 1000);
        assert_eq!(service.last_format(), Some(format));
    }
}
