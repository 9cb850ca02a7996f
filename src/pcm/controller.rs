//! Stream lifecycle: open, configure, prepare, trigger, close

use crate::chip::{ChipRegistry, Interrupt, Slots};
use crate::config::PcmConfig;
use crate::error::{PcmError, Result};
use crate::pcm::{
    Direction, HwConstraints, HwParams, StopOutcome, StreamRecord, StreamState, TransferBuffer,
};
use crate::service::{AudioService, PeriodListener};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Start/stop request from the host framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
}

/// Externally queryable position of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    /// Byte offset into the ring
    pub pos: u64,
    pub buffer_size: u64,
    pub period_size: u64,
    pub n_overflow: u32,
    /// `pos` in frames (0 before Configure)
    pub frames: u64,
}

/// Result of a Prepare that reached the Prepared state
#[derive(Debug)]
#[must_use]
pub struct PrepareOutcome {
    pub buffer_size: u64,
    pub period_size: u64,
    /// Session setup failures; the stream is prepared regardless
    pub warnings: Vec<PcmError>,
}

impl PrepareOutcome {
    /// Check if session setup completed without errors
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// State machine serializing stream transitions under the chip lock
///
/// Each stream's timer ticks without the chip lock. Close, Prepare, and
/// hw_free therefore stop the timer and wait for it *before* taking the lock,
/// then touch the tracker fields.
pub struct LifecycleController {
    registry: ChipRegistry,
    service: Arc<dyn AudioService>,
    listener: Arc<dyn PeriodListener>,
    constraints: HwConstraints,
    tick_interval: Duration,
}

impl LifecycleController {
    /// Create a controller with default constraints and a 5ms tick
    pub fn new(
        registry: ChipRegistry,
        service: Arc<dyn AudioService>,
        listener: Arc<dyn PeriodListener>,
    ) -> Self {
        Self {
            registry,
            service,
            listener,
            constraints: HwConstraints::default(),
            tick_interval: Duration::from_millis(5),
        }
    }

    /// Create a controller from a loaded configuration
    pub fn from_config(
        config: &PcmConfig,
        service: Arc<dyn AudioService>,
        listener: Arc<dyn PeriodListener>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(
            Self::new(ChipRegistry::new(config.max_streams), service, listener)
                .with_constraints(config.constraints.clone())
                .with_tick_interval(config.tick_interval()),
        )
    }

    pub fn with_constraints(mut self, constraints: HwConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn registry(&self) -> &ChipRegistry {
        &self.registry
    }

    /// Open a stream on slot `idx`
    pub fn open(&self, idx: usize, link: &str, direction: Direction) -> Result<()> {
        self.open_interruptible(idx, link, direction, &Interrupt::new())
    }

    /// Open, abandoning the lock wait if `interrupt` fires
    ///
    /// On failure no session is held and the slot stays empty.
    pub fn open_interruptible(
        &self,
        idx: usize,
        link: &str,
        direction: Direction,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let mut slots = self.registry.lock_interruptible(interrupt)?;

        if idx >= slots.capacity() {
            return Err(PcmError::InvalidParams(format!(
                "stream index {} outside 0..{}",
                idx,
                slots.capacity()
            )));
        }
        if slots.is_open(idx) {
            return Err(PcmError::ResourceUnavailable(format!(
                "stream slot {} already open",
                idx
            )));
        }

        let session = self.service.open_session(link).map_err(|e| {
            error!("Failed to open session for {}: {}", link, e);
            e
        })?;

        let record = StreamRecord::new(idx, link, direction, session.clone());
        let base = record.tracker().hw_ptr_base;
        if let Err(e) = slots.register(idx, record) {
            session.close();
            return Err(e);
        }

        info!(
            "Opened {} stream {} on {} (counter base {})",
            direction, idx, link, base
        );
        Ok(())
    }

    /// Record format and allocate the transfer buffer (hw_params)
    pub fn configure(&self, idx: usize, params: &HwParams) -> Result<()> {
        self.configure_interruptible(idx, params, &Interrupt::new())
    }

    pub fn configure_interruptible(
        &self,
        idx: usize,
        params: &HwParams,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let mut slots = self.registry.lock_interruptible(interrupt)?;
        let record = Self::record_mut(&mut slots, idx, "configure")?;

        match record.state {
            StreamState::Opened | StreamState::Configured => {}
            state => return Err(PcmError::invalid_state("configure", state)),
        }

        self.constraints.validate(params)?;
        let transfer = TransferBuffer::allocate(
            params.buffer_bytes,
            params.period_bytes,
            self.constraints.buffer_bytes_max,
        )
        .map_err(|e| {
            error!("Stream {}: {}", idx, e);
            e
        })?;

        let format = params.pcm_format();
        record.transfer = Some(transfer);
        record.format = Some(format);
        record.state = StreamState::Configured;

        debug!(
            "Stream {} configured: {} ({:?}), buffer {} bytes, period {} bytes",
            idx, format, params.format, params.buffer_bytes, params.period_bytes
        );
        Ok(())
    }

    /// Release the transfer buffer and return to Opened (hw_free)
    pub fn hw_free(&self, idx: usize) -> Result<()> {
        let interrupt = Interrupt::new();
        self.check_state(idx, "hw_free", &interrupt, |state| {
            state != StreamState::Running
        })?;

        let mut slots = self.lock_quiesced(idx, &interrupt)?;
        let record = Self::record_mut(&mut slots, idx, "hw_free")?;
        if record.state == StreamState::Running {
            return Err(self.reject_quiesced(idx, record, "hw_free"));
        }

        record.clear_geometry();
        record.state = StreamState::Opened;
        debug!("Stream {} transfer buffer released", idx);
        Ok(())
    }

    /// Reset position tracking, push the format to the session, and start the
    /// timer
    pub fn prepare(&self, idx: usize) -> Result<PrepareOutcome> {
        self.prepare_interruptible(idx, &Interrupt::new())
    }

    /// Prepare, abandoning the lock wait if `interrupt` fires
    ///
    /// Session setup is best effort: failures land in
    /// [`PrepareOutcome::warnings`] and the stream still becomes Prepared.
    pub fn prepare_interruptible(
        &self,
        idx: usize,
        interrupt: &Interrupt,
    ) -> Result<PrepareOutcome> {
        let preparable = |state: StreamState| matches!(state, StreamState::Configured | StreamState::Prepared);
        self.check_state(idx, "prepare", interrupt, preparable)?;

        let mut slots = self.lock_quiesced(idx, interrupt)?;
        let record = Self::record_mut(&mut slots, idx, "prepare")?;
        if !preparable(record.state) {
            return Err(self.reject_quiesced(idx, record, "prepare"));
        }

        let (buffer_size, period_size) = match &record.transfer {
            Some(transfer) if !transfer.is_empty() => {
                (transfer.len() as u64, transfer.period_bytes() as u64)
            }
            _ => return Err(self.reject_quiesced(idx, record, "prepare")),
        };
        record.buffer_size = buffer_size;
        record.period_size = period_size;
        record.rebase();

        let mut warnings = Vec::new();
        if let Some(format) = record.format {
            if let Err(e) = record.session.configure(&format) {
                error!("Stream {}: error setting session params: {}", idx, e);
                warnings.push(e);
            }
            debug!("Stream {} session params: {}", idx, format);
        }
        if let Err(e) = record.session.prepare() {
            warn!("Stream {}: call path setup failed, continuing: {}", idx, e);
            warnings.push(e);
        }

        debug!(
            "Stream {} buffer_size={} period_size={} base={}",
            idx,
            buffer_size,
            period_size,
            record.tracker().hw_ptr_base
        );

        self.arm_timer(idx, record)?;

        record.state = StreamState::Prepared;
        info!("Stream {} prepared", idx);

        Ok(PrepareOutcome {
            buffer_size,
            period_size,
            warnings,
        })
    }

    /// Start or stop the data flow
    pub fn trigger(&self, idx: usize, trigger: Trigger) -> Result<()> {
        let mut slots = self.registry.lock();
        let record = Self::record_mut(&mut slots, idx, "trigger")?;

        match (trigger, record.state) {
            (Trigger::Start, StreamState::Prepared) => {
                record.running = true;
                record.state = StreamState::Running;
                info!("Stream {} running", idx);
                Ok(())
            }
            (Trigger::Stop, StreamState::Running) => {
                record.running = false;
                record.state = StreamState::Prepared;
                info!("Stream {} stopped", idx);
                record.session.stop().map_err(|e| {
                    error!("Stream {}: failed to stop session: {}", idx, e);
                    e
                })
            }
            (Trigger::Start, state) => Err(PcmError::invalid_state("start", state)),
            (Trigger::Stop, state) => Err(PcmError::invalid_state("stop", state)),
        }
    }

    /// Tear down and release a stream
    ///
    /// Never fails: teardown errors are logged and release always completes.
    /// Closing an empty slot is a no-op.
    pub fn close(&self, idx: usize) {
        // An uninterrupted wait cannot fail
        let _ = self.close_interruptible(idx, &Interrupt::new());
    }

    /// Close, abandoning the lock wait if `interrupt` fires
    ///
    /// The only error is [`PcmError::Interrupted`], returned only before the
    /// timer was touched: the stream is left exactly as it was. Once the timer
    /// has been stopped the close runs to completion.
    pub fn close_interruptible(&self, idx: usize, interrupt: &Interrupt) -> Result<()> {
        let mut slots = self.lock_quiesced(idx, interrupt)?;
        let Some(record) = slots.lookup_mut(idx) else {
            debug!("Close on empty stream slot {}", idx);
            return Ok(());
        };

        info!("Closing stream {} ({})", idx, record.link);
        if let Err(e) = record.session.teardown() {
            error!("Stream {}: error tearing down call path: {}", idx, e);
        }

        // A force-killed client never sends the stop trigger
        if record.running {
            warn!("Stream {} still running at close, stopping", idx);
            if let Err(e) = record.session.stop() {
                error!("Stream {}: failed to stop session: {}", idx, e);
            }
            record.running = false;
        }

        record.clear_geometry();
        record.open = false;
        record.state = StreamState::Closed;

        if let Some(record) = slots.unregister(idx) {
            record.session.close();
        }
        info!("Stream {} closed", idx);
        Ok(())
    }

    /// Current position of a stream
    pub fn pointer(&self, idx: usize) -> Result<StreamPosition> {
        let slots = self.registry.lock();
        let record = slots
            .lookup(idx)
            .ok_or_else(|| PcmError::invalid_state("pointer", StreamState::Closed))?;

        let tracker = record.tracker();
        let frames = record
            .format
            .map(|format| format.bytes_to_frames(tracker.pos))
            .unwrap_or(0);

        Ok(StreamPosition {
            pos: tracker.pos,
            buffer_size: record.buffer_size,
            period_size: record.period_size,
            n_overflow: tracker.n_overflow,
            frames,
        })
    }

    /// Lifecycle state of a slot (Closed when empty)
    pub fn state(&self, idx: usize) -> StreamState {
        self.registry
            .lookup(idx, |record| record.state)
            .unwrap_or(StreamState::Closed)
    }

    /// Check if the stream's timer is armed (false for an empty slot)
    pub fn is_ticking(&self, idx: usize) -> bool {
        self.registry
            .lookup(idx, |record| record.timer.clone())
            .map(|timer| timer.is_armed())
            .unwrap_or(false)
    }

    /// Close every open stream
    pub fn close_all(&self) {
        let open = self.registry.lock().open_indices();
        for idx in open {
            self.close(idx);
        }
    }

    /// Start polling the stream's counter into its position cell
    fn arm_timer(&self, idx: usize, record: &StreamRecord) -> Result<()> {
        let position = record.position.clone();
        let session = record.session.clone();
        let listener = self.listener.clone();
        let direction = record.direction;
        record.timer.start(self.tick_interval, move || {
            let consumed = session.read_consumed(direction);
            if let Some(elapsed) = position.tick(consumed) {
                listener.period_elapsed(idx, elapsed);
            }
        })
    }

    /// Refuse an operation whose timer stop already happened
    ///
    /// The state changed between the state check and the stop. A stream that
    /// was ticking gets its timer back before the error is returned.
    fn reject_quiesced(
        &self,
        idx: usize,
        record: &StreamRecord,
        operation: &'static str,
    ) -> PcmError {
        if matches!(record.state, StreamState::Prepared | StreamState::Running) {
            warn!(
                "Stream {} changed to {} during {}, resuming timer",
                idx, record.state, operation
            );
            if let Err(e) = self.arm_timer(idx, record) {
                error!("Stream {}: failed to resume timer: {}", idx, e);
            }
        }
        PcmError::invalid_state(operation, record.state)
    }

    fn record_mut<'a>(
        slots: &'a mut MutexGuard<'_, Slots>,
        idx: usize,
        operation: &'static str,
    ) -> Result<&'a mut StreamRecord> {
        slots
            .lookup_mut(idx)
            .ok_or_else(|| PcmError::invalid_state(operation, StreamState::Closed))
    }

    /// Reject an operation before its timer stop would stall a stream
    fn check_state(
        &self,
        idx: usize,
        operation: &'static str,
        interrupt: &Interrupt,
        allowed: impl Fn(StreamState) -> bool,
    ) -> Result<()> {
        let slots = self.registry.lock_interruptible(interrupt)?;
        let state = slots
            .lookup(idx)
            .map(|record| record.state)
            .unwrap_or(StreamState::Closed);
        if allowed(state) {
            Ok(())
        } else {
            Err(PcmError::invalid_state(operation, state))
        }
    }

    /// Stop the stream's timer outside the chip lock, then take the lock
    ///
    /// The join happens without the lock held because a period listener may
    /// itself query the chip. If the timer was re-armed in between, repeat.
    ///
    /// `interrupt` is honored only until a timer has been stopped. Past that
    /// point the caller must finish, so the lock is waited for in full.
    fn lock_quiesced(
        &self,
        idx: usize,
        interrupt: &Interrupt,
    ) -> Result<MutexGuard<'_, Slots>> {
        let mut committed = false;
        // Running inside this stream's own tick callback
        let mut on_tick_thread = false;
        loop {
            let timer = self
                .lock_unless_committed(committed, interrupt)?
                .lookup(idx)
                .map(|record| record.timer.clone());
            if let Some(timer) = &timer {
                match timer.stop_sync() {
                    StopOutcome::Idle => {}
                    StopOutcome::Joined => committed = true,
                    StopOutcome::Detached => {
                        committed = true;
                        on_tick_thread = true;
                    }
                }
            }

            let slots = self.lock_unless_committed(committed, interrupt)?;
            let retry = match slots.lookup(idx) {
                Some(record) if record.timer.is_armed() => {
                    debug!("Stream {} timer re-armed during stop, retrying", idx);
                    true
                }
                // Another caller took the tick thread and has not joined it yet
                Some(record) if !on_tick_thread && record.timer.is_joining() => {
                    debug!("Stream {} timer still stopping, retrying", idx);
                    true
                }
                _ => false,
            };
            if !retry {
                return Ok(slots);
            }
        }
    }

    fn lock_unless_committed(
        &self,
        committed: bool,
        interrupt: &Interrupt,
    ) -> Result<MutexGuard<'_, Slots>> {
        if committed {
            Ok(self.registry.lock())
        } else {
            self.registry.lock_interruptible(interrupt)
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.close_all();
    }
}
