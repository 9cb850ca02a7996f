//! Slot table mapping stream index to its record

use crate::error::{PcmError, Result};
use crate::pcm::StreamRecord;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Width of the opened bitmask
pub const MAX_SLOTS: usize = 32;

/// How often a cancellable lock wait re-checks its interrupt
const LOCK_POLL: Duration = Duration::from_millis(5);

/// Cancellation token for a caller waiting on the chip lock
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon any lock wait using this token
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Slot table guarded by the chip lock
pub struct Slots {
    records: Vec<Option<StreamRecord>>,
    opened_mask: u32,
}

impl Slots {
    fn check_index(&self, idx: usize) -> Result<()> {
        if idx >= self.records.len() {
            return Err(PcmError::InvalidParams(format!(
                "stream index {} outside 0..{}",
                idx,
                self.records.len()
            )));
        }
        Ok(())
    }

    /// Insert a record; a second register on an occupied slot is rejected
    pub fn register(&mut self, idx: usize, record: StreamRecord) -> Result<()> {
        self.check_index(idx)?;
        if self.is_open(idx) {
            return Err(PcmError::ResourceUnavailable(format!(
                "stream slot {} already open",
                idx
            )));
        }
        self.records[idx] = Some(record);
        self.opened_mask |= 1 << idx;
        debug!("Registered stream slot {} (mask {:#x})", idx, self.opened_mask);
        Ok(())
    }

    /// Remove and return the record in a slot
    pub fn unregister(&mut self, idx: usize) -> Option<StreamRecord> {
        let record = self.records.get_mut(idx)?.take();
        if record.is_some() {
            self.opened_mask &= !(1 << idx);
            debug!("Unregistered stream slot {} (mask {:#x})", idx, self.opened_mask);
        }
        record
    }

    pub fn lookup(&self, idx: usize) -> Option<&StreamRecord> {
        self.records.get(idx)?.as_ref()
    }

    pub fn lookup_mut(&mut self, idx: usize) -> Option<&mut StreamRecord> {
        self.records.get_mut(idx)?.as_mut()
    }

    /// Check the bitmask without scanning the table
    pub fn is_open(&self, idx: usize) -> bool {
        idx < MAX_SLOTS && self.opened_mask & (1 << idx) != 0
    }

    pub fn opened_mask(&self) -> u32 {
        self.opened_mask
    }

    /// Indices of all open slots
    pub fn open_indices(&self) -> Vec<usize> {
        (0..self.records.len()).filter(|&i| self.is_open(i)).collect()
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

/// Chip-wide registry of open streams
///
/// One lock serializes every registry access and every lifecycle transition
/// on the chip, whichever slot it targets. The lock is not reentrant.
pub struct ChipRegistry {
    slots: Mutex<Slots>,
}

impl ChipRegistry {
    /// Create a registry with `max_streams` slots (at most `MAX_SLOTS`)
    pub fn new(max_streams: usize) -> Self {
        let capacity = max_streams.min(MAX_SLOTS);
        Self {
            slots: Mutex::new(Slots {
                records: (0..capacity).map(|_| None).collect(),
                opened_mask: 0,
            }),
        }
    }

    /// Acquire the chip lock
    pub fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock()
    }

    /// Acquire the chip lock unless the caller interrupts the wait
    pub fn lock_interruptible(&self, interrupt: &Interrupt) -> Result<MutexGuard<'_, Slots>> {
        loop {
            if interrupt.is_interrupted() {
                return Err(PcmError::Interrupted);
            }
            if let Some(guard) = self.slots.try_lock_for(LOCK_POLL) {
                return Ok(guard);
            }
        }
    }

    pub fn register(&self, idx: usize, record: StreamRecord) -> Result<()> {
        self.lock().register(idx, record)
    }

    pub fn unregister(&self, idx: usize) -> Option<StreamRecord> {
        self.lock().unregister(idx)
    }

    /// Run `f` against the record in a slot under the chip lock
    pub fn lookup<R>(&self, idx: usize, f: impl FnOnce(&StreamRecord) -> R) -> Option<R> {
        self.lock().lookup(idx).map(f)
    }

    pub fn opened_mask(&self) -> u32 {
        self.lock().opened_mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::Direction;
    use crate::service::{AudioService, SimulatedService};
    use std::thread;

    fn record(service: &SimulatedService, idx: usize) -> StreamRecord {
        let link = format!("link{}", idx);
        let session = service.open_session(&link).unwrap();
        StreamRecord::new(idx, &link, Direction::Capture, session)
    }

    #[test]
    fn test_register_lookup_unregister() {
        let service = SimulatedService::manual(0);
        let registry = ChipRegistry::new(4);

        registry.register(2, record(&service, 2)).unwrap();
        assert_eq!(registry.opened_mask(), 0b100);
        assert_eq!(registry.lookup(2, |r| r.idx), Some(2));
        assert!(registry.lookup(1, |r| r.idx).is_none());

        let removed = registry.unregister(2).unwrap();
        assert_eq!(removed.idx, 2);
        assert_eq!(registry.opened_mask(), 0);
        assert!(registry.unregister(2).is_none());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let service = SimulatedService::manual(0);
        let registry = ChipRegistry::new(4);
        registry.register(0, record(&service, 0)).unwrap();

        let second = service.open_session("other").unwrap();
        let dup = StreamRecord::new(0, "other", Direction::Playback, second);
        assert!(matches!(
            registry.register(0, dup),
            Err(PcmError::ResourceUnavailable(_))
        ));
        assert_eq!(registry.lookup(0, |r| r.link.clone()).unwrap(), "link0");
    }

    #[test]
    fn test_index_out_of_range() {
        let service = SimulatedService::manual(0);
        let registry = ChipRegistry::new(2);
        assert!(matches!(
            registry.register(5, record(&service, 5)),
            Err(PcmError::InvalidParams(_))
        ));
        assert_eq!(ChipRegistry::new(100).lock().capacity(), MAX_SLOTS);
    }

    #[test]
    fn test_interrupted_lock_wait() {
        let registry = Arc::new(ChipRegistry::new(1));
        let held = registry.lock();

        let interrupt = Interrupt::new();
        let waiter = {
            let registry = registry.clone();
            let interrupt = interrupt.clone();
            thread::spawn(move || registry.lock_interruptible(&interrupt).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(20));
        interrupt.interrupt();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PcmError::Interrupted)));
        drop(held);

        assert!(registry.lock_interruptible(&Interrupt::new()).is_ok());
    }
}
