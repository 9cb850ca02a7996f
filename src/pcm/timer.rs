//! Periodic tick thread with a synchronous stop

use crate::error::{PcmError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An armed timer: the tick thread and the channel that stops it
struct Armed {
    stop_tx: Sender<()>,
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Armed {
    fn signal(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());
    }
}

/// What a `stop_sync` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was armed; any stop already in progress has finished
    Idle,
    /// The tick thread was stopped and joined
    Joined,
    /// Called from the tick thread itself: the timer is disarmed and the
    /// thread exits once the running callback returns
    Detached,
}

/// Periodic callback scheduler owned by one stream
///
/// Created disarmed at Open. `start` spawns a thread that invokes the callback
/// once per interval; `stop_sync` does not return until that thread has exited,
/// so no callback is executing or pending afterwards.
pub struct PeriodicTimer {
    name: String,
    armed: Mutex<Option<Armed>>,
    /// Held across a join so every concurrent stopper waits for the exit
    joining: Mutex<()>,
    /// Most recently spawned tick thread, recorded by the thread itself
    tick_thread: Arc<Mutex<Option<ThreadId>>>,
}

impl PeriodicTimer {
    /// Set up a disarmed timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            armed: Mutex::new(None),
            joining: Mutex::new(()),
            tick_thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Arm the timer, replacing any previous callback
    pub fn start<F>(&self, interval: Duration, callback: F) -> Result<()>
    where
        F: Fn() + Send + 'static,
    {
        self.stop_sync();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();
        let tick_thread = self.tick_thread.clone();
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-tick", self.name))
            .spawn(move || {
                *tick_thread.lock() = Some(thread::current().id());
                trace!("Timer {} armed every {:?}", name, interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if thread_stop.load(Ordering::Acquire) {
                                break;
                            }
                            callback();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("Timer {} thread exiting", name);
            })
            .map_err(|e| {
                PcmError::ResourceUnavailable(format!("timer thread for {}: {}", self.name, e))
            })?;

        let previous = self.armed.lock().replace(Armed {
            stop_tx,
            stop_flag,
            handle,
        });
        if let Some(previous) = previous {
            warn!("Timer {} re-armed while armed, detaching old thread", self.name);
            previous.signal();
        }
        debug!("Timer {} started ({:?})", self.name, interval);
        Ok(())
    }

    /// Disarm and wait until the tick thread has exited
    ///
    /// Called from the timer's own callback this disarms and detaches the
    /// thread instead, since it cannot join itself.
    pub fn stop_sync(&self) -> StopOutcome {
        if *self.tick_thread.lock() == Some(thread::current().id()) {
            if let Some(armed) = self.armed.lock().take() {
                armed.signal();
            }
            debug!("Timer {} stopped from its own callback", self.name);
            return StopOutcome::Detached;
        }

        let _joining = self.joining.lock();
        let Some(armed) = self.armed.lock().take() else {
            return StopOutcome::Idle;
        };
        armed.signal();
        if armed.handle.join().is_err() {
            warn!("Timer {} callback panicked", self.name);
        }
        debug!("Timer {} stopped", self.name);
        StopOutcome::Joined
    }

    /// Check if the timer is armed
    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Check if another thread is still waiting for a tick thread to exit
    pub fn is_joining(&self) -> bool {
        self.joining.try_lock().is_none()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_ticks_until_stopped() {
        let timer = PeriodicTimer::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        assert!(!timer.is_armed());
        timer
            .start(Duration::from_millis(1), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.is_armed());

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        timer.stop_sync();
        assert!(!timer.is_armed());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_waits_for_inflight_callback() {
        let timer = PeriodicTimer::new("slow");
        let in_callback = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (entered, f) = (in_callback.clone(), finished.clone());

        timer
            .start(Duration::from_millis(1), move || {
                entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                f.store(true, Ordering::SeqCst);
            })
            .unwrap();

        while !in_callback.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        timer.stop_sync();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_when_disarmed_is_noop() {
        let timer = PeriodicTimer::new("idle");
        assert_eq!(timer.stop_sync(), StopOutcome::Idle);
        assert_eq!(timer.stop_sync(), StopOutcome::Idle);
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_stop_from_own_callback_disarms() {
        let timer = Arc::new(PeriodicTimer::new("self-stop"));
        let count = Arc::new(AtomicUsize::new(0));
        let outcome = Arc::new(Mutex::new(None));
        let (weak, c, o) = (Arc::downgrade(&timer), count.clone(), outcome.clone());

        timer
            .start(Duration::from_millis(1), move || {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(timer) = weak.upgrade() {
                    *o.lock() = Some(timer.stop_sync());
                }
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while outcome.lock().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*outcome.lock(), Some(StopOutcome::Detached));
        assert!(!timer.is_armed());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.stop_sync(), StopOutcome::Idle);
    }

    #[test]
    fn test_stop_reports_join() {
        let timer = PeriodicTimer::new("join");
        timer.start(Duration::from_millis(1), || {}).unwrap();
        assert_eq!(timer.stop_sync(), StopOutcome::Joined);
        assert!(!timer.is_armed());
    }
}
