use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::EventRecord;

/// Item handed from worker thread to consumer thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Backend finished its setup, worker is about to enter its loop
    Ready,
    Event(EventRecord),
    /// Worker stopped and will never post again
    Fatal(String),
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("event bridge is closed")]
pub struct BridgeClosed;

#[derive(Debug, Default)]
struct Slot {
    signal: Option<Signal>,

    /// Set when signal is posted, cleared only by acknowledge
    in_flight: bool,

    closed: bool,
}

/// Single slot rendezvous between worker and consumer threads
///
/// Worker posts exactly one signal and stays blocked until consumer has
/// processed and acknowledged it, so at most one signal is in flight.
#[derive(Debug, Default)]
pub struct EventBridge {
    slot: Mutex<Slot>,
    posted: Condvar,
    acknowledged: Condvar,
}

impl EventBridge {
    pub fn new() -> Self {
        EventBridge::default()
    }

    /// Hands record to consumer and waits until it is acknowledged
    pub fn post(&self, record: EventRecord) -> Result<(), BridgeClosed> {
        self.post_signal(Signal::Event(record))
    }

    pub fn post_ready(&self) -> Result<(), BridgeClosed> {
        self.post_signal(Signal::Ready)
    }

    pub fn post_fatal(&self, reason: String) -> Result<(), BridgeClosed> {
        self.post_signal(Signal::Fatal(reason))
    }

    fn post_signal(&self, signal: Signal) -> Result<(), BridgeClosed> {
        let mut slot = self.slot.lock();
        while slot.in_flight && !slot.closed {
            self.acknowledged.wait(&mut slot);
        }
        if slot.closed {
            return Err(BridgeClosed);
        }

        slot.signal = Some(signal);
        slot.in_flight = true;
        self.posted.notify_one();

        while slot.in_flight && !slot.closed {
            self.acknowledged.wait(&mut slot);
        }
        if slot.in_flight {
            // closed before consumer got to it
            slot.signal = None;
            Err(BridgeClosed)
        } else {
            Ok(())
        }
    }

    /// Blocks until worker posts a signal
    ///
    /// Returns `None` once bridge is closed and no signal is pending.
    /// Worker is released when returned delivery is dropped.
    pub fn receive(&self) -> Option<Delivery<'_>> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(signal) = slot.signal.take() {
                return Some(Delivery {
                    bridge: self,
                    signal,
                });
            }
            if slot.closed {
                return None;
            }
            self.posted.wait(&mut slot);
        }
    }

    /// Same as `receive` but never blocks
    pub fn try_receive(&self) -> Option<Delivery<'_>> {
        let signal = self.slot.lock().signal.take()?;
        Some(Delivery {
            bridge: self,
            signal,
        })
    }

    /// Releases worker (if it is blocked in post) and rejects all future posts
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.posted.notify_all();
        self.acknowledged.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    fn acknowledge(&self) {
        let mut slot = self.slot.lock();
        slot.in_flight = false;
        self.acknowledged.notify_all();
    }
}

/// Signal taken out of the bridge slot
///
/// Dropping it acknowledges the signal and lets worker continue.
#[derive(Debug)]
pub struct Delivery<'a> {
    bridge: &'a EventBridge,
    signal: Signal,
}

impl<'a> Delivery<'a> {
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn acknowledge(self) {
        // drop does the work
    }
}

impl<'a> Drop for Delivery<'a> {
    fn drop(&mut self) {
        self.bridge.acknowledge();
    }
}
