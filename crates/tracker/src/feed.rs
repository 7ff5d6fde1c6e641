use libc::pid_t;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One state-change record broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Delta {
    Add {
        id: u64,
        pid: pid_t,
        start: u64,
        end: u64,
        size: u64,
        pages: u64,
        tag: String,
        /// Elapsed nanoseconds since tracker start. Non-decreasing across
        /// the emitted sequence.
        t: u64,
    },
    Remove {
        id: u64,
        pid: pid_t,
        t: u64,
    },
}

/// Append-only delta log plus live subscriber hand-off.
///
/// Every delta lands in the log before it is pushed live, so a late joiner
/// that first drains the log observes some prefix of the true history.
/// Emission never blocks: a subscriber whose bounded queue is full, or that
/// went away, is dropped on the spot.
#[derive(Debug)]
pub struct DeltaFeed {
    capacity: usize,
    log: Vec<Delta>,
    subscribers: Vec<flume::Sender<Delta>>,
}

impl DeltaFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            log: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Register a subscriber: the full history so far, then live deltas.
    pub fn subscribe(&mut self) -> (Vec<Delta>, flume::Receiver<Delta>) {
        let (tx, rx) = flume::bounded(self.capacity);
        self.subscribers.push(tx);
        (self.log.clone(), rx)
    }

    pub fn emit(&mut self, delta: Delta) {
        self.log.push(delta.clone());
        self.subscribers.retain(|tx| match tx.try_send(delta.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                debug!("subscriber queue full, dropping subscriber");
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn log(&self) -> &[Delta] {
        &self.log
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
