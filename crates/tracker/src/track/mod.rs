mod inner;

use crate::feed::Delta;
use crate::region::Region;
use config::Config;
use inner::TrackerInner;
use libc::pid_t;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

/// Shared handle to the allocation tracker.
///
/// Every mutating operation takes one exclusive lock for its full duration,
/// delta emission included, so broadcast state never runs ahead of the
/// committed region sets. Nothing suspends while the lock is held.
#[derive(Debug, Clone)]
pub struct Tracker(Arc<Mutex<TrackerInner>>);

impl Tracker {
    pub fn new(config: &Config) -> Self {
        Self(Arc::new(Mutex::new(TrackerInner::new(config))))
    }

    /// Record a new mapping for `pid`. Size 0 is a no-op.
    pub fn add_allocation(&self, pid: pid_t, addr: u64, size: u64, tag: &str) {
        self.0.lock().add_allocation(pid, addr, size, tag);
    }

    /// Unmap `[addr, addr + size)` for `pid`, splitting regions as needed.
    pub fn remove_allocation(&self, pid: pid_t, addr: u64, size: u64) {
        self.0.lock().remove_allocation(pid, addr, size, false);
    }

    /// Like [`Tracker::remove_allocation`] but silent when nothing is
    /// mapped there.
    pub fn remove_allocation_if_present(&self, pid: pid_t, addr: u64, size: u64) {
        self.0.lock().remove_allocation(pid, addr, size, true);
    }

    /// Diff the program break against the thread's watermark. The first
    /// observation for a thread only initializes the watermark.
    pub fn handle_brk(&self, pid: pid_t, tid: u32, new_brk: u64, tag: &str) {
        self.0.lock().handle_brk(pid, tid, new_brk, tag);
    }

    /// Forget everything about a process believed to have exited.
    pub fn clear_allocations_for_pid(&self, pid: pid_t) {
        self.0.lock().clear_for_pid(pid);
    }

    /// Register a delta subscriber: the full history so far, then live
    /// deltas on the returned channel.
    pub fn subscribe(&self) -> (Vec<Delta>, flume::Receiver<Delta>) {
        self.0.lock().subscribe()
    }

    pub fn catchup_log(&self) -> Vec<Delta> {
        self.0.lock().catchup_log()
    }

    /// Pids with at least one tracked region.
    pub fn pids(&self) -> Vec<pid_t> {
        self.0.lock().pids()
    }

    /// Snapshot of the live regions of one process, in address order.
    pub fn regions(&self, pid: pid_t) -> Vec<Region> {
        self.0.lock().regions(pid)
    }

    pub fn page_size(&self) -> u64 {
        self.0.lock().page_size()
    }

    pub fn dump_summary(&self) {
        self.0.lock().dump_summary();
    }
}

/// Periodically dump the human-readable allocation summary.
pub async fn summary_loop(tracker: Tracker, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        tracker.dump_summary();
    }
}
