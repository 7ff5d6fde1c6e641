use crate::Error;
use crate::track::Tracker;
use libc::pid_t;
use nix::{sys::signal::kill, unistd::Pid};
use procfs::process::Process;
use std::time::Duration;
use tracing::{debug, warn};

/// One usage observation from `/proc/<pid>/statm`, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSample {
    pub pid: pid_t,
    pub vm_pages: u64,
    pub rss_pages: u64,
}

/// Read the current usage counters for one process.
pub fn sample(pid: pid_t) -> Result<UsageSample, Error> {
    let statm = Process::new(pid)?.statm()?;
    Ok(UsageSample {
        pid,
        vm_pages: statm.size,
        rss_pages: statm.resident,
    })
}

fn is_alive(pid: pid_t) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Periodically sample every process the tracker holds regions for, and
/// clear the ones that are gone.
pub async fn usage_loop(tracker: Tracker, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for pid in tracker.pids() {
            match sample(pid) {
                Ok(sample) => debug!(
                    pid,
                    vm_pages = sample.vm_pages,
                    rss_pages = sample.rss_pages,
                    "usage"
                ),
                Err(_) if !is_alive(pid) => {
                    tracker.clear_allocations_for_pid(pid);
                }
                Err(err) => warn!(pid, %err, "usage sample failed"),
            }
        }
    }
}
