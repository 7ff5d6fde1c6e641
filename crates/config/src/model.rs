#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Model {
    /// Interval between human-readable allocation summaries, in seconds.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub summary_interval: Duration,

    /// Interval between /proc usage samples, in seconds.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub usage_interval: Duration,

    /// Bounded capacity of each subscriber's delta queue.
    pub feed_capacity: usize,

    /// Cap on events held back while a process-creation syscall is in
    /// flight. Beyond it the oldest deferred event is dropped.
    pub max_buffered_events: usize,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            summary_interval: Duration::from_secs(1),
            usage_interval: Duration::from_secs(1),
            feed_capacity: 64,
            max_buffered_events: 4096,
        }
    }
}
