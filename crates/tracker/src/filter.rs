use crate::event::{CloneFlags, Event, Payload, ThreadHandle};
use libc::pid_t;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// What the filter decided to do with an incoming event.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Route through correlation and the tracker now.
    Deliver(Event),
    /// Held back until the in-flight process creations resolve.
    Deferred,
    /// Not of interest, or consumed by fork bookkeeping.
    Ignored,
    /// A fork batch resolved: replay these in arrival order.
    Resolved(Vec<Event>),
}

/// Decides which processes are of interest and keeps event order stable
/// across fork windows.
///
/// While any process-creation syscall from a tracked process is between its
/// enter and exit, the new child's pid is unknown, so every other event for
/// every pid is held back. Once the last in-flight creation resolves, the
/// tracked set absorbs the new children and the backlog is replayed in its
/// original arrival order. Buffering all pids rather than only unresolved
/// ones keeps replayed events ordered relative to the rest of the stream.
#[derive(Debug)]
pub struct SubjectFilter {
    /// Pid of this tracer process. Observed for its forks, never tracked.
    self_pid: pid_t,

    global: bool,

    tracked: HashSet<pid_t>,

    /// Whether the next fork resolution replaces the tracked set. True until
    /// the root has been observed one way or the other.
    first_resolution: bool,

    forks_in_flight: HashSet<ThreadHandle>,

    /// Children discovered by the current in-flight batch.
    new_subjects: HashSet<pid_t>,

    /// Deferred events per pid, each stamped with a global arrival sequence.
    buffered: HashMap<pid_t, VecDeque<(u64, Event)>>,

    buffered_total: usize,

    next_seq: u64,

    max_buffered: usize,
}

impl SubjectFilter {
    pub fn new(self_pid: pid_t, max_buffered: usize) -> Self {
        Self {
            self_pid,
            global: false,
            tracked: HashSet::new(),
            first_resolution: true,
            forks_in_flight: HashSet::new(),
            new_subjects: HashSet::new(),
            buffered: HashMap::new(),
            buffered_total: 0,
            next_seq: 0,
            max_buffered,
        }
    }

    /// Track the launched root command. Mutually exclusive with
    /// [`SubjectFilter::enable_global_mode`].
    pub fn mark_root_tracked(&mut self, pid: pid_t) {
        info!(pid, "tracking root command");
        self.tracked.insert(pid);
        // An explicitly marked root must survive later fork resolutions.
        self.first_resolution = false;
    }

    /// Trace every process on the system (except this one).
    pub fn enable_global_mode(&mut self) {
        info!("tracing all processes");
        self.global = true;
    }

    pub fn is_tracked(&self, pid: pid_t) -> bool {
        if pid == self.self_pid {
            return false;
        }
        self.global || self.tracked.contains(&pid)
    }

    pub fn forks_in_flight(&self) -> usize {
        self.forks_in_flight.len()
    }

    pub fn buffered_events(&self) -> usize {
        self.buffered_total
    }

    pub fn admit(&mut self, event: Event) -> Admission {
        if event.payload.is_process_creation() {
            return self.admit_fork(event);
        }

        let pid = event.handle.pid();
        if self.global {
            return if pid == self.self_pid {
                Admission::Ignored
            } else {
                Admission::Deliver(event)
            };
        }
        if !self.forks_in_flight.is_empty() {
            self.buffer(pid, event);
            return Admission::Deferred;
        }
        if self.tracked.contains(&pid) {
            Admission::Deliver(event)
        } else {
            Admission::Ignored
        }
    }

    /// Process-creation records never join the backlog: holding back the
    /// exits would leave the in-flight set stuck forever.
    fn admit_fork(&mut self, event: Event) -> Admission {
        match &event.payload {
            Payload::CloneEnter { flags, .. } | Payload::Clone3Enter { flags, .. } => {
                if flags.contains(CloneFlags::THREAD) {
                    // Same address space: a thread, not a new subject.
                    debug!(handle = %event.handle, "thread clone, no new subject");
                } else {
                    self.fork_enter(event.handle);
                }
                Admission::Ignored
            }
            Payload::VforkEnter { .. } => {
                self.fork_enter(event.handle);
                Admission::Ignored
            }
            Payload::CloneExit { child_pid }
            | Payload::Clone3Exit { child_pid }
            | Payload::VforkExit { child_pid } => self.fork_exit(event.handle, *child_pid),
            _ => Admission::Ignored,
        }
    }

    fn fork_enter(&mut self, handle: ThreadHandle) {
        if self.global {
            return;
        }
        let pid = handle.pid();
        if !self.tracked.contains(&pid) && pid != self.self_pid {
            return;
        }
        debug!(pid, tid = handle.tid(), "process creation entered");
        self.forks_in_flight.insert(handle);
    }

    fn fork_exit(&mut self, handle: ThreadHandle, child_pid: pid_t) -> Admission {
        if self.global || !self.forks_in_flight.remove(&handle) {
            return Admission::Ignored;
        }
        debug!(pid = handle.pid(), child_pid, "process creation resolved");
        self.new_subjects.insert(child_pid);
        if self.forks_in_flight.is_empty() {
            self.resolve_batch()
        } else {
            Admission::Ignored
        }
    }

    fn resolve_batch(&mut self) -> Admission {
        let new_subjects = std::mem::take(&mut self.new_subjects);
        if self.first_resolution {
            // The very first resolution is the root command observing itself
            // through the supervisor's fork.
            self.tracked = new_subjects;
            self.first_resolution = false;
        } else {
            self.tracked.extend(new_subjects);
        }
        self.tracked.remove(&self.self_pid);
        info!(tracked = self.tracked.len(), "tracked set updated");

        let mut replay: Vec<(u64, Event)> = Vec::new();
        let mut dropped = 0usize;
        for (pid, queue) in self.buffered.drain() {
            if self.tracked.contains(&pid) {
                replay.extend(queue);
            } else {
                dropped += queue.len();
            }
        }
        self.buffered_total = 0;
        if dropped > 0 {
            debug!(dropped, "deferred events for untracked pids discarded");
        }

        replay.sort_unstable_by_key(|(seq, _)| *seq);
        Admission::Resolved(replay.into_iter().map(|(_, event)| event).collect())
    }

    fn buffer(&mut self, pid: pid_t, event: Event) {
        if self.buffered_total >= self.max_buffered {
            self.drop_oldest_buffered();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffered.entry(pid).or_default().push_back((seq, event));
        self.buffered_total += 1;
    }

    fn drop_oldest_buffered(&mut self) {
        let oldest = self
            .buffered
            .iter()
            .filter_map(|(pid, queue)| queue.front().map(|(seq, _)| (*seq, *pid)))
            .min();
        if let Some((_, pid)) = oldest
            && let Some(queue) = self.buffered.get_mut(&pid)
        {
            queue.pop_front();
            self.buffered_total -= 1;
            warn!(pid, "fork-window buffer full, oldest deferred event dropped");
        }
    }
}
