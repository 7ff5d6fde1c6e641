use crate::correlate::{Correlator, PendingMmap, PendingMremap};
use crate::event::{Event, Payload, SYSCALL_FAILED};
use crate::filter::{Admission, SubjectFilter};
use crate::track::Tracker;
use tracing::{debug, trace, warn};

/// The single event-consuming context: admission, correlation, tracking.
///
/// Events are processed strictly in arrival order; fork-replay correctness
/// depends on it, so the router never runs concurrently with itself. Every
/// steady-state anomaly (unmatched exit, failed syscall, unknown pid) is
/// absorbed here and never stops the stream.
#[derive(Debug)]
pub struct EventRouter {
    filter: SubjectFilter,
    correlator: Correlator,
    tracker: Tracker,
}

impl EventRouter {
    pub fn new(filter: SubjectFilter, tracker: Tracker) -> Self {
        Self {
            filter,
            correlator: Correlator::default(),
            tracker,
        }
    }

    /// Drain the event stream until the sender side closes.
    pub async fn run(mut self, events: flume::Receiver<Event>) {
        while let Ok(event) = events.recv_async().await {
            self.handle(event);
        }
        debug!("event stream closed");
    }

    pub fn handle(&mut self, event: Event) {
        match self.filter.admit(event) {
            Admission::Deliver(event) => self.apply(&event),
            Admission::Resolved(backlog) => {
                if !backlog.is_empty() {
                    debug!(events = backlog.len(), "replaying deferred events");
                }
                for event in &backlog {
                    self.apply(event);
                }
            }
            Admission::Deferred | Admission::Ignored => {}
        }
    }

    fn apply(&mut self, event: &Event) {
        let handle = event.handle;
        let pid = handle.pid();
        match &event.payload {
            Payload::MmapEnter {
                requested_addr,
                size,
                comm,
            } => {
                trace!(
                    pid,
                    addr = format_args!("{requested_addr:#x}"),
                    size,
                    "mmap enter"
                );
                self.correlator.push_mmap(
                    handle,
                    PendingMmap {
                        requested_addr: *requested_addr,
                        size: *size,
                        comm: comm.clone(),
                    },
                );
            }
            Payload::MmapExit { actual_addr } => {
                let Some(pending) = self.correlator.pop_mmap(handle) else {
                    debug!(pid, "mmap exit without a pending enter, dropped");
                    return;
                };
                if *actual_addr == SYSCALL_FAILED {
                    debug!(pid, size = pending.size, "mmap failed");
                    return;
                }
                self.tracker
                    .add_allocation(pid, *actual_addr, pending.size, &pending.comm);
            }
            Payload::MremapEnter {
                old_addr,
                old_size,
                new_size,
                flags,
                comm,
                ..
            } => {
                trace!(
                    pid,
                    old_addr = format_args!("{old_addr:#x}"),
                    old_size,
                    new_size,
                    "mremap enter"
                );
                self.correlator.push_mremap(
                    handle,
                    PendingMremap {
                        old_addr: *old_addr,
                        old_size: *old_size,
                        new_size: *new_size,
                        flags: *flags,
                        comm: comm.clone(),
                    },
                );
            }
            Payload::MremapExit { new_addr } => {
                let Some(pending) = self.correlator.pop_mremap(handle) else {
                    debug!(pid, "mremap exit without a pending enter, dropped");
                    return;
                };
                if *new_addr == SYSCALL_FAILED {
                    warn!(
                        pid,
                        old_addr = format_args!("{:#x}", pending.old_addr),
                        "mremap failed"
                    );
                    return;
                }
                if pending.flags.unmaps_old() {
                    self.tracker
                        .remove_allocation(pid, pending.old_addr, pending.old_size);
                }
                if pending.flags.unmaps_new() {
                    self.tracker
                        .remove_allocation_if_present(pid, *new_addr, pending.new_size);
                }
                self.tracker
                    .add_allocation(pid, *new_addr, pending.new_size, &pending.comm);
            }
            Payload::Munmap {
                start_addr, size, ..
            } => {
                self.tracker.remove_allocation(pid, *start_addr, *size);
            }
            Payload::BrkEnter { requested_brk, .. } => {
                trace!(pid, brk = format_args!("{requested_brk:#x}"), "brk enter");
            }
            Payload::BrkExit { actual_brk, comm } => {
                self.tracker
                    .handle_brk(pid, handle.tid(), *actual_brk, comm);
            }
            // Process-creation records are consumed by the filter and never
            // reach this point.
            _ => debug!(pid, "unexpected event kind past admission"),
        }
    }
}
