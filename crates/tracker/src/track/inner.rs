use crate::feed::{Delta, DeltaFeed};
use crate::region::{Region, RegionIdGen, RegionSet, SetChange};
use config::Config;
use humansize::{BINARY, format_size};
use itertools::Itertools;
use libc::pid_t;
use std::{collections::HashMap, time::Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct TrackerInner {
    page_size: u64,

    ids: RegionIdGen,

    /// One interval set per tracked process.
    spaces: HashMap<pid_t, RegionSet>,

    /// Last-observed program break per (pid, tid).
    breaks: HashMap<(pid_t, u32), u64>,

    feed: DeltaFeed,

    start: Instant,
}

impl TrackerInner {
    pub fn new(config: &Config) -> Self {
        let page_size = config
            .system
            .pagesize
            .filter(|&ps| ps > 0)
            .unwrap_or_else(procfs::page_size);
        Self {
            page_size,
            ids: RegionIdGen::default(),
            spaces: HashMap::new(),
            breaks: HashMap::new(),
            feed: DeltaFeed::new(config.model.feed_capacity),
            start: Instant::now(),
        }
    }

    pub fn add_allocation(&mut self, pid: pid_t, addr: u64, size: u64, tag: &str) {
        if size == 0 {
            return;
        }
        let page_size = self.page_size;
        let set = self
            .spaces
            .entry(pid)
            .or_insert_with(|| RegionSet::new(page_size));
        let changes = set.insert(addr, size, tag, &mut self.ids);
        self.publish(pid, changes);
    }

    pub fn remove_allocation(&mut self, pid: pid_t, addr: u64, size: u64, quiet: bool) {
        if size == 0 {
            return;
        }
        let Some(set) = self.spaces.get_mut(&pid) else {
            if !quiet {
                warn!(
                    pid,
                    addr = format_args!("{addr:#x}"),
                    size,
                    "unmap for a pid with no tracked allocations"
                );
            }
            return;
        };
        let changes = if quiet {
            set.remove_if_present(addr, size, &mut self.ids)
        } else {
            set.remove(addr, size, &mut self.ids)
        };
        self.publish(pid, changes);
    }

    pub fn handle_brk(&mut self, pid: pid_t, tid: u32, new_brk: u64, tag: &str) {
        let Some(old_brk) = self.breaks.insert((pid, tid), new_brk) else {
            // No baseline to diff against yet.
            info!(
                pid,
                tid,
                brk = format_args!("{new_brk:#x}"),
                "initialized heap watermark"
            );
            return;
        };
        if new_brk > old_brk {
            self.add_allocation(pid, old_brk, new_brk - old_brk, tag);
        } else if new_brk < old_brk {
            self.remove_allocation(pid, new_brk, old_brk - new_brk, false);
        }
    }

    pub fn clear_for_pid(&mut self, pid: pid_t) {
        let Some(mut set) = self.spaces.remove(&pid) else {
            debug!(pid, "no allocations to clear");
            return;
        };
        let changes = set.clear();
        info!(pid, regions = changes.len(), "cleared exited process");
        self.publish(pid, changes);
        self.breaks.retain(|(p, _), _| *p != pid);
    }

    fn publish(&mut self, pid: pid_t, changes: Vec<SetChange>) {
        if changes.is_empty() {
            return;
        }
        let t = self.start.elapsed().as_nanos() as u64;
        for change in changes {
            let delta = match change {
                SetChange::Added(region) => Delta::Add {
                    id: region.id.raw(),
                    pid,
                    start: region.start,
                    end: region.end,
                    size: region.size,
                    pages: region.pages,
                    tag: region.tag,
                    t,
                },
                SetChange::Removed(id) => Delta::Remove {
                    id: id.raw(),
                    pid,
                    t,
                },
            };
            self.feed.emit(delta);
        }
    }

    pub fn subscribe(&mut self) -> (Vec<Delta>, flume::Receiver<Delta>) {
        self.feed.subscribe()
    }

    pub fn catchup_log(&self) -> Vec<Delta> {
        self.feed.log().to_vec()
    }

    pub fn pids(&self) -> Vec<pid_t> {
        self.spaces.keys().copied().collect()
    }

    pub fn regions(&self, pid: pid_t) -> Vec<Region> {
        self.spaces
            .get(&pid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn dump_summary(&self) {
        let span = tracing::info_span!("summary");
        let _enter = span.enter();

        for (pid, set) in self.spaces.iter().sorted_by_key(|(pid, _)| **pid) {
            info!(
                pid,
                regions = set.len(),
                size = %format_size(set.total_size(), BINARY),
                pages = set.total_pages(),
                "address space"
            );
        }
        let total_size: u64 = self.spaces.values().map(RegionSet::total_size).sum();
        let total_pages: u64 = self.spaces.values().map(RegionSet::total_pages).sum();
        info!(
            processes = self.spaces.len(),
            regions = self.spaces.values().map(RegionSet::len).sum::<usize>(),
            total = %format_size(total_size, BINARY),
            pages = total_pages,
            subscribers = self.feed.subscriber_count(),
            "totals"
        );
    }
}
