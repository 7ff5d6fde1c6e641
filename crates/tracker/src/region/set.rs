use super::{Region, RegionIdGen, SetChange};
use tracing::{debug, warn};

/// Sorted, non-overlapping regions of one process.
///
/// Invariant: for all i, `regions[i].end < regions[i + 1].start` strictly.
/// Touching regions never persist, they are merged on insert.
#[derive(Debug)]
pub struct RegionSet {
    page_size: u64,
    regions: Vec<Region>,
}

impl RegionSet {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            regions: Vec::new(),
        }
    }

    /// Insert `[start, start + size)`.
    ///
    /// A range overlapping any live region is dropped: the kernel reporting
    /// an already-mapped range means a duplicate or racing report, not a new
    /// mapping. On success the set is re-coalesced and the reported changes
    /// are zero or more removals of absorbed ids followed by exactly one
    /// addition covering the final merged bounds.
    pub fn insert(
        &mut self,
        start: u64,
        size: u64,
        tag: &str,
        ids: &mut RegionIdGen,
    ) -> Vec<SetChange> {
        if size == 0 {
            return Vec::new();
        }
        let Some(end) = start.checked_add(size) else {
            warn!(
                start = format_args!("{start:#x}"),
                size, "mapping overflows the address space, dropped"
            );
            return Vec::new();
        };
        if self.regions.iter().any(|r| start < r.end && r.start < end) {
            debug!(
                start = format_args!("{start:#x}"),
                size, "overlapping mapping reported, dropped"
            );
            return Vec::new();
        }

        let id = ids.next_id();
        let pos = self.regions.partition_point(|r| r.end <= start);
        self.regions
            .insert(pos, Region::new(id, start, end, self.page_size, tag.to_owned()));

        let mut changes = self.coalesce();
        match self.regions.iter().find(|r| r.start <= start && end <= r.end) {
            Some(region) => changes.push(SetChange::Added(region.clone())),
            None => {
                debug_assert!(false, "inserted region vanished during coalesce");
                warn!(
                    start = format_args!("{start:#x}"),
                    size, "inserted region not found after merge, delta skipped"
                );
            }
        }
        changes
    }

    /// Merge strictly adjacent neighbours. The merged region keeps the
    /// larger of the two ids; the smaller id is reported removed.
    fn coalesce(&mut self) -> Vec<SetChange> {
        let mut changes = Vec::new();
        let mut i = 0;
        while i + 1 < self.regions.len() {
            if self.regions[i].end == self.regions[i + 1].start {
                let right = self.regions.remove(i + 1);
                let left = &mut self.regions[i];
                changes.push(SetChange::Removed(left.id.min(right.id)));
                left.id = left.id.max(right.id);
                left.end = right.end;
                left.size = left.end - left.start;
                left.pages = left.size.div_ceil(self.page_size);
            } else {
                i += 1;
            }
        }
        changes
    }

    /// Remove `[start, start + size)`, truncating or splitting every
    /// intersecting region. Remainders get fresh ids. A range matching
    /// nothing is a warning, not an error: the mapping may predate tracing.
    pub fn remove(&mut self, start: u64, size: u64, ids: &mut RegionIdGen) -> Vec<SetChange> {
        self.remove_range(start, size, ids, false)
    }

    /// Like [`RegionSet::remove`] but silent when nothing intersects.
    pub fn remove_if_present(
        &mut self,
        start: u64,
        size: u64,
        ids: &mut RegionIdGen,
    ) -> Vec<SetChange> {
        self.remove_range(start, size, ids, true)
    }

    fn remove_range(
        &mut self,
        start: u64,
        size: u64,
        ids: &mut RegionIdGen,
        quiet: bool,
    ) -> Vec<SetChange> {
        if size == 0 {
            return Vec::new();
        }
        let Some(end) = start.checked_add(size) else {
            warn!(
                start = format_args!("{start:#x}"),
                size, "unmap overflows the address space, dropped"
            );
            return Vec::new();
        };

        let mut changes = Vec::new();
        let mut kept = Vec::with_capacity(self.regions.len());
        for region in self.regions.drain(..) {
            if region.end <= start || region.start >= end {
                kept.push(region);
                continue;
            }
            changes.push(SetChange::Removed(region.id));
            if region.start < start {
                let left = Region::new(
                    ids.next_id(),
                    region.start,
                    start,
                    self.page_size,
                    region.tag.clone(),
                );
                changes.push(SetChange::Added(left.clone()));
                kept.push(left);
            }
            if region.end > end {
                let right = Region::new(
                    ids.next_id(),
                    end,
                    region.end,
                    self.page_size,
                    region.tag.clone(),
                );
                changes.push(SetChange::Added(right.clone()));
                kept.push(right);
            }
        }
        self.regions = kept;

        if changes.is_empty() && !quiet {
            warn!(
                start = format_args!("{start:#x}"),
                size, "unmap did not match any tracked region"
            );
        }
        changes
    }

    /// Drop every live region, reporting each as removed.
    pub fn clear(&mut self) -> Vec<SetChange> {
        self.regions
            .drain(..)
            .map(|r| SetChange::Removed(r.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    pub fn total_pages(&self) -> u64 {
        self.regions.iter().map(|r| r.pages).sum()
    }
}
