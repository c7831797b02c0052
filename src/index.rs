//! # Patch point index
//!
//! An address-interval map from injected patch regions to their policy
//! descriptors. This is the structure the dispatch gateway consults on
//! every patched execution, so point lookup is O(log n).
//!
//! Every region is exactly [`PATCH_REGION_SIZE`](crate::table::PATCH_REGION_SIZE)
//! bytes, which lets one map shape serve both range-overlap queries and
//! single-address containment.
//!
//! Entries are inserted only at injection time and removed only at
//! removal/unload time, always under the engine's writer lock; overlapping
//! inserts and removals of absent ranges therefore indicate a bookkeeping
//! bug. They assert in debug builds and fail safe (no-op, error log) in
//! release builds.

use std::collections::BTreeMap;
use std::ops::Range;

use log::error;

use crate::table::PointId;

/// One injected patch region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Absolute address range of the patched bytes.
    pub range: Range<usize>,
    /// Descriptor of the owning patch point.
    pub id: PointId,
}

/// Address-interval map over injected patch regions.
#[derive(Debug, Default)]
pub struct PatchIndex {
    /// Entries keyed by range start. Ranges never overlap, so ordering by
    /// start is a total order over regions.
    entries: BTreeMap<usize, IndexEntry>,
}

impl PatchIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        PatchIndex::default()
    }

    /// Number of injected regions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no regions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a region. Returns `false` (and changes nothing) if the range
    /// overlaps an existing entry; matching and injection are serialized,
    /// so an overlap here is an invariant violation.
    pub fn insert(&mut self, range: Range<usize>, id: PointId) -> bool {
        if self.overlaps(&range) {
            debug_assert!(false, "index insert with overlapping range {range:?}");
            error!("patch index: refusing overlapping insert at {:#x}", range.start);
            return false;
        }
        self.entries.insert(range.start, IndexEntry { range, id });
        true
    }

    /// Removes the region starting exactly at `range.start`. Returns the
    /// removed entry, or `None` if absent, which (like overlap on insert)
    /// indicates a bookkeeping bug and is defensively ignored.
    pub fn remove(&mut self, range: &Range<usize>) -> Option<IndexEntry> {
        let removed = self.entries.remove(&range.start);
        if removed.is_none() {
            debug_assert!(false, "index remove of absent range {range:?}");
            error!("patch index: remove of absent range at {:#x}", range.start);
        }
        removed
    }

    /// Point containment query: the entry whose region contains `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&IndexEntry> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.range.contains(&addr))
    }

    /// Whether `range` overlaps any indexed region.
    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        self.overlapping(range).next().is_some()
    }

    /// Iterates entries overlapping `range`.
    pub fn overlapping<'a>(
        &'a self,
        range: &Range<usize>,
    ) -> impl Iterator<Item = &'a IndexEntry> {
        // candidates start before range.end; the predecessor of range.start
        // may still reach into it, so filter on actual intersection
        let (start, end) = (range.start, range.end);
        self.entries
            .range(..end)
            .rev()
            .map(|(_, entry)| entry)
            .take_while(move |entry| entry.range.end > start)
            .filter(move |entry| entry.range.start < end && entry.range.end > start)
    }

    /// Full enumeration, used only during bulk teardown and reload.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
