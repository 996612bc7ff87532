//! Static and dynamic header tables (RFC 9204 Section 3.2).
//!
//! [`HeaderTableBase`] holds the dynamic table state common to both
//! directions: entries, size accounting, capacity and eviction. The
//! encoder adds name/value lookup on top, the decoder adds lookup by
//! index and insert count observers.

use crate::field_line::{entry_size, FieldLine, ENTRY_SIZE_OVERHEAD};
use crate::static_table;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::trace;

/// Dynamic table state shared by encoder and decoder.
#[derive(Debug, Default)]
pub struct HeaderTableBase {
    /// Entries in insertion order; the front has absolute index
    /// `dropped_entry_count`.
    entries: VecDeque<FieldLine>,
    /// Sum of entry sizes.
    dynamic_table_size: u64,
    dynamic_table_capacity: u64,
    /// Upper bound on `dynamic_table_capacity`, set once.
    maximum_dynamic_table_capacity: u64,
    /// `maximum_dynamic_table_capacity / 32`, the modulus used for
    /// encoding Required Insert Count.
    max_entries: u64,
    dropped_entry_count: u64,
    dynamic_table_entry_referenced: bool,
}

impl HeaderTableBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an entry with the given name and value fits in the
    /// dynamic table at its current capacity.
    pub fn entry_fits_dynamic_table_capacity(&self, name: &[u8], value: &[u8]) -> bool {
        entry_size(name, value) <= self.dynamic_table_capacity
    }

    /// Inserts an entry, evicting as needed, and returns its absolute
    /// index. `on_evict` is called with each evicted entry's index.
    ///
    /// The entry must fit the current capacity.
    fn insert_entry(
        &mut self,
        name: Bytes,
        value: Bytes,
        on_evict: impl FnMut(u64, &FieldLine),
    ) -> u64 {
        let entry = FieldLine::new(name, value);
        let size = entry.size();
        debug_assert!(size <= self.dynamic_table_capacity);

        let index = self.inserted_entry_count();
        self.dynamic_table_size += size;
        self.entries.push_back(entry);
        self.evict_down_to_capacity(self.dynamic_table_capacity, on_evict);
        index
    }

    /// Changes the capacity, evicting entries that no longer fit.
    ///
    /// Returns false if `capacity` exceeds the maximum.
    fn set_dynamic_table_capacity(
        &mut self,
        capacity: u64,
        on_evict: impl FnMut(u64, &FieldLine),
    ) -> bool {
        if capacity > self.maximum_dynamic_table_capacity {
            return false;
        }
        self.dynamic_table_capacity = capacity;
        self.evict_down_to_capacity(capacity, on_evict);
        debug_assert!(self.dynamic_table_size <= self.dynamic_table_capacity);
        true
    }

    /// Sets the maximum capacity. May only be done once; setting the same
    /// value again succeeds, any other value fails.
    pub fn set_maximum_dynamic_table_capacity(&mut self, maximum: u64) -> bool {
        if self.maximum_dynamic_table_capacity == 0 {
            self.maximum_dynamic_table_capacity = maximum;
            self.max_entries = maximum / ENTRY_SIZE_OVERHEAD;
            return true;
        }
        maximum == self.maximum_dynamic_table_capacity
    }

    fn evict_down_to_capacity(&mut self, capacity: u64, mut on_evict: impl FnMut(u64, &FieldLine)) {
        while self.dynamic_table_size > capacity {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            self.dynamic_table_size -= entry.size();
            on_evict(self.dropped_entry_count, &entry);
            trace!(index = self.dropped_entry_count, "evicted dynamic table entry");
            self.dropped_entry_count += 1;
        }
    }

    /// Returns the dynamic entry with the given absolute index, unless it
    /// has been evicted or not yet inserted.
    pub fn dynamic_entry(&self, index: u64) -> Option<&FieldLine> {
        let offset = index.checked_sub(self.dropped_entry_count)?;
        self.entries.get(usize::try_from(offset).ok()?)
    }

    pub fn dynamic_entries(&self) -> impl Iterator<Item = &FieldLine> {
        self.entries.iter()
    }

    /// Number of insertions so far, including evicted entries.
    pub fn inserted_entry_count(&self) -> u64 {
        self.entries.len() as u64 + self.dropped_entry_count
    }

    pub fn dropped_entry_count(&self) -> u64 {
        self.dropped_entry_count
    }

    pub fn dynamic_table_size(&self) -> u64 {
        self.dynamic_table_size
    }

    pub fn dynamic_table_capacity(&self) -> u64 {
        self.dynamic_table_capacity
    }

    pub fn maximum_dynamic_table_capacity(&self) -> u64 {
        self.maximum_dynamic_table_capacity
    }

    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Records that a header block referenced the dynamic table.
    pub fn set_dynamic_table_entry_referenced(&mut self) {
        self.dynamic_table_entry_referenced = true;
    }

    pub fn dynamic_table_entry_referenced(&self) -> bool {
        self.dynamic_table_entry_referenced
    }
}

/// How well a header field matches a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    NameAndValue,
    Name,
    NoMatch,
}

/// Result of looking up a header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub is_static: bool,
    /// Static index, or absolute dynamic index.
    pub index: u64,
}

impl MatchResult {
    const NO_MATCH: MatchResult = MatchResult {
        match_type: MatchType::NoMatch,
        is_static: false,
        index: 0,
    };
}

/// Header table used by the encoder.
#[derive(Debug, Default)]
pub struct QpackEncoderHeaderTable {
    base: HeaderTableBase,
    /// Absolute index of the most recent entry for each name and value.
    dynamic_index: HashMap<(Bytes, Bytes), u64>,
    /// Absolute index of the most recent entry for each name.
    dynamic_name_index: HashMap<Bytes, u64>,
}

impl QpackEncoderHeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the best match for a header field: exact before name-only,
    /// static before dynamic, most recent dynamic entry first.
    pub fn find_header_field(&self, name: &[u8], value: &[u8]) -> MatchResult {
        if let Some(index) = static_table::find_exact(name, value) {
            return MatchResult {
                match_type: MatchType::NameAndValue,
                is_static: true,
                index,
            };
        }
        if let Some(&index) = self
            .dynamic_index
            .get(&(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)))
        {
            return MatchResult {
                match_type: MatchType::NameAndValue,
                is_static: false,
                index,
            };
        }
        self.find_header_name(name)
    }

    /// Finds an entry with a matching name only.
    pub fn find_header_name(&self, name: &[u8]) -> MatchResult {
        if let Some(index) = static_table::find_name(name) {
            return MatchResult {
                match_type: MatchType::Name,
                is_static: true,
                index,
            };
        }
        if let Some(&index) = self.dynamic_name_index.get(name) {
            return MatchResult {
                match_type: MatchType::Name,
                is_static: false,
                index,
            };
        }
        MatchResult::NO_MATCH
    }

    /// Inserts an entry and returns its absolute index.
    pub fn insert_entry(&mut self, name: Bytes, value: Bytes) -> u64 {
        let dynamic_index = &mut self.dynamic_index;
        let dynamic_name_index = &mut self.dynamic_name_index;
        let index = self.base.insert_entry(name.clone(), value.clone(), |evicted, entry| {
            Self::forget(dynamic_index, dynamic_name_index, evicted, entry)
        });
        self.dynamic_index.insert((name.clone(), value), index);
        self.dynamic_name_index.insert(name, index);
        index
    }

    /// Changes the capacity. Returns false if it exceeds the maximum.
    pub fn set_dynamic_table_capacity(&mut self, capacity: u64) -> bool {
        let dynamic_index = &mut self.dynamic_index;
        let dynamic_name_index = &mut self.dynamic_name_index;
        self.base.set_dynamic_table_capacity(capacity, |evicted, entry| {
            Self::forget(dynamic_index, dynamic_name_index, evicted, entry)
        })
    }

    fn forget(
        dynamic_index: &mut HashMap<(Bytes, Bytes), u64>,
        dynamic_name_index: &mut HashMap<Bytes, u64>,
        evicted: u64,
        entry: &FieldLine,
    ) {
        // A later duplicate may own the map slot already.
        let key = (entry.name.clone(), entry.value.clone());
        if dynamic_index.get(&key) == Some(&evicted) {
            dynamic_index.remove(&key);
        }
        if dynamic_name_index.get(&entry.name) == Some(&evicted) {
            dynamic_name_index.remove(&entry.name);
        }
    }

    /// Largest entry that can be inserted without evicting the entry with
    /// absolute index `index` or anything newer.
    pub fn max_insert_size_without_evicting_given_entry(&self, index: u64) -> u64 {
        let base = &self.base;
        if index > base.inserted_entry_count() {
            // Every entry may be evicted.
            return base.dynamic_table_capacity();
        }

        let mut max_insert_size = base.dynamic_table_capacity() - base.dynamic_table_size();
        let mut entry_index = base.dropped_entry_count();
        for entry in base.dynamic_entries() {
            if entry_index >= index {
                break;
            }
            entry_index += 1;
            max_insert_size += entry.size();
        }
        max_insert_size
    }

    /// Returns the absolute index below which entries should no longer be
    /// referenced, so they can drain out of the table.
    ///
    /// Entries below the draining index occupy at most
    /// `draining_fraction` of the capacity, counting free space.
    pub fn draining_index(&self, draining_fraction: f32) -> u64 {
        debug_assert!((0.0..=1.0).contains(&draining_fraction));
        let base = &self.base;
        let required_space = (f64::from(draining_fraction) * base.dynamic_table_capacity() as f64) as u64;
        let mut space_above_draining_index = base.dynamic_table_capacity() - base.dynamic_table_size();

        if base.entries.is_empty() || space_above_draining_index >= required_space {
            return base.dropped_entry_count();
        }

        let mut entry_index = base.dropped_entry_count();
        for entry in base.dynamic_entries() {
            if space_above_draining_index >= required_space {
                break;
            }
            space_above_draining_index += entry.size();
            entry_index += 1;
        }
        entry_index
    }

    pub fn base(&self) -> &HeaderTableBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut HeaderTableBase {
        &mut self.base
    }
}

/// Header table used by the decoder.
#[derive(Debug, Default)]
pub struct QpackDecoderHeaderTable {
    base: HeaderTableBase,
    /// Streams waiting for the insert count to reach a threshold, ordered
    /// by threshold.
    observers: BTreeSet<(u64, u64)>,
}

impl QpackDecoderHeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a static entry by index or a dynamic entry by absolute
    /// index.
    pub fn lookup_entry(&self, is_static: bool, index: u64) -> Option<(Bytes, Bytes)> {
        if is_static {
            return static_table::get(index)
                .map(|(name, value)| (Bytes::from_static(name), Bytes::from_static(value)));
        }
        self.base
            .dynamic_entry(index)
            .map(|entry| (entry.name.clone(), entry.value.clone()))
    }

    /// Inserts an entry and returns the streams whose threshold the new
    /// insert count reached, in threshold order. Their registrations are
    /// removed.
    ///
    /// The entry must fit the current capacity.
    pub fn insert_entry(&mut self, name: Bytes, value: Bytes) -> Vec<u64> {
        self.base.insert_entry(name, value, |_, _| {});

        let inserted_entry_count = self.base.inserted_entry_count();
        let mut reached = Vec::new();
        while let Some(&(required, stream_id)) = self.observers.first() {
            if required > inserted_entry_count {
                break;
            }
            self.observers.remove(&(required, stream_id));
            reached.push(stream_id);
        }
        reached
    }

    /// Changes the capacity. Returns false if it exceeds the maximum.
    pub fn set_dynamic_table_capacity(&mut self, capacity: u64) -> bool {
        self.base.set_dynamic_table_capacity(capacity, |_, _| {})
    }

    /// Asks to be told when the insert count reaches `required_insert_count`.
    pub fn register_observer(&mut self, required_insert_count: u64, stream_id: u64) {
        debug_assert!(required_insert_count > self.base.inserted_entry_count());
        self.observers.insert((required_insert_count, stream_id));
    }

    pub fn unregister_observer(&mut self, required_insert_count: u64, stream_id: u64) {
        let removed = self.observers.remove(&(required_insert_count, stream_id));
        debug_assert!(removed, "observer for stream {} not registered", stream_id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn base(&self) -> &HeaderTableBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut HeaderTableBase {
        &mut self.base
    }

    pub fn inserted_entry_count(&self) -> u64 {
        self.base.inserted_entry_count()
    }

    pub fn max_entries(&self) -> u64 {
        self.base.max_entries()
    }

    pub fn set_dynamic_table_entry_referenced(&mut self) {
        self.base.set_dynamic_table_entry_referenced();
    }
}
