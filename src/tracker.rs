//! Record tracking engine
//!
//! Owns one module's record pool plus two indices into it:
//! - primary: record identifier → slot (every resource ever tracked)
//! - secondary: open handle → slot (resources currently open)
//!
//! The engine itself is single-threaded (`&mut self`); the owning module
//! serializes access with its recursive lock, so each call here runs with
//! exclusive access for its whole duration.
//!
//! "Unavailable" is not an error: excluded names, a full pool or an
//! untracked handle all come back as `None` and the caller skips tracking.

use crate::filter::PathFilter;
use crate::identity::{canonical_name, IdentifierAuthority, Namespace, RecordId};
use crate::pool::{PoolSlot, RecordPool, SlotId};
use crate::record::{CounterSchema, StatsRecord};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handle of an open resource (file descriptor, library object id)
pub type Handle = i64;

/// Tracking state of one module
pub struct RecordTracker<S: CounterSchema> {
    pool: RecordPool<S>,
    by_id: HashMap<RecordId, SlotId>,
    by_handle: HashMap<Handle, SlotId>,
    identifiers: Arc<dyn IdentifierAuthority>,
    exclusions: PathFilter,
    namespace: Namespace,
    rank: i64,
    exhaustion_reported: bool,
}

impl<S: CounterSchema> RecordTracker<S> {
    pub fn new(
        pool: RecordPool<S>,
        identifiers: Arc<dyn IdentifierAuthority>,
        exclusions: PathFilter,
        namespace: Namespace,
        rank: i64,
    ) -> Self {
        Self {
            pool,
            by_id: HashMap::new(),
            by_handle: HashMap::new(),
            identifiers,
            exclusions,
            namespace,
            rank,
            exhaustion_reported: false,
        }
    }

    /// Find or create the record for a resource name
    ///
    /// Returns `None` when the name is excluded or the pool is exhausted.
    pub fn resolve_by_name(&mut self, name: &str) -> Option<SlotId> {
        if self.exclusions.is_excluded(name) {
            return None;
        }

        let canonical = canonical_name(name);
        let id = self
            .identifiers
            .lookup_identifier(&canonical, self.namespace);

        if let Some(&slot) = self.by_id.get(&id) {
            return Some(slot);
        }

        match self.pool.allocate_next() {
            Ok(slot) => {
                if let Some(entry) = self.pool.get_mut(slot) {
                    entry.record.stamp_identity(id, self.rank);
                }
                self.by_id.insert(id, slot);
                Some(slot)
            }
            Err(exhausted) => {
                if !self.exhaustion_reported {
                    self.exhaustion_reported = true;
                    tracing::warn!(
                        module = %S::MODULE,
                        capacity = exhausted.capacity,
                        "record pool exhausted; new resources will not be tracked"
                    );
                }
                None
            }
        }
    }

    /// Resolve `name` and point `handle` at its record
    ///
    /// A handle that already maps somewhere is silently repointed: the
    /// environment reuses handle values after close.
    pub fn bind_handle(&mut self, name: &str, handle: Handle) -> Option<SlotId> {
        let slot = self.resolve_by_name(name)?;
        self.by_handle.insert(handle, slot);
        Some(slot)
    }

    /// Record currently bound to `handle`
    pub fn lookup_by_handle(&self, handle: Handle) -> Option<SlotId> {
        self.by_handle.get(&handle).copied()
    }

    /// Drop the binding of `handle`; unknown handles are ignored
    pub fn unbind_handle(&mut self, handle: Handle) -> Option<SlotId> {
        self.by_handle.remove(&handle)
    }

    /// Drop every handle binding
    pub fn unbind_all(&mut self) {
        self.by_handle.clear();
    }

    pub fn lookup_by_id(&self, id: RecordId) -> Option<SlotId> {
        self.by_id.get(&id).copied()
    }

    /// Record for `name` if it is already tracked
    ///
    /// Neither allocates a record nor registers the name with the authority.
    pub fn find_by_name(&self, name: &str) -> Option<SlotId> {
        let canonical = canonical_name(name);
        let id = self.identifiers.peek_identifier(&canonical, self.namespace);
        self.lookup_by_id(id)
    }

    pub fn record(&self, slot: SlotId) -> Option<&StatsRecord<S>> {
        self.pool.get(slot).map(|entry| &entry.record)
    }

    pub fn slot(&self, slot: SlotId) -> Option<&PoolSlot<S>> {
        self.pool.get(slot)
    }

    pub fn slot_mut(&mut self, slot: SlotId) -> Option<&mut PoolSlot<S>> {
        self.pool.get_mut(slot)
    }

    /// Run `update` against a slot's record and bookkeeping
    pub fn update<R>(
        &mut self,
        slot: SlotId,
        update: impl FnOnce(&mut StatsRecord<S>, &mut S::Runtime) -> R,
    ) -> Option<R> {
        let entry = self.pool.get_mut(slot)?;
        Some(update(&mut entry.record, &mut entry.runtime))
    }

    pub fn increment(&mut self, slot: SlotId, counter: S::Counter, amount: i64) {
        self.update(slot, |record, _| record.increment(counter, amount));
    }

    pub fn set_max(&mut self, slot: SlotId, counter: S::Counter, value: i64) {
        self.update(slot, |record, _| record.set_max(counter, value));
    }

    /// Non-overlapping duration accumulation against a watermark kept in
    /// the slot's bookkeeping, chosen by `watermark`
    pub fn accumulate_non_overlapping(
        &mut self,
        slot: SlotId,
        counter: S::FCounter,
        start: f64,
        end: f64,
        watermark: fn(&mut S::Runtime) -> &mut f64,
    ) {
        self.update(slot, |record, runtime| {
            record.accumulate_non_overlapping(counter, start, end, watermark(runtime))
        });
    }

    /// Canonical name behind a record, if the identifier authority kept it
    pub fn name_of(&self, id: RecordId) -> Option<String> {
        self.identifiers.name_of(id)
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    /// Number of distinct records tracked (primary index size)
    pub fn record_count(&self) -> usize {
        self.by_id.len()
    }

    /// Number of live handle bindings
    pub fn handle_count(&self) -> usize {
        self.by_handle.len()
    }

    pub fn pool(&self) -> &RecordPool<S> {
        &self.pool
    }

    /// Tracked records in allocation order
    pub fn records(&self) -> impl Iterator<Item = &StatsRecord<S>> + '_ {
        self.pool.records()
    }
}
