/// Record pool: a budget-sized arena of statistics records
///
/// The pool is sized once from the memory budget granted at module
/// registration (`capacity = budget / slot footprint`) and eagerly filled
/// with zeroed slots. The footprint counts everything a slot holds in
/// memory: the slot itself and both of its counter arrays. Every one of
/// those allocations is fallible. Slots are issued in arrival order and never returned;
/// the pool lives as long as the job.
///
/// Exhaustion is not fatal: `allocate_next` reports it and callers simply
/// stop tracking new resources.
use crate::record::{CounterSchema, StatsRecord};
use std::collections::TryReserveError;
use std::mem;
use thiserror::Error;

/// Index of an issued pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The pool has issued every slot it owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("record pool exhausted after {capacity} records")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// Storage for the pool could not be reserved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot allocate {capacity} record slots ({bytes} bytes)")]
pub struct AllocationError {
    pub capacity: usize,
    pub bytes: usize,
}

/// One arena slot: the persisted record plus its unpersisted bookkeeping
pub struct PoolSlot<S: CounterSchema> {
    pub record: StatsRecord<S>,
    pub runtime: S::Runtime,
}

impl<S: CounterSchema> PoolSlot<S> {
    fn try_zeroed() -> Result<Self, TryReserveError> {
        Ok(PoolSlot {
            record: StatsRecord::try_zeroed()?,
            runtime: S::Runtime::default(),
        })
    }
}

/// Pre-sized arena of records for one module
pub struct RecordPool<S: CounterSchema> {
    slots: Vec<PoolSlot<S>>,
    issued: usize,
    budget_bytes: usize,
    exhausted_requests: u64,
}

impl<S: CounterSchema> RecordPool<S> {
    /// Size the pool from a memory budget and allocate every slot
    ///
    /// A budget smaller than one record yields a usable pool that never
    /// satisfies a request.
    pub fn initialize(budget_bytes: usize) -> Result<Self, AllocationError> {
        let capacity = budget_bytes / Self::slot_footprint();
        let failed = |_| AllocationError {
            capacity,
            bytes: capacity.saturating_mul(Self::slot_footprint()),
        };

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(failed)?;
        for _ in 0..capacity {
            slots.push(PoolSlot::try_zeroed().map_err(failed)?);
        }

        Ok(RecordPool {
            slots,
            issued: 0,
            budget_bytes,
            exhausted_requests: 0,
        })
    }

    /// Bytes one slot costs against the budget
    pub fn slot_footprint() -> usize {
        mem::size_of::<PoolSlot<S>>() + StatsRecord::<S>::counter_bytes()
    }

    /// Issue the next unused slot
    pub fn allocate_next(&mut self) -> Result<SlotId, PoolExhausted> {
        if self.issued == self.slots.len() {
            self.exhausted_requests += 1;
            return Err(PoolExhausted {
                capacity: self.slots.len(),
            });
        }

        let slot = SlotId(self.issued);
        self.issued += 1;
        Ok(slot)
    }

    /// Issued slot, if `slot` was handed out by this pool
    pub fn get(&self, slot: SlotId) -> Option<&PoolSlot<S>> {
        self.issued_slots().get(slot.0)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut PoolSlot<S>> {
        let issued = self.issued;
        self.slots[..issued].get_mut(slot.0)
    }

    /// Issued slots in allocation order
    pub fn issued_slots(&self) -> &[PoolSlot<S>] {
        &self.slots[..self.issued]
    }

    /// Issued records in allocation order
    pub fn records(&self) -> impl Iterator<Item = &StatsRecord<S>> + '_ {
        self.issued_slots().iter().map(|slot| &slot.record)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots issued so far
    pub fn len(&self) -> usize {
        self.issued
    }

    pub fn is_empty(&self) -> bool {
        self.issued == 0
    }

    pub fn is_exhausted(&self) -> bool {
        self.issued == self.slots.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.slots.len(),
            issued: self.issued,
            budget_bytes: self.budget_bytes,
            slot_bytes: Self::slot_footprint(),
            exhausted_requests: self.exhausted_requests,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots owned by the pool
    pub capacity: usize,
    /// Slots handed out
    pub issued: usize,
    /// Budget the pool was sized from
    pub budget_bytes: usize,
    /// Budget bytes charged per slot
    pub slot_bytes: usize,
    /// Requests refused because the pool was full
    pub exhausted_requests: u64,
}

impl PoolStats {
    /// Calculate pool utilization (percentage of capacity issued)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.issued as f64 / self.capacity as f64) * 100.0
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.issued
    }
}
