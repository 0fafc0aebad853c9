//! Fixed-layout statistics records
//!
//! A record is the identity of one resource (record id, owning rank) plus
//! two ordered counter arrays: integer counters (counts, extrema, byte
//! totals) and floating counters (timestamps, cumulative durations).
//! The layout of each array is defined once per instrumentation module
//! through a [`CounterSchema`], whose slot enums are generated by
//! [`define_counters!`](crate::define_counters).
//!
//! Identity is stamped once when the pool slot is issued; afterwards only
//! counter slots change, through the update primitives on [`StatsRecord`].

use crate::identity::RecordId;
use crate::runtime::ModuleId;
use std::collections::TryReserveError;
use std::fmt;
use std::marker::PhantomData;

/// Bytes taken by the identity fields (record id + rank)
pub const IDENTITY_BYTES: usize = 16;

/// Encoded size of a record with the given number of counters
pub const fn record_size(counters: usize, fcounters: usize) -> usize {
    IDENTITY_BYTES + 8 * counters + 8 * fcounters
}

/// Typed index into one of a record's counter arrays
pub trait CounterIndex: Copy + fmt::Debug {
    fn index(self) -> usize;
    fn name(self) -> &'static str;
}

/// Record layout of one instrumentation module
pub trait CounterSchema: Send + 'static {
    /// Module that owns records of this layout
    const MODULE: ModuleId;
    /// Integer counter names in slot order
    const COUNTER_NAMES: &'static [&'static str];
    /// Floating counter names in slot order
    const FCOUNTER_NAMES: &'static [&'static str];

    type Counter: CounterIndex;
    type FCounter: CounterIndex;
    /// Per-record bookkeeping that is never persisted (offsets, watermarks)
    type Runtime: Default + Send;

    /// Encoded size of one record
    fn record_size() -> usize {
        record_size(Self::COUNTER_NAMES.len(), Self::FCOUNTER_NAMES.len())
    }
}

/// Define a counter slot enum together with its name table
///
/// # Usage
///
/// ```
/// rastro::define_counters! {
///     /// Counters of a toy module
///     pub enum ToyCounter {
///         Opens = "TOY_OPENS",
///         BytesRead = "TOY_BYTES_READ",
///     }
/// }
///
/// use rastro::record::CounterIndex;
/// assert_eq!(ToyCounter::BytesRead.index(), 1);
/// assert_eq!(ToyCounter::NAMES, &["TOY_OPENS", "TOY_BYTES_READ"]);
/// ```
#[macro_export]
macro_rules! define_counters {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Counter names in slot order
            pub const NAMES: &'static [&'static str] = &[$($label),+];
            /// Every slot in order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl $crate::record::CounterIndex for $name {
            fn index(self) -> usize {
                self as usize
            }

            fn name(self) -> &'static str {
                Self::NAMES[self as usize]
            }
        }
    };
}

/// Statistics record for one resource
pub struct StatsRecord<S: CounterSchema> {
    id: RecordId,
    rank: i64,
    counters: Box<[i64]>,
    fcounters: Box<[f64]>,
    _schema: PhantomData<fn() -> S>,
}

impl<S: CounterSchema> StatsRecord<S> {
    /// All-zero record, as found in a fresh pool slot
    pub fn zeroed() -> Self {
        Self {
            id: RecordId::default(),
            rank: 0,
            counters: vec![0; S::COUNTER_NAMES.len()].into_boxed_slice(),
            fcounters: vec![0.0; S::FCOUNTER_NAMES.len()].into_boxed_slice(),
            _schema: PhantomData,
        }
    }

    /// Like [`zeroed`](Self::zeroed), but reports allocation failure
    pub fn try_zeroed() -> Result<Self, TryReserveError> {
        Ok(Self {
            id: RecordId::default(),
            rank: 0,
            counters: try_zeroed_slice(S::COUNTER_NAMES.len(), 0)?,
            fcounters: try_zeroed_slice(S::FCOUNTER_NAMES.len(), 0.0)?,
            _schema: PhantomData,
        })
    }

    /// Heap bytes owned by one record's counter arrays
    pub fn counter_bytes() -> usize {
        std::mem::size_of::<i64>() * S::COUNTER_NAMES.len()
            + std::mem::size_of::<f64>() * S::FCOUNTER_NAMES.len()
    }

    /// Zeroed counters with the given identity
    pub fn new(id: RecordId, rank: i64) -> Self {
        let mut record = Self::zeroed();
        record.stamp_identity(id, rank);
        record
    }

    /// Rebuild a record from decoded parts; lengths must match the schema
    pub(crate) fn from_parts(
        id: RecordId,
        rank: i64,
        counters: Vec<i64>,
        fcounters: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(counters.len(), S::COUNTER_NAMES.len());
        debug_assert_eq!(fcounters.len(), S::FCOUNTER_NAMES.len());
        Self {
            id,
            rank,
            counters: counters.into_boxed_slice(),
            fcounters: fcounters.into_boxed_slice(),
            _schema: PhantomData,
        }
    }

    pub(crate) fn stamp_identity(&mut self, id: RecordId, rank: i64) {
        self.id = id;
        self.rank = rank;
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn counters(&self) -> &[i64] {
        &self.counters
    }

    pub fn fcounters(&self) -> &[f64] {
        &self.fcounters
    }

    pub fn get(&self, counter: S::Counter) -> i64 {
        self.counters[counter.index()]
    }

    pub fn fget(&self, counter: S::FCounter) -> f64 {
        self.fcounters[counter.index()]
    }

    /// Overwrite an integer slot (categorical values such as a file mode)
    pub fn set(&mut self, counter: S::Counter, value: i64) {
        self.counters[counter.index()] = value;
    }

    /// Add to an integer slot; overflow wraps
    pub fn increment(&mut self, counter: S::Counter, amount: i64) {
        let slot = &mut self.counters[counter.index()];
        *slot = slot.wrapping_add(amount);
    }

    /// Raise an integer slot to `value` if larger
    pub fn set_max(&mut self, counter: S::Counter, value: i64) {
        let slot = &mut self.counters[counter.index()];
        if *slot < value {
            *slot = value;
        }
    }

    pub fn fincrement(&mut self, counter: S::FCounter, amount: f64) {
        self.fcounters[counter.index()] += amount;
    }

    /// Raise a floating slot to `value` if larger
    pub fn fset_max(&mut self, counter: S::FCounter, value: f64) {
        let slot = &mut self.fcounters[counter.index()];
        if *slot < value {
            *slot = value;
        }
    }

    /// Record a "first seen" timestamp: set when unset, otherwise only lowered
    pub fn set_first(&mut self, counter: S::FCounter, timestamp: f64) {
        let slot = &mut self.fcounters[counter.index()];
        if *slot == 0.0 || timestamp < *slot {
            *slot = timestamp;
        }
    }

    /// Record a "last seen" timestamp: only raised
    pub fn set_last(&mut self, counter: S::FCounter, timestamp: f64) {
        self.fset_max(counter, timestamp);
    }

    /// Add the part of `[start, end]` not already covered by `watermark`
    ///
    /// The watermark is the end of the latest interval accounted so far; it
    /// advances to `max(watermark, end)`. Overlapping or nested intervals
    /// therefore contribute only their uncovered tail.
    ///
    /// # Example
    /// ```
    /// use rastro::modules::posix::{PosixFCounter, PosixSchema};
    /// use rastro::record::StatsRecord;
    ///
    /// let mut record = StatsRecord::<PosixSchema>::zeroed();
    /// let mut watermark = 0.0;
    /// record.accumulate_non_overlapping(PosixFCounter::WriteTime, 0.0, 10.0, &mut watermark);
    /// record.accumulate_non_overlapping(PosixFCounter::WriteTime, 5.0, 15.0, &mut watermark);
    /// assert_eq!(record.fget(PosixFCounter::WriteTime), 15.0);
    /// assert_eq!(watermark, 15.0);
    /// ```
    pub fn accumulate_non_overlapping(
        &mut self,
        counter: S::FCounter,
        start: f64,
        end: f64,
        watermark: &mut f64,
    ) {
        let from = start.max(*watermark);
        if end > from {
            self.fcounters[counter.index()] += end - from;
        }
        if end > *watermark {
            *watermark = end;
        }
    }
}

fn try_zeroed_slice<T: Copy>(len: usize, zero: T) -> Result<Box<[T]>, TryReserveError> {
    let mut values = Vec::new();
    values.try_reserve_exact(len)?;
    values.resize(len, zero);
    Ok(values.into_boxed_slice())
}

impl<S: CounterSchema> Clone for StatsRecord<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rank: self.rank,
            counters: self.counters.clone(),
            fcounters: self.fcounters.clone(),
            _schema: PhantomData,
        }
    }
}

impl<S: CounterSchema> PartialEq for StatsRecord<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.rank == other.rank
            && self.counters == other.counters
            && self.fcounters == other.fcounters
    }
}

impl<S: CounterSchema> fmt::Debug for StatsRecord<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsRecord")
            .field("module", &S::MODULE)
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("counters", &self.counters)
            .field("fcounters", &self.fcounters)
            .finish()
    }
}
