//! HDF5 file-level instrumentation
//!
//! Handles are HDF5 file identifiers (`hid_t`), a handle space separate
//! from POSIX descriptors.

use super::{InitError, InstrumentedModule, Timing};
use crate::define_counters;
use crate::record::{CounterSchema, StatsRecord};
use crate::runtime::{Coordinator, ModuleId};
use crate::telemetry::{EventKind, IoEvent, Segment};
use crate::tracker::Handle;
use std::sync::Arc;

define_counters! {
    pub enum Hdf5Counter {
        Opens = "HDF5_OPENS",
    }
}

define_counters! {
    pub enum Hdf5FCounter {
        OpenTimestamp = "HDF5_F_OPEN_TIMESTAMP",
        CloseTimestamp = "HDF5_F_CLOSE_TIMESTAMP",
        MetaTime = "HDF5_F_META_TIME",
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hdf5FileRuntime {
    pub last_meta_end: f64,
}

/// Record layout of the HDF5 module
pub struct Hdf5Schema;

impl CounterSchema for Hdf5Schema {
    const MODULE: ModuleId = ModuleId::Hdf5;
    const COUNTER_NAMES: &'static [&'static str] = Hdf5Counter::NAMES;
    const FCOUNTER_NAMES: &'static [&'static str] = Hdf5FCounter::NAMES;

    type Counter = Hdf5Counter;
    type FCounter = Hdf5FCounter;
    type Runtime = Hdf5FileRuntime;
}

fn meta_watermark(runtime: &mut Hdf5FileRuntime) -> &mut f64 {
    &mut runtime.last_meta_end
}

/// The HDF5 instrumentation module
#[derive(Clone)]
pub struct Hdf5Module {
    core: Arc<InstrumentedModule<Hdf5Schema>>,
}

impl Hdf5Module {
    pub fn new(coordinator: &Arc<Coordinator>) -> Self {
        Self {
            core: InstrumentedModule::new(coordinator),
        }
    }

    pub fn core(&self) -> &Arc<InstrumentedModule<Hdf5Schema>> {
        &self.core
    }

    pub fn initialize(&self) -> Result<(), InitError> {
        self.core.initialize()
    }

    /// H5Fcreate/H5Fopen; `result` is the file id, negative on failure
    pub fn record_file_open(&self, path: &str, result: Handle, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.bind_handle(path, result)?;
            ctx.tracker.increment(slot, Hdf5Counter::Opens, 1);
            ctx.tracker.update(slot, |record, _| {
                record.set_first(Hdf5FCounter::OpenTimestamp, timing.start)
            });
            ctx.tracker.accumulate_non_overlapping(
                slot,
                Hdf5FCounter::MetaTime,
                timing.start,
                timing.end,
                meta_watermark,
            );
            event(ctx, slot, "open", timing)
        });
    }

    /// H5Fclose
    pub fn record_file_close(&self, file_id: Handle, timing: Timing) {
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(file_id)?;
            ctx.tracker.update(slot, |record, _| {
                record.set_last(Hdf5FCounter::CloseTimestamp, timing.end)
            });
            ctx.tracker.accumulate_non_overlapping(
                slot,
                Hdf5FCounter::MetaTime,
                timing.start,
                timing.end,
                meta_watermark,
            );
            ctx.tracker.unbind_handle(file_id);
            event(ctx, slot, "close", timing)
        });
    }

    pub fn snapshot(&self, path: &str) -> Option<StatsRecord<Hdf5Schema>> {
        self.core.snapshot(path)
    }

    pub fn records(&self) -> Vec<StatsRecord<Hdf5Schema>> {
        self.core.records()
    }
}

fn event(
    ctx: &super::ModuleContext<Hdf5Schema>,
    slot: crate::pool::SlotId,
    op: &str,
    timing: Timing,
) -> Option<IoEvent> {
    if !ctx.telemetry_enabled() {
        return None;
    }
    let record = ctx.tracker.record(slot)?;
    let file = ctx
        .tracker
        .name_of(record.id())
        .unwrap_or_else(|| "N/A".to_string());

    let mut event = IoEvent::new(
        &ctx.origin,
        ModuleId::Hdf5,
        EventKind::Meta,
        op,
        record.id(),
        file,
    );
    event.cnt = record.get(Hdf5Counter::Opens);
    event.seg.push(Segment {
        off: -1,
        len: -1,
        start: timing.start,
        dur: timing.duration(),
        total: record.fget(Hdf5FCounter::MetaTime),
        timestamp: ctx.origin.epoch + timing.end,
    });
    Some(event)
}
