//! POSIX file-level instrumentation
//!
//! Handles are file descriptors (stream opens share the same handle space
//! through their underlying descriptor). A record accumulates over every
//! open of the same file within the job; closing only drops the handle.

use super::{InitError, InstrumentedModule, ModuleContext, Timing};
use crate::define_counters;
use crate::pool::SlotId;
use crate::record::{CounterSchema, StatsRecord};
use crate::runtime::{Coordinator, ModuleId};
use crate::telemetry::{EventKind, IoEvent, Segment};
use crate::tracker::Handle;
use std::sync::Arc;
use tracing::debug;

define_counters! {
    /// Integer counters of a POSIX record
    pub enum PosixCounter {
        Opens = "POSIX_OPENS",
        Fopens = "POSIX_FOPENS",
        Reads = "POSIX_READS",
        Writes = "POSIX_WRITES",
        Seeks = "POSIX_SEEKS",
        Fseeks = "POSIX_FSEEKS",
        Stats = "POSIX_STATS",
        Mmaps = "POSIX_MMAPS",
        Fsyncs = "POSIX_FSYNCS",
        Fdsyncs = "POSIX_FDSYNCS",
        Mode = "POSIX_MODE",
        BytesRead = "POSIX_BYTES_READ",
        BytesWritten = "POSIX_BYTES_WRITTEN",
        MaxByteRead = "POSIX_MAX_BYTE_READ",
        MaxByteWritten = "POSIX_MAX_BYTE_WRITTEN",
        ConsecReads = "POSIX_CONSEC_READS",
        ConsecWrites = "POSIX_CONSEC_WRITES",
        SeqReads = "POSIX_SEQ_READS",
        SeqWrites = "POSIX_SEQ_WRITES",
        RwSwitches = "POSIX_RW_SWITCHES",
        MaxReadTimeSize = "POSIX_MAX_READ_TIME_SIZE",
        MaxWriteTimeSize = "POSIX_MAX_WRITE_TIME_SIZE",
        // Persisted but never updated here
        SizeRead0To100 = "POSIX_SIZE_READ_0_100",
        SizeRead100To1K = "POSIX_SIZE_READ_100_1K",
        SizeRead1KTo10K = "POSIX_SIZE_READ_1K_10K",
        SizeRead10KTo100K = "POSIX_SIZE_READ_10K_100K",
        SizeRead100KTo1M = "POSIX_SIZE_READ_100K_1M",
        SizeRead1MTo4M = "POSIX_SIZE_READ_1M_4M",
        SizeRead4MTo10M = "POSIX_SIZE_READ_4M_10M",
        SizeRead10MTo100M = "POSIX_SIZE_READ_10M_100M",
        SizeRead100MTo1G = "POSIX_SIZE_READ_100M_1G",
        SizeRead1GPlus = "POSIX_SIZE_READ_1G_PLUS",
        SizeWrite0To100 = "POSIX_SIZE_WRITE_0_100",
        SizeWrite100To1K = "POSIX_SIZE_WRITE_100_1K",
        SizeWrite1KTo10K = "POSIX_SIZE_WRITE_1K_10K",
        SizeWrite10KTo100K = "POSIX_SIZE_WRITE_10K_100K",
        SizeWrite100KTo1M = "POSIX_SIZE_WRITE_100K_1M",
        SizeWrite1MTo4M = "POSIX_SIZE_WRITE_1M_4M",
        SizeWrite4MTo10M = "POSIX_SIZE_WRITE_4M_10M",
        SizeWrite10MTo100M = "POSIX_SIZE_WRITE_10M_100M",
        SizeWrite100MTo1G = "POSIX_SIZE_WRITE_100M_1G",
        SizeWrite1GPlus = "POSIX_SIZE_WRITE_1G_PLUS",
        Stride1Stride = "POSIX_STRIDE1_STRIDE",
        Stride2Stride = "POSIX_STRIDE2_STRIDE",
        Stride3Stride = "POSIX_STRIDE3_STRIDE",
        Stride4Stride = "POSIX_STRIDE4_STRIDE",
        Stride1Count = "POSIX_STRIDE1_COUNT",
        Stride2Count = "POSIX_STRIDE2_COUNT",
        Stride3Count = "POSIX_STRIDE3_COUNT",
        Stride4Count = "POSIX_STRIDE4_COUNT",
        Access1Access = "POSIX_ACCESS1_ACCESS",
        Access2Access = "POSIX_ACCESS2_ACCESS",
        Access3Access = "POSIX_ACCESS3_ACCESS",
        Access4Access = "POSIX_ACCESS4_ACCESS",
        Access1Count = "POSIX_ACCESS1_COUNT",
        Access2Count = "POSIX_ACCESS2_COUNT",
        Access3Count = "POSIX_ACCESS3_COUNT",
        Access4Count = "POSIX_ACCESS4_COUNT",
    }
}

define_counters! {
    /// Floating counters of a POSIX record
    pub enum PosixFCounter {
        OpenTimestamp = "POSIX_F_OPEN_TIMESTAMP",
        ReadStartTimestamp = "POSIX_F_READ_START_TIMESTAMP",
        WriteStartTimestamp = "POSIX_F_WRITE_START_TIMESTAMP",
        CloseTimestamp = "POSIX_F_CLOSE_TIMESTAMP",
        ReadEndTimestamp = "POSIX_F_READ_END_TIMESTAMP",
        WriteEndTimestamp = "POSIX_F_WRITE_END_TIMESTAMP",
        ReadTime = "POSIX_F_READ_TIME",
        WriteTime = "POSIX_F_WRITE_TIME",
        MetaTime = "POSIX_F_META_TIME",
        MaxReadTime = "POSIX_F_MAX_READ_TIME",
        MaxWriteTime = "POSIX_F_MAX_WRITE_TIME",
    }
}

/// Direction of a data operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Per-file bookkeeping kept next to the record, never persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosixFileRuntime {
    /// Implicit file offset used by read/write without an explicit offset
    pub offset: i64,
    pub last_byte_read: Option<i64>,
    pub last_byte_written: Option<i64>,
    pub last_io: Option<Direction>,
    pub last_read_end: f64,
    pub last_write_end: f64,
    pub last_meta_end: f64,
}

/// Record layout of the POSIX module
pub struct PosixSchema;

impl CounterSchema for PosixSchema {
    const MODULE: ModuleId = ModuleId::Posix;
    const COUNTER_NAMES: &'static [&'static str] = PosixCounter::NAMES;
    const FCOUNTER_NAMES: &'static [&'static str] = PosixFCounter::NAMES;

    type Counter = PosixCounter;
    type FCounter = PosixFCounter;
    type Runtime = PosixFileRuntime;
}

struct DirectionSlots {
    op: &'static str,
    count: PosixCounter,
    bytes: PosixCounter,
    max_byte: PosixCounter,
    consec: PosixCounter,
    seq: PosixCounter,
    max_time_size: PosixCounter,
    start: PosixFCounter,
    end: PosixFCounter,
    time: PosixFCounter,
    max_time: PosixFCounter,
}

const READ_SLOTS: DirectionSlots = DirectionSlots {
    op: "read",
    count: PosixCounter::Reads,
    bytes: PosixCounter::BytesRead,
    max_byte: PosixCounter::MaxByteRead,
    consec: PosixCounter::ConsecReads,
    seq: PosixCounter::SeqReads,
    max_time_size: PosixCounter::MaxReadTimeSize,
    start: PosixFCounter::ReadStartTimestamp,
    end: PosixFCounter::ReadEndTimestamp,
    time: PosixFCounter::ReadTime,
    max_time: PosixFCounter::MaxReadTime,
};

const WRITE_SLOTS: DirectionSlots = DirectionSlots {
    op: "write",
    count: PosixCounter::Writes,
    bytes: PosixCounter::BytesWritten,
    max_byte: PosixCounter::MaxByteWritten,
    consec: PosixCounter::ConsecWrites,
    seq: PosixCounter::SeqWrites,
    max_time_size: PosixCounter::MaxWriteTimeSize,
    start: PosixFCounter::WriteStartTimestamp,
    end: PosixFCounter::WriteEndTimestamp,
    time: PosixFCounter::WriteTime,
    max_time: PosixFCounter::MaxWriteTime,
};

impl Direction {
    fn slots(self) -> &'static DirectionSlots {
        match self {
            Direction::Read => &READ_SLOTS,
            Direction::Write => &WRITE_SLOTS,
        }
    }

    fn last_byte(self, runtime: &mut PosixFileRuntime) -> &mut Option<i64> {
        match self {
            Direction::Read => &mut runtime.last_byte_read,
            Direction::Write => &mut runtime.last_byte_written,
        }
    }

    fn watermark(self) -> fn(&mut PosixFileRuntime) -> &mut f64 {
        match self {
            Direction::Read => read_watermark,
            Direction::Write => write_watermark,
        }
    }
}

fn read_watermark(runtime: &mut PosixFileRuntime) -> &mut f64 {
    &mut runtime.last_read_end
}

fn meta_watermark(runtime: &mut PosixFileRuntime) -> &mut f64 {
    &mut runtime.last_meta_end
}

fn write_watermark(runtime: &mut PosixFileRuntime) -> &mut f64 {
    &mut runtime.last_write_end
}

/// The POSIX instrumentation module
#[derive(Clone)]
pub struct PosixModule {
    core: Arc<InstrumentedModule<PosixSchema>>,
}

impl PosixModule {
    pub fn new(coordinator: &Arc<Coordinator>) -> Self {
        Self {
            core: InstrumentedModule::new(coordinator),
        }
    }

    pub fn core(&self) -> &Arc<InstrumentedModule<PosixSchema>> {
        &self.core
    }

    pub fn initialize(&self) -> Result<(), InitError> {
        self.core.initialize()
    }

    /// open/creat (`stream == false`) or fopen (`stream == true`)
    pub fn record_open(&self, path: &str, mode: i64, result: Handle, stream: bool, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.bind_handle(path, result)?;
            let opens = ctx.tracker.update(slot, |record, runtime| {
                runtime.offset = 0;
                runtime.last_byte_read = None;
                runtime.last_byte_written = None;

                if mode != 0 {
                    record.set(PosixCounter::Mode, mode);
                }
                let counter = if stream {
                    PosixCounter::Fopens
                } else {
                    PosixCounter::Opens
                };
                record.increment(counter, 1);
                record.set_first(PosixFCounter::OpenTimestamp, timing.start);
                record.accumulate_non_overlapping(
                    PosixFCounter::MetaTime,
                    timing.start,
                    timing.end,
                    &mut runtime.last_meta_end,
                );
                record.get(PosixCounter::Opens) + record.get(PosixCounter::Fopens)
            })?;
            meta_event(ctx, slot, "open", opens, timing)
        });
    }

    pub fn record_read(&self, fd: Handle, offset: Option<i64>, result: i64, timing: Timing) {
        self.record_io(Direction::Read, fd, offset, result, timing);
    }

    pub fn record_write(&self, fd: Handle, offset: Option<i64>, result: i64, timing: Timing) {
        self.record_io(Direction::Write, fd, offset, result, timing);
    }

    /// Data operation; `offset` is `Some` for positioned calls (pread/pwrite)
    fn record_io(
        &self,
        direction: Direction,
        fd: Handle,
        offset: Option<i64>,
        result: i64,
        timing: Timing,
    ) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            let slots = direction.slots();

            let outcome = ctx
                .tracker
                .update(slot, |record, runtime| {
                    let this_offset = offset.unwrap_or(runtime.offset);
                    // Extent of this access; untrackable when it leaves the i64 range
                    let Some((end, last)) = this_offset
                        .checked_add(result)
                        .and_then(|end| Some((end, end.checked_sub(1)?)))
                    else {
                        debug!(
                            fd,
                            offset = this_offset,
                            len = result,
                            "{} extent overflows, update skipped",
                            slots.op
                        );
                        return None;
                    };
                    if offset.is_none() {
                        runtime.offset = end;
                    }

                    record.increment(slots.count, 1);
                    record.increment(slots.bytes, result);
                    if result > 0 {
                        record.set_max(slots.max_byte, last);
                    }

                    let last_byte = direction.last_byte(runtime);
                    if let Some(previous) = *last_byte {
                        if previous.checked_add(1) == Some(this_offset) {
                            record.increment(slots.consec, 1);
                        }
                        if this_offset > previous {
                            record.increment(slots.seq, 1);
                        }
                    }
                    *last_byte = Some(last);

                    if matches!(runtime.last_io, Some(prev) if prev != direction) {
                        record.increment(PosixCounter::RwSwitches, 1);
                    }
                    runtime.last_io = Some(direction);

                    record.set_first(slots.start, timing.start);
                    record.set_last(slots.end, timing.end);
                    record.accumulate_non_overlapping(
                        slots.time,
                        timing.start,
                        timing.end,
                        (direction.watermark())(runtime),
                    );
                    if timing.duration() > record.fget(slots.max_time) {
                        record.fset_max(slots.max_time, timing.duration());
                        record.set(slots.max_time_size, result);
                    }

                    Some(DataOutcome {
                        offset: this_offset,
                        count: record.get(slots.count),
                        max_byte: record.get(slots.max_byte),
                        switches: record.get(PosixCounter::RwSwitches),
                        total: record.fget(slots.time),
                    })
                })
                .flatten()?;

            data_event(ctx, slot, slots.op, outcome, result, timing)
        });
    }

    /// lseek (`stream == false`) or fseek; `result` is the new offset
    pub fn record_seek(&self, fd: Handle, result: i64, stream: bool, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            let counter = if stream {
                PosixCounter::Fseeks
            } else {
                PosixCounter::Seeks
            };
            let count = ctx.tracker.update(slot, |record, runtime| {
                runtime.offset = result;
                record.increment(counter, 1);
                record.accumulate_non_overlapping(
                    PosixFCounter::MetaTime,
                    timing.start,
                    timing.end,
                    &mut runtime.last_meta_end,
                );
                record.get(counter)
            })?;
            meta_event(ctx, slot, "seek", count, timing)
        });
    }

    /// stat/lstat by path
    pub fn record_stat(&self, path: &str, result: i64, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.resolve_by_name(path)?;
            Self::stat_update(ctx, slot, timing)
        });
    }

    /// fstat by descriptor
    pub fn record_fstat(&self, fd: Handle, result: i64, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            Self::stat_update(ctx, slot, timing)
        });
    }

    fn stat_update(
        ctx: &mut ModuleContext<PosixSchema>,
        slot: SlotId,
        timing: Timing,
    ) -> Option<IoEvent> {
        ctx.tracker.increment(slot, PosixCounter::Stats, 1);
        ctx.tracker.accumulate_non_overlapping(
            slot,
            PosixFCounter::MetaTime,
            timing.start,
            timing.end,
            meta_watermark,
        );
        let count = ctx.tracker.record(slot)?.get(PosixCounter::Stats);
        meta_event(ctx, slot, "stat", count, timing)
    }

    /// fsync (`data_only == false`) or fdatasync
    pub fn record_fsync(&self, fd: Handle, result: i64, data_only: bool, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            let counter = if data_only {
                PosixCounter::Fdsyncs
            } else {
                PosixCounter::Fsyncs
            };
            ctx.tracker.increment(slot, counter, 1);
            ctx.tracker.accumulate_non_overlapping(
                slot,
                PosixFCounter::WriteTime,
                timing.start,
                timing.end,
                write_watermark,
            );
            let mut event = meta_event(ctx, slot, "fsync", 0, timing)?;
            let record = ctx.tracker.record(slot)?;
            event.flushes = record.get(PosixCounter::Fsyncs) + record.get(PosixCounter::Fdsyncs);
            Some(event)
        });
    }

    /// mmap of a tracked descriptor
    pub fn record_mmap(&self, fd: Handle, result: i64, timing: Timing) {
        if result < 0 {
            return;
        }
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            ctx.tracker.increment(slot, PosixCounter::Mmaps, 1);
            let count = ctx.tracker.record(slot)?.get(PosixCounter::Mmaps);
            meta_event(ctx, slot, "mmap", count, timing)
        });
    }

    /// close/fclose; the record survives, only the handle is dropped
    pub fn record_close(&self, fd: Handle, timing: Timing) {
        self.core.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(fd)?;
            let opens = ctx.tracker.update(slot, |record, runtime| {
                record.set_last(PosixFCounter::CloseTimestamp, timing.end);
                record.accumulate_non_overlapping(
                    PosixFCounter::MetaTime,
                    timing.start,
                    timing.end,
                    &mut runtime.last_meta_end,
                );
                record.get(PosixCounter::Opens) + record.get(PosixCounter::Fopens)
            })?;
            ctx.tracker.unbind_handle(fd);
            meta_event(ctx, slot, "close", opens, timing)
        });
    }

    /// Copy of the record tracked for `path`
    pub fn snapshot(&self, path: &str) -> Option<StatsRecord<PosixSchema>> {
        self.core.snapshot(path)
    }

    pub fn records(&self) -> Vec<StatsRecord<PosixSchema>> {
        self.core.records()
    }

    /// Whether `fd` currently maps to a record
    pub fn is_tracked(&self, fd: Handle) -> bool {
        self.core
            .inspect(|tracker| tracker.lookup_by_handle(fd).is_some())
            .unwrap_or(false)
    }
}

struct DataOutcome {
    offset: i64,
    count: i64,
    max_byte: i64,
    switches: i64,
    total: f64,
}

fn base_event(
    ctx: &ModuleContext<PosixSchema>,
    slot: SlotId,
    kind: EventKind,
    op: &str,
) -> Option<IoEvent> {
    if !ctx.telemetry_enabled() {
        return None;
    }
    let id = ctx.tracker.record(slot)?.id();
    let file = ctx.tracker.name_of(id).unwrap_or_else(|| "N/A".to_string());
    Some(IoEvent::new(&ctx.origin, ModuleId::Posix, kind, op, id, file))
}

fn meta_event(
    ctx: &ModuleContext<PosixSchema>,
    slot: SlotId,
    op: &str,
    count: i64,
    timing: Timing,
) -> Option<IoEvent> {
    let mut event = base_event(ctx, slot, EventKind::Meta, op)?;
    let total = ctx.tracker.record(slot)?.fget(PosixFCounter::MetaTime);
    event.cnt = count;
    event.seg.push(Segment {
        off: -1,
        len: -1,
        start: timing.start,
        dur: timing.duration(),
        total,
        timestamp: ctx.origin.epoch + timing.end,
    });
    Some(event)
}

fn data_event(
    ctx: &ModuleContext<PosixSchema>,
    slot: SlotId,
    op: &str,
    outcome: DataOutcome,
    len: i64,
    timing: Timing,
) -> Option<IoEvent> {
    let mut event = base_event(ctx, slot, EventKind::Data, op)?;
    event.cnt = outcome.count;
    event.max_byte = outcome.max_byte;
    event.switches = outcome.switches;
    event.seg.push(Segment {
        off: outcome.offset,
        len,
        start: timing.start,
        dur: timing.duration(),
        total: outcome.total,
        timestamp: ctx.origin.epoch + timing.end,
    });
    Some(event)
}
