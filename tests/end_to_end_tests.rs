//! End-to-end tests: instrumented calls in, persisted job log out

use rastro::codec::JobLog;
use rastro::config::RuntimeConfig;
use rastro::dispatch::{replay, DispatchTable};
use rastro::modules::hdf5::{Hdf5Counter, Hdf5Module, Hdf5Schema};
use rastro::modules::posix::{PosixCounter, PosixFCounter, PosixModule, PosixSchema};
use rastro::modules::{ModulePhase, Timing};
use rastro::runtime::{Coordinator, ModuleId};
use rastro::telemetry::{CollectingSink, EventKind, EventSink};
use std::sync::Arc;

#[test]
fn test_open_write_close_scenario() {
    let coordinator = Coordinator::new(RuntimeConfig {
        rank: 5,
        job_id: 1234,
        ..RuntimeConfig::default()
    });
    let posix = PosixModule::new(&coordinator);

    let (t1, t2, t3) = (1.25, 2.5, 3.75);
    posix.record_open("/data/run1.dat", 0o644, 3, false, Timing::new(t1, t1 + 0.01));
    posix.record_write(3, None, 4096, Timing::new(t2 - 0.1, t2));
    posix.record_close(3, Timing::new(t3, t3 + 0.01));

    assert!(!posix.is_tracked(3));
    let record = posix.snapshot("/data/run1.dat").unwrap();
    assert_eq!(record.rank(), 5);
    assert_eq!(record.get(PosixCounter::Opens), 1);
    assert_eq!(record.get(PosixCounter::BytesWritten), 4096);
    assert_eq!(record.fget(PosixFCounter::OpenTimestamp), t1);
    assert_eq!(record.fget(PosixFCounter::WriteEndTimestamp), t2);

    let log = coordinator.shutdown();
    assert_eq!(log.header.rank, 5);
    assert_eq!(log.header.job_id, 1234);
    assert!(log.header.end_time >= log.header.start_time);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run1.rastro");
    log.save(&path).unwrap();

    let loaded = JobLog::load(&path).unwrap();
    let block = loaded.block(ModuleId::Posix).unwrap();
    let records = block.records::<PosixSchema>().unwrap();
    assert_eq!(records, vec![record.clone()]);
    assert_eq!(loaded.name_of(record.id()), Some("/data/run1.dat"));
}

#[test]
fn test_reopen_accumulates_into_one_record() {
    let coordinator = Coordinator::new(RuntimeConfig::default());
    let posix = PosixModule::new(&coordinator);

    posix.record_open("/data/a", 0, 3, false, Timing::new(1.0, 1.1));
    posix.record_read(3, None, 100, Timing::new(1.2, 1.3));
    posix.record_close(3, Timing::new(1.4, 1.5));

    posix.record_open("/data/./a", 0, 4, true, Timing::new(2.0, 2.1));
    posix.record_read(4, None, 50, Timing::new(2.2, 2.3));
    posix.record_close(4, Timing::new(2.4, 2.5));

    let records = posix.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.get(PosixCounter::Opens), 1);
    assert_eq!(record.get(PosixCounter::Fopens), 1);
    assert_eq!(record.get(PosixCounter::BytesRead), 150);
    // Offsets restart at each open
    assert_eq!(record.get(PosixCounter::MaxByteRead), 99);
    assert_eq!(record.fget(PosixFCounter::OpenTimestamp), 1.0);
    assert_eq!(record.fget(PosixFCounter::CloseTimestamp), 2.5);
}

#[test]
fn test_shutdown_collects_every_module() {
    let coordinator = Coordinator::new(RuntimeConfig::default());
    let posix = PosixModule::new(&coordinator);
    let hdf5 = Hdf5Module::new(&coordinator);
    let table = DispatchTable::standard(&posix, &hdf5);

    let stream = r#"
{"op":"open","path":"/data/mesh.bin","result":3,"start":1.0,"end":1.1}
{"op":"H5Fopen","path":"/data/fields.h5","result":72057594037927936,"start":1.5,"end":1.6}
{"op":"read","fd":3,"result":65536,"start":2.0,"end":2.4}
{"op":"open","path":"/etc/hosts","result":4,"start":2.5,"end":2.6}
{"op":"H5Fclose","file_id":72057594037927936,"start":3.0,"end":3.2}
{"op":"close","fd":3,"start":3.5,"end":3.6}
"#;
    let stats = replay(stream.as_bytes(), &table).unwrap();
    assert_eq!(stats.calls, 6);

    let log = coordinator.shutdown();
    assert_eq!(posix.core().phase(), ModulePhase::Finalized);
    assert_eq!(hdf5.core().phase(), ModulePhase::Finalized);
    assert_eq!(log.blocks.len(), 2);

    let posix_block = log.block(ModuleId::Posix).unwrap();
    // /etc/hosts is excluded
    assert_eq!(posix_block.record_count(), 1);

    let hdf5_records = log.block(ModuleId::Hdf5).unwrap().records::<Hdf5Schema>().unwrap();
    assert_eq!(hdf5_records[0].get(Hdf5Counter::Opens), 1);

    // Bytes survive a full save/load cycle
    let bytes = log.to_bytes().unwrap();
    assert_eq!(JobLog::from_bytes(&bytes).unwrap(), log);
}

#[test]
fn test_replay_survives_offsets_at_the_i64_limit() {
    let coordinator = Coordinator::new(RuntimeConfig::default());
    let posix = PosixModule::new(&coordinator);
    let hdf5 = Hdf5Module::new(&coordinator);
    let table = DispatchTable::standard(&posix, &hdf5);

    let stream = r#"
{"op":"open","path":"/data/a","result":3,"start":1.0,"end":1.1}
{"op":"lseek","fd":3,"result":9223372036854775807,"start":1.2,"end":1.3}
{"op":"read","fd":3,"result":1,"start":1.4,"end":1.5}
{"op":"write","fd":3,"offset":9223372036854775800,"result":4096,"start":1.6,"end":1.7}
{"op":"lseek","fd":3,"result":0,"start":1.8,"end":1.9}
{"op":"write","fd":3,"result":512,"start":2.0,"end":2.1}
{"op":"close","fd":3,"start":2.2,"end":2.3}
"#;
    let stats = replay(stream.as_bytes(), &table).unwrap();
    assert_eq!(stats.calls, 7);

    let record = posix.snapshot("/data/a").unwrap();
    assert_eq!(record.get(PosixCounter::Seeks), 2);
    assert_eq!(record.get(PosixCounter::Reads), 0);
    assert_eq!(record.get(PosixCounter::Writes), 1);
    assert_eq!(record.get(PosixCounter::MaxByteWritten), 511);

    let log = coordinator.shutdown();
    assert_eq!(log.block(ModuleId::Posix).unwrap().record_count(), 1);
}

#[test]
fn test_calls_after_shutdown_are_ignored() {
    let coordinator = Coordinator::new(RuntimeConfig::default());
    let posix = PosixModule::new(&coordinator);
    posix.record_open("/data/a", 0, 3, false, Timing::new(1.0, 1.1));

    let log = coordinator.shutdown();
    assert_eq!(log.record_count(), 1);

    posix.record_write(3, None, 10, Timing::new(2.0, 2.1));
    posix.record_open("/data/b", 0, 4, false, Timing::new(2.0, 2.1));
    let records = posix.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get(PosixCounter::Writes), 0);
}

#[test]
fn test_zero_budget_tracks_nothing() {
    let coordinator = Coordinator::new(RuntimeConfig {
        module_memory_bytes: 0,
        ..RuntimeConfig::default()
    });
    let posix = PosixModule::new(&coordinator);
    posix.record_open("/data/a", 0, 3, false, Timing::new(1.0, 1.1));
    posix.record_write(3, None, 10, Timing::new(2.0, 2.1));

    assert!(posix.records().is_empty());
    assert!(!posix.is_tracked(3));
    let log = coordinator.shutdown();
    assert_eq!(log.record_count(), 0);
}

#[test]
fn test_events_published_for_tracked_calls() {
    let sink = Arc::new(CollectingSink::new());
    let events: Arc<dyn EventSink> = sink.clone();
    let coordinator = Coordinator::with_sink(
        RuntimeConfig {
            job_id: 99,
            rank: 2,
            ..RuntimeConfig::default()
        },
        Some(events),
    );
    let posix = PosixModule::new(&coordinator);

    posix.record_open("/data/a", 0, 3, false, Timing::new(1.0, 1.1));
    posix.record_write(3, None, 4096, Timing::new(2.0, 2.5));
    posix.record_close(3, Timing::new(3.0, 3.1));
    // Untracked handle: no event
    posix.record_write(42, None, 1, Timing::new(4.0, 4.1));

    let events = sink.events();
    let ops: Vec<_> = events.iter().map(|e| e.op.as_str()).collect();
    assert_eq!(ops, ["open", "write", "close"]);

    let write = &events[1];
    assert_eq!(write.kind, EventKind::Data);
    assert_eq!(write.job_id, 99);
    assert_eq!(write.rank, 2);
    assert_eq!(write.file, "/data/a");
    assert_eq!(write.max_byte, 4095);
    assert_eq!(write.seg[0].len, 4096);
    assert_eq!(write.seg[0].off, 0);

    // Close reports the record's own open count
    let close = &events[2];
    assert_eq!(close.kind, EventKind::Meta);
    assert_eq!(close.cnt, 1);
}
