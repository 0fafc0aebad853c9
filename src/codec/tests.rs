// Codec tests: record blocks, byte-order normalization, log container
// framing and rejection of malformed input.

use super::*;
use crate::modules::hdf5::{Hdf5Counter, Hdf5FCounter, Hdf5Schema};
use crate::modules::posix::{PosixCounter, PosixFCounter, PosixSchema};
use byteorder::ByteOrder;

fn posix_record() -> StatsRecord<PosixSchema> {
    let mut record = StatsRecord::<PosixSchema>::new(RecordId(0x0123_4567_89ab_cdef), 2);
    record.increment(PosixCounter::Opens, 1);
    record.increment(PosixCounter::Writes, 1);
    record.increment(PosixCounter::BytesWritten, 4096);
    record.set_max(PosixCounter::MaxByteWritten, 4095);
    record.set(PosixCounter::Mode, 0o644);
    record.set_first(PosixFCounter::OpenTimestamp, 0.25);
    record.fincrement(PosixFCounter::WriteTime, 0.125);
    record
}

fn hdf5_record(id: u64) -> StatsRecord<Hdf5Schema> {
    let mut record = StatsRecord::<Hdf5Schema>::new(RecordId(id), 2);
    record.increment(Hdf5Counter::Opens, 3);
    record.set_last(Hdf5FCounter::CloseTimestamp, 9.5);
    record
}

fn sample_log() -> JobLog {
    let posix = posix_record();
    JobLog {
        header: LogHeader {
            rank: 2,
            job_id: 4242,
            start_time: 1_700_000_000.5,
            end_time: 1_700_000_060.25,
        },
        names: vec![
            (RecordId(7), "/scratch/run.h5".to_string()),
            (posix.id(), "/scratch/out.dat".to_string()),
        ],
        blocks: vec![
            ModuleBlock::from_records([&posix]),
            ModuleBlock::from_records([&hdf5_record(7), &hdf5_record(8)]),
        ],
    }
}

#[test]
fn test_record_round_trip() {
    let record = posix_record();
    let bytes = encode(&record);
    assert_eq!(bytes.len(), PosixSchema::record_size());
    assert_eq!(decode::<PosixSchema>(&bytes, false).unwrap(), record);
}

#[test]
fn test_field_layout() {
    let record = posix_record();
    let bytes = encode(&record);

    assert_eq!(NativeEndian::read_u64(&bytes[0..8]), record.id().0);
    assert_eq!(NativeEndian::read_i64(&bytes[8..16]), 2);

    let bytes_written = 16 + 8 * PosixCounter::BytesWritten as usize;
    assert_eq!(
        NativeEndian::read_i64(&bytes[bytes_written..bytes_written + 8]),
        4096
    );

    let fbase = 16 + 8 * PosixCounter::NAMES.len();
    assert_eq!(NativeEndian::read_f64(&bytes[fbase..fbase + 8]), 0.25);
}

#[test]
fn test_swapped_record_decodes_to_same_values() {
    let record = posix_record();
    let foreign = encode_with_order::<SwappedEndian, _>(&record);
    assert_ne!(foreign, encode(&record));
    assert_eq!(decode::<PosixSchema>(&foreign, true).unwrap(), record);
}

#[test]
fn test_short_block_rejected() {
    let bytes = encode(&posix_record());
    let err = decode::<PosixSchema>(&bytes[..bytes.len() - 1], false).unwrap_err();
    assert!(matches!(
        err,
        CodecError::Truncated { expected, actual }
            if expected == PosixSchema::record_size() && actual == expected - 1
    ));
}

#[test]
fn test_long_block_rejected() {
    let mut bytes = encode(&hdf5_record(1));
    bytes.extend_from_slice(&[0u8; 3]);
    let err = decode::<Hdf5Schema>(&bytes, false).unwrap_err();
    assert!(matches!(err, CodecError::TrailingBytes { extra: 3 }));
}

#[test]
fn test_wrong_module_rejected() {
    let bytes = encode(&hdf5_record(1));
    let record = decode_dyn(ModuleId::Hdf5, &bytes, false).unwrap();
    let err = record.into_typed::<PosixSchema>().unwrap_err();
    assert!(matches!(
        err,
        CodecError::ModuleMismatch {
            expected: ModuleId::Posix,
            found: ModuleId::Hdf5
        }
    ));
}

#[test]
fn test_dyn_record_lookup_by_name() {
    let record = DynRecord::from_record(&posix_record());
    assert_eq!(record.counter("POSIX_BYTES_WRITTEN"), Some(4096));
    assert_eq!(record.fcounter("POSIX_F_WRITE_TIME"), Some(0.125));
    assert_eq!(record.counter("HDF5_OPENS"), None);
}

#[test]
fn test_log_round_trip_native() {
    let log = sample_log();
    let bytes = log.to_bytes().unwrap();
    let decoded = JobLog::from_bytes(&bytes).unwrap();

    assert_eq!(decoded.header, log.header);
    assert_eq!(decoded.blocks, log.blocks);
    assert_eq!(decoded.record_count(), 3);
    // Names come back ordered by id
    assert_eq!(decoded.name_of(RecordId(7)), Some("/scratch/run.h5"));
    assert_eq!(
        decoded.name_of(posix_record().id()),
        Some("/scratch/out.dat")
    );
    assert_eq!(decoded.name_of(RecordId(8)), None);
}

#[test]
fn test_log_from_foreign_byte_order() {
    let log = sample_log();
    let mut foreign = Vec::new();
    log.write_with_order::<SwappedEndian, _>(&mut foreign).unwrap();
    assert_ne!(foreign, log.to_bytes().unwrap());

    let decoded = JobLog::from_bytes(&foreign).unwrap();
    assert_eq!(decoded.header, log.header);
    assert_eq!(decoded.blocks, log.blocks);

    let hdf5 = decoded.block(ModuleId::Hdf5).unwrap();
    let records = hdf5.records::<Hdf5Schema>().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].id(), RecordId(8));
    assert_eq!(records[1].get(Hdf5Counter::Opens), 3);
    assert_eq!(records[1].fget(Hdf5FCounter::CloseTimestamp), 9.5);
}

#[test]
fn test_bad_magic() {
    let mut bytes = sample_log().to_bytes().unwrap();
    bytes[0] ^= 0xff;
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::BadMagic(_))
    ));
}

#[test]
fn test_unsupported_version() {
    let mut bytes = sample_log().to_bytes().unwrap();
    NativeEndian::write_u32(&mut bytes[8..12], FORMAT_VERSION + 1);
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
    ));
}

#[test]
fn test_truncated_log_every_prefix() {
    let bytes = sample_log().to_bytes().unwrap();
    for len in 0..bytes.len() {
        assert!(
            JobLog::from_bytes(&bytes[..len]).is_err(),
            "prefix of {len} bytes decoded"
        );
    }
}

#[test]
fn test_trailing_bytes_in_log() {
    let mut bytes = sample_log().to_bytes().unwrap();
    bytes.push(0);
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::TrailingBytes { extra: 1 })
    ));
}

#[test]
fn test_unknown_module() {
    let log = JobLog {
        header: sample_log().header,
        names: Vec::new(),
        blocks: vec![ModuleBlock::empty(ModuleId::Posix)],
    };
    let mut bytes = log.to_bytes().unwrap();
    // magic + version + 4 header fields + name count + block count
    let module_offset = 8 + 4 + 32 + 8 + 4;
    NativeEndian::write_u32(&mut bytes[module_offset..module_offset + 4], 99);
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::UnknownModule(99))
    ));
}

#[test]
fn test_invalid_name() {
    let log = JobLog {
        header: sample_log().header,
        names: vec![(RecordId(1), "ab".to_string())],
        blocks: Vec::new(),
    };
    let mut bytes = log.to_bytes().unwrap();
    let name_offset = 8 + 4 + 32 + 8 + 8 + 4;
    bytes[name_offset] = 0xff;
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::InvalidName)
    ));
}

#[test]
fn test_huge_counts_rejected_without_allocating() {
    let log = JobLog {
        header: sample_log().header,
        names: Vec::new(),
        blocks: Vec::new(),
    };
    let mut bytes = log.to_bytes().unwrap();
    NativeEndian::write_u64(&mut bytes[44..52], u64::MAX);
    assert!(matches!(
        JobLog::from_bytes(&bytes),
        Err(CodecError::Truncated { .. })
    ));
}

#[test]
fn test_block_push_checks_module() {
    let mut block = ModuleBlock::empty(ModuleId::Posix);
    block.push(&posix_record()).unwrap();
    assert_eq!(block.record_count(), 1);
    assert!(matches!(
        block.push(&hdf5_record(1)),
        Err(CodecError::ModuleMismatch { .. })
    ));
    assert_eq!(block.record_count(), 1);
}

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.rastro");
    let log = sample_log();
    log.save(&path).unwrap();
    assert_eq!(JobLog::load(&path).unwrap(), log);
    assert!(JobLog::load(dir.path().join("missing")).is_err());
}

#[test]
fn test_typed_and_dyn_encoders_agree() {
    let record = posix_record();
    let dynamic = DynRecord::from_record(&record);
    assert_eq!(dynamic.encode_with_order::<NativeEndian>(), encode(&record));
    assert_eq!(
        dynamic.encode_with_order::<SwappedEndian>(),
        encode_with_order::<SwappedEndian, _>(&record)
    );

    let mut appended = Vec::new();
    encode_into(&record, &mut appended);
    assert_eq!(appended, encode(&record));
}

#[test]
fn test_truncation_inside_a_field() {
    let bytes = sample_log().to_bytes().unwrap();
    // Magic intact, version cut after two bytes
    assert!(matches!(
        JobLog::from_bytes(&bytes[..10]),
        Err(CodecError::Truncated {
            expected: 4,
            actual: 2
        })
    ));

    let mut foreign = Vec::new();
    sample_log()
        .write_with_order::<SwappedEndian, _>(&mut foreign)
        .unwrap();
    // Swapped header cut right after the rank
    assert!(matches!(
        JobLog::from_bytes(&foreign[..20]),
        Err(CodecError::Truncated {
            expected: 8,
            actual: 0
        })
    ));
}
