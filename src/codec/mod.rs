//! Record codec
//!
//! A record block is the record's identity followed by its counter arrays,
//! every field 8 bytes wide:
//!
//! ```text
//! id u64 | rank i64 | counters: N × i64 | fcounters: M × f64
//! ```
//!
//! Writers always use their native byte order. Readers get a `swap` flag
//! (derived from the log magic) and read every field in the opposite order
//! when it is set. A block of the wrong length is rejected outright, never
//! half-decoded.

pub mod log;
pub mod text;

use crate::identity::RecordId;
use crate::record::{CounterSchema, StatsRecord};
use crate::runtime::ModuleId;
use byteorder::{ByteOrder, NativeEndian, ReadBytesExt};
use std::io::{self, Cursor};
use thiserror::Error;

pub use log::{JobLog, LogHeader, ModuleBlock, FORMAT_VERSION, LOG_MAGIC};
pub use text::{record_lines, write_text};

/// Byte order opposite to the host's
#[cfg(target_endian = "little")]
pub type SwappedEndian = byteorder::BigEndian;
#[cfg(target_endian = "big")]
pub type SwappedEndian = byteorder::LittleEndian;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated data: need {expected} bytes, {actual} available")]
    Truncated { expected: usize, actual: usize },

    #[error("{extra} unexpected trailing bytes")]
    TrailingBytes { extra: usize },

    #[error("bad magic {0:#018x}, not a rastro log")]
    BadMagic(u64),

    #[error("unsupported log format version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown module id {0}")]
    UnknownModule(u32),

    #[error("record belongs to module {found}, expected {expected}")]
    ModuleMismatch { expected: ModuleId, found: ModuleId },

    #[error("record name is not valid UTF-8")]
    InvalidName,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Module-agnostic decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct DynRecord {
    pub module: ModuleId,
    pub id: RecordId,
    pub rank: i64,
    pub counters: Vec<i64>,
    pub fcounters: Vec<f64>,
}

impl DynRecord {
    pub fn from_record<S: CounterSchema>(record: &StatsRecord<S>) -> Self {
        DynRecord {
            module: S::MODULE,
            id: record.id(),
            rank: record.rank(),
            counters: record.counters().to_vec(),
            fcounters: record.fcounters().to_vec(),
        }
    }

    /// Typed record, if this record belongs to `S`'s module
    pub fn into_typed<S: CounterSchema>(self) -> Result<StatsRecord<S>, CodecError> {
        if self.module != S::MODULE {
            return Err(CodecError::ModuleMismatch {
                expected: S::MODULE,
                found: self.module,
            });
        }
        Ok(StatsRecord::from_parts(
            self.id,
            self.rank,
            self.counters,
            self.fcounters,
        ))
    }

    /// Integer counter by name
    pub fn counter(&self, name: &str) -> Option<i64> {
        let index = self.module.counter_names().iter().position(|n| *n == name)?;
        self.counters.get(index).copied()
    }

    /// Floating counter by name
    pub fn fcounter(&self, name: &str) -> Option<f64> {
        let index = self.module.fcounter_names().iter().position(|n| *n == name)?;
        self.fcounters.get(index).copied()
    }

    /// Encoded block in byte order `B`
    pub fn encode_with_order<B: ByteOrder>(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.module.record_size());
        put_fields::<B>(&mut out, self.id, self.rank, &self.counters, &self.fcounters);
        out
    }
}

/// Encode a record in native byte order
///
/// # Example
/// ```
/// use rastro::codec::{decode, encode};
/// use rastro::identity::RecordId;
/// use rastro::modules::posix::{PosixCounter, PosixSchema};
/// use rastro::record::StatsRecord;
///
/// let mut record = StatsRecord::<PosixSchema>::new(RecordId(42), 0);
/// record.increment(PosixCounter::BytesWritten, 4096);
///
/// let bytes = encode(&record);
/// let decoded = decode::<PosixSchema>(&bytes, false).unwrap();
/// assert_eq!(decoded, record);
/// ```
pub fn encode<S: CounterSchema>(record: &StatsRecord<S>) -> Vec<u8> {
    encode_with_order::<NativeEndian, S>(record)
}

/// Append the native encoding of `record` to `out`
pub fn encode_into<S: CounterSchema>(record: &StatsRecord<S>, out: &mut Vec<u8>) {
    put_fields::<NativeEndian>(
        out,
        record.id(),
        record.rank(),
        record.counters(),
        record.fcounters(),
    );
}

/// Encode with an explicit byte order (producing logs for another platform)
pub fn encode_with_order<B: ByteOrder, S: CounterSchema>(record: &StatsRecord<S>) -> Vec<u8> {
    let mut out = Vec::with_capacity(S::record_size());
    put_fields::<B>(
        &mut out,
        record.id(),
        record.rank(),
        record.counters(),
        record.fcounters(),
    );
    out
}

/// Decode one record block; `swap` reverses every field first
pub fn decode<S: CounterSchema>(bytes: &[u8], swap: bool) -> Result<StatsRecord<S>, CodecError> {
    decode_dyn(S::MODULE, bytes, swap)?.into_typed()
}

/// Decode one record block of `module`
pub fn decode_dyn(module: ModuleId, bytes: &[u8], swap: bool) -> Result<DynRecord, CodecError> {
    let expected = module.record_size();
    if bytes.len() > expected {
        return Err(CodecError::TrailingBytes {
            extra: bytes.len() - expected,
        });
    }

    let mut reader = FieldReader::new(bytes);
    if swap {
        reader.record::<SwappedEndian>(module)
    } else {
        reader.record::<NativeEndian>(module)
    }
}

/// The one field writer: identity, then both counter arrays, in order `B`
fn put_fields<B: ByteOrder>(
    out: &mut Vec<u8>,
    id: RecordId,
    rank: i64,
    counters: &[i64],
    fcounters: &[f64],
) {
    let mut field = [0u8; 8];
    B::write_u64(&mut field, id.0);
    out.extend_from_slice(&field);
    B::write_i64(&mut field, rank);
    out.extend_from_slice(&field);
    for &value in counters {
        B::write_i64(&mut field, value);
        out.extend_from_slice(&field);
    }
    for &value in fcounters {
        B::write_f64(&mut field, value);
        out.extend_from_slice(&field);
    }
}

/// `ReadBytesExt` over a cursor, reporting short input as [`CodecError::Truncated`]
pub(crate) struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    pub(crate) fn require(&self, n: usize) -> Result<(), CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                expected: n,
                actual: self.remaining(),
            });
        }
        Ok(())
    }

    /// Borrow the next `n` raw bytes
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.require(n)?;
        let bytes: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + n) as u64);
        Ok(&bytes[start..start + n])
    }

    fn field<T>(
        &mut self,
        width: usize,
        read: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>,
    ) -> Result<T, CodecError> {
        self.require(width)?;
        Ok(read(&mut self.cursor)?)
    }

    pub(crate) fn u32<B: ByteOrder>(&mut self) -> Result<u32, CodecError> {
        self.field(4, |c| c.read_u32::<B>())
    }

    pub(crate) fn u64<B: ByteOrder>(&mut self) -> Result<u64, CodecError> {
        self.field(8, |c| c.read_u64::<B>())
    }

    pub(crate) fn i64<B: ByteOrder>(&mut self) -> Result<i64, CodecError> {
        self.field(8, |c| c.read_i64::<B>())
    }

    pub(crate) fn f64<B: ByteOrder>(&mut self) -> Result<f64, CodecError> {
        self.field(8, |c| c.read_f64::<B>())
    }

    /// One complete record block of `module` in byte order `B`
    pub(crate) fn record<B: ByteOrder>(&mut self, module: ModuleId) -> Result<DynRecord, CodecError> {
        self.require(module.record_size())?;

        let id = RecordId(self.u64::<B>()?);
        let rank = self.i64::<B>()?;
        let mut counters = vec![0i64; module.counter_names().len()];
        self.cursor.read_i64_into::<B>(&mut counters)?;
        let mut fcounters = vec![0f64; module.fcounter_names().len()];
        self.cursor.read_f64_into::<B>(&mut fcounters)?;

        Ok(DynRecord {
            module,
            id,
            rank,
            counters,
            fcounters,
        })
    }
}

#[cfg(test)]
mod tests;
