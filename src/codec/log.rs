//! Job log container
//!
//! ```text
//! header : magic u64 | version u32 | rank i64 | job_id u64 | start f64 | end f64
//! names  : count u64 | count × (id u64 | len u32 | utf8 bytes)
//! blocks : count u32 | count × (module u32 | record_count u64 | records)
//! ```
//!
//! The magic doubles as the byte-order mark: read natively it is either
//! [`LOG_MAGIC`] (same byte order) or its byte-swapped value (swap every
//! field). Blocks held in memory are always native-endian.

use super::{decode_dyn, encode_into, CodecError, DynRecord, FieldReader, SwappedEndian};
use crate::identity::RecordId;
use crate::record::{CounterSchema, StatsRecord};
use crate::runtime::ModuleId;
use anyhow::{Context, Result};
use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// "RASTROLG" read as a big-endian integer
pub const LOG_MAGIC: u64 = 0x5241_5354_524f_4c47;

pub const FORMAT_VERSION: u32 = 1;

/// Smallest possible encoded name entry (id + length, empty name)
const MIN_NAME_ENTRY: usize = 12;

/// Job-level metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogHeader {
    pub rank: i64,
    pub job_id: u64,
    /// Seconds since the epoch
    pub start_time: f64,
    pub end_time: f64,
}

/// Encoded records of one module, in allocation order
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleBlock {
    pub module: ModuleId,
    data: Vec<u8>,
}

impl ModuleBlock {
    pub fn empty(module: ModuleId) -> Self {
        ModuleBlock {
            module,
            data: Vec::new(),
        }
    }

    pub fn from_records<'a, S, I>(records: I) -> Self
    where
        S: CounterSchema,
        I: IntoIterator<Item = &'a StatsRecord<S>>,
    {
        let mut block = Self::empty(S::MODULE);
        for record in records {
            encode_into(record, &mut block.data);
        }
        block
    }

    /// Append one record; it must belong to this block's module
    pub fn push<S: CounterSchema>(&mut self, record: &StatsRecord<S>) -> Result<(), CodecError> {
        if S::MODULE != self.module {
            return Err(CodecError::ModuleMismatch {
                expected: self.module,
                found: S::MODULE,
            });
        }
        encode_into(record, &mut self.data);
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.data.len() / self.module.record_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Native-endian record blocks, back to back
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decode every record as `S`
    pub fn records<S: CounterSchema>(&self) -> Result<Vec<StatsRecord<S>>, CodecError> {
        self.dyn_records()?
            .into_iter()
            .map(DynRecord::into_typed)
            .collect()
    }

    pub fn dyn_records(&self) -> Result<Vec<DynRecord>, CodecError> {
        self.data
            .chunks(self.module.record_size())
            .map(|chunk| decode_dyn(self.module, chunk, false))
            .collect()
    }
}

/// Everything one process persists at shutdown
#[derive(Debug, Clone, PartialEq)]
pub struct JobLog {
    pub header: LogHeader,
    /// Record id to canonical name, ordered by id
    pub names: Vec<(RecordId, String)>,
    pub blocks: Vec<ModuleBlock>,
}

impl JobLog {
    pub fn block(&self, module: ModuleId) -> Option<&ModuleBlock> {
        self.blocks.iter().find(|b| b.module == module)
    }

    pub fn name_of(&self, id: RecordId) -> Option<&str> {
        self.names
            .binary_search_by_key(&id, |(entry, _)| *entry)
            .ok()
            .map(|index| self.names[index].1.as_str())
    }

    /// Total records across all modules
    pub fn record_count(&self) -> usize {
        self.blocks.iter().map(ModuleBlock::record_count).sum()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), CodecError> {
        self.write_with_order::<NativeEndian, W>(out)
    }

    /// Serialize in byte order `B` (native logs use [`JobLog::write_to`])
    pub fn write_with_order<B: ByteOrder, W: Write>(&self, out: &mut W) -> Result<(), CodecError> {
        out.write_u64::<B>(LOG_MAGIC)?;
        out.write_u32::<B>(FORMAT_VERSION)?;
        out.write_i64::<B>(self.header.rank)?;
        out.write_u64::<B>(self.header.job_id)?;
        out.write_f64::<B>(self.header.start_time)?;
        out.write_f64::<B>(self.header.end_time)?;

        out.write_u64::<B>(self.names.len() as u64)?;
        for (id, name) in &self.names {
            out.write_u64::<B>(id.0)?;
            out.write_u32::<B>(name.len() as u32)?;
            out.write_all(name.as_bytes())?;
        }

        out.write_u32::<B>(self.blocks.len() as u32)?;
        for block in &self.blocks {
            out.write_u32::<B>(block.module as u32)?;
            out.write_u64::<B>(block.record_count() as u64)?;
            for record in block.dyn_records()? {
                out.write_all(&record.encode_with_order::<B>())?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, CodecError> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Parse a complete log, native or byte-swapped
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(bytes);

        let magic = reader.u64::<NativeEndian>()?;
        if magic == LOG_MAGIC {
            Self::read_body::<NativeEndian>(&mut reader, false)
        } else if magic == LOG_MAGIC.swap_bytes() {
            Self::read_body::<SwappedEndian>(&mut reader, true)
        } else {
            Err(CodecError::BadMagic(magic))
        }
    }

    /// Everything after the magic, in byte order `B`
    fn read_body<B: ByteOrder>(reader: &mut FieldReader<'_>, swap: bool) -> Result<Self, CodecError> {
        let version = reader.u32::<B>()?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let header = LogHeader {
            rank: reader.i64::<B>()?,
            job_id: reader.u64::<B>()?,
            start_time: reader.f64::<B>()?,
            end_time: reader.f64::<B>()?,
        };

        let name_count = reader.u64::<B>()?;
        let max_names = (reader.remaining() / MIN_NAME_ENTRY) as u64;
        if name_count > max_names {
            return Err(CodecError::Truncated {
                expected: usize::try_from(name_count)
                    .unwrap_or(usize::MAX)
                    .saturating_mul(MIN_NAME_ENTRY),
                actual: reader.remaining(),
            });
        }
        let mut names = Vec::with_capacity(name_count as usize);
        for _ in 0..name_count {
            let id = RecordId(reader.u64::<B>()?);
            let len = reader.u32::<B>()? as usize;
            let raw = reader.take(len)?;
            let name = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidName)?;
            names.push((id, name.to_string()));
        }
        names.sort_by_key(|(id, _)| *id);

        let block_count = reader.u32::<B>()?;
        let mut blocks = Vec::new();
        for _ in 0..block_count {
            let raw_module = reader.u32::<B>()?;
            let module = ModuleId::from_u32(raw_module).ok_or(CodecError::UnknownModule(raw_module))?;
            let record_count = reader.u64::<B>()?;

            let record_size = module.record_size();
            let total = usize::try_from(record_count)
                .ok()
                .and_then(|count| count.checked_mul(record_size))
                .unwrap_or(usize::MAX);
            let raw = reader.take(total)?;

            let mut block = ModuleBlock::empty(module);
            if swap {
                // Held natively from here on
                block.data.reserve(raw.len());
                for chunk in raw.chunks(record_size) {
                    let record = decode_dyn(module, chunk, true)?;
                    block
                        .data
                        .extend_from_slice(&record.encode_with_order::<NativeEndian>());
                }
            } else {
                block.data.extend_from_slice(raw);
            }
            blocks.push(block);
        }

        if reader.remaining() > 0 {
            return Err(CodecError::TrailingBytes {
                extra: reader.remaining(),
            });
        }

        Ok(JobLog {
            header,
            names,
            blocks,
        })
    }

    /// Write the log to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)
            .with_context(|| format!("Failed to write log file {}", path.display()))?;
        out.flush()
            .with_context(|| format!("Failed to flush log file {}", path.display()))?;
        Ok(())
    }

    /// Read a log file written by [`JobLog::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("Failed to decode {}", path.display()))
    }
}
