//! Human-readable projection of decoded records
//!
//! One tab-separated line per counter:
//! `module  rank  record-id  counter  value  file  mount  fs-type`

use super::{CodecError, DynRecord, JobLog};
use crate::mounts::PathResolver;
use std::io::Write;

const UNKNOWN: &str = "UNKNOWN";

/// Text lines for every counter of `record`
pub fn record_lines(
    record: &DynRecord,
    name: Option<&str>,
    resolver: &dyn PathResolver,
) -> Vec<String> {
    let mount = name.and_then(|n| resolver.resolve(n));
    let file = name.unwrap_or(UNKNOWN);
    let (mount_point, fs_type) = match &mount {
        Some(info) => (info.mount_point.as_str(), info.fs_type.as_str()),
        None => (UNKNOWN, UNKNOWN),
    };
    let module = record.module.name();

    let ints = record
        .module
        .counter_names()
        .iter()
        .zip(&record.counters)
        .map(|(counter, value)| (*counter, value.to_string()));
    let floats = record
        .module
        .fcounter_names()
        .iter()
        .zip(&record.fcounters)
        .map(|(counter, value)| (*counter, format!("{value:.6}")));

    ints.chain(floats)
        .map(|(counter, value)| {
            format!(
                "{module}\t{}\t{}\t{counter}\t{value}\t{file}\t{mount_point}\t{fs_type}",
                record.rank, record.id
            )
        })
        .collect()
}

/// Write the full text projection of `log`
pub fn write_text<W: Write>(
    log: &JobLog,
    resolver: &dyn PathResolver,
    out: &mut W,
) -> Result<(), CodecError> {
    writeln!(out, "# rank: {}", log.header.rank)?;
    writeln!(out, "# job id: {}", log.header.job_id)?;
    writeln!(out, "# start time: {:.6}", log.header.start_time)?;
    writeln!(out, "# end time: {:.6}", log.header.end_time)?;
    writeln!(
        out,
        "# <module>\t<rank>\t<record id>\t<counter>\t<value>\t<file>\t<mount pt>\t<fs type>"
    )?;

    for block in &log.blocks {
        writeln!(out, "\n# {} module: {} records", block.module, block.record_count())?;
        for record in block.dyn_records()? {
            for line in record_lines(&record, log.name_of(record.id), resolver) {
                writeln!(out, "{line}")?;
            }
        }
    }
    Ok(())
}
