//! Interception boundary
//!
//! The interception layer hands each completed call over as an
//! [`InterceptedCall`]: the name or handle, the call's arguments and result,
//! and the two timestamps bracketing the real operation. A [`DispatchTable`]
//! routes every operation name to the [`OperationAdapter`] for its call
//! signature, which feeds the owning module.

use crate::modules::hdf5::Hdf5Module;
use crate::modules::posix::PosixModule;
use crate::modules::Timing;
use crate::tracker::Handle;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;

/// One completed, intercepted I/O call
///
/// Serialized as a JSON object tagged by `op`, e.g.
/// `{"op":"write","fd":3,"result":4096,"start":1.5,"end":1.6}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InterceptedCall {
    Open {
        path: String,
        #[serde(default)]
        mode: i64,
        result: Handle,
        start: f64,
        end: f64,
    },
    Fopen {
        path: String,
        result: Handle,
        start: f64,
        end: f64,
    },
    Close {
        fd: Handle,
        start: f64,
        end: f64,
    },
    Read {
        fd: Handle,
        /// Explicit offset (pread); absent for implicit-offset reads
        #[serde(default)]
        offset: Option<i64>,
        result: i64,
        start: f64,
        end: f64,
    },
    Write {
        fd: Handle,
        #[serde(default)]
        offset: Option<i64>,
        result: i64,
        start: f64,
        end: f64,
    },
    Lseek {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    Fseek {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    Stat {
        path: String,
        result: i64,
        start: f64,
        end: f64,
    },
    Fstat {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    Fsync {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    Fdatasync {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    Mmap {
        fd: Handle,
        result: i64,
        start: f64,
        end: f64,
    },
    #[serde(rename = "H5Fopen")]
    H5Fopen {
        path: String,
        result: Handle,
        start: f64,
        end: f64,
    },
    #[serde(rename = "H5Fclose")]
    H5Fclose {
        file_id: Handle,
        start: f64,
        end: f64,
    },
}

impl InterceptedCall {
    /// Operation name, as used for dispatch
    pub fn op(&self) -> &'static str {
        match self {
            InterceptedCall::Open { .. } => "open",
            InterceptedCall::Fopen { .. } => "fopen",
            InterceptedCall::Close { .. } => "close",
            InterceptedCall::Read { .. } => "read",
            InterceptedCall::Write { .. } => "write",
            InterceptedCall::Lseek { .. } => "lseek",
            InterceptedCall::Fseek { .. } => "fseek",
            InterceptedCall::Stat { .. } => "stat",
            InterceptedCall::Fstat { .. } => "fstat",
            InterceptedCall::Fsync { .. } => "fsync",
            InterceptedCall::Fdatasync { .. } => "fdatasync",
            InterceptedCall::Mmap { .. } => "mmap",
            InterceptedCall::H5Fopen { .. } => "H5Fopen",
            InterceptedCall::H5Fclose { .. } => "H5Fclose",
        }
    }

    pub fn timing(&self) -> Timing {
        let (start, end) = match self {
            InterceptedCall::Open { start, end, .. }
            | InterceptedCall::Fopen { start, end, .. }
            | InterceptedCall::Close { start, end, .. }
            | InterceptedCall::Read { start, end, .. }
            | InterceptedCall::Write { start, end, .. }
            | InterceptedCall::Lseek { start, end, .. }
            | InterceptedCall::Fseek { start, end, .. }
            | InterceptedCall::Stat { start, end, .. }
            | InterceptedCall::Fstat { start, end, .. }
            | InterceptedCall::Fsync { start, end, .. }
            | InterceptedCall::Fdatasync { start, end, .. }
            | InterceptedCall::Mmap { start, end, .. }
            | InterceptedCall::H5Fopen { start, end, .. }
            | InterceptedCall::H5Fclose { start, end, .. } => (*start, *end),
        };
        Timing::new(start, end)
    }
}

/// Feeds calls of one signature into a module
///
/// Returns `false` when handed a call of a different signature.
pub trait OperationAdapter: Send + Sync {
    fn apply(&self, call: &InterceptedCall) -> bool;
}

/// open/fopen: name in, handle out
pub struct OpenAdapter {
    posix: PosixModule,
}

impl OperationAdapter for OpenAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        let timing = call.timing();
        match call {
            InterceptedCall::Open {
                path, mode, result, ..
            } => self.posix.record_open(path, *mode, *result, false, timing),
            InterceptedCall::Fopen { path, result, .. } => {
                self.posix.record_open(path, 0, *result, true, timing)
            }
            _ => return false,
        }
        true
    }
}

/// read/write: handle, optional offset, byte count
pub struct TransferAdapter {
    posix: PosixModule,
}

impl OperationAdapter for TransferAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        let timing = call.timing();
        match call {
            InterceptedCall::Read {
                fd, offset, result, ..
            } => self.posix.record_read(*fd, *offset, *result, timing),
            InterceptedCall::Write {
                fd, offset, result, ..
            } => self.posix.record_write(*fd, *offset, *result, timing),
            _ => return false,
        }
        true
    }
}

/// Handle plus status result: seeks, fstat, syncs, mmap
pub struct HandleAdapter {
    posix: PosixModule,
}

impl OperationAdapter for HandleAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        let timing = call.timing();
        match call {
            InterceptedCall::Lseek { fd, result, .. } => {
                self.posix.record_seek(*fd, *result, false, timing)
            }
            InterceptedCall::Fseek { fd, result, .. } => {
                self.posix.record_seek(*fd, *result, true, timing)
            }
            InterceptedCall::Fstat { fd, result, .. } => {
                self.posix.record_fstat(*fd, *result, timing)
            }
            InterceptedCall::Fsync { fd, result, .. } => {
                self.posix.record_fsync(*fd, *result, false, timing)
            }
            InterceptedCall::Fdatasync { fd, result, .. } => {
                self.posix.record_fsync(*fd, *result, true, timing)
            }
            InterceptedCall::Mmap { fd, result, .. } => {
                self.posix.record_mmap(*fd, *result, timing)
            }
            _ => return false,
        }
        true
    }
}

/// stat by name
pub struct PathQueryAdapter {
    posix: PosixModule,
}

impl OperationAdapter for PathQueryAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        match call {
            InterceptedCall::Stat { path, result, .. } => {
                self.posix.record_stat(path, *result, call.timing());
                true
            }
            _ => false,
        }
    }
}

/// close: releases a handle
pub struct CloseAdapter {
    posix: PosixModule,
}

impl OperationAdapter for CloseAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        match call {
            InterceptedCall::Close { fd, .. } => {
                self.posix.record_close(*fd, call.timing());
                true
            }
            _ => false,
        }
    }
}

/// H5Fopen/H5Fclose
pub struct Hdf5FileAdapter {
    hdf5: Hdf5Module,
}

impl OperationAdapter for Hdf5FileAdapter {
    fn apply(&self, call: &InterceptedCall) -> bool {
        let timing = call.timing();
        match call {
            InterceptedCall::H5Fopen { path, result, .. } => {
                self.hdf5.record_file_open(path, *result, timing)
            }
            InterceptedCall::H5Fclose { file_id, .. } => {
                self.hdf5.record_file_close(*file_id, timing)
            }
            _ => return false,
        }
        true
    }
}

/// Operation name to adapter
#[derive(Default)]
pub struct DispatchTable {
    adapters: HashMap<&'static str, Arc<dyn OperationAdapter>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation the bundled modules instrument
    pub fn standard(posix: &PosixModule, hdf5: &Hdf5Module) -> Self {
        let mut table = Self::new();

        let open: Arc<dyn OperationAdapter> = Arc::new(OpenAdapter {
            posix: posix.clone(),
        });
        let transfer: Arc<dyn OperationAdapter> = Arc::new(TransferAdapter {
            posix: posix.clone(),
        });
        let handle: Arc<dyn OperationAdapter> = Arc::new(HandleAdapter {
            posix: posix.clone(),
        });
        let hdf5_file: Arc<dyn OperationAdapter> = Arc::new(Hdf5FileAdapter { hdf5: hdf5.clone() });

        table.register("open", Arc::clone(&open));
        table.register("fopen", open);
        table.register("read", Arc::clone(&transfer));
        table.register("write", transfer);
        for op in ["lseek", "fseek", "fstat", "fsync", "fdatasync", "mmap"] {
            table.register(op, Arc::clone(&handle));
        }
        table.register(
            "stat",
            Arc::new(PathQueryAdapter {
                posix: posix.clone(),
            }),
        );
        table.register(
            "close",
            Arc::new(CloseAdapter {
                posix: posix.clone(),
            }),
        );
        table.register("H5Fopen", Arc::clone(&hdf5_file));
        table.register("H5Fclose", hdf5_file);
        table
    }

    /// Route `op` to `adapter`, replacing any previous route
    pub fn register(&mut self, op: &'static str, adapter: Arc<dyn OperationAdapter>) {
        self.adapters.insert(op, adapter);
    }

    pub fn handles(&self, op: &str) -> bool {
        self.adapters.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Feed one call to its adapter; `false` if nothing handles it
    pub fn dispatch(&self, call: &InterceptedCall) -> bool {
        match self.adapters.get(call.op()) {
            Some(adapter) => adapter.apply(call),
            None => {
                tracing::debug!(op = call.op(), "no adapter registered");
                false
            }
        }
    }
}

/// Outcome of replaying a call stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Calls parsed from the stream
    pub calls: u64,
    /// Calls routed to an adapter
    pub dispatched: u64,
    /// Calls no adapter handles
    pub unhandled: u64,
}

/// Feed a JSON-lines stream of calls through `table`
///
/// Blank lines and lines starting with `#` are skipped. A line that does
/// not parse aborts the replay with its line number.
pub fn replay<R: BufRead>(input: R, table: &DispatchTable) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    for (index, line) in input.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read call stream at line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let call: InterceptedCall = serde_json::from_str(line)
            .with_context(|| format!("Invalid call at line {}", index + 1))?;
        stats.calls += 1;
        if table.dispatch(&call) {
            stats.dispatched += 1;
        } else {
            stats.unhandled += 1;
        }
    }

    tracing::debug!(
        calls = stats.calls,
        dispatched = stats.dispatched,
        unhandled = stats.unhandled,
        "replay finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::modules::hdf5::Hdf5Counter;
    use crate::modules::posix::{PosixCounter, PosixFCounter};
    use crate::runtime::Coordinator;

    struct Fixture {
        _coordinator: Arc<Coordinator>,
        posix: PosixModule,
        hdf5: Hdf5Module,
        table: DispatchTable,
    }

    fn setup() -> Fixture {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let posix = PosixModule::new(&coordinator);
        let hdf5 = Hdf5Module::new(&coordinator);
        let table = DispatchTable::standard(&posix, &hdf5);
        Fixture {
            _coordinator: coordinator,
            posix,
            hdf5,
            table,
        }
    }

    #[test]
    fn test_parse_call_lines() {
        let call: InterceptedCall = serde_json::from_str(
            r#"{"op":"write","fd":3,"result":4096,"start":1.5,"end":1.75}"#,
        )
        .unwrap();
        assert_eq!(
            call,
            InterceptedCall::Write {
                fd: 3,
                offset: None,
                result: 4096,
                start: 1.5,
                end: 1.75
            }
        );
        assert_eq!(call.op(), "write");
        assert_eq!(call.timing().duration(), 0.25);

        let call: InterceptedCall = serde_json::from_str(
            r#"{"op":"H5Fopen","path":"/d/a.h5","result":5,"start":0.1,"end":0.2}"#,
        )
        .unwrap();
        assert_eq!(call.op(), "H5Fopen");
    }

    #[test]
    fn test_unknown_op_rejected_by_parser() {
        let parsed: Result<InterceptedCall, _> =
            serde_json::from_str(r#"{"op":"ioctl","fd":3,"start":0.0,"end":0.1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_standard_table_covers_every_op() {
        let table = setup().table;
        for op in [
            "open", "fopen", "close", "read", "write", "lseek", "fseek", "stat", "fstat",
            "fsync", "fdatasync", "mmap", "H5Fopen", "H5Fclose",
        ] {
            assert!(table.handles(op), "missing adapter for {op}");
        }
        assert_eq!(table.len(), 14);
    }

    #[test]
    fn test_dispatch_sequence() {
        let Fixture {
            _coordinator,
            posix,
            hdf5,
            table,
        } = setup();
        let calls = [
            r#"{"op":"open","path":"/data/run1.dat","mode":420,"result":3,"start":1.0,"end":1.1}"#,
            r#"{"op":"write","fd":3,"result":4096,"start":2.0,"end":2.5}"#,
            r#"{"op":"lseek","fd":3,"result":0,"start":2.6,"end":2.7}"#,
            r#"{"op":"read","fd":3,"result":100,"start":3.0,"end":3.2}"#,
            r#"{"op":"fsync","fd":3,"result":0,"start":3.3,"end":3.4}"#,
            r#"{"op":"close","fd":3,"start":4.0,"end":4.1}"#,
            r#"{"op":"H5Fopen","path":"/data/run1.h5","result":7,"start":5.0,"end":5.1}"#,
        ];
        for line in calls {
            let call: InterceptedCall = serde_json::from_str(line).unwrap();
            assert!(table.dispatch(&call));
        }

        let record = posix.snapshot("/data/run1.dat").unwrap();
        assert_eq!(record.get(PosixCounter::Opens), 1);
        assert_eq!(record.get(PosixCounter::Mode), 420);
        assert_eq!(record.get(PosixCounter::BytesWritten), 4096);
        assert_eq!(record.get(PosixCounter::Seeks), 1);
        assert_eq!(record.get(PosixCounter::BytesRead), 100);
        assert_eq!(record.get(PosixCounter::MaxByteRead), 99);
        assert_eq!(record.get(PosixCounter::Fsyncs), 1);
        assert_eq!(record.fget(PosixFCounter::CloseTimestamp), 4.1);
        assert!(!posix.is_tracked(3));

        assert_eq!(
            hdf5.snapshot("/data/run1.h5").unwrap().get(Hdf5Counter::Opens),
            1
        );
    }

    #[test]
    fn test_adapter_rejects_other_signatures() {
        let fixture = setup();
        let adapter = CloseAdapter {
            posix: fixture.posix.clone(),
        };
        let call = InterceptedCall::Stat {
            path: "/x".to_string(),
            result: 0,
            start: 0.0,
            end: 0.1,
        };
        assert!(!adapter.apply(&call));
    }

    #[test]
    fn test_empty_table_dispatches_nothing() {
        let table = DispatchTable::new();
        assert!(table.is_empty());
        let call = InterceptedCall::Close {
            fd: 3,
            start: 0.0,
            end: 0.1,
        };
        assert!(!table.dispatch(&call));
    }

    #[test]
    fn test_replay_stream() {
        let fixture = setup();
        let stream = "\
# calls captured from a short run
{\"op\":\"open\",\"path\":\"/data/a\",\"result\":4,\"start\":1.0,\"end\":1.1}

{\"op\":\"write\",\"fd\":4,\"offset\":1024,\"result\":512,\"start\":2.0,\"end\":2.1}
{\"op\":\"close\",\"fd\":4,\"start\":3.0,\"end\":3.1}
";
        let stats = replay(stream.as_bytes(), &fixture.table).unwrap();
        assert_eq!(
            stats,
            ReplayStats {
                calls: 3,
                dispatched: 3,
                unhandled: 0
            }
        );

        let record = fixture.posix.snapshot("/data/a").unwrap();
        assert_eq!(record.get(PosixCounter::MaxByteWritten), 1535);
    }

    #[test]
    fn test_replay_counts_unhandled() {
        let table = DispatchTable::new();
        let stream = r#"{"op":"close","fd":1,"start":0.5,"end":0.6}"#;
        let stats = replay(stream.as_bytes(), &table).unwrap();
        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.dispatched, 0);
    }

    #[test]
    fn test_replay_reports_bad_line() {
        let table = DispatchTable::new();
        let stream = "{\"op\":\"close\",\"fd\":1,\"start\":0.5,\"end\":0.6}\nnot json\n";
        let err = replay(stream.as_bytes(), &table).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
