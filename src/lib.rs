//! Rastro - per-file I/O characterization records for HPC jobs
//!
//! This library provides the record-tracking engine that instrumentation
//! modules share (identity resolution, bounded record pools, handle
//! bindings, counter updates), the module registration protocol, and the
//! portable binary codec used to persist and read back job logs.

pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod identity;
pub mod modules;
pub mod mounts;
pub mod pool;
pub mod record;
pub mod runtime;
pub mod telemetry;
pub mod tracker;
