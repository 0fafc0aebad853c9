//! Module registration protocol and the coordinating runtime
//!
//! The [`Coordinator`] is the job-wide context object: it hands out memory
//! budgets, owns the identifier authority and collects each module's
//! output at shutdown. It is constructed explicitly and shared as
//! `Arc<Coordinator>`; modules keep only a `Weak` back-reference.
//!
//! Shutdown runs in two phases so no module emits output while another
//! is still tracking: every `prepare_for_shutdown` hook first, then every
//! `produce_output` hook, in registration order.

use crate::codec::log::{JobLog, LogHeader, ModuleBlock};
use crate::config::RuntimeConfig;
use crate::filter::PathFilter;
use crate::identity::{IdentifierAuthority, NameRegistry, Namespace, RecordId};
use crate::modules::hdf5::Hdf5Schema;
use crate::modules::posix::PosixSchema;
use crate::record::CounterSchema;
use crate::telemetry::{EventOrigin, EventSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identity tag of an instrumentation module, persisted in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u32)]
pub enum ModuleId {
    Posix = 1,
    Hdf5 = 2,
}

impl ModuleId {
    pub const ALL: [ModuleId; 2] = [ModuleId::Posix, ModuleId::Hdf5];

    pub fn name(self) -> &'static str {
        match self {
            ModuleId::Posix => "POSIX",
            ModuleId::Hdf5 => "HDF5",
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ModuleId::Posix),
            2 => Some(ModuleId::Hdf5),
            _ => None,
        }
    }

    pub fn counter_names(self) -> &'static [&'static str] {
        match self {
            ModuleId::Posix => PosixSchema::COUNTER_NAMES,
            ModuleId::Hdf5 => Hdf5Schema::COUNTER_NAMES,
        }
    }

    pub fn fcounter_names(self) -> &'static [&'static str] {
        match self {
            ModuleId::Posix => PosixSchema::FCOUNTER_NAMES,
            ModuleId::Hdf5 => Hdf5Schema::FCOUNTER_NAMES,
        }
    }

    /// Encoded size of one record of this module
    pub fn record_size(self) -> usize {
        match self {
            ModuleId::Posix => PosixSchema::record_size(),
            ModuleId::Hdf5 => Hdf5Schema::record_size(),
        }
    }

    /// Identifier namespace used for this module's records
    pub fn namespace(self) -> Namespace {
        match self {
            ModuleId::Posix | ModuleId::Hdf5 => Namespace::File,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hooks a module hands to the coordinator at registration
pub trait ModuleCallbacks: Send + Sync {
    /// Last-moment finalization; tracking stops after this returns
    fn prepare_for_shutdown(&self);

    /// Finished records of the module, encoded
    fn produce_output(&self) -> ModuleBlock;
}

/// What a module receives in exchange for registering
#[derive(Clone)]
pub struct ModuleGrant {
    /// Bytes the module may spend on its record pool
    pub memory_budget: usize,
    pub rank: i64,
    pub identifiers: Arc<dyn IdentifierAuthority>,
    pub exclusions: PathFilter,
    pub telemetry: Option<Arc<dyn EventSink>>,
    pub origin: EventOrigin,
}

impl fmt::Debug for ModuleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleGrant")
            .field("memory_budget", &self.memory_budget)
            .field("rank", &self.rank)
            .field("exclusions", &self.exclusions)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("module {0} is already registered")]
    AlreadyRegistered(ModuleId),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

struct Registration {
    module: ModuleId,
    callbacks: Arc<dyn ModuleCallbacks>,
}

struct Registry {
    modules: Vec<Registration>,
    granted_bytes: usize,
}

/// Job-wide coordinating runtime
pub struct Coordinator {
    config: RuntimeConfig,
    names: Arc<NameRegistry>,
    exclusions: PathFilter,
    telemetry: Option<Arc<dyn EventSink>>,
    registry: Mutex<Registry>,
    shutting_down: AtomicBool,
    started: Instant,
    start_time: f64,
}

impl Coordinator {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_sink(config, None)
    }

    /// Coordinator whose modules republish per-operation events to `sink`
    pub fn with_sink(config: RuntimeConfig, sink: Option<Arc<dyn EventSink>>) -> Arc<Self> {
        let exclusions = config.path_filter();
        Arc::new(Coordinator {
            config,
            names: Arc::new(NameRegistry::new()),
            exclusions,
            telemetry: sink,
            registry: Mutex::new(Registry {
                modules: Vec::new(),
                granted_bytes: 0,
            }),
            shutting_down: AtomicBool::new(false),
            started: Instant::now(),
            start_time: unix_now(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a module and receive its memory budget
    ///
    /// The budget is the configured per-module budget, capped by what is
    /// left of the job-wide total.
    pub fn register_module(
        &self,
        module: ModuleId,
        callbacks: Arc<dyn ModuleCallbacks>,
    ) -> Result<ModuleGrant, RegistrationError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistrationError::ShuttingDown);
        }

        let mut registry = self.registry.lock();
        if registry.modules.iter().any(|r| r.module == module) {
            return Err(RegistrationError::AlreadyRegistered(module));
        }

        let remaining = self
            .config
            .total_memory_bytes
            .saturating_sub(registry.granted_bytes);
        let memory_budget = self.config.module_memory_bytes.min(remaining);
        registry.granted_bytes += memory_budget;
        registry.modules.push(Registration { module, callbacks });

        tracing::debug!(
            module = %module,
            memory_budget,
            "module registered"
        );

        Ok(ModuleGrant {
            memory_budget,
            rank: self.config.rank,
            identifiers: self.names.clone(),
            exclusions: self.exclusions.clone(),
            telemetry: self
                .telemetry
                .clone()
                .filter(|_| self.config.telemetry.publishes(module)),
            origin: EventOrigin {
                job_id: self.config.job_id,
                rank: self.config.rank,
                uid: self.config.uid.unwrap_or_else(process_uid),
                producer: self.config.telemetry.producer.clone(),
                exe: self.config.telemetry.exe.clone(),
                epoch: self.start_time,
            },
        })
    }

    /// Identifier for a canonical name; the name is remembered for the log
    pub fn lookup_identifier(&self, canonical: &str, namespace: Namespace) -> RecordId {
        self.names.lookup_identifier(canonical, namespace)
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    /// Seconds since the coordinator was created
    pub fn wtime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn registered_modules(&self) -> Vec<ModuleId> {
        self.registry.lock().modules.iter().map(|r| r.module).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Finalize every registered module and assemble the job log
    pub fn shutdown(&self) -> JobLog {
        self.shutting_down.store(true, Ordering::SeqCst);

        // Callbacks re-enter module locks; never hold the registry across them
        let modules: Vec<(ModuleId, Arc<dyn ModuleCallbacks>)> = self
            .registry
            .lock()
            .modules
            .iter()
            .map(|r| (r.module, r.callbacks.clone()))
            .collect();

        for (module, callbacks) in &modules {
            tracing::debug!(module = %module, "preparing module for shutdown");
            callbacks.prepare_for_shutdown();
        }

        let blocks: Vec<ModuleBlock> = modules
            .iter()
            .map(|(_, callbacks)| callbacks.produce_output())
            .collect();

        JobLog {
            header: LogHeader {
                rank: self.config.rank,
                job_id: self.config.job_id,
                start_time: self.start_time,
                end_time: self.start_time + self.wtime(),
            },
            names: self.names.snapshot(),
            blocks,
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Owner of the running process, read from `/proc/self`
#[cfg(unix)]
fn process_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|meta| meta.uid())
        .unwrap_or(0)
}

#[cfg(not(unix))]
fn process_uid() -> u32 {
    0
}
