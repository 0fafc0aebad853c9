//! Instrumentation modules
//!
//! Every module shares the same skeleton, [`InstrumentedModule`]: lazy
//! one-time registration with the coordinator, a record tracker sized from
//! the granted budget, and one recursive lock around all of it.
//!
//! The lock is a `ReentrantMutex`, so the owning thread can re-enter (for
//! example a tracked call made while the module is initializing). State
//! sits in a `RefCell` inside the lock.
//!
//! # Re-entrant calls are dropped
//!
//! A call that re-enters [`InstrumentedModule::track`] on the thread already
//! holding the module's state finds the `RefCell` borrowed and returns
//! without touching any record. Its counter updates and its telemetry event
//! are lost, and the caller is not told. The outer call is unaffected.
//! Other threads are never dropped: they wait on the lock.
//!
//! ```text
//! Uninitialized ──register ok──▶ Active ──prepare_for_shutdown──▶ Finalized
//!       │
//!       └──register/alloc failure──▶ Inactive (every call is a no-op)
//! ```

pub mod hdf5;
pub mod posix;

use crate::codec::log::ModuleBlock;
use crate::pool::{AllocationError, RecordPool};
use crate::record::{CounterSchema, StatsRecord};
use crate::runtime::{Coordinator, ModuleCallbacks, RegistrationError};
use crate::telemetry::{EventOrigin, EventSink, IoEvent};
use crate::tracker::RecordTracker;
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Timestamps bracketing the underlying call, in seconds since job start
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub start: f64,
    pub end: f64,
}

impl Timing {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("coordinator no longer exists")]
    CoordinatorGone,

    #[error("module is inactive after a failed initialization")]
    Inactive,
}

/// Everything a module tracks once it is active
pub struct ModuleContext<S: CounterSchema> {
    pub tracker: RecordTracker<S>,
    pub origin: EventOrigin,
    telemetry: Option<Arc<dyn EventSink>>,
}

impl<S: CounterSchema> ModuleContext<S> {
    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry.is_some()
    }
}

enum ModuleState<S: CounterSchema> {
    Uninitialized,
    Active(Box<ModuleContext<S>>),
    Inactive,
    Finalized(Box<ModuleContext<S>>),
}

/// Lifecycle stage of a module, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePhase {
    Uninitialized,
    Active,
    Inactive,
    Finalized,
}

/// Shared skeleton of an instrumentation module
pub struct InstrumentedModule<S: CounterSchema> {
    coordinator: Weak<Coordinator>,
    state: ReentrantMutex<RefCell<ModuleState<S>>>,
}

impl<S: CounterSchema> InstrumentedModule<S> {
    pub fn new(coordinator: &Arc<Coordinator>) -> Arc<Self> {
        Arc::new(InstrumentedModule {
            coordinator: Arc::downgrade(coordinator),
            state: ReentrantMutex::new(RefCell::new(ModuleState::Uninitialized)),
        })
    }

    /// Register with the coordinator and size the record pool
    ///
    /// Runs once; later calls report the outcome of the first one. A
    /// failure leaves the module inactive for the rest of the job.
    pub fn initialize(self: &Arc<Self>) -> Result<(), InitError> {
        let guard = self.state.lock();
        match guard.try_borrow().as_deref() {
            Ok(ModuleState::Uninitialized) => {}
            Ok(ModuleState::Inactive) => return Err(InitError::Inactive),
            // Borrowed further up this thread's stack: a tracked call is running
            Ok(ModuleState::Active(_)) | Ok(ModuleState::Finalized(_)) | Err(_) => return Ok(()),
        }

        match self.build_context() {
            Ok(context) => {
                *guard.borrow_mut() = ModuleState::Active(Box::new(context));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(module = %S::MODULE, error = %e, "module disabled");
                *guard.borrow_mut() = ModuleState::Inactive;
                Err(e)
            }
        }
    }

    fn build_context(self: &Arc<Self>) -> Result<ModuleContext<S>, InitError> {
        let coordinator = self.coordinator.upgrade().ok_or(InitError::CoordinatorGone)?;
        let callbacks: Arc<dyn ModuleCallbacks> = self.clone();
        let grant = coordinator.register_module(S::MODULE, callbacks)?;
        let pool = RecordPool::initialize(grant.memory_budget)?;

        tracing::debug!(
            module = %S::MODULE,
            capacity = pool.capacity(),
            slot_bytes = RecordPool::<S>::slot_footprint(),
            "record pool ready"
        );

        Ok(ModuleContext {
            tracker: RecordTracker::new(
                pool,
                grant.identifiers,
                grant.exclusions,
                S::MODULE.namespace(),
                grant.rank,
            ),
            origin: grant.origin,
            telemetry: grant.telemetry,
        })
    }

    /// Run one tracked operation under the module lock
    ///
    /// Initializes the module on first use. Does nothing when the module is
    /// inactive or finalized. A nested call from inside another `update` on
    /// the same thread is dropped (see the module docs). An event returned
    /// by `update` is published after the lock is released.
    pub fn track<F>(self: &Arc<Self>, update: F)
    where
        F: FnOnce(&mut ModuleContext<S>) -> Option<IoEvent>,
    {
        let published = {
            let guard = self.state.lock();

            let uninitialized = matches!(
                guard.try_borrow().as_deref(),
                Ok(ModuleState::Uninitialized)
            );
            if uninitialized {
                if let Err(e) = self.initialize() {
                    tracing::debug!(module = %S::MODULE, error = %e, "call not tracked");
                    return;
                }
            }

            let Ok(mut state) = guard.try_borrow_mut() else {
                tracing::trace!(module = %S::MODULE, "re-entrant call dropped");
                return;
            };
            let ModuleState::Active(context) = &mut *state else {
                return;
            };

            let event = update(&mut **context);
            event.zip(context.telemetry.clone())
        };

        if let Some((event, sink)) = published {
            if let Err(e) = sink.publish(&event) {
                tracing::debug!(module = %S::MODULE, op = %event.op, error = %e, "event not published");
            }
        }
    }

    /// Read-only access to the tracker of an active or finalized module
    pub fn inspect<R>(&self, f: impl FnOnce(&RecordTracker<S>) -> R) -> Option<R> {
        let guard = self.state.lock();
        let state = guard.try_borrow().ok()?;
        match &*state {
            ModuleState::Active(context) | ModuleState::Finalized(context) => {
                Some(f(&context.tracker))
            }
            ModuleState::Uninitialized | ModuleState::Inactive => None,
        }
    }

    /// Copy of the record tracked for `name`, if any
    pub fn snapshot(&self, name: &str) -> Option<StatsRecord<S>> {
        self.inspect(|tracker| {
            let slot = tracker.find_by_name(name)?;
            tracker.record(slot).cloned()
        })
        .flatten()
    }

    /// Copies of every tracked record in allocation order
    pub fn records(&self) -> Vec<StatsRecord<S>> {
        self.inspect(|tracker| tracker.records().cloned().collect())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> ModulePhase {
        let guard = self.state.lock();
        let Ok(state) = guard.try_borrow() else {
            return ModulePhase::Active;
        };
        match &*state {
            ModuleState::Uninitialized => ModulePhase::Uninitialized,
            ModuleState::Active(_) => ModulePhase::Active,
            ModuleState::Inactive => ModulePhase::Inactive,
            ModuleState::Finalized(_) => ModulePhase::Finalized,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == ModulePhase::Active
    }

    fn finalize(state: &mut ModuleState<S>) {
        if let ModuleState::Active(_) = state {
            if let ModuleState::Active(mut context) =
                std::mem::replace(state, ModuleState::Uninitialized)
            {
                context.tracker.unbind_all();
                *state = ModuleState::Finalized(context);
            }
        }
    }
}

impl<S: CounterSchema> ModuleCallbacks for InstrumentedModule<S> {
    fn prepare_for_shutdown(&self) {
        let guard = self.state.lock();
        if let Ok(mut state) = guard.try_borrow_mut() {
            Self::finalize(&mut state);
        };
    }

    fn produce_output(&self) -> ModuleBlock {
        let guard = self.state.lock();
        let Ok(mut state) = guard.try_borrow_mut() else {
            return ModuleBlock::empty(S::MODULE);
        };
        Self::finalize(&mut state);

        match &*state {
            ModuleState::Finalized(context) => {
                let block = ModuleBlock::from_records(context.tracker.records());
                tracing::debug!(
                    module = %S::MODULE,
                    records = block.record_count(),
                    "module output produced"
                );
                block
            }
            _ => ModuleBlock::empty(S::MODULE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::modules::posix::{PosixCounter, PosixSchema};

    type Module = InstrumentedModule<PosixSchema>;

    fn open(module: &Arc<Module>, name: &str, fd: i64) {
        module.track(|ctx| {
            let slot = ctx.tracker.bind_handle(name, fd)?;
            ctx.tracker.increment(slot, PosixCounter::Opens, 1);
            None
        });
    }

    #[test]
    fn test_lazy_initialization_on_first_track() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);
        assert_eq!(module.phase(), ModulePhase::Uninitialized);

        open(&module, "/data/a", 3);
        assert!(module.is_active());
        assert_eq!(module.snapshot("/data/a").unwrap().get(PosixCounter::Opens), 1);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);
        module.initialize().unwrap();
        module.initialize().unwrap();
        assert_eq!(coordinator.registered_modules().len(), 1);
    }

    #[test]
    fn test_second_instance_goes_inactive() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let first = Module::new(&coordinator);
        let second = Module::new(&coordinator);
        first.initialize().unwrap();

        let err = second.initialize().unwrap_err();
        assert!(matches!(err, InitError::Registration(_)));
        assert_eq!(second.phase(), ModulePhase::Inactive);
        assert!(matches!(second.initialize(), Err(InitError::Inactive)));

        // Calls on an inactive module are ignored
        open(&second, "/data/a", 3);
        assert!(second.records().is_empty());
    }

    #[test]
    fn test_coordinator_gone() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);
        drop(coordinator);
        assert!(matches!(module.initialize(), Err(InitError::CoordinatorGone)));
        assert_eq!(module.phase(), ModulePhase::Inactive);
    }

    #[test]
    fn test_reentrant_track_is_untracked_not_deadlocked() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);
        let inner = module.clone();

        module.track(|ctx| {
            let slot = ctx.tracker.bind_handle("/data/outer", 1)?;
            ctx.tracker.increment(slot, PosixCounter::Opens, 1);
            // Same thread re-enters the lock; the nested call is dropped
            open(&inner, "/data/inner", 2);
            // Including updates to the record the outer call holds
            inner.track(|ctx| {
                let slot = ctx.tracker.lookup_by_handle(1)?;
                ctx.tracker.increment(slot, PosixCounter::Opens, 100);
                None
            });
            None
        });

        assert_eq!(
            module.snapshot("/data/outer").unwrap().get(PosixCounter::Opens),
            1
        );
        assert!(module.snapshot("/data/inner").is_none());

        // Once the outer call returns, the same handle tracks normally
        module.track(|ctx| {
            let slot = ctx.tracker.lookup_by_handle(1)?;
            ctx.tracker.increment(slot, PosixCounter::Opens, 1);
            None
        });
        assert_eq!(
            module.snapshot("/data/outer").unwrap().get(PosixCounter::Opens),
            2
        );
    }

    #[test]
    fn test_unallocatable_budget_goes_inactive() {
        let coordinator = Coordinator::new(RuntimeConfig {
            module_memory_bytes: usize::MAX,
            total_memory_bytes: usize::MAX,
            ..RuntimeConfig::default()
        });
        let module = Module::new(&coordinator);

        let err = module.initialize().unwrap_err();
        assert!(matches!(err, InitError::Allocation(_)));
        assert_eq!(module.phase(), ModulePhase::Inactive);

        open(&module, "/data/a", 3);
        assert!(module.records().is_empty());
    }

    #[test]
    fn test_shutdown_finalizes_and_unbinds() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);
        open(&module, "/data/a", 3);
        open(&module, "/data/b", 4);

        let log = coordinator.shutdown();
        assert_eq!(module.phase(), ModulePhase::Finalized);
        assert_eq!(module.inspect(|t| t.handle_count()), Some(0));
        assert_eq!(log.blocks.len(), 1);
        assert_eq!(log.blocks[0].record_count(), 2);

        // Tracking stopped
        open(&module, "/data/c", 5);
        assert_eq!(module.records().len(), 2);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let coordinator = Coordinator::new(RuntimeConfig::default());
        let module = Module::new(&coordinator);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let module = module.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        module.track(|ctx| {
                            let slot = ctx.tracker.resolve_by_name("/data/shared")?;
                            ctx.tracker.increment(slot, PosixCounter::BytesWritten, 1);
                            None
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let record = module.snapshot("/data/shared").unwrap();
        assert_eq!(record.get(PosixCounter::BytesWritten), 8000);
    }
}
