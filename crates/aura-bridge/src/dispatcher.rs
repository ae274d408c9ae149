//! Actuator dispatcher - fire-and-forget light commands.
//!
//! `dispatch` only pushes onto a bounded pending deque, so it returns at once from
//! any thread or runtime. A worker task on the runtime that created the dispatcher
//! takes commands off the front and runs each blocking device call on the blocking
//! pool, with at most `max_in_flight` calls outstanding. Outcomes are logged and
//! counted, never reported back to the caller.
//!
//! Commands wait in the deque until a device slot is free. When it is full the
//! oldest pending command is evicted, so the newest color always gets applied.
//! With `max_in_flight` of 1 the last command dispatched is the last one applied.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::actuator::ActuatorDriver;
use crate::classifier::ActuatorState;

/// One queued light command.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub actuator_id: String,
    pub state: ActuatorState,
    pub transition_time: u16,
}

/// What happened to a `dispatch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// No device has been configured yet.
    NoDriver,
    /// Queued after evicting the oldest pending command.
    Replaced,
}

/// Counters, readable at any time.
#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub queued: u64,
    pub applied: u64,
    pub failed: u64,
    /// Pending commands evicted by newer ones.
    pub dropped: u64,
}

type DriverSlot = Arc<RwLock<Option<Arc<dyn ActuatorDriver>>>>;

/// Commands waiting for a device slot, oldest first.
struct Pending {
    commands: Mutex<VecDeque<DispatchRequest>>,
    available: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Pending {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            commands: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            available: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn commands(&self) -> MutexGuard<'_, VecDeque<DispatchRequest>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the evicted command, if any.
    fn push(&self, request: DispatchRequest) -> Option<DispatchRequest> {
        let evicted = {
            let mut commands = self.commands();
            let evicted = if commands.len() >= self.capacity {
                commands.pop_front()
            } else {
                None
            };
            commands.push_back(request);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    /// Next command; `None` once closed and drained.
    async fn pop(&self) -> Option<DispatchRequest> {
        loop {
            let notified = self.available.notified();
            if let Some(request) = self.commands().pop_front() {
                return Some(request);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_one();
    }
}

struct Shared {
    pending: Arc<Pending>,
    driver: DriverSlot,
    counters: Arc<Counters>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: let the worker finish what is pending and exit.
        self.pending.close();
    }
}

/// Handle to the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct ActuatorDispatcher {
    shared: Arc<Shared>,
}

impl ActuatorDispatcher {
    /// Start the dispatcher worker on the current tokio runtime.
    ///
    /// `capacity` bounds pending commands; `max_in_flight` bounds concurrent device calls.
    pub fn spawn(capacity: usize, max_in_flight: usize) -> Self {
        let pending = Arc::new(Pending::new(capacity));
        let driver: DriverSlot = Arc::new(RwLock::new(None));
        let counters = Arc::new(Counters::default());

        tokio::spawn(run_worker(
            Arc::clone(&pending),
            Arc::clone(&driver),
            Arc::clone(&counters),
            Arc::new(Semaphore::new(max_in_flight.max(1))),
        ));

        Self {
            shared: Arc::new(Shared {
                pending,
                driver,
                counters,
            }),
        }
    }

    /// Install (or replace) the device driver used for future commands.
    pub fn install_driver(&self, driver: Arc<dyn ActuatorDriver>) {
        *self.shared.driver.write().unwrap_or_else(PoisonError::into_inner) = Some(driver);
    }

    pub fn has_driver(&self) -> bool {
        read_driver(&self.shared.driver).is_some()
    }

    /// Queue a light command. Never blocks.
    pub fn dispatch(
        &self,
        actuator_id: impl Into<String>,
        state: ActuatorState,
        transition_time: u16,
    ) -> DispatchOutcome {
        if !self.has_driver() {
            debug!(target: "aura::dispatch", "no actuator configured, skipping");
            return DispatchOutcome::NoDriver;
        }
        let request = DispatchRequest {
            actuator_id: actuator_id.into(),
            state,
            transition_time,
        };
        let counters = &self.shared.counters;
        counters.queued.fetch_add(1, Ordering::Relaxed);
        match self.shared.pending.push(request) {
            None => DispatchOutcome::Queued,
            Some(stale) => {
                let total = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    target: "aura::dispatch",
                    actuator = %stale.actuator_id,
                    dropped_total = total,
                    "device busy, replaced oldest pending command"
                );
                DispatchOutcome::Replaced
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.shared.counters;
        DispatchStats {
            queued: counters.queued.load(Ordering::Relaxed),
            applied: counters.applied.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

fn read_driver(slot: &DriverSlot) -> Option<Arc<dyn ActuatorDriver>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

async fn run_worker(
    pending: Arc<Pending>,
    driver: DriverSlot,
    counters: Arc<Counters>,
    in_flight: Arc<Semaphore>,
) {
    loop {
        // Take a slot first so waiting commands stay evictable.
        let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
            break;
        };
        let Some(request) = pending.pop().await else {
            break;
        };
        let Some(driver) = read_driver(&driver) else {
            continue;
        };
        let counters = Arc::clone(&counters);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match driver.set_state(
                &request.actuator_id,
                &request.state,
                request.transition_time,
            ) {
                Ok(()) => {
                    counters.applied.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target: "aura::dispatch",
                        actuator = %request.actuator_id,
                        hue = request.state.hue,
                        "💡 Light updated"
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "aura::dispatch", actuator = %request.actuator_id, error = %e, "Light error");
                }
            }
        });
    }
    debug!(target: "aura::dispatch", "dispatcher worker stopped");
}
