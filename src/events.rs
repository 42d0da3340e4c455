//! Typed events and the process-wide fan-out dispatcher.
//!
//! Every decoded piece of controller feedback that means something ends up
//! here as an [`Event`], stamped at dispatch time and delivered to every
//! registered handler. Delivery is non-blocking and best-effort: a slow or
//! stuck handler never delays ingestion or the other handlers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::debug;

/// Default cap on concurrently running handler deliveries.
pub const DEFAULT_MAX_DISPATCH_CONCURRENCY: usize = 64;

/// Event category, matching the protocol class that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Button,
    RfidTag,
    RfidAntenna,
    Presence,
    Device,
    Controller,
}

/// What happened, as a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Press,
    Release,
    Hold,
    Closed,
    Open,
    Pickup,
    Putback,
    Status,
    DetectionZone,
    Update,
    Ready,
    SystemUpdate,
    Unknown,
}

/// The public unit leaving the protocol engine. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Name of the controller that produced the event.
    pub controller: String,
    pub address: u16,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Original protocol line, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Hold/press duration in milliseconds, for button events that carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Assigned by the dispatcher; milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Event {
    pub(crate) fn new(kind: EventKind, address: u16, action: Action) -> Self {
        Self {
            kind,
            controller: String::new(),
            address,
            action,
            data: None,
            raw: None,
            duration_ms: None,
            timestamp_ms: 0,
        }
    }
}

/// Receives events from the dispatcher.
///
/// Handlers run on their own tasks; they may block without affecting the
/// decode loop. Errors inside a handler are the handler's own problem —
/// nothing is surfaced back to the engine.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: Event);
}

// Closures double as handlers, so callers can register `|event| { ... }`
// without a wrapper type.
impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn handle_event(&self, event: Event) {
        self(event);
    }
}

/// Token returned by [`Dispatcher::add_handler`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Process-wide event fan-out bus.
///
/// `dispatch` stamps the event and spawns one delivery task per handler;
/// it returns without waiting for any of them. Concurrency of running
/// deliveries is bounded by a semaphore so a burst of events against slow
/// handlers cannot grow tasks without limit. Per-handler ordering follows
/// dispatch order; completion order across handlers is unspecified.
pub struct Dispatcher {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
    fan_out: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fan_out: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Registers a handler; may be called at any time.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write_lock(&self.handlers).push((id, handler));
        id
    }

    /// Deregisters a handler. Returns false if the id is unknown.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = write_lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        read_lock(&self.handlers).len()
    }

    /// Stamps the event and delivers it to every registered handler.
    ///
    /// Must be called from within a tokio runtime. Fire-and-forget: there
    /// is no backpressure signal back to the caller.
    pub fn dispatch(&self, mut event: Event) {
        event.timestamp_ms = epoch_ms();

        debug!(
            kind = ?event.kind,
            action = ?event.action,
            address = event.address,
            controller = %event.controller,
            "event"
        );

        let handlers: Vec<Arc<dyn EventHandler>> = read_lock(&self.handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            let permit_pool = Arc::clone(&self.fan_out);
            let event = event.clone();
            tokio::spawn(async move {
                // Semaphore is never closed, so acquire only fails if the
                // dispatcher is being torn down; drop the event then.
                if let Ok(_permit) = permit_pool.acquire_owned().await {
                    handler.handle_event(event);
                }
            });
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DISPATCH_CONCURRENCY)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Poisoned locks only happen if a writer panicked mid-update; the guarded
// collections are still usable, so recover instead of propagating.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
