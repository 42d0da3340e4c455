//! Service lifecycle: controller discovery, registry, and the runtime
//! control surface.
//!
//! The service periodically asks its [`TransportProvider`] for serial
//! ports, attaches a [`Controller`] to every newly seen supported port,
//! and tears the controller down again when its stream ends. Events from
//! all controllers funnel through one shared [`Dispatcher`].

use crate::controller::{lock, Controller, ControllerError, ControllerInfo, QueueTier};
use crate::events::{
    read_lock, write_lock, Action, Dispatcher, Event, EventHandler, EventKind, HandlerId,
};
use crate::protocol::MAX_DEVICE_ADDRESS;
use crate::transport::{is_supported_adapter, PortDescriptor, SerialLink, TransportProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("controller {0} not found")]
    ControllerNotFound(String),
    #[error("invalid device address {0} (must be 1-999)")]
    InvalidAddress(u16),
    #[error("service already running")]
    AlreadyRunning,
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Timing and sizing knobs. Defaults match the shipped hardware profile;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How often the transport is polled for new controllers.
    pub scan_interval: Duration,
    /// Grace period after opening a port before discovery probes go out;
    /// the controller firmware needs a moment after the port opens.
    pub settle_delay: Duration,
    /// How long to wait for discovery answers before declaring the
    /// controller ready regardless.
    pub ready_timeout: Duration,
    /// Pacing tick: one outbound command is written per tick.
    pub queue_tick_interval: Duration,
    /// Addresses 1..=N are probed with a `TYPE` query on attach.
    pub discovery_probe_count: u16,
    /// Cap on concurrently running handler deliveries.
    pub max_dispatch_concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            queue_tick_interval: Duration::from_millis(250),
            discovery_probe_count: 8,
            max_dispatch_concurrency: crate::events::DEFAULT_MAX_DISPATCH_CONCURRENCY,
        }
    }
}

struct ControllerHandle {
    controller: Arc<Controller>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ServiceConfig,
    transport: Box<dyn TransportProvider>,
    controllers: RwLock<HashMap<String, ControllerHandle>>,
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the controller registry and the discovery loop.
///
/// Cheap to clone conceptually — internally a single shared state — but
/// handed around by reference; all methods take `&self`.
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(transport: Box<dyn TransportProvider>) -> Self {
        Self::with_config(transport, ServiceConfig::default())
    }

    pub fn with_config(transport: Box<dyn TransportProvider>, config: ServiceConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.max_dispatch_concurrency));
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                controllers: RwLock::new(HashMap::new()),
                dispatcher,
                running: AtomicBool::new(false),
                scan_task: Mutex::new(None),
            }),
        }
    }

    /// Registers an event handler; valid at any time, before or after start.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.inner.dispatcher.add_handler(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.remove_handler(id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Begins periodic controller discovery. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<(), ServiceError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyRunning);
        }

        info!("nexmosphere service starting");
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            // First tick fires immediately, giving the initial scan.
            let mut ticker = interval(inner.config.scan_interval);
            loop {
                ticker.tick().await;
                scan_for_controllers(&inner);
            }
        });
        *lock(&self.inner.scan_task) = Some(task);
        Ok(())
    }

    /// Halts discovery and tears down every controller: pacing and
    /// ingestion tasks aborted, hold notifiers cancelled, streams dropped.
    pub fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!("nexmosphere service stopping");
        if let Some(task) = lock(&self.inner.scan_task).take() {
            task.abort();
        }
        let handles: Vec<ControllerHandle> = {
            let mut map = write_lock(&self.inner.controllers);
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            for task in handle.tasks {
                task.abort();
            }
            handle.controller.cancel_hold_tasks();
        }
    }

    /// Snapshot of every attached controller.
    pub fn controllers(&self) -> Vec<ControllerInfo> {
        read_lock(&self.inner.controllers)
            .values()
            .map(|handle| handle.controller.info())
            .collect()
    }

    /// Enqueues an application command on the named controller's user
    /// tier. The pacing loop writes it out; system traffic goes first.
    pub fn send_command(&self, controller_name: &str, cmd: &str) -> Result<(), ServiceError> {
        let controller = self.lookup(controller_name)?;
        controller.enqueue(QueueTier::User, cmd.to_string())?;
        Ok(())
    }

    /// Reconfigures how often a device emits `hold` events while a button
    /// stays pressed. Zero disables them. An in-flight press keeps its
    /// previous interval.
    pub fn set_hold_interval(
        &self,
        controller_name: &str,
        address: u16,
        interval: Duration,
    ) -> Result<(), ServiceError> {
        if !(1..=MAX_DEVICE_ADDRESS).contains(&address) {
            return Err(ServiceError::InvalidAddress(address));
        }
        let controller = self.lookup(controller_name)?;
        controller.set_hold_interval(address, interval);
        debug!(controller = controller_name, address, ?interval, "hold interval set");
        Ok(())
    }

    fn lookup(&self, controller_name: &str) -> Result<Arc<Controller>, ServiceError> {
        read_lock(&self.inner.controllers)
            .get(controller_name)
            .map(|handle| Arc::clone(&handle.controller))
            .ok_or_else(|| ServiceError::ControllerNotFound(controller_name.to_string()))
    }
}

/// One discovery pass: attach a controller for every supported, not yet
/// registered port the transport reports.
fn scan_for_controllers(inner: &Arc<Inner>) {
    let ports = match inner.transport.list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            error!("failed to enumerate ports: {e}");
            return;
        }
    };
    if ports.is_empty() {
        debug!("no serial ports found");
        return;
    }

    for port in ports {
        if !is_supported_adapter(&port) {
            continue;
        }
        if read_lock(&inner.controllers).contains_key(&port.name) {
            continue;
        }
        match inner.transport.open(&port) {
            Ok(link) => attach_controller(inner, port, link),
            Err(e) => debug!(port = %port.name, "failed to open controller: {e}"),
        }
    }
}

fn attach_controller(inner: &Arc<Inner>, port: PortDescriptor, link: Box<dyn SerialLink>) {
    let name = port.name.clone();
    let (reader, writer) = tokio::io::split(link);
    let controller = Arc::new(Controller::new(
        port,
        Box::new(writer),
        Arc::clone(&inner.dispatcher),
    ));
    info!(controller = %name, "listening");

    let pacing = tokio::spawn(
        Arc::clone(&controller).run_pacing(inner.config.queue_tick_interval),
    );
    let readiness = tokio::spawn(run_readiness_sequence(
        Arc::clone(inner),
        Arc::clone(&controller),
    ));

    write_lock(&inner.controllers).insert(
        name.clone(),
        ControllerHandle {
            controller: Arc::clone(&controller),
            tasks: vec![pacing, readiness],
        },
    );

    let ingestion = tokio::spawn(run_ingestion_guard(
        Arc::clone(inner),
        controller,
        Box::new(reader),
    ));
    match write_lock(&inner.controllers).get_mut(&name) {
        Some(handle) => handle.tasks.push(ingestion),
        // Stream ended before wiring finished; the guard already detached.
        None => ingestion.abort(),
    }

    send_system_update(inner);
}

/// Runs the ingestion loop and owns the teardown when it exits.
async fn run_ingestion_guard(
    inner: Arc<Inner>,
    controller: Arc<Controller>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
) {
    match Arc::clone(&controller).run_ingestion(reader).await {
        Ok(()) => info!(controller = %controller.name(), "closing: EOF"),
        Err(e) => error!(controller = %controller.name(), "closing: {e}"),
    }
    detach_controller(&inner, controller.name());
}

fn detach_controller(inner: &Arc<Inner>, name: &str) {
    let removed = write_lock(&inner.controllers).remove(name);
    if let Some(handle) = removed {
        // Aborting the ingestion task from its own teardown path is fine;
        // nothing below suspends.
        for task in handle.tasks {
            task.abort();
        }
        handle.controller.cancel_hold_tasks();
        send_system_update(inner);
    }
}

/// Settle, probe, then arm the grace timeout. The countdown in the
/// controller's diagnostic handler races this; whichever flips `ready`
/// first dispatches the single ready event.
async fn run_readiness_sequence(inner: Arc<Inner>, controller: Arc<Controller>) {
    sleep(inner.config.settle_delay).await;
    let probe_count = inner.config.discovery_probe_count;
    controller.begin_discovery(probe_count);

    sleep(inner.config.ready_timeout).await;
    if controller.mark_ready() {
        let found = (probe_count as usize).saturating_sub(controller.pending_queries());
        info!(controller = %controller.name(), "controller ready - {found} device(s) found");
        let mut event = Event::new(EventKind::Controller, 0, Action::Ready);
        event.controller = controller.name().to_string();
        event.data = Some(format!("{found} device(s) found"));
        inner.dispatcher.dispatch(event);
    }
}

/// Announces registry churn: one `system-update` with current counts, plus
/// a `TYPE` update per already-discovered device so late-joining handlers
/// can rebuild their picture.
fn send_system_update(inner: &Arc<Inner>) {
    let controllers: Vec<Arc<Controller>> = read_lock(&inner.controllers)
        .values()
        .map(|handle| Arc::clone(&handle.controller))
        .collect();

    let mut event = Event::new(EventKind::Controller, 0, Action::SystemUpdate);
    event.data = Some(format!(
        "controllers={},handlers={}",
        controllers.len(),
        inner.dispatcher.handler_count()
    ));
    inner.dispatcher.dispatch(event);

    for controller in controllers {
        for (address, model) in controller.known_device_models() {
            let mut update = Event::new(EventKind::Device, address, Action::Update);
            update.controller = controller.name().to_string();
            update.data = Some(format!("TYPE={model}"));
            inner.dispatcher.dispatch(update);
        }
    }
}
