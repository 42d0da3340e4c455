//! Per-controller protocol engine: feedback routing, the two-tier outbound
//! command queue, and the pacing loop that drains it.
//!
//! One controller owns one serial link and up to 1000 addressed devices.
//! Its ingestion loop decodes lines strictly in arrival order; its pacing
//! loop writes at most one command per tick so the half-duplex hardware is
//! never flooded.

use crate::device::{Device, DeviceContext, DeviceKind};
use crate::events::{Action, Dispatcher, Event, EventKind};
use crate::protocol::{
    decode_feedback, rfid_status_probe, type_probe, Feedback, FeedbackKind, LINE_TERMINATOR,
    MAX_DEVICE_ADDRESS,
};
use crate::transport::PortDescriptor;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, trace, warn};

/// Pending commands per tier. Generous for a link that drains four
/// commands a second; hitting it means the caller is flooding.
pub const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("command queue full ({tier:?} tier)")]
    QueueFull { tier: QueueTier },
}

/// Priority class of an outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTier {
    /// Discovery/maintenance traffic; always drained first.
    System,
    /// Application traffic.
    User,
}

/// Two-tier FIFO of pending command strings.
///
/// `system` is drained before `user` whenever both are non-empty; order
/// within each tier is preserved.
#[derive(Debug, Default)]
pub struct CommandQueue {
    system: Deque<String, QUEUE_CAPACITY>,
    user: Deque<String, QUEUE_CAPACITY>,
}

impl CommandQueue {
    pub fn push(&mut self, tier: QueueTier, cmd: String) -> Result<(), ControllerError> {
        let queue = match tier {
            QueueTier::System => &mut self.system,
            QueueTier::User => &mut self.user,
        };
        queue
            .push_back(cmd)
            .map_err(|_| ControllerError::QueueFull { tier })
    }

    pub fn pop(&mut self) -> Option<String> {
        self.system.pop_front().or_else(|| self.user.pop_front())
    }

    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// Snapshot of one connected controller, for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub name: String,
    pub is_usb: bool,
    pub vendor_id: String,
    pub product_id: String,
    pub device_count: usize,
    pub ready: bool,
}

/// One Nexmosphere controller on one serial link.
pub struct Controller {
    descriptor: PortDescriptor,
    devices: Mutex<HashMap<u16, Device>>,
    queue: Mutex<CommandQueue>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    dispatcher: Arc<Dispatcher>,
    /// Monotonic false→true; guards the ready event against the discovery
    /// counter and the grace timeout both firing.
    ready: AtomicBool,
    pending_queries: AtomicUsize,
}

impl Controller {
    pub(crate) fn new(
        descriptor: PortDescriptor,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            descriptor,
            devices: Mutex::new(HashMap::new()),
            queue: Mutex::new(CommandQueue::default()),
            writer: tokio::sync::Mutex::new(writer),
            dispatcher,
            ready: AtomicBool::new(false),
            pending_queries: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ControllerInfo {
        let device_count = lock(&self.devices)
            .values()
            .filter(|d| !d.model.is_empty())
            .count();
        ControllerInfo {
            name: self.descriptor.name.clone(),
            is_usb: self.descriptor.is_usb,
            vendor_id: self.descriptor.vendor_id.clone(),
            product_id: self.descriptor.product_id.clone(),
            device_count,
            ready: self.is_ready(),
        }
    }

    /// Appends a command to the given tier. The pacing loop writes it out
    /// on a later tick; enqueueing never touches the wire directly.
    pub fn enqueue(&self, tier: QueueTier, cmd: String) -> Result<(), ControllerError> {
        lock(&self.queue).push(tier, cmd)
    }

    /// Non-empty model strings per discovered device, keyed by address.
    pub(crate) fn known_device_models(&self) -> Vec<(u16, String)> {
        lock(&self.devices)
            .iter()
            .filter(|(_, d)| !d.model.is_empty())
            .map(|(addr, d)| (*addr, d.model.clone()))
            .collect()
    }

    pub(crate) fn set_hold_interval(&self, address: u16, interval: Duration) {
        let mut devices = lock(&self.devices);
        devices.entry(address).or_default().hold_tick_interval = interval;
    }

    /// Arms the discovery batch: one `TYPE` probe per address on the
    /// system tier, counter set to the batch size.
    pub(crate) fn begin_discovery(&self, probe_count: u16) {
        self.pending_queries
            .store(probe_count as usize, Ordering::Release);
        for address in 1..=probe_count {
            debug!(controller = %self.name(), address, "sending info request");
            if let Err(e) = self.enqueue(QueueTier::System, type_probe(address)) {
                warn!(controller = %self.name(), "discovery probe dropped: {e}");
            }
        }
    }

    pub(crate) fn pending_queries(&self) -> usize {
        self.pending_queries.load(Ordering::Acquire)
    }

    /// Flips the controller ready exactly once; returns whether this call
    /// won the race.
    pub(crate) fn mark_ready(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancels every live hold notifier. Part of teardown; the ingestion
    /// loop never does this on its own.
    pub(crate) fn cancel_hold_tasks(&self) {
        for device in lock(&self.devices).values_mut() {
            device.cancel_hold_tasks();
        }
    }

    /// Reads lines until EOF or a read error, routing each one.
    ///
    /// Strict arrival order: the next line is not read until the current
    /// one has been fully handled and its events handed to the dispatcher.
    pub(crate) async fn run_ingestion(
        self: Arc<Self>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> std::io::Result<()> {
        let mut lines = BufReader::new(reader).lines();
        let mut last_feedback: Option<Feedback> = None;
        while let Some(line) = lines.next_line().await? {
            self.handle_line(&line, &mut last_feedback);
        }
        Ok(())
    }

    /// Decodes one line and routes it by protocol class.
    ///
    /// `last_feedback` advances only when the class handler produced a
    /// primary event, so unparseable or unknown lines cannot corrupt the
    /// RFID correlation state.
    pub(crate) fn handle_line(&self, line: &str, last_feedback: &mut Option<Feedback>) {
        let Some(fb) = decode_feedback(line) else {
            trace!(controller = %self.name(), line, "unparseable line skipped");
            return;
        };

        let event = match fb.kind {
            FeedbackKind::RfidTag => Some(self.on_rfid_tag(&fb)),
            FeedbackKind::DeviceTalk => self.on_device_talk(&fb, last_feedback.as_ref()),
            FeedbackKind::Diagnostic => self.on_diagnostic(&fb),
            FeedbackKind::Other => None,
        };

        if let Some(event) = event {
            self.dispatcher.dispatch(event);
            *last_feedback = Some(fb);
        }
    }

    /// Writes one command per tick, system tier first. Runs until aborted.
    pub(crate) async fn run_pacing(self: Arc<Self>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cmd = lock(&self.queue).pop();
            if let Some(cmd) = cmd {
                if let Err(e) = self.write_command(&cmd).await {
                    error!(controller = %self.name(), "can't write to serial: {e}");
                }
            }
        }
    }

    /// Frames and writes a single command.
    pub(crate) async fn write_command(&self, cmd: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("{cmd}{LINE_TERMINATOR}").as_bytes())
            .await?;
        writer.flush().await
    }

    /// RFID tag protocol (`XR`): the first two payload letters name the
    /// movement.
    fn on_rfid_tag(&self, fb: &Feedback) -> Event {
        let action = match fb.command.get(..2) {
            Some("PU") => Action::Pickup,
            Some("PB") => Action::Putback,
            _ => Action::Unknown,
        };
        let mut event = Event::new(EventKind::RfidTag, fb.address, action);
        event.controller = self.name().to_string();
        event.raw = Some(fb.raw.clone());
        event
    }

    /// X-Talk device feedback: routed by the behavior pinned at discovery.
    fn on_device_talk(&self, fb: &Feedback, last_feedback: Option<&Feedback>) -> Option<Event> {
        let mut devices = lock(&self.devices);
        let device = devices.entry(fb.address).or_default();

        match device.kind {
            DeviceKind::ButtonPanel => {
                if fb.format == Some('A') {
                    let ctx = DeviceContext {
                        controller: self.name(),
                        dispatcher: &self.dispatcher,
                    };
                    device.apply_button_mask(fb, &ctx);
                }
                None
            }
            DeviceKind::PresenceSensor => {
                let mut event = device.process_presence(fb)?;
                event.controller = self.name().to_string();
                Some(event)
            }
            DeviceKind::RfidReader => {
                drop(devices);
                self.on_rfid_reader(fb, last_feedback)
            }
            DeviceKind::Unknown => None,
        }
    }

    /// RFID reader feedback (XRDR1).
    ///
    /// Format `A` reports a presence change without naming the antenna; the
    /// antenna is taken from the most recent feedback line, which the
    /// hardware sends immediately before. Format `B` is a full status dump:
    /// one extra putback per non-zero `d`-prefixed token.
    fn on_rfid_reader(&self, fb: &Feedback, last_feedback: Option<&Feedback>) -> Option<Event> {
        let mut event = Event::new(EventKind::RfidAntenna, fb.address, Action::Status);
        event.controller = self.name().to_string();
        event.raw = Some(fb.raw.clone());

        match fb.format {
            Some('A') => {
                event.action = match fb.command.as_str() {
                    "1" => Action::Pickup,
                    "0" => Action::Putback,
                    _ => return None,
                };
                event.data = last_feedback.map(|last| format!("{:03}", last.address));
                Some(event)
            }
            Some('B') => {
                for tag in fb.command.split(' ') {
                    let address: u16 = tag.trim_start_matches('d').parse().unwrap_or(0);
                    if address == 0 {
                        continue;
                    }
                    let mut tag_event =
                        Event::new(EventKind::RfidAntenna, fb.address, Action::Putback);
                    tag_event.controller = self.name().to_string();
                    tag_event.data = Some(format!("{address:03}"));
                    tag_event.raw = Some(fb.raw.clone());
                    self.dispatcher.dispatch(tag_event);
                }
                Some(event)
            }
            _ => None,
        }
    }

    /// Diagnostic feedback (`D`): `KEY=VALUE` updates against the addressed
    /// device. `TYPE` answers also drive the readiness countdown.
    fn on_diagnostic(&self, fb: &Feedback) -> Option<Event> {
        let (key, value) = fb.command.split_once('=')?;
        if fb.address > MAX_DEVICE_ADDRESS {
            return None;
        }

        {
            let mut devices = lock(&self.devices);
            let device = devices.entry(fb.address).or_default();
            match key {
                "TYPE" => {
                    device.set_model(value);
                    // Readers answer the status probe with their current
                    // tag population, so ask right away.
                    if device.kind == DeviceKind::RfidReader {
                        drop(devices);
                        if let Err(e) =
                            self.enqueue(QueueTier::System, rfid_status_probe(fb.address))
                        {
                            warn!(controller = %self.name(), "status probe dropped: {e}");
                        }
                    }
                    self.note_query_answered();
                }
                "SERIAL" => {
                    device.serial = Some(value.to_string());
                }
                _ => {}
            }
        }

        let mut event = Event::new(EventKind::Device, fb.address, Action::Update);
        event.controller = self.name().to_string();
        event.data = Some(fb.command.clone());
        event.raw = Some(fb.raw.clone());
        Some(event)
    }

    /// Counts down one discovery answer; flips ready when the batch is
    /// complete and the grace timeout has not already done so.
    fn note_query_answered(&self) {
        let outcome =
            self.pending_queries
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                    pending.checked_sub(1)
                });
        if outcome == Ok(1) && self.mark_ready() {
            info!(controller = %self.name(), "controller ready - all devices initialized");
            let mut event = Event::new(EventKind::Controller, 0, Action::Ready);
            event.controller = self.name().to_string();
            event.data = Some("All devices initialized".to_string());
            self.dispatcher.dispatch(event);
        }
    }
}

// Nothing holds these locks across awaits, so poisoning means a panic in
// straight-line state code; the state is still coherent enough to carry on.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_controller() -> (Arc<Controller>, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::default());
        let descriptor = PortDescriptor {
            name: "ttyUSB0".to_string(),
            is_usb: true,
            vendor_id: "067b".to_string(),
            product_id: "2303".to_string(),
        };
        let controller = Arc::new(Controller::new(
            descriptor,
            Box::new(tokio::io::sink()),
            Arc::clone(&dispatcher),
        ));
        (controller, dispatcher)
    }

    fn collector(dispatcher: &Dispatcher) -> Arc<StdMutex<Vec<Event>>> {
        let events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dispatcher.add_handler(Arc::new(move |event: Event| {
            sink.lock().unwrap().push(event);
        }));
        events
    }

    async fn drain_dispatch() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_rfid_tag_events() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("XR[PU045]", &mut last);
        controller.handle_line("XR[PB012]", &mut last);
        controller.handle_line("XR[ZZ001]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::RfidTag);
        assert_eq!(events[0].action, Action::Pickup);
        assert_eq!(events[0].address, 45);
        assert_eq!(events[1].action, Action::Putback);
        assert_eq!(events[1].address, 12);
        assert_eq!(events[2].action, Action::Unknown);
        // All three produced events, so correlation state advanced.
        assert_eq!(last.as_ref().unwrap().address, 1);
    }

    #[tokio::test]
    async fn test_diagnostic_type_discovery() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("D003B[TYPE=XTB4N6]", &mut last);
        controller.handle_line("D003B[SERIAL=ABC123]", &mut last);
        controller.handle_line("D003B[FWVERSION=1.2]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == EventKind::Device));
        assert!(events.iter().all(|e| e.action == Action::Update));
        assert_eq!(events[0].data.as_deref(), Some("TYPE=XTB4N6"));
        assert_eq!(events[1].data.as_deref(), Some("SERIAL=ABC123"));
        // Unknown keys still surface as device updates.
        assert_eq!(events[2].data.as_deref(), Some("FWVERSION=1.2"));

        let models = controller.known_device_models();
        assert_eq!(models, vec![(3, "XTB4N6".to_string())]);
    }

    #[tokio::test]
    async fn test_diagnostic_out_of_scope() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        // No key=value split: unhandled, no event, no correlation update.
        controller.handle_line("D003B[PING]", &mut last);
        drain_dispatch().await;

        assert!(events.lock().unwrap().is_empty());
        assert!(last.is_none());
    }

    #[tokio::test]
    async fn test_rfid_reader_discovery_queues_status_probe() {
        let (controller, dispatcher) = test_controller();
        let _events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("D002B[TYPE=XRDR1]", &mut last);
        drain_dispatch().await;

        // The status probe rides the system tier.
        assert_eq!(lock(&controller.queue).pop().as_deref(), Some("X002B[]"));
    }

    #[tokio::test]
    async fn test_rfid_reader_status_dump() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("D010B[TYPE=XRDR1]", &mut last);
        controller.handle_line("X010B[d012 d000 d033]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let putbacks: Vec<&Event> = events
            .iter()
            .filter(|e| e.kind == EventKind::RfidAntenna && e.action == Action::Putback)
            .collect();
        assert_eq!(putbacks.len(), 2);
        assert_eq!(putbacks[0].data.as_deref(), Some("012"));
        assert_eq!(putbacks[1].data.as_deref(), Some("033"));
        assert!(putbacks.iter().all(|e| e.address == 10));

        // The dump itself surfaces as one status event.
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::RfidAntenna && e.action == Action::Status));
    }

    #[tokio::test]
    async fn test_rfid_reader_correlates_last_antenna() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("D002B[TYPE=XRDR1]", &mut last);
        // The antenna reports the tag first; the reader's presence change
        // follows without naming it.
        controller.handle_line("XR[PB033]", &mut last);
        controller.handle_line("X002A[1]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let pickup = events
            .iter()
            .find(|e| e.kind == EventKind::RfidAntenna && e.action == Action::Pickup)
            .unwrap();
        assert_eq!(pickup.address, 2);
        assert_eq!(pickup.data.as_deref(), Some("033"));
    }

    #[tokio::test]
    async fn test_rfid_reader_pickup_without_prior_feedback() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);

        // Fresh correlation state: pickup has no antenna to point at.
        let mut last = None;
        controller.handle_line("X002A[1]", &mut last);
        drain_dispatch().await;
        assert!(events.lock().unwrap().is_empty()); // device still unknown

        controller.handle_line("D002B[TYPE=XRDR1]", &mut last);
        last = None;
        controller.handle_line("X002A[1]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let pickup = events
            .iter()
            .find(|e| e.action == Action::Pickup)
            .unwrap();
        assert_eq!(pickup.data, None);
    }

    #[tokio::test]
    async fn test_unknown_device_and_unparseable_lines_keep_correlation() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.handle_line("XR[PU045]", &mut last);
        drain_dispatch().await;
        assert_eq!(events.lock().unwrap().len(), 1);

        // Unknown device type, garbage, unknown class: no events, and the
        // correlation state still points at the tag line.
        controller.handle_line("X099A[1]", &mut last);
        controller.handle_line("not a protocol line", &mut last);
        controller.handle_line("Q001A[1]", &mut last);
        drain_dispatch().await;

        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(last.as_ref().unwrap().address, 45);
    }

    #[tokio::test]
    async fn test_discovery_countdown_flips_ready_once() {
        let (controller, dispatcher) = test_controller();
        let events = collector(&dispatcher);
        let mut last = None;

        controller.begin_discovery(2);
        assert_eq!(controller.pending_queries(), 2);
        assert!(!controller.is_ready());

        controller.handle_line("D001B[TYPE=XTB4N6]", &mut last);
        assert!(!controller.is_ready());
        controller.handle_line("D002B[TYPE=XY240]", &mut last);
        assert!(controller.is_ready());

        // Late answers must not fire a second ready event.
        controller.handle_line("D003B[TYPE=XTB4N6]", &mut last);
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let ready: Vec<&Event> = events
            .iter()
            .filter(|e| e.kind == EventKind::Controller && e.action == Action::Ready)
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].data.as_deref(), Some("All devices initialized"));
        assert!(!controller.mark_ready());
    }

    #[test]
    fn test_queue_fifo_within_tier() {
        let mut queue = CommandQueue::default();
        queue.push(QueueTier::User, "a".into()).unwrap();
        queue.push(QueueTier::User, "b".into()).unwrap();
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_queue_system_tier_priority() {
        let mut queue = CommandQueue::default();
        queue.push(QueueTier::User, "user1".into()).unwrap();
        queue.push(QueueTier::System, "sys1".into()).unwrap();
        queue.push(QueueTier::User, "user2".into()).unwrap();
        queue.push(QueueTier::System, "sys2".into()).unwrap();

        assert_eq!(queue.pop().as_deref(), Some("sys1"));
        assert_eq!(queue.pop().as_deref(), Some("sys2"));
        assert_eq!(queue.pop().as_deref(), Some("user1"));
        assert_eq!(queue.pop().as_deref(), Some("user2"));
    }

    #[test]
    fn test_queue_capacity() {
        let mut queue = CommandQueue::default();
        for i in 0..QUEUE_CAPACITY {
            queue.push(QueueTier::User, format!("cmd{i}")).unwrap();
        }
        let overflow = queue.push(QueueTier::User, "one too many".into());
        assert!(matches!(
            overflow,
            Err(ControllerError::QueueFull {
                tier: QueueTier::User
            })
        ));
        // The other tier is unaffected.
        queue.push(QueueTier::System, "sys".into()).unwrap();
        assert_eq!(queue.len(), QUEUE_CAPACITY + 1);
    }
}
