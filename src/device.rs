//! Per-address device model and its feedback state machines.
//!
//! A device is lazily created the first time its address shows up on the
//! wire and lives for its controller's lifetime. Behavior is selected once,
//! when the `TYPE` diagnostic names the model — not re-matched per line.

use crate::events::{Action, Dispatcher, Event, EventKind};
use crate::protocol::Feedback;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const BUTTON_COUNT: usize = 4;

/// Hold events tick at this rate unless reconfigured; zero disables them.
pub const DEFAULT_HOLD_TICK_INTERVAL: Duration = Duration::from_millis(500);

pub const MODEL_BUTTON_PANEL: &str = "XTB4N6";
pub const MODEL_RFID_READER: &str = "XRDR1";
pub const MODEL_PRESENCE_SENSOR: &str = "XY240";

/// Closed set of device behaviors, chosen when the model is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    /// XT-B4 four-button push panel.
    ButtonPanel,
    /// XRDR1 RFID reader.
    RfidReader,
    /// X-Eye presence & air-button sensor.
    PresenceSensor,
    #[default]
    Unknown,
}

impl DeviceKind {
    pub fn from_model(model: &str) -> Self {
        match model {
            MODEL_BUTTON_PANEL => DeviceKind::ButtonPanel,
            MODEL_RFID_READER => DeviceKind::RfidReader,
            MODEL_PRESENCE_SENSOR => DeviceKind::PresenceSensor,
            _ => DeviceKind::Unknown,
        }
    }
}

/// One physical button on a panel.
///
/// `pressed` is true only while `closed` is true, and a hold task exists
/// only while `pressed` is true.
#[derive(Debug, Default)]
pub struct Button {
    /// Raw contact state (wire closed).
    pub closed: bool,
    /// Debounced logical state.
    pub pressed: bool,
    pressed_at: Option<Instant>,
    hold_task: Option<JoinHandle<()>>,
}

/// One addressed sensor/actuator behind a controller.
#[derive(Debug)]
pub struct Device {
    pub model: String,
    pub kind: DeviceKind,
    pub serial: Option<String>,
    /// Interval between `hold` events while a button stays pressed.
    /// Zero disables hold notifications. Changing it does not disturb an
    /// in-flight press.
    pub hold_tick_interval: Duration,
    buttons: [Button; BUTTON_COUNT],
}

impl Default for Device {
    fn default() -> Self {
        Self {
            model: String::new(),
            kind: DeviceKind::Unknown,
            serial: None,
            hold_tick_interval: DEFAULT_HOLD_TICK_INTERVAL,
            buttons: Default::default(),
        }
    }
}

/// Dispatch context threaded into device state machines.
pub(crate) struct DeviceContext<'a> {
    pub controller: &'a str,
    pub dispatcher: &'a Arc<Dispatcher>,
}

impl Device {
    /// Records the discovered model string and pins the behavior variant.
    pub fn set_model(&mut self, model: &str) {
        self.model = model.to_string();
        self.kind = DeviceKind::from_model(model);
    }

    pub fn button(&self, button_id: usize) -> Option<&Button> {
        (1..=BUTTON_COUNT)
            .contains(&button_id)
            .then(|| &self.buttons[button_id - 1])
    }

    /// Applies a button-panel status word (format `A`): bit *b-1* of the
    /// decoded integer is the contact state of button *b*.
    pub(crate) fn apply_button_mask(&mut self, fb: &Feedback, ctx: &DeviceContext<'_>) {
        let mask: u8 = fb.command.parse().unwrap_or(0);
        for button_id in 1..=BUTTON_COUNT {
            let closed = mask & (1 << (button_id - 1)) != 0;
            self.set_button(button_id, closed, fb, ctx);
        }
    }

    /// Drives one button through a contact-state transition, emitting the
    /// debounced event sequence (`closed`/`press` on close, `open`/`release`
    /// with duration on open) and managing the hold notifier task.
    pub(crate) fn set_button(
        &mut self,
        button_id: usize,
        state: bool,
        fb: &Feedback,
        ctx: &DeviceContext<'_>,
    ) {
        if !(1..=BUTTON_COUNT).contains(&button_id) {
            return;
        }
        let hold_interval = self.hold_tick_interval;
        let button = &mut self.buttons[button_id - 1];

        if button.closed == state {
            return;
        }
        button.closed = state;

        let mut event = Event::new(EventKind::Button, fb.address, Action::Closed);
        event.controller = ctx.controller.to_string();
        event.data = Some(format!("{button_id:02}"));
        event.raw = Some(fb.raw.clone());

        if state {
            button.pressed_at = Some(Instant::now());
        } else {
            event.action = Action::Open;
            if let Some(pressed_at) = button.pressed_at.take() {
                event.duration_ms = Some(pressed_at.elapsed().as_millis() as u64);
            }
            // Hold task must be gone before the logical state clears.
            if let Some(task) = button.hold_task.take() {
                task.abort();
            }
            button.pressed = false;
        }

        ctx.dispatcher.dispatch(event.clone());

        if !state {
            let mut release = event;
            release.action = Action::Release;
            ctx.dispatcher.dispatch(release);
            return;
        }

        if !button.pressed {
            button.pressed = true;
            let mut press = event;
            press.action = Action::Press;
            ctx.dispatcher.dispatch(press.clone());

            if hold_interval > Duration::ZERO {
                let pressed_at = button.pressed_at.unwrap_or_else(Instant::now);
                button.hold_task = Some(spawn_hold_notifier(
                    press,
                    pressed_at,
                    hold_interval,
                    Arc::clone(ctx.dispatcher),
                ));
            }
        }
    }

    /// Aborts any live hold notifier tasks. Called on controller teardown
    /// so no periodic task outlives its closed stream.
    pub(crate) fn cancel_hold_tasks(&mut self) {
        for button in &mut self.buttons {
            if let Some(task) = button.hold_task.take() {
                task.abort();
            }
        }
    }

    /// Presence sensor (X-Eye) format `B`: `Dz=<zone>` reports the current
    /// detection zone; anything else yields no event.
    pub(crate) fn process_presence(&self, fb: &Feedback) -> Option<Event> {
        if fb.format != Some('B') {
            return None;
        }
        let (key, value) = fb.command.split_once('=')?;
        match key {
            "Dz" => {
                let mut event = Event::new(EventKind::Presence, fb.address, Action::DetectionZone);
                event.data = Some(value.to_string());
                event.raw = Some(fb.raw.clone());
                Some(event)
            }
            _ => None,
        }
    }
}

fn spawn_hold_notifier(
    template: Event,
    pressed_at: Instant,
    interval: Duration,
    dispatcher: Arc<Dispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick of a tokio interval completes immediately; the first
        // hold event belongs one full interval after the press.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut hold = template.clone();
            hold.action = Action::Hold;
            hold.duration_ms = Some(pressed_at.elapsed().as_millis() as u64);
            dispatcher.dispatch(hold);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_feedback;
    use std::sync::Mutex;

    fn collector(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<Event>>> {
        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dispatcher.add_handler(Arc::new(move |event: Event| {
            sink.lock().unwrap().push(event);
        }));
        events
    }

    /// Lets spawned delivery tasks run on the test runtime.
    async fn drain_dispatch() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn feed(device: &mut Device, dispatcher: &Arc<Dispatcher>, line: &str) {
        let fb = decode_feedback(line).unwrap();
        let ctx = DeviceContext {
            controller: "ttyUSB0",
            dispatcher,
        };
        device.apply_button_mask(&fb, &ctx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_debounce_sequence() {
        let dispatcher = Arc::new(Dispatcher::default());
        let events = collector(&dispatcher);
        let mut device = Device::default();
        device.set_model(MODEL_BUTTON_PANEL);

        feed(&mut device, &dispatcher, "X001A[1]");
        tokio::time::sleep(Duration::from_millis(120)).await;
        feed(&mut device, &dispatcher, "X001A[0]");
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let actions: Vec<Action> = events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![Action::Closed, Action::Press, Action::Open, Action::Release]
        );
        // Open and release both carry the press duration.
        assert_eq!(events[2].duration_ms, Some(120));
        assert_eq!(events[3].duration_ms, Some(120));
        assert_eq!(events[0].data.as_deref(), Some("01"));
        assert_eq!(events[0].controller, "ttyUSB0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_unchanged_state_is_noop() {
        let dispatcher = Arc::new(Dispatcher::default());
        let events = collector(&dispatcher);
        let mut device = Device::default();
        device.set_model(MODEL_BUTTON_PANEL);

        feed(&mut device, &dispatcher, "X001A[1]");
        feed(&mut device, &dispatcher, "X001A[1]");
        drain_dispatch().await;

        assert_eq!(events.lock().unwrap().len(), 2); // closed + press, once
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_mask_drives_buttons_independently() {
        let dispatcher = Arc::new(Dispatcher::default());
        let events = collector(&dispatcher);
        let mut device = Device::default();
        device.set_model(MODEL_BUTTON_PANEL);
        device.hold_tick_interval = Duration::ZERO;

        // Bit 0 = button 1, bit 2 = button 3.
        feed(&mut device, &dispatcher, "X001A[5]");
        drain_dispatch().await;

        let events = events.lock().unwrap();
        let pressed: Vec<&str> = events
            .iter()
            .filter(|e| e.action == Action::Press)
            .filter_map(|e| e.data.as_deref())
            .collect();
        assert_eq!(pressed, vec!["01", "03"]);
        assert!(device.button(1).unwrap().pressed);
        assert!(!device.button(2).unwrap().pressed);
        assert!(device.button(3).unwrap().pressed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_events_tick_while_pressed() {
        let dispatcher = Arc::new(Dispatcher::default());
        let events = collector(&dispatcher);
        let mut device = Device::default();
        device.set_model(MODEL_BUTTON_PANEL);
        device.hold_tick_interval = Duration::from_millis(100);

        feed(&mut device, &dispatcher, "X001A[1]");
        tokio::time::sleep(Duration::from_millis(350)).await;
        drain_dispatch().await;
        feed(&mut device, &dispatcher, "X001A[0]");
        drain_dispatch().await;

        let snapshot: Vec<Event> = events.lock().unwrap().clone();
        let holds: Vec<&Event> = snapshot
            .iter()
            .filter(|e| e.action == Action::Hold)
            .collect();
        assert!(holds.len() >= 3, "expected >=3 holds, got {}", holds.len());
        // Hold durations grow with the press.
        assert_eq!(holds[0].duration_ms, Some(100));
        assert_eq!(holds[1].duration_ms, Some(200));

        // Release cancels the notifier: no further holds accumulate.
        let count_after_release = snapshot.len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        drain_dispatch().await;
        assert_eq!(events.lock().unwrap().len(), count_after_release);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_hold() {
        let dispatcher = Arc::new(Dispatcher::default());
        let events = collector(&dispatcher);
        let mut device = Device::default();
        device.set_model(MODEL_BUTTON_PANEL);
        device.hold_tick_interval = Duration::ZERO;

        feed(&mut device, &dispatcher, "X001A[1]");
        tokio::time::sleep(Duration::from_millis(800)).await;
        drain_dispatch().await;

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.action != Action::Hold));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_detection_zone() {
        let device = Device::default();
        let fb = decode_feedback("X005B[Dz=2]").unwrap();
        let event = device.process_presence(&fb).unwrap();
        assert_eq!(event.kind, EventKind::Presence);
        assert_eq!(event.action, Action::DetectionZone);
        assert_eq!(event.data.as_deref(), Some("2"));

        // Unknown key or malformed payload yields nothing.
        assert!(device
            .process_presence(&decode_feedback("X005B[Xq=2]").unwrap())
            .is_none());
        assert!(device
            .process_presence(&decode_feedback("X005B[Dz]").unwrap())
            .is_none());
        // Wrong format letter yields nothing.
        assert!(device
            .process_presence(&decode_feedback("X005A[Dz=2]").unwrap())
            .is_none());
    }

    #[test]
    fn test_kind_from_model() {
        assert_eq!(DeviceKind::from_model("XTB4N6"), DeviceKind::ButtonPanel);
        assert_eq!(DeviceKind::from_model("XRDR1"), DeviceKind::RfidReader);
        assert_eq!(DeviceKind::from_model("XY240"), DeviceKind::PresenceSensor);
        assert_eq!(DeviceKind::from_model("XTB4N"), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_model(""), DeviceKind::Unknown);
    }

    #[test]
    fn test_set_model_pins_behavior() {
        let mut device = Device::default();
        device.set_model("XRDR1");
        assert_eq!(device.model, "XRDR1");
        assert_eq!(device.kind, DeviceKind::RfidReader);
    }

    #[test]
    fn test_button_accessor_bounds() {
        let device = Device::default();
        assert!(device.button(0).is_none());
        assert!(device.button(1).is_some());
        assert!(device.button(BUTTON_COUNT).is_some());
        assert!(device.button(BUTTON_COUNT + 1).is_none());
    }
}
