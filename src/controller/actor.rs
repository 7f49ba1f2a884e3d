//! Per-controller serial processing
//!
//! Each [`Controller`] is a handle onto a task that owns the controller's
//! state. Messages and state inspections are applied strictly in the order
//! they were enqueued, and observers run inside that task.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::protocol::{ButtonKind, ControllerIndex, GamepadLayout, JoystickKind};

use super::reducer::{reduce, ControllerMessage};
use super::state::{ControllerSnapshot, ControllerState, ObserverId, StateChange};

/// Tuning for a controller's message processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Coalesce button and joystick changes per input within this window
    pub coalesce: Option<Duration>,
}

impl ControllerOptions {
    pub fn coalescing(interval: Duration) -> Self {
        Self {
            coalesce: Some(interval),
        }
    }
}

type Inspector = Box<dyn FnOnce(&mut ControllerState) + Send>;

enum Command {
    Message(ControllerMessage),
    Inspect(Inspector),
}

/// Handle onto a controller's processing task
#[derive(Debug, Clone)]
pub struct Controller {
    index: ControllerIndex,
    sender: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Message(message) => f.debug_tuple("Message").field(message).finish(),
            Command::Inspect(_) => f.write_str("Inspect"),
        }
    }
}

impl Controller {
    /// Spawn a controller task on the current runtime
    pub fn spawn(index: ControllerIndex, layout: GamepadLayout) -> Self {
        Self::with_options(index, layout, ControllerOptions::default())
    }

    pub fn with_options(
        index: ControllerIndex,
        layout: GamepadLayout,
        options: ControllerOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = ControllerActor {
            state: ControllerState::new(layout),
            coalescer: options.coalesce.map(Coalescer::new),
            receiver,
        };
        tokio::spawn(actor.run());

        Self { index, sender }
    }

    pub fn index(&self) -> ControllerIndex {
        self.index
    }

    /// Enqueue a message; returns false once the controller task has ended
    pub fn send(&self, message: impl Into<ControllerMessage>) -> bool {
        self.sender.send(Command::Message(message.into())).is_ok()
    }

    /// Run `f` against the state inside the controller's task
    pub fn with_state<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut ControllerState) + Send + 'static,
    {
        self.sender.send(Command::Inspect(Box::new(f))).is_ok()
    }

    /// Register a listener for every field change
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        let id = ObserverId::next();
        self.with_state(move |state| state.insert_listener(id, Box::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.with_state(move |state| state.remove_listener(id));
    }

    /// Copy of the state once every previously enqueued message is applied
    pub async fn snapshot(&self) -> Option<ControllerSnapshot> {
        let (reply, response) = oneshot::channel();
        self.with_state(move |state| {
            let _ = reply.send(state.snapshot());
        });
        response.await.ok()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

struct ControllerActor {
    state: ControllerState,
    coalescer: Option<Coalescer>,
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl ControllerActor {
    async fn run(mut self) {
        loop {
            let deadline = self.coalescer.as_ref().and_then(Coalescer::next_deadline);

            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(Command::Message(message)) => self.admit(message),
                        Some(Command::Inspect(inspect)) => inspect(&mut self.state),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let released = self
                        .coalescer
                        .as_mut()
                        .map(|coalescer| coalescer.expire(Instant::now()))
                        .unwrap_or_default();
                    for message in released {
                        reduce(&mut self.state, message);
                    }
                }
            }
        }
    }

    fn admit(&mut self, message: ControllerMessage) {
        let message = match self.coalescer.as_mut() {
            Some(coalescer) => coalescer.admit(message, Instant::now()),
            None => Some(message),
        };
        if let Some(message) = message {
            reduce(&mut self.state, message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InputKey {
    Button(ButtonKind),
    Joystick(JoystickKind),
}

#[derive(Debug)]
struct Window {
    closes_at: Instant,
    pending: Option<ControllerMessage>,
}

/// Per-input rate limiting: the first change passes, later changes inside
/// the window collapse onto the latest one, released when the window closes
#[derive(Debug)]
struct Coalescer {
    interval: Duration,
    windows: HashMap<InputKey, Window>,
}

impl Coalescer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            windows: HashMap::new(),
        }
    }

    fn admit(&mut self, message: ControllerMessage, now: Instant) -> Option<ControllerMessage> {
        let key = match &message {
            ControllerMessage::ButtonChanged(kind, _) => InputKey::Button(*kind),
            ControllerMessage::JoystickChanged(kind, _) => InputKey::Joystick(*kind),
            _ => return Some(message),
        };

        match self.windows.get_mut(&key) {
            Some(window) => {
                window.pending = Some(message);
                None
            }
            None => {
                self.windows.insert(
                    key,
                    Window {
                        closes_at: now + self.interval,
                        pending: None,
                    },
                );
                Some(message)
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.windows.values().map(|window| window.closes_at).min()
    }

    /// Release pending values of closed windows; a released value opens a new window
    fn expire(&mut self, now: Instant) -> Vec<ControllerMessage> {
        let mut released = Vec::new();
        let interval = self.interval;
        self.windows.retain(|_, window| {
            if window.closes_at > now {
                return true;
            }
            match window.pending.take() {
                Some(message) => {
                    released.push(message);
                    window.closes_at = now + interval;
                    true
                }
                None => false,
            }
        });
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ButtonState, ConnectionStatus, JoystickState};

    fn collect_changes(controller: &Controller) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        controller.observe(move |change| {
            let _ = tx.send(change.clone());
        });
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StateChange>) -> Vec<StateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        changes
    }

    #[tokio::test]
    async fn test_messages_apply_in_order() {
        let controller = Controller::spawn(0, GamepadLayout::Regular);
        let mut rx = collect_changes(&controller);

        for step in 0..50 {
            let value = step as f32 / 50.0;
            controller.send(ControllerMessage::ButtonChanged(ButtonKind::A, ButtonState::new(value, true)));
        }
        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.gamepad.button_a, ButtonState::new(49.0 / 50.0, true));

        let values: Vec<f32> = drain(&mut rx)
            .into_iter()
            .map(|change| match change {
                StateChange::Button { new: Some(state), .. } => state.value,
                other => panic!("unexpected change {other:?}"),
            })
            .collect();
        let expected: Vec<f32> = (0..50).map(|step| step as f32 / 50.0).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_concurrent_senders_keep_per_sender_order() {
        let controller = Controller::spawn(0, GamepadLayout::Extended);
        let mut rx = collect_changes(&controller);

        let buttons = controller.clone();
        let sticks = controller.clone();
        let a = tokio::spawn(async move {
            for step in 0..20 {
                buttons.send(ControllerMessage::ButtonChanged(ButtonKind::X, ButtonState::new(step as f32, false)));
                tokio::task::yield_now().await;
            }
        });
        let b = tokio::spawn(async move {
            for step in 0..20 {
                sticks.send(ControllerMessage::JoystickChanged(JoystickKind::Dpad, JoystickState::new(step as f32, 0.0)));
                tokio::task::yield_now().await;
            }
        });
        a.await.unwrap();
        b.await.unwrap();
        controller.snapshot().await.unwrap();

        let mut button_values = Vec::new();
        let mut stick_values = Vec::new();
        for change in drain(&mut rx) {
            match change {
                StateChange::Button { new: Some(state), .. } => button_values.push(state.value),
                StateChange::Joystick { new: Some(state), .. } => stick_values.push(state.x_axis),
                other => panic!("unexpected change {other:?}"),
            }
        }
        let expected: Vec<f32> = (0..20).map(|step| step as f32).collect();
        assert_eq!(button_values, expected);
        assert_eq!(stick_values, expected);
    }

    #[tokio::test]
    async fn test_removed_observer_stops_receiving() {
        let controller = Controller::spawn(3, GamepadLayout::Micro);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = controller.observe(move |change| {
            let _ = tx.send(change.clone());
        });

        controller.send(ControllerMessage::ConnectionChanged(ConnectionStatus::Connected));
        controller.remove_observer(id);
        controller.send(ControllerMessage::SetName(Some("late".into())));
        controller.snapshot().await.unwrap();

        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(controller.index(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalescing_delivers_latest_value_per_window() {
        let controller = Controller::with_options(
            0,
            GamepadLayout::Regular,
            ControllerOptions::coalescing(Duration::from_millis(50)),
        );
        let mut rx = collect_changes(&controller);

        for step in 1..=5 {
            controller.send(ControllerMessage::JoystickChanged(
                JoystickKind::Dpad,
                JoystickState::new(step as f32 / 10.0, 0.0),
            ));
        }
        // Other inputs have their own window
        controller.send(ControllerMessage::ButtonChanged(ButtonKind::A, ButtonState::new(1.0, true)));
        controller.snapshot().await.unwrap();

        let first = drain(&mut rx);
        assert_eq!(first.len(), 2);
        assert!(matches!(
            first[0],
            StateChange::Joystick { new: Some(JoystickState { x_axis, .. }), .. } if x_axis == 0.1
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.snapshot().await.unwrap();

        let released = drain(&mut rx);
        assert_eq!(released.len(), 1);
        assert!(matches!(
            released[0],
            StateChange::Joystick { new: Some(JoystickState { x_axis, .. }), .. } if x_axis == 0.5
        ));

        // Control messages are never coalesced
        controller.send(ControllerMessage::SetName(Some("a".into())));
        controller.send(ControllerMessage::SetName(Some("b".into())));
        controller.snapshot().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_send_after_task_ends() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let controller = Controller { index: 1, sender };
        assert!(!controller.send(ControllerMessage::SetName(None)));
        assert!(!controller.is_running());
        assert!(controller.snapshot().await.is_none());
    }
}
