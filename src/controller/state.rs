//! Observable controller state
//!
//! Every field is an [`Observable`] so listeners can follow individual
//! inputs. A state-wide listener receives the same changes as a single
//! [`StateChange`] stream.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{
    ButtonKind, ButtonState, ConnectionStatus, GamepadLayout, GamepadMessage, JoystickKind,
    JoystickState,
};

/// Handle returned when registering an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Old and new value of a field
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

impl<T> Change<T> {
    fn into_optional(self) -> Change<Option<T>> {
        Change {
            old: Some(self.old),
            new: Some(self.new),
        }
    }
}

type FieldObserver<T> = Box<dyn FnMut(&Change<T>) + Send>;

/// A value whose every assignment is reported to its observers
pub struct Observable<T> {
    value: T,
    observers: Vec<(ObserverId, FieldObserver<T>)>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            observers: Vec::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn observe<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Change<T>) + Send + 'static,
    {
        let id = ObserverId::next();
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) {
        self.observers.retain(|(existing, _)| *existing != id);
    }

    /// Assign and notify, even when the value is unchanged
    pub(crate) fn set(&mut self, value: T) -> Change<T> {
        let old = std::mem::replace(&mut self.value, value);
        let change = Change {
            old,
            new: self.value.clone(),
        };
        for (_, observer) in self.observers.iter_mut() {
            observer(&change);
        }
        change
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &self.value)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// A single field mutation, reported in application order
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Status {
        old: ConnectionStatus,
        new: ConnectionStatus,
    },
    Layout {
        old: GamepadLayout,
        new: GamepadLayout,
    },
    Name {
        old: Option<String>,
        new: Option<String>,
    },
    Button {
        button: ButtonKind,
        old: Option<ButtonState>,
        new: Option<ButtonState>,
    },
    Joystick {
        joystick: JoystickKind,
        old: Option<JoystickState>,
        new: Option<JoystickState>,
    },
}

type StateObserver = Box<dyn FnMut(&StateChange) + Send>;

/// Point-in-time copy of a controller's state
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub status: ConnectionStatus,
    pub name: Option<String>,
    pub gamepad: GamepadMessage,
}

/// Live state of one controller
///
/// Fields outside the current layout hold `None` and are only touched by
/// layout changes.
pub struct ControllerState {
    pub status: Observable<ConnectionStatus>,
    pub layout: Observable<GamepadLayout>,
    pub name: Observable<Option<String>>,

    pub button_a: Observable<ButtonState>,
    pub button_x: Observable<ButtonState>,
    pub dpad: Observable<JoystickState>,

    pub button_b: Observable<Option<ButtonState>>,
    pub button_y: Observable<Option<ButtonState>>,
    pub left_shoulder: Observable<Option<ButtonState>>,
    pub right_shoulder: Observable<Option<ButtonState>>,

    pub left_trigger: Observable<Option<ButtonState>>,
    pub right_trigger: Observable<Option<ButtonState>>,
    pub left_thumbstick: Observable<Option<JoystickState>>,
    pub right_thumbstick: Observable<Option<JoystickState>>,

    listeners: Vec<(ObserverId, StateObserver)>,
}

impl ControllerState {
    pub fn new(layout: GamepadLayout) -> Self {
        let neutral = GamepadMessage::neutral(layout);

        Self {
            status: Observable::new(ConnectionStatus::Disconnected),
            layout: Observable::new(layout),
            name: Observable::new(None),
            button_a: Observable::new(neutral.button_a),
            button_x: Observable::new(neutral.button_x),
            dpad: Observable::new(neutral.dpad),
            button_b: Observable::new(neutral.button_b),
            button_y: Observable::new(neutral.button_y),
            left_shoulder: Observable::new(neutral.left_shoulder),
            right_shoulder: Observable::new(neutral.right_shoulder),
            left_trigger: Observable::new(neutral.left_trigger),
            right_trigger: Observable::new(neutral.right_trigger),
            left_thumbstick: Observable::new(neutral.left_thumbstick),
            right_thumbstick: Observable::new(neutral.right_thumbstick),
            listeners: Vec::new(),
        }
    }

    /// Listen to every field change of this controller
    pub fn observe_changes<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        let id = ObserverId::next();
        self.insert_listener(id, Box::new(observer));
        id
    }

    pub(crate) fn insert_listener(&mut self, id: ObserverId, observer: StateObserver) {
        self.listeners.push((id, observer));
    }

    pub fn remove_listener(&mut self, id: ObserverId) {
        self.listeners.retain(|(existing, _)| *existing != id);
    }

    pub fn button(&self, kind: ButtonKind) -> Option<ButtonState> {
        match kind {
            ButtonKind::A => Some(*self.button_a.get()),
            ButtonKind::X => Some(*self.button_x.get()),
            ButtonKind::B => *self.button_b.get(),
            ButtonKind::Y => *self.button_y.get(),
            ButtonKind::LeftShoulder => *self.left_shoulder.get(),
            ButtonKind::RightShoulder => *self.right_shoulder.get(),
            ButtonKind::LeftTrigger => *self.left_trigger.get(),
            ButtonKind::RightTrigger => *self.right_trigger.get(),
            ButtonKind::Pause => None,
        }
    }

    pub fn joystick(&self, kind: JoystickKind) -> Option<JoystickState> {
        match kind {
            JoystickKind::Dpad => Some(*self.dpad.get()),
            JoystickKind::LeftThumbstick => *self.left_thumbstick.get(),
            JoystickKind::RightThumbstick => *self.right_thumbstick.get(),
        }
    }

    /// Full input state in wire form
    pub fn gamepad(&self) -> GamepadMessage {
        GamepadMessage {
            layout: *self.layout.get(),
            button_a: *self.button_a.get(),
            button_x: *self.button_x.get(),
            dpad: *self.dpad.get(),
            button_b: *self.button_b.get(),
            button_y: *self.button_y.get(),
            left_shoulder: *self.left_shoulder.get(),
            right_shoulder: *self.right_shoulder.get(),
            left_trigger: *self.left_trigger.get(),
            right_trigger: *self.right_trigger.get(),
            left_thumbstick: *self.left_thumbstick.get(),
            right_thumbstick: *self.right_thumbstick.get(),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            status: *self.status.get(),
            name: self.name.get().clone(),
            gamepad: self.gamepad(),
        }
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        let Change { old, new } = self.status.set(status);
        self.emit(StateChange::Status { old, new });
    }

    pub(crate) fn set_layout(&mut self, layout: GamepadLayout) {
        let Change { old, new } = self.layout.set(layout);
        self.emit(StateChange::Layout { old, new });
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        let Change { old, new } = self.name.set(name);
        self.emit(StateChange::Name { old, new });
    }

    /// Assign a button; the always-present buttons ignore `None`
    pub(crate) fn set_button(&mut self, kind: ButtonKind, state: Option<ButtonState>) {
        let change = match kind {
            ButtonKind::A => state.map(|s| self.button_a.set(s).into_optional()),
            ButtonKind::X => state.map(|s| self.button_x.set(s).into_optional()),
            ButtonKind::B => Some(self.button_b.set(state)),
            ButtonKind::Y => Some(self.button_y.set(state)),
            ButtonKind::LeftShoulder => Some(self.left_shoulder.set(state)),
            ButtonKind::RightShoulder => Some(self.right_shoulder.set(state)),
            ButtonKind::LeftTrigger => Some(self.left_trigger.set(state)),
            ButtonKind::RightTrigger => Some(self.right_trigger.set(state)),
            ButtonKind::Pause => None,
        };
        if let Some(Change { old, new }) = change {
            self.emit(StateChange::Button {
                button: kind,
                old,
                new,
            });
        }
    }

    /// Assign a joystick; the dpad ignores `None`
    pub(crate) fn set_joystick(&mut self, kind: JoystickKind, state: Option<JoystickState>) {
        let change = match kind {
            JoystickKind::Dpad => state.map(|s| self.dpad.set(s).into_optional()),
            JoystickKind::LeftThumbstick => Some(self.left_thumbstick.set(state)),
            JoystickKind::RightThumbstick => Some(self.right_thumbstick.set(state)),
        };
        if let Some(Change { old, new }) = change {
            self.emit(StateChange::Joystick {
                joystick: kind,
                old,
                new,
            });
        }
    }

    fn emit(&mut self, change: StateChange) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&change);
        }
    }
}

impl fmt::Debug for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerState")
            .field("snapshot", &self.snapshot())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_new_state_matches_layout() {
        let state = ControllerState::new(GamepadLayout::Micro);
        assert_eq!(*state.status.get(), ConnectionStatus::Disconnected);
        assert_eq!(state.button(ButtonKind::B), None);
        assert_eq!(state.joystick(JoystickKind::Dpad), Some(JoystickState::default()));

        let state = ControllerState::new(GamepadLayout::Extended);
        assert_eq!(state.button(ButtonKind::RightTrigger), Some(ButtonState::default()));
        assert_eq!(state.gamepad(), GamepadMessage::neutral(GamepadLayout::Extended));
    }

    #[test]
    fn test_field_and_state_observers_fire() {
        let mut state = ControllerState::new(GamepadLayout::Regular);
        let field_log = Arc::new(Mutex::new(Vec::new()));
        let state_log = Arc::new(Mutex::new(Vec::new()));

        let sink = field_log.clone();
        state.button_b.observe(move |change| sink.lock().unwrap().push(change.clone()));
        let sink = state_log.clone();
        state.observe_changes(move |change| sink.lock().unwrap().push(change.clone()));

        let pressed = ButtonState::new(1.0, true);
        state.set_button(ButtonKind::B, Some(pressed));

        assert_eq!(
            field_log.lock().unwrap().as_slice(),
            &[Change { old: Some(ButtonState::default()), new: Some(pressed) }]
        );
        assert_eq!(
            state_log.lock().unwrap().as_slice(),
            &[StateChange::Button {
                button: ButtonKind::B,
                old: Some(ButtonState::default()),
                new: Some(pressed),
            }]
        );
    }

    #[test]
    fn test_removed_listener_is_silent() {
        let mut state = ControllerState::new(GamepadLayout::Regular);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let id = state.observe_changes(move |_| *sink.lock().unwrap() += 1);

        state.set_name(Some("pad".into()));
        state.remove_listener(id);
        state.set_name(None);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_required_fields_ignore_absent() {
        let mut state = ControllerState::new(GamepadLayout::Micro);
        state.set_button(ButtonKind::A, None);
        state.set_joystick(JoystickKind::Dpad, None);
        assert_eq!(state.button(ButtonKind::A), Some(ButtonState::default()));
        assert_eq!(state.joystick(JoystickKind::Dpad), Some(JoystickState::default()));
    }
}
