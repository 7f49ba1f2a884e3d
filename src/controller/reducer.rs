//! Controller state reducer
//!
//! `reduce` applies one message to a controller's state. It is total over
//! [`ControllerMessage`]; inputs outside the current layout are ignored.

use crate::protocol::{
    ButtonChanged, ButtonKind, ButtonState, ConnectionStatus, GamepadLayout, GamepadMessage,
    JoystickChanged, JoystickKind, JoystickState,
};

use super::ControllerState;

/// Every message a controller's state reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    ConnectionChanged(ConnectionStatus),
    SetLayout(GamepadLayout),
    SetName(Option<String>),
    ButtonChanged(ButtonKind, ButtonState),
    JoystickChanged(JoystickKind, JoystickState),
}

impl ControllerMessage {
    /// Expand a full-state frame into the messages that reproduce it
    pub fn from_gamepad(gamepad: &GamepadMessage) -> Vec<ControllerMessage> {
        let mut messages = vec![ControllerMessage::SetLayout(gamepad.layout)];
        messages.extend(ButtonKind::ALL.into_iter().filter_map(|kind| {
            gamepad
                .button(kind)
                .map(|state| ControllerMessage::ButtonChanged(kind, state))
        }));
        messages.extend(JoystickKind::ALL.into_iter().filter_map(|kind| {
            gamepad
                .joystick(kind)
                .map(|state| ControllerMessage::JoystickChanged(kind, state))
        }));
        messages
    }
}

impl From<ButtonChanged> for ControllerMessage {
    fn from(message: ButtonChanged) -> Self {
        ControllerMessage::ButtonChanged(message.button, message.state)
    }
}

impl From<JoystickChanged> for ControllerMessage {
    fn from(message: JoystickChanged) -> Self {
        ControllerMessage::JoystickChanged(message.joystick, message.state)
    }
}

/// Apply `message` to `state`, notifying observers of each field touched
pub fn reduce(state: &mut ControllerState, message: ControllerMessage) {
    match message {
        ControllerMessage::ConnectionChanged(status) => state.set_status(status),
        ControllerMessage::SetLayout(layout) => apply_layout(state, layout),
        ControllerMessage::SetName(name) => state.set_name(name),
        ControllerMessage::ButtonChanged(kind, button) => {
            if state.layout.get().supports_button(kind) {
                state.set_button(kind, Some(button));
            }
        }
        ControllerMessage::JoystickChanged(kind, joystick) => {
            if state.layout.get().supports_joystick(kind) {
                state.set_joystick(kind, Some(joystick));
            }
        }
    }
}

fn apply_layout(state: &mut ControllerState, layout: GamepadLayout) {
    let previous = *state.layout.get();
    if previous == layout {
        return;
    }

    for kind in ButtonKind::ALL {
        match (previous.supports_button(kind), layout.supports_button(kind)) {
            (false, true) => state.set_button(kind, Some(ButtonState::default())),
            (true, false) => state.set_button(kind, None),
            _ => {}
        }
    }
    for kind in JoystickKind::ALL {
        match (previous.supports_joystick(kind), layout.supports_joystick(kind)) {
            (false, true) => state.set_joystick(kind, Some(JoystickState::default())),
            (true, false) => state.set_joystick(kind, None),
            _ => {}
        }
    }

    state.set_layout(layout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StateChange;
    use std::sync::{Arc, Mutex};

    fn recorded(state: &mut ControllerState) -> Arc<Mutex<Vec<StateChange>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        state.observe_changes(move |change| sink.lock().unwrap().push(change.clone()));
        log
    }

    #[test]
    fn test_button_outside_layout_is_ignored() {
        let mut state = ControllerState::new(GamepadLayout::Micro);
        let log = recorded(&mut state);

        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::B, ButtonState::new(1.0, true)));
        reduce(&mut state, ControllerMessage::JoystickChanged(JoystickKind::LeftThumbstick, JoystickState::new(1.0, 0.0)));
        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::Pause, ButtonState::new(1.0, true)));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(state.button(ButtonKind::B), None);
    }

    #[test]
    fn test_layout_round_trip_resets_extended_fields() {
        let mut state = ControllerState::new(GamepadLayout::Extended);
        let pressed = ButtonState::new(0.75, true);
        let tilted = JoystickState::new(-0.5, 0.5);
        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::LeftTrigger, pressed));
        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::RightTrigger, pressed));
        reduce(&mut state, ControllerMessage::JoystickChanged(JoystickKind::LeftThumbstick, tilted));
        reduce(&mut state, ControllerMessage::JoystickChanged(JoystickKind::RightThumbstick, tilted));

        reduce(&mut state, ControllerMessage::SetLayout(GamepadLayout::Micro));
        assert_eq!(state.button(ButtonKind::LeftTrigger), None);
        assert_eq!(state.button(ButtonKind::B), None);
        assert_eq!(state.joystick(JoystickKind::RightThumbstick), None);

        reduce(&mut state, ControllerMessage::SetLayout(GamepadLayout::Extended));
        assert_eq!(state.gamepad(), GamepadMessage::neutral(GamepadLayout::Extended));
    }

    #[test]
    fn test_layout_change_keeps_still_valid_fields() {
        let mut state = ControllerState::new(GamepadLayout::Extended);
        let pressed = ButtonState::new(1.0, true);
        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::B, pressed));
        reduce(&mut state, ControllerMessage::ButtonChanged(ButtonKind::A, pressed));

        let log = recorded(&mut state);
        reduce(&mut state, ControllerMessage::SetLayout(GamepadLayout::Regular));

        assert_eq!(state.button(ButtonKind::B), Some(pressed));
        assert_eq!(state.button(ButtonKind::A), Some(pressed));

        // Four fields become absent, then the layout itself changes
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(
            log.last(),
            Some(&StateChange::Layout { old: GamepadLayout::Extended, new: GamepadLayout::Regular })
        );
    }

    #[test]
    fn test_same_layout_is_a_no_op() {
        let mut state = ControllerState::new(GamepadLayout::Regular);
        let log = recorded(&mut state);
        reduce(&mut state, ControllerMessage::SetLayout(GamepadLayout::Regular));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_status_and_name() {
        let mut state = ControllerState::new(GamepadLayout::Regular);
        reduce(&mut state, ControllerMessage::ConnectionChanged(ConnectionStatus::Connected));
        reduce(&mut state, ControllerMessage::SetName(Some("Pad1".into())));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.name.as_deref(), Some("Pad1"));
    }

    #[test]
    fn test_gamepad_expansion_reproduces_state() {
        let mut source = GamepadMessage::neutral(GamepadLayout::Extended);
        source.set_button(ButtonKind::Y, ButtonState::new(0.3, false));
        source.set_joystick(JoystickKind::RightThumbstick, JoystickState::new(1.0, -1.0));

        let mut state = ControllerState::new(GamepadLayout::Regular);
        for message in ControllerMessage::from_gamepad(&source) {
            reduce(&mut state, message);
        }
        assert_eq!(state.gamepad(), source);
    }
}
