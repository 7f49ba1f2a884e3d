//! Protocol message definitions
//!
//! Defines the input value types and every message exchanged between a
//! controller publisher and a controller browser.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{ControllerIndex, Marshal, WireReader, PROTOCOL_VERSION};

/// Declared input capability tier of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum GamepadLayout {
    Micro = 1,
    Regular = 2,
    Extended = 3,
}

impl GamepadLayout {
    /// Whether `button` is part of this layout
    pub fn supports_button(self, button: ButtonKind) -> bool {
        match button {
            ButtonKind::A | ButtonKind::X => true,
            ButtonKind::B | ButtonKind::Y | ButtonKind::LeftShoulder | ButtonKind::RightShoulder => {
                self >= GamepadLayout::Regular
            }
            ButtonKind::LeftTrigger | ButtonKind::RightTrigger => self == GamepadLayout::Extended,
            ButtonKind::Pause => false,
        }
    }

    /// Whether `joystick` is part of this layout
    pub fn supports_joystick(self, joystick: JoystickKind) -> bool {
        match joystick {
            JoystickKind::Dpad => true,
            JoystickKind::LeftThumbstick | JoystickKind::RightThumbstick => {
                self == GamepadLayout::Extended
            }
        }
    }
}

impl TryFrom<u16> for GamepadLayout {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GamepadLayout::Micro),
            2 => Ok(GamepadLayout::Regular),
            3 => Ok(GamepadLayout::Extended),
            other => Err(other),
        }
    }
}

/// Button identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ButtonKind {
    A = 1,
    B = 2,
    X = 3,
    Y = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftTrigger = 7,
    RightTrigger = 8,
    Pause = 9,
}

impl ButtonKind {
    pub const ALL: [ButtonKind; 9] = [
        ButtonKind::A,
        ButtonKind::B,
        ButtonKind::X,
        ButtonKind::Y,
        ButtonKind::LeftShoulder,
        ButtonKind::RightShoulder,
        ButtonKind::LeftTrigger,
        ButtonKind::RightTrigger,
        ButtonKind::Pause,
    ];
}

impl TryFrom<u16> for ButtonKind {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ButtonKind::ALL
            .into_iter()
            .find(|kind| *kind as u16 == value)
            .ok_or(value)
    }
}

/// Joystick identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum JoystickKind {
    Dpad = 1,
    LeftThumbstick = 2,
    RightThumbstick = 3,
}

impl JoystickKind {
    pub const ALL: [JoystickKind; 3] = [
        JoystickKind::Dpad,
        JoystickKind::LeftThumbstick,
        JoystickKind::RightThumbstick,
    ];
}

impl TryFrom<u16> for JoystickKind {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        JoystickKind::ALL
            .into_iter()
            .find(|kind| *kind as u16 == value)
            .ok_or(value)
    }
}

/// Connection status of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// State of a single button
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonState {
    /// Analog value in [0, 1]
    pub value: f32,
    pub pressed: bool,
}

impl ButtonState {
    pub fn new(value: f32, pressed: bool) -> Self {
        Self { value, pressed }
    }

    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.value);
        buf.put_u8(self.pressed as u8);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let value = reader.read_f32()?;
        let pressed = reader.read_bool()?;
        Some(Self { value, pressed })
    }
}

/// State of a directional input
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JoystickState {
    /// Horizontal axis in [-1, 1]
    pub x_axis: f32,
    /// Vertical axis in [-1, 1], negative is up
    pub y_axis: f32,
}

impl JoystickState {
    pub fn new(x_axis: f32, y_axis: f32) -> Self {
        Self { x_axis, y_axis }
    }

    pub fn up(&self) -> bool {
        self.y_axis < 0.0
    }

    pub fn down(&self) -> bool {
        self.y_axis > 0.0
    }

    pub fn left(&self) -> bool {
        self.x_axis < 0.0
    }

    pub fn right(&self) -> bool {
        self.x_axis > 0.0
    }

    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.x_axis);
        buf.put_f32_le(self.y_axis);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let x_axis = reader.read_f32()?;
        let y_axis = reader.read_f32()?;
        Some(Self { x_axis, y_axis })
    }
}

/// Announces a controller owned by the sending peer
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConnected {
    pub index: ControllerIndex,
    pub layout: GamepadLayout,
    pub version: u16,
    /// An empty name travels as no name
    pub name: Option<String>,
}

impl ControllerConnected {
    pub fn new(index: ControllerIndex, layout: GamepadLayout, name: Option<String>) -> Self {
        Self {
            index,
            layout,
            version: PROTOCOL_VERSION,
            name: name.filter(|n| !n.is_empty()),
        }
    }
}

impl Marshal for ControllerConnected {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.layout as u16);
        buf.put_u16_le(self.version);
        if let Some(name) = &self.name {
            buf.put_slice(name.as_bytes());
        }
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let index = reader.read_u16()?;
        let layout = reader.read_enum()?;
        let version = reader.read_u16()?;
        let name = reader.read_string()?;
        Some(Self {
            index,
            layout,
            version,
            name: (!name.is_empty()).then_some(name),
        })
    }
}

/// Withdraws a controller owned by the sending peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerDisconnected {
    pub index: ControllerIndex,
}

impl Marshal for ControllerDisconnected {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.index);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        Some(Self {
            index: reader.read_u16()?,
        })
    }
}

/// Display name of a controller, sent inside an indexed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerName {
    pub name: String,
}

impl Marshal for ControllerName {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_slice(self.name.as_bytes());
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        Some(Self {
            name: reader.read_string()?,
        })
    }
}

/// Layout change, sent inside an indexed envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLayout {
    pub layout: GamepadLayout,
}

impl Marshal for SetLayout {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.layout as u16);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        Some(Self {
            layout: reader.read_enum()?,
        })
    }
}

/// A single button changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonChanged {
    pub button: ButtonKind,
    pub state: ButtonState,
}

impl Marshal for ButtonChanged {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.button as u16);
        self.state.marshal(buf);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let button = reader.read_enum()?;
        let state = ButtonState::unmarshal(reader)?;
        Some(Self { button, state })
    }
}

/// A single joystick changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoystickChanged {
    pub joystick: JoystickKind,
    pub state: JoystickState,
}

impl Marshal for JoystickChanged {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.joystick as u16);
        self.state.marshal(buf);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let joystick = reader.read_enum()?;
        let state = JoystickState::unmarshal(reader)?;
        Some(Self { joystick, state })
    }
}

/// Full input state of a controller
///
/// Only the fields valid for `layout` travel on the wire, in the order
/// A, X, dpad, B, Y, left shoulder, right shoulder, left trigger,
/// right trigger, left thumbstick, right thumbstick. Fields outside the
/// layout are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamepadMessage {
    pub layout: GamepadLayout,
    pub button_a: ButtonState,
    pub button_x: ButtonState,
    pub dpad: JoystickState,
    pub button_b: Option<ButtonState>,
    pub button_y: Option<ButtonState>,
    pub left_shoulder: Option<ButtonState>,
    pub right_shoulder: Option<ButtonState>,
    pub left_trigger: Option<ButtonState>,
    pub right_trigger: Option<ButtonState>,
    pub left_thumbstick: Option<JoystickState>,
    pub right_thumbstick: Option<JoystickState>,
}

impl GamepadMessage {
    /// Every field of `layout` at rest, every other field absent
    pub fn neutral(layout: GamepadLayout) -> Self {
        let button = |kind| layout.supports_button(kind).then(ButtonState::default);
        let joystick = |kind| layout.supports_joystick(kind).then(JoystickState::default);

        Self {
            layout,
            button_a: ButtonState::default(),
            button_x: ButtonState::default(),
            dpad: JoystickState::default(),
            button_b: button(ButtonKind::B),
            button_y: button(ButtonKind::Y),
            left_shoulder: button(ButtonKind::LeftShoulder),
            right_shoulder: button(ButtonKind::RightShoulder),
            left_trigger: button(ButtonKind::LeftTrigger),
            right_trigger: button(ButtonKind::RightTrigger),
            left_thumbstick: joystick(JoystickKind::LeftThumbstick),
            right_thumbstick: joystick(JoystickKind::RightThumbstick),
        }
    }

    pub fn button(&self, kind: ButtonKind) -> Option<ButtonState> {
        match kind {
            ButtonKind::A => Some(self.button_a),
            ButtonKind::X => Some(self.button_x),
            ButtonKind::B => self.button_b,
            ButtonKind::Y => self.button_y,
            ButtonKind::LeftShoulder => self.left_shoulder,
            ButtonKind::RightShoulder => self.right_shoulder,
            ButtonKind::LeftTrigger => self.left_trigger,
            ButtonKind::RightTrigger => self.right_trigger,
            ButtonKind::Pause => None,
        }
    }

    pub fn joystick(&self, kind: JoystickKind) -> Option<JoystickState> {
        match kind {
            JoystickKind::Dpad => Some(self.dpad),
            JoystickKind::LeftThumbstick => self.left_thumbstick,
            JoystickKind::RightThumbstick => self.right_thumbstick,
        }
    }

    /// Record a button value, ignoring buttons outside the layout
    pub fn set_button(&mut self, kind: ButtonKind, state: ButtonState) {
        if !self.layout.supports_button(kind) {
            return;
        }
        match kind {
            ButtonKind::A => self.button_a = state,
            ButtonKind::X => self.button_x = state,
            ButtonKind::B => self.button_b = Some(state),
            ButtonKind::Y => self.button_y = Some(state),
            ButtonKind::LeftShoulder => self.left_shoulder = Some(state),
            ButtonKind::RightShoulder => self.right_shoulder = Some(state),
            ButtonKind::LeftTrigger => self.left_trigger = Some(state),
            ButtonKind::RightTrigger => self.right_trigger = Some(state),
            ButtonKind::Pause => {}
        }
    }

    /// Record a joystick value, ignoring joysticks outside the layout
    pub fn set_joystick(&mut self, kind: JoystickKind, state: JoystickState) {
        if !self.layout.supports_joystick(kind) {
            return;
        }
        match kind {
            JoystickKind::Dpad => self.dpad = state,
            JoystickKind::LeftThumbstick => self.left_thumbstick = Some(state),
            JoystickKind::RightThumbstick => self.right_thumbstick = Some(state),
        }
    }

    /// Switch layout, resetting fields whose validity changed
    pub fn set_layout(&mut self, layout: GamepadLayout) {
        if layout == self.layout {
            return;
        }
        let previous = std::mem::replace(self, Self::neutral(layout));
        for kind in ButtonKind::ALL {
            if previous.layout.supports_button(kind) {
                if let Some(state) = previous.button(kind) {
                    self.set_button(kind, state);
                }
            }
        }
        for kind in JoystickKind::ALL {
            if previous.layout.supports_joystick(kind) {
                if let Some(state) = previous.joystick(kind) {
                    self.set_joystick(kind, state);
                }
            }
        }
    }

    /// Buttons carried on the wire for this layout, in wire order
    fn wire_buttons(layout: GamepadLayout) -> impl Iterator<Item = ButtonKind> {
        [
            ButtonKind::B,
            ButtonKind::Y,
            ButtonKind::LeftShoulder,
            ButtonKind::RightShoulder,
            ButtonKind::LeftTrigger,
            ButtonKind::RightTrigger,
        ]
        .into_iter()
        .filter(move |kind| layout.supports_button(*kind))
    }

    fn wire_joysticks(layout: GamepadLayout) -> impl Iterator<Item = JoystickKind> {
        [JoystickKind::LeftThumbstick, JoystickKind::RightThumbstick]
            .into_iter()
            .filter(move |kind| layout.supports_joystick(*kind))
    }
}

impl Marshal for GamepadMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.layout as u16);
        self.button_a.marshal(buf);
        self.button_x.marshal(buf);
        self.dpad.marshal(buf);

        for kind in Self::wire_buttons(self.layout) {
            self.button(kind).unwrap_or_default().marshal(buf);
        }
        for kind in Self::wire_joysticks(self.layout) {
            self.joystick(kind).unwrap_or_default().marshal(buf);
        }
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let layout = reader.read_enum()?;
        let mut message = Self::neutral(layout);
        message.button_a = ButtonState::unmarshal(reader)?;
        message.button_x = ButtonState::unmarshal(reader)?;
        message.dpad = JoystickState::unmarshal(reader)?;

        for kind in Self::wire_buttons(layout) {
            let state = ButtonState::unmarshal(reader)?;
            message.set_button(kind, state);
        }
        for kind in Self::wire_joysticks(layout) {
            let state = JoystickState::unmarshal(reader)?;
            message.set_joystick(kind, state);
        }

        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Indexed;

    fn extended_sample() -> GamepadMessage {
        let mut message = GamepadMessage::neutral(GamepadLayout::Extended);
        message.set_button(ButtonKind::A, ButtonState::new(1.0, true));
        message.set_button(ButtonKind::RightTrigger, ButtonState::new(0.25, false));
        message.set_joystick(JoystickKind::Dpad, JoystickState::new(-1.0, 1.0));
        message.set_joystick(JoystickKind::LeftThumbstick, JoystickState::new(0.5, -0.5));
        message
    }

    #[test]
    fn test_layout_capabilities() {
        assert!(GamepadLayout::Micro.supports_button(ButtonKind::A));
        assert!(!GamepadLayout::Micro.supports_button(ButtonKind::B));
        assert!(GamepadLayout::Regular.supports_button(ButtonKind::RightShoulder));
        assert!(!GamepadLayout::Regular.supports_button(ButtonKind::LeftTrigger));
        assert!(GamepadLayout::Extended.supports_joystick(JoystickKind::RightThumbstick));
        assert!(!GamepadLayout::Extended.supports_button(ButtonKind::Pause));
    }

    #[test]
    fn test_unknown_ordinals_are_rejected() {
        assert_eq!(GamepadLayout::try_from(0), Err(0));
        assert_eq!(ButtonKind::try_from(10), Err(10));
        assert_eq!(JoystickKind::try_from(4), Err(4));

        // SetLayout with ordinal 7
        assert!(SetLayout::decode(&[7, 0]).is_none());
        // ButtonChanged with button ordinal 0
        assert!(ButtonChanged::decode(&[0, 0, 0, 0, 128, 63, 1]).is_none());
    }

    #[test]
    fn test_button_changed_boundaries() {
        for state in [ButtonState::new(0.0, false), ButtonState::new(1.0, true)] {
            let message = Indexed::new(u16::MAX, ButtonChanged { button: ButtonKind::A, state });
            assert_eq!(Indexed::<ButtonChanged>::decode(&message.encode()), Some(message));
        }
    }

    #[test]
    fn test_joystick_changed_boundaries() {
        for state in [JoystickState::new(-1.0, -1.0), JoystickState::new(1.0, 1.0)] {
            let message = Indexed::new(0, JoystickChanged { joystick: JoystickKind::Dpad, state });
            assert_eq!(Indexed::<JoystickChanged>::decode(&message.encode()), Some(message));
        }
    }

    #[test]
    fn test_controller_connected_names() {
        let unnamed = ControllerConnected::new(65535, GamepadLayout::Micro, None);
        assert_eq!(ControllerConnected::decode(&unnamed.encode()), Some(unnamed));

        let long_name = "x".repeat(4096);
        let named = ControllerConnected::new(0, GamepadLayout::Regular, Some(long_name));
        assert_eq!(ControllerConnected::decode(&named.encode()), Some(named));

        let empty = ControllerConnected::new(1, GamepadLayout::Extended, Some(String::new()));
        assert_eq!(empty.name, None);
    }

    #[test]
    fn test_controller_name_may_be_empty() {
        let message = Indexed::new(2, ControllerName { name: String::new() });
        assert_eq!(Indexed::<ControllerName>::decode(&message.encode()), Some(message));
    }

    #[test]
    fn test_truncated_buffers_decode_to_none() {
        fn check<T: Marshal + std::fmt::Debug>(full: &[u8], min: usize) {
            for len in 0..min {
                assert!(T::decode(&full[..len]).is_none(), "length {len} decoded");
            }
        }

        let button = ButtonChanged { button: ButtonKind::B, state: ButtonState::new(0.5, true) };
        check::<ButtonChanged>(&button.encode(), 7);

        let joystick = JoystickChanged { joystick: JoystickKind::Dpad, state: JoystickState::new(0.1, 0.2) };
        check::<JoystickChanged>(&joystick.encode(), 10);

        check::<ControllerConnected>(&ControllerConnected::new(3, GamepadLayout::Regular, None).encode(), 6);
        check::<ControllerDisconnected>(&ControllerDisconnected { index: 9 }.encode(), 2);
        check::<SetLayout>(&SetLayout { layout: GamepadLayout::Micro }.encode(), 2);

        let gamepad = extended_sample().encode();
        check::<GamepadMessage>(&gamepad, gamepad.len());

        let indexed = Indexed::new(4, button).encode();
        check::<Indexed<ButtonChanged>>(&indexed, indexed.len());
    }

    #[test]
    fn test_gamepad_message_omits_fields_outside_layout() {
        let micro = GamepadMessage::neutral(GamepadLayout::Micro);
        // layout + A + X + dpad
        assert_eq!(micro.encode().len(), 2 + 5 + 5 + 8);

        let decoded = GamepadMessage::decode(&micro.encode()).unwrap();
        assert_eq!(decoded.button_b, None);
        assert_eq!(decoded.left_thumbstick, None);
    }

    #[test]
    fn test_gamepad_message_extended_roundtrip() {
        let message = extended_sample();
        assert_eq!(GamepadMessage::decode(&message.encode()), Some(message));
    }

    #[test]
    fn test_gamepad_set_layout_resets_fields() {
        let mut message = extended_sample();
        message.set_layout(GamepadLayout::Micro);
        assert_eq!(message.right_trigger, None);
        assert_eq!(message.button_a, ButtonState::new(1.0, true));

        message.set_layout(GamepadLayout::Extended);
        assert_eq!(message.right_trigger, Some(ButtonState::default()));
        assert_eq!(message.left_thumbstick, Some(JoystickState::default()));
    }

    #[test]
    fn test_joystick_directions() {
        let state = JoystickState::new(0.5, -0.5);
        assert!(state.up() && state.right());
        assert!(!state.down() && !state.left());
    }
}
