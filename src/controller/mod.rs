//! Controller module - Observable per-controller state
//!
//! A controller is a set of observable input fields driven by a pure
//! reducer. Each controller runs in its own task so that updates from the
//! network and from local hardware are applied in arrival order.

mod actor;
mod reducer;
mod state;

pub use actor::{Controller, ControllerOptions};
pub use reducer::{reduce, ControllerMessage};
pub use state::{Change, ControllerSnapshot, ControllerState, Observable, ObserverId, StateChange};
