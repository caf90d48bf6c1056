pub mod event;
pub mod phase;
pub mod round;

pub use event::normalize;
pub use phase::{Phase, PhaseConfig, PhaseEvent, PhaseStateMachine};
