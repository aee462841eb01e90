//! Listener-facing caption delivery

pub mod broadcaster;
pub mod queue;

pub use broadcaster::Broadcaster;
pub use queue::{CaptionQueue, CaptionReceiver, PushOutcome};
