//! Playback session lifecycle: refill thread, session resources and the
//! controller state machine

pub mod controller;
pub mod feeder;
pub mod session;

pub use controller::{PlaybackController, PlaybackState, PlayerStatus};
pub use feeder::{FeederExit, RingFeeder};
pub use session::{GenerationGate, PlaybackSession, SessionCounters, SessionStats};
