//! OBD-II Rotation Poller
//!
//! Polls the command catalog through the engine's async command path, one
//! command at a time, honouring each channel's skip count. Poll cadence lives
//! here so the catalog itself stays immutable.

mod scheduler;

pub use scheduler::{PollCadence, PollStats, PollerConfig, PollerHandle, RotationPoller};
