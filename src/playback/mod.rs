//! Playback of recorded resources
//!
//! A [`PlaybackScheduler`] is built from a snapshot of the engine's
//! [`PlaybackSettings`] for each replayed request. It delays the response
//! head by the recorded TTFB and streams the stored body through a
//! [`Pipeline`] of stages that restore the original encoding and pace the
//! transfer to the recorded data rate.

mod scheduler;
pub mod stage;

pub use crate::config::PlaybackSettings;
pub use scheduler::PlaybackScheduler;
pub use stage::{BodyStream, Pipeline, ProxyBody, Stage};
