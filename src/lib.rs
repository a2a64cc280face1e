//! Playback proxy - HTTP recording/playback proxy
//!
//! Records origin responses together with their timing while online, and
//! replays them offline with the original time-to-first-byte and data
//! rate. Requests that only approximately match a recording (say, a
//! different cache-busting parameter) are served from the nearest one.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod index;
pub mod matcher;
pub mod network;
pub mod playback;
pub mod proxy;
pub mod recording;
pub mod resource;
pub mod storage;
pub mod url;

pub use config::{MatchStrategy, Mode, PlaybackSettings, ProxyConfig};
pub use error::{ProxyError, Result};
pub use proxy::ProxyEngine;
