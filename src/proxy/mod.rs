//! Proxy engine tying recording and playback together

mod decision;
mod engine;

pub use decision::{decide, Decision};
pub use engine::ProxyEngine;
