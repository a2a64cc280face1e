//! Recording engine for capturing origin traffic

mod engine;

pub use engine::{Exchange, Recorder};
