//! What to do with a request, given the mode and the index lookup

use crate::config::Mode;

/// Action taken for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Fetch from the origin and record the exchange
    Record,
    /// Serve the matched recording
    Replay,
    /// Serve the matched recording; record live if its body is gone
    ReplayThenFallbackToRecord,
    /// Answer 404 without contacting the origin
    RejectNotFound,
}

/// Pick the action for a request
///
/// `hit` says whether the index had an exact or approximate match.
#[must_use]
pub fn decide(mode: Mode, hit: bool) -> Decision {
    match (mode, hit) {
        (Mode::Online, _) => Decision::Record,
        (Mode::Offline, true) => Decision::Replay,
        (Mode::Offline, false) => Decision::RejectNotFound,
        (Mode::Mixed, true) => Decision::ReplayThenFallbackToRecord,
        (Mode::Mixed, false) => Decision::Record,
    }
}
