//! Time helpers shared by the cache, reaper and log multiplexer.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    chrono::Utc::now()
}

/// Formats a timestamp the way the substrate stores it (RFC 3339, UTC, `Z`).
#[must_use]
pub fn rfc3339(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}
