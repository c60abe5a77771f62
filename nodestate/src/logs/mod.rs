//! Pod log multiplexing.
//!
//! [`LogMultiplexer`] reads the logs of all pods of one workflow
//! concurrently and forwards them to a sink sorted by timestamp, one drain
//! window at a time.

mod entry;
mod multiplexer;

pub use entry::{sort_entries, LineSplitter, LogEntry};
pub use multiplexer::{LogMultiplexer, LogOptions, WORKFLOW_LABEL};
