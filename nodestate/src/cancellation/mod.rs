//! Structured cancellation utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - KeyedTaskGroup for supervising one task per key

mod task_group;
mod token;

pub use task_group::KeyedTaskGroup;
pub use token::CancellationToken;
