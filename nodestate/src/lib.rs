//! # Nodestate
//!
//! The node-state lifecycle layer of a Kubernetes-native workflow engine.
//!
//! The reconcile loop of a workflow controller leans on this crate for the
//! state that does not fit comfortably on the workflow object itself:
//!
//! - **Artifact drivers**: load, save and stream artifacts from object stores,
//!   HTTP endpoints, volumes and inline data
//! - **Transfer engine**: parallel directory transfers against S3-compatible
//!   stores with transient-error retries
//! - **Memoization**: a named step-output cache with time-to-idle reaping
//! - **Hydration**: moving node status between inline, compressed and
//!   offloaded representations
//! - **External steps**: asynchronous HTTP and plugin steps whose outcomes are
//!   folded back into node status on a later reconcile
//! - **Logs**: merging log streams from many pods into one time-ordered feed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nodestate::prelude::*;
//!
//! let hydrator = Hydrator::new(repository, HydratorConfig::default());
//! hydrator.hydrate(&mut workflow).await?;
//! // ... reconcile ...
//! hydrator.dehydrate(&mut workflow).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod hydrator;
pub mod logs;
pub mod memo;
pub mod objectstore;
pub mod observability;
pub mod retry;
pub mod steps;
pub mod substrate;
pub mod sync;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactDriver, ByteStream, DriverFactory};
    pub use crate::cancellation::{CancellationToken, KeyedTaskGroup};
    pub use crate::config::{
        CacheConfig, HydratorConfig, LayerConfig, LogMultiplexerConfig, StepExecutorConfig,
        TransferConfig,
    };
    pub use crate::core::{
        Artifact, ArtifactLocation, NodePhase, NodeStatus, NodeType, Nodes, Outputs, Parameter,
        ResourcesDuration, Workflow, WorkflowPhase, WorkflowStatus,
    };
    pub use crate::errors::{ErrorKind, NodeStateError, Result};
    pub use crate::hydrator::Hydrator;
    pub use crate::logs::{LogEntry, LogMultiplexer, LogOptions};
    pub use crate::memo::{CacheEntry, CacheFactory, CacheReaper, MemoizationCache};
    pub use crate::objectstore::{S3Client, S3Driver, TransientClassifier};
    pub use crate::retry::{with_retry, RetryPolicy};
    pub use crate::steps::{StepExecutor, StepPayload};
    pub use crate::substrate::{
        KeyValueStore, NodeStatusRepository, PodApi, SecretStore, WorkflowWatcher,
    };
    pub use crate::utils::{Clock, ManualClock, SystemClock, Timestamp};
}
