//! Failure classification and retry decisions.
//!
//! - [`Classifier`] maps a [`Failure`](linkkeeper_protocol::Failure) to an
//!   [`ErrorClassification`] through a [`PolicyTable`].
//! - [`backoff`] computes bounded, jittered retry delays.
//! - [`RecoveryTracker`] holds per-session retry state and turns a
//!   classification into a [`RecoveryDecision`].
//!
//! Nothing in this module performs I/O.

pub mod backoff;
mod classifier;
mod policy;
mod state;

pub use backoff::BackoffPolicy;
pub use classifier::{Classifier, resolve_code};
pub use policy::{
    ErrorClassification, ErrorCode, PolicyOverride, PolicyTable, RecoveryStrategy, Severity,
};
pub use state::{
    DEFAULT_CIRCUIT_BREAKER_THRESHOLD, GiveUpReason, RecoveryDecision, RecoveryState,
    RecoveryTracker,
};
