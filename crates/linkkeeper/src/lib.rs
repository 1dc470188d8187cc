//! linkkeeper supervises long-lived messaging-protocol connections.
//!
//! One connection runs per tenant session. The [`supervisor::Supervisor`]
//! initializes each session through a [`connector::Connector`], consumes its
//! lifecycle events, classifies failures with [`recovery::Classifier`] and
//! decides retries with [`recovery::RecoveryTracker`]. Observed messages are
//! kept in a tiered [`cache::MessageCache`] so the protocol layer can answer
//! retransmission requests.

pub mod background;
pub mod bus;
pub mod cache;
pub mod config;
pub mod connector;
pub mod metrics;
pub mod recovery;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod sync;
