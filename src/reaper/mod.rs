//! Crash-safe cleanup.
//!
//! The sidecar ([`server`]) outlives the test process and removes whatever
//! the session registered once the process's connection is gone. The
//! [`client`] keeps that connection open and registers the session's filters
//! over the line [`protocol`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{ReaperClient, ReaperState};
pub use error::ReaperError;
pub use protocol::{Filter, FilterSet};
pub use server::{PruneReport, ReaperServer, Registry, prune};
