//! Disposable containers for tests.
//!
//! `throwaway` creates containers on a local engine, waits until they are
//! actually usable, and makes sure they are removed again even when the test
//! process dies before it can clean up.
//!
//! - [`wait`]: readiness strategies (log, port, HTTP, SQL, exec, health, exit)
//!   and the ALL combinator
//! - [`lifecycle`]: `Provider` with ordered hooks around create/start/terminate
//! - [`reaper`]: the crash-safe cleanup sidecar and its client
//! - [`session`]: per-run labels and ordered teardown

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod reaper;
pub mod session;
pub mod testing;
pub mod wait;

pub use config::Config;
pub use engine::{ContainerPort, DockerEngine, Engine};
pub use lifecycle::{Provider, ResourceHandle, ResourceRequest};
pub use session::Session;
pub use wait::{WaitSpec, wait_until_ready};
