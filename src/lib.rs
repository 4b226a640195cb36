//! Two-process counter rendezvous over POSIX shared memory.
//!
//! An owner process creates a shared counter segment and a set of named
//! semaphores ("gates"); a peer process attaches to them by name. Both
//! announce readiness, increment the counter under a shared mutex, signal
//! completion, and check the total against `2 * quota`.
//!
//! The entry points are [`protocol::Session::establish_owner`] and
//! [`protocol::Session::attach_peer`].

pub mod config;
pub mod error;
pub mod gates;
pub mod ipc;
pub mod protocol;
pub mod segment;
pub mod signal;
pub mod stale;
pub mod trace;
pub mod wait;

pub use config::Config;
pub use error::TandemError;
pub use gates::Shape;
pub use protocol::{Phase, Report, Role, Session};
pub use signal::Shutdown;
pub use trace::init_tracing;
