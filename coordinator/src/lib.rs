//! Coordination of multi-party threshold cryptography sessions.
//!
//! A [`Coordinator`] drives one or more [`Process`]es that share a session id
//! through the initiate, ready and start handshake. It elects the peer that
//! coordinates the session, retries recoverable failures with a new
//! coordinator and bounds every attempt with a timeout.

mod config;
mod coordinator;
pub mod elector;
mod error;
pub mod message;
mod process;
pub mod round;

pub use config::{BullyConfig, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use elector::{CoordinatorElector, ElectorFactory, ElectorKind};
pub use error::{ElectionError, Error, ProcessError, RetryPolicy};
pub use process::{exclude_peers, is_participant, Process, ProcessResult, ResultSender};
pub use round::RoundChannel;
