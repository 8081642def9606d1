//! A threshold signing node: configuration, key management and the
//! peer-to-peer bus that coordinated sessions run on.

pub mod args;
pub mod config;
pub mod init;
pub mod node;
pub mod peer;
pub mod write_atomic;

pub use config::Config;
pub use node::{Node, PeerStatusTracker};
