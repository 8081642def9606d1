use std::time::Duration;

use comm::{CommunicationError, PeerId};
use thiserror::Error;

/// Errors a [`Process`](crate::Process) reports back to the coordinator.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The local peer was not selected for the running subset.
    #[error("peer {0} is not part of the active subset")]
    NotInSubset(PeerId),
    /// The protocol identified the peers responsible for the failure.
    #[error("{reason} (culprits: {culprits:?})")]
    Culprits {
        culprits: Vec<PeerId>,
        reason: String,
    },
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ElectionError {
    #[error("no coordinator candidates")]
    NoCandidates,
    #[error("election timed out after {0:?}")]
    Timeout(Duration),
    #[error("communication closed during election")]
    Closed,
}

/// Errors returned by [`Coordinator::execute`](crate::Coordinator::execute).
#[derive(Debug, Error)]
pub enum Error {
    #[error("process already pending for session {0}")]
    AlreadyPending(String),
    #[error("no processes to execute")]
    NoProcesses,
    #[error("process of session {found} executed together with session {expected}")]
    MismatchedSessions { expected: String, found: String },
    #[error("coordinator election failed: {0}")]
    Election(#[from] ElectionError),
    /// The coordinator never started the session.
    #[error("coordinator {peer} did not start the session")]
    Coordinator { peer: PeerId },
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error("process failed: {reason} (culprits: {culprits:?})")]
    Culprits {
        culprits: Vec<PeerId>,
        reason: String,
    },
    #[error("peer {peer} is not part of the active subset")]
    Subset { peer: PeerId },
    #[error("tss process timed out after {0:?}")]
    Timeout(Duration),
    /// The coordinator broadcast a fail message.
    #[error("session aborted by coordinator {peer}")]
    Aborted { peer: PeerId },
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("process failed: {0}")]
    Process(String),
    #[error("communication closed")]
    Closed,
}

/// What the coordinator does after an attempt failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Run a bully election without the given peers and start over.
    Reelect { exclude: Vec<PeerId> },
    /// Wait for a start message from whichever peer coordinates next.
    WaitForStart,
    /// Give up and return the error.
    Fatal,
}

impl Error {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Error::Coordinator { peer } => RetryPolicy::Reelect {
                exclude: vec![peer.clone()],
            },
            Error::Communication(_) => RetryPolicy::Reelect {
                exclude: Vec::new(),
            },
            Error::Culprits { culprits, .. } => RetryPolicy::Reelect {
                exclude: culprits.clone(),
            },
            Error::Subset { .. } => RetryPolicy::WaitForStart,
            Error::AlreadyPending(_)
            | Error::NoProcesses
            | Error::MismatchedSessions { .. }
            | Error::Election(_)
            | Error::Timeout(_)
            | Error::Aborted { .. }
            | Error::InvalidMessage(_)
            | Error::Process(_)
            | Error::Closed => RetryPolicy::Fatal,
        }
    }
}

impl From<ProcessError> for Error {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotInSubset(peer) => Error::Subset { peer },
            ProcessError::Culprits { culprits, reason } => Error::Culprits { culprits, reason },
            ProcessError::Communication(err) => Error::Communication(err),
            ProcessError::Other(reason) => Error::Process(reason),
        }
    }
}
