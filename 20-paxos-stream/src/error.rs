use std::{io, num::ParseIntError};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the command layer can surface to a client.
///
/// Parse and build errors (`UnknownCommand`, `IncorrectCommand`, `Decode`)
/// are raised before any collaborator is touched. The rest originate in the
/// log or consensus collaborators and pass through the dispatcher unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown cmd {0:?}")]
    UnknownCommand(String),

    #[error("incorrect cmd")]
    IncorrectCommand,

    #[error("cannot decode {arg:?} as an integer: {source}")]
    Decode {
        arg: String,
        #[source]
        source: ParseIntError,
    },

    #[error("no quorum: {reason}")]
    NoQuorum { reason: String },

    #[error("log storage: {0}")]
    Storage(String),

    #[error("slot {index} already holds a different value")]
    Conflict { index: u64 },

    #[error("index {index} out of range, log head is {head}")]
    OutOfRange { index: u64, head: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("remote: {0}")]
    Remote(String),

    #[error("cannot encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors caused by the shape of the incoming line rather than
    /// by the state of the replica.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::UnknownCommand(_) | Error::IncorrectCommand | Error::Decode { .. }
        )
    }
}
