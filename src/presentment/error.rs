use crate::cbor::CborError;
use crate::definitions::session;
use crate::hpke;
use crate::presentment::model::StateKind;
use crate::presentment::source::{KeyError, SourceError};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected state {expected}, was {actual}")]
    IllegalState {
        expected: StateKind,
        actual: StateKind,
    },
    #[error("candidate credentials must come from distinct documents, {0} appears twice")]
    DuplicateDocuments(String),
    #[error("document {0} was not offered")]
    UnknownDocument(String),
    #[error("presentment was cancelled")]
    Cancelled,
    #[error("timed out waiting for the reader")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no credential matches the request")]
    NoMatchingCredential,
    #[error(transparent)]
    SessionEncryption(#[from] session::Error),
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Hpke(#[from] hpke::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<coset::CoseError> for Error {
    fn from(e: coset::CoseError) -> Self {
        Error::Cbor(e.into())
    }
}

/// How a presentment ended, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Cancelled,
    TimedOut,
    Error,
}

impl Error {
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::Cancelled => Outcome::Cancelled,
            Error::Timeout => Outcome::TimedOut,
            _ => Outcome::Error,
        }
    }
}

impl Outcome {
    pub fn of(error: Option<&Error>) -> Self {
        error.map_or(Outcome::Success, Error::outcome)
    }
}
