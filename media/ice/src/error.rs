use crate::candidate::ParseCandidateError;

/// Errors returned by the [`IceAgent`](crate::IceAgent) API or reported through [`IceEvent`](crate::IceEvent)s
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unknown stream")]
    UnknownStream,
    #[error("component does not exist in the stream")]
    UnknownComponent,
    #[error(transparent)]
    InvalidCandidate(#[from] ParseCandidateError),
    #[error("unsupported candidate, {0}")]
    UnsupportedCandidate(&'static str),
    #[error("no candidate pair has been selected for the component")]
    NoSelectedPair,
    #[error("agent is closed")]
    Closed,
    #[error("STUN transaction timed out")]
    StunTimeout,
    #[error("TURN allocation quota reached")]
    TurnAllocationQuota,
    #[error("TURN server responded with error {code}: {reason}")]
    TurnError { code: u16, reason: String },
    #[error("invalid STUN message, {0}")]
    Stun(String),
}

impl From<stun_types::Error> for Error {
    fn from(e: stun_types::Error) -> Self {
        Self::Stun(e.to_string())
    }
}
