use thiserror::Error;

use crate::room::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("ID \"{0}\" is taken")]
    IdTaken(PeerId),
    #[error("API key is invalid: {0}")]
    InvalidKey(String),
    #[error("could not connect to peer {0}")]
    PeerUnavailable(PeerId),
    #[error("lost connection to signaling server: {0}")]
    Network(String),
    #[error("signaling server error: {0}")]
    Server(String),
    #[error("negotiation of connection to {0} failed")]
    Negotiation(PeerId),
    #[error("identity has been destroyed")]
    Disconnected,
}

impl ProviderError {
    // error type names as reported by PeerJS
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::IdTaken(_) => "unavailable-id",
            ProviderError::InvalidKey(_) => "invalid-key",
            ProviderError::PeerUnavailable(_) => "peer-unavailable",
            ProviderError::Network(_) => "network",
            ProviderError::Server(_) => "server-error",
            ProviderError::Negotiation(_) => "negotiation-failed",
            ProviderError::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("a session is already active")]
    AlreadyActive,
    #[error("connection to {0} closed before it opened")]
    ClosedBeforeOpen(PeerId),
    #[error("session was disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session actor unavailable: {0}")]
    Actor(String),
    #[error("Please enter your name")]
    MissingName,
    #[error("Please enter both room code and your name")]
    MissingJoinDetails,
    #[error("invalid room code `{0}`, expected 6 digits")]
    InvalidRoomCode(String),
}
