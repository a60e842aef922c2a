use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{errors::ProviderError, room::PeerId};

pub mod memory;
pub mod peerjs;
pub(crate) mod rtc;

pub type EventSender = mpsc::UnboundedSender<ProviderEvent>;

/// Names one channel; a peer that reconnects gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// channel events carry the remote peer and the channel they belong to
#[derive(derive_more::Debug)]
pub enum ProviderEvent {
    Open(PeerId),
    Error(ProviderError),
    #[debug("Connection({}, {})", _0.peer(), _0.id())]
    Connection(Box<dyn Channel>),
    ChannelOpen(PeerId, ConnectionId),
    ChannelData(PeerId, ConnectionId, Bytes),
    ChannelClose(PeerId, ConnectionId),
    ChannelError(PeerId, ConnectionId, ProviderError),
}

#[async_trait]
pub trait ChannelProvider: Send + Sync {
    // Open or Error is emitted on `events` once the identity is live
    async fn register(&self, desired_id: Option<PeerId>, events: EventSender) -> Result<Box<dyn Identity>, ProviderError>;
}

#[async_trait]
pub trait Identity: Send + Sync {
    async fn connect(&self, target: &PeerId) -> Result<Box<dyn Channel>, ProviderError>;
    async fn destroy(&self);
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn peer(&self) -> &PeerId;
    fn id(&self) -> &ConnectionId;
    fn is_open(&self) -> bool;
    async fn send(&self, text: String) -> Result<(), ProviderError>;
    async fn close(&self);
}
