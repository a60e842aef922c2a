use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::ProviderError,
    provider::{Channel, ChannelProvider, ConnectionId, EventSender, Identity, ProviderEvent},
    room::PeerId,
};

// identities live in one process and talk over unbounded queues
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, Arc<Endpoint>>>>,
}

struct Endpoint {
    events: EventSender,
    channels: Mutex<Vec<MemoryChannel>>,
}

impl Endpoint {
    // closed channels are dropped so they stop holding the other side's sender
    fn track(&self, channel: MemoryChannel) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|channel| channel.is_open());
        channels.push(channel);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> MemoryProvider {
        MemoryProvider { network: self.clone() }
    }

    fn lookup(&self, id: &PeerId) -> Option<Arc<Endpoint>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .filter(|endpoint| !endpoint.events.is_closed())
            .cloned()
    }
}

pub struct MemoryProvider {
    network: MemoryNetwork,
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn register(&self, desired_id: Option<PeerId>, events: EventSender) -> Result<Box<dyn Identity>, ProviderError> {
        let id = desired_id.unwrap_or_else(|| PeerId::new(Uuid::new_v4().to_string()));
        let endpoint = {
            let mut peers = self.network.peers.lock().unwrap_or_else(|e| e.into_inner());
            match peers.get(&id) {
                Some(existing) if !existing.events.is_closed() => None,
                _ => {
                    let endpoint = Arc::new(Endpoint { events: events.clone(), channels: Mutex::new(Vec::new()) });
                    peers.insert(id.clone(), endpoint.clone());
                    Some(endpoint)
                },
            }
        };
        if endpoint.is_some() {
            debug!("memory identity {id} registered");
            let _ = events.send(ProviderEvent::Open(id.clone()));
        } else {
            let _ = events.send(ProviderEvent::Error(ProviderError::IdTaken(id.clone())));
        }
        Ok(Box::new(MemoryIdentity { id, network: self.network.clone(), endpoint }))
    }
}

struct MemoryIdentity {
    id: PeerId,
    network: MemoryNetwork,
    // None when registration was rejected
    endpoint: Option<Arc<Endpoint>>,
}

#[async_trait]
impl Identity for MemoryIdentity {
    async fn connect(&self, target: &PeerId) -> Result<Box<dyn Channel>, ProviderError> {
        let Some(endpoint) = &self.endpoint else {
            return Err(ProviderError::Disconnected);
        };
        let remote = self.network.lookup(target);
        let open = Arc::new(AtomicBool::new(remote.is_some()));
        let id = ConnectionId::new(format!("mem_{}", Uuid::new_v4().simple()));
        let local = MemoryChannel {
            id: id.clone(),
            peer: target.clone(),
            local_id: self.id.clone(),
            local: endpoint.events.clone(),
            remote: remote.as_ref().map(|remote| remote.events.clone()),
            open: open.clone(),
        };
        endpoint.track(local.clone());

        let Some(remote) = remote else {
            let _ = endpoint.events.send(ProviderEvent::ChannelError(
                target.clone(),
                id,
                ProviderError::PeerUnavailable(target.clone()),
            ));
            return Ok(Box::new(local));
        };
        let inbound = MemoryChannel {
            id: id.clone(),
            peer: self.id.clone(),
            local_id: target.clone(),
            local: remote.events.clone(),
            remote: Some(endpoint.events.clone()),
            open: open.clone(),
        };
        remote.track(inbound.clone());
        let _ = remote.events.send(ProviderEvent::Connection(Box::new(inbound)));
        let _ = remote.events.send(ProviderEvent::ChannelOpen(self.id.clone(), id.clone()));
        let _ = endpoint.events.send(ProviderEvent::ChannelOpen(target.clone(), id));
        Ok(Box::new(local))
    }

    async fn destroy(&self) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let channels = std::mem::take(&mut *endpoint.channels.lock().unwrap_or_else(|e| e.into_inner()));
        for channel in channels {
            channel.shutdown();
        }
        let mut peers = self.network.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.get(&self.id).is_some_and(|current| Arc::ptr_eq(current, endpoint)) {
            peers.remove(&self.id);
        }
        debug!("memory identity {} destroyed", self.id);
    }
}

// both ends share the `open` flag, so closing either side closes the pair once
#[derive(Clone)]
struct MemoryChannel {
    id: ConnectionId,
    peer: PeerId,
    local_id: PeerId,
    local: EventSender,
    remote: Option<EventSender>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.local.send(ProviderEvent::ChannelClose(self.peer.clone(), self.id.clone()));
        if let Some(remote) = &self.remote {
            let _ = remote.send(ProviderEvent::ChannelClose(self.local_id.clone(), self.id.clone()));
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: String) -> Result<(), ProviderError> {
        let Some(remote) = self.remote.as_ref().filter(|_| self.is_open()) else {
            return Err(ProviderError::PeerUnavailable(self.peer.clone()));
        };
        remote
            .send(ProviderEvent::ChannelData(self.local_id.clone(), self.id.clone(), Bytes::from(text)))
            .map_err(|_| ProviderError::PeerUnavailable(self.peer.clone()))
    }

    async fn close(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let network = MemoryNetwork::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _a = network.provider().register(Some(PeerId::from("123456")), tx1).await.unwrap();
        let _b = network.provider().register(Some(PeerId::from("123456")), tx2).await.unwrap();
        assert!(matches!(rx1.recv().await, Some(ProviderEvent::Open(id)) if id.as_str() == "123456"));
        assert!(matches!(rx2.recv().await, Some(ProviderEvent::Error(ProviderError::IdTaken(_)))));
    }

    #[tokio::test]
    async fn connect_send_and_close() {
        let network = MemoryNetwork::new();
        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let _host = network.provider().register(Some(PeerId::from("111111")), host_tx).await.unwrap();
        let peer = network.provider().register(None, peer_tx).await.unwrap();
        let Some(ProviderEvent::Open(peer_id)) = peer_rx.recv().await else { panic!("peer not open") };
        assert!(matches!(host_rx.recv().await, Some(ProviderEvent::Open(_))));

        let channel = peer.connect(&PeerId::from("111111")).await.unwrap();
        assert!(channel.is_open());
        let Some(ProviderEvent::Connection(inbound)) = host_rx.recv().await else { panic!("no inbound connection") };
        assert_eq!(inbound.peer(), &peer_id);
        assert_eq!(inbound.id(), channel.id());
        assert!(matches!(host_rx.recv().await, Some(ProviderEvent::ChannelOpen(id, _)) if id == peer_id));
        assert!(matches!(peer_rx.recv().await, Some(ProviderEvent::ChannelOpen(id, _)) if id.as_str() == "111111"));

        channel.send("hello".to_string()).await.unwrap();
        let Some(ProviderEvent::ChannelData(from, conn, data)) = host_rx.recv().await else { panic!("no data") };
        assert_eq!(from, peer_id);
        assert_eq!(&conn, channel.id());
        assert_eq!(&data[..], b"hello");

        inbound.close().await;
        inbound.close().await;
        assert!(!channel.is_open());
        assert!(matches!(host_rx.recv().await, Some(ProviderEvent::ChannelClose(id, _)) if id == peer_id));
        assert!(matches!(peer_rx.recv().await, Some(ProviderEvent::ChannelClose(_, conn)) if &conn == channel.id()));
        assert!(host_rx.try_recv().is_err());
        assert!(channel.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn connect_to_unknown_peer_reports_channel_error() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let identity = network.provider().register(None, tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProviderEvent::Open(_))));
        let channel = identity.connect(&PeerId::from("999999")).await.unwrap();
        assert!(!channel.is_open());
        assert!(matches!(
            rx.recv().await,
            Some(ProviderEvent::ChannelError(id, _, ProviderError::PeerUnavailable(_))) if id.as_str() == "999999"
        ));
    }

    #[tokio::test]
    async fn destroy_frees_the_id() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = network.provider().register(Some(PeerId::from("222222")), tx).await.unwrap();
        first.destroy().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _second = network.provider().register(Some(PeerId::from("222222")), tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProviderEvent::Open(_))));
    }

    #[tokio::test]
    async fn closed_channels_are_pruned() {
        let network = MemoryNetwork::new();
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let _host = network.provider().register(Some(PeerId::from("333333")), host_tx).await.unwrap();
        let peer = network.provider().register(None, peer_tx).await.unwrap();
        for _ in 0..5 {
            let channel = peer.connect(&PeerId::from("333333")).await.unwrap();
            channel.close().await;
        }
        let _live = peer.connect(&PeerId::from("333333")).await.unwrap();
        let host = network.lookup(&PeerId::from("333333")).unwrap();
        assert_eq!(host.tracked(), 1);
    }
}
