use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::{
    api::{APIBuilder, interceptor_registry::register_default_interceptors, media_engine::MediaEngine},
    data_channel::{RTCDataChannel, data_channel_message::DataChannelMessage, data_channel_state::RTCDataChannelState},
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    peer_connection::{RTCPeerConnection, configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState},
};

use crate::{
    errors::ProviderError,
    provider::{Channel, ConnectionId, EventSender, ProviderEvent},
    room::PeerId,
};

pub(crate) async fn create_rtc_connection(ice_servers: Vec<RTCIceServer>) -> webrtc::error::Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    debug!("ice servers: {:?}", ice_servers);
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    api.new_peer_connection(config).await
}

pub(crate) type ClosedSender = mpsc::UnboundedSender<ConnectionId>;

// the answering side only learns its data channel once the offerer's arrives
#[derive(Clone)]
pub(crate) struct RtcChannel {
    id: ConnectionId,
    peer: PeerId,
    rtc: Arc<RTCPeerConnection>,
    data: Arc<OnceLock<Arc<RTCDataChannel>>>,
}

impl RtcChannel {
    // `closed` learns the id once the connection fails or closes, so its owner can drop it
    pub(crate) fn new(
        id: ConnectionId,
        peer: PeerId,
        rtc: Arc<RTCPeerConnection>,
        events: EventSender,
        closed: ClosedSender,
    ) -> Self {
        let (id2, peer2) = (id.clone(), peer.clone());
        rtc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("peer connection {id2} to {peer2} is {state}");
            match state {
                RTCPeerConnectionState::Failed => {
                    let err = ProviderError::Negotiation(peer2.clone());
                    let _ = events.send(ProviderEvent::ChannelError(peer2.clone(), id2.clone(), err));
                    let _ = closed.send(id2.clone());
                },
                RTCPeerConnectionState::Closed => {
                    let _ = events.send(ProviderEvent::ChannelClose(peer2.clone(), id2.clone()));
                    let _ = closed.send(id2.clone());
                },
                _ => {},
            }
            Box::pin(async {})
        }));
        RtcChannel { id, peer, rtc, data: Arc::new(OnceLock::new()) }
    }

    pub(crate) fn rtc(&self) -> &Arc<RTCPeerConnection> {
        &self.rtc
    }

    pub(crate) fn attach(&self, channel: Arc<RTCDataChannel>, events: EventSender, closed: ClosedSender) {
        attach(&self.data, &self.id, &self.peer, channel, events, closed);
    }

    // for `on_data_channel` handlers, which must not own the peer connection
    pub(crate) fn attacher(&self) -> impl Fn(Arc<RTCDataChannel>, EventSender, ClosedSender) + Send + Sync + 'static {
        let (data, id, peer) = (self.data.clone(), self.id.clone(), self.peer.clone());
        move |channel, events, closed| attach(&data, &id, &peer, channel, events, closed)
    }
}

fn attach(
    slot: &OnceLock<Arc<RTCDataChannel>>,
    id: &ConnectionId,
    peer: &PeerId,
    channel: Arc<RTCDataChannel>,
    events: EventSender,
    closed: ClosedSender,
) {
    if slot.set(channel.clone()).is_err() {
        warn!("ignoring extra data channel `{}` from {}", channel.label(), peer);
        return;
    }

    let (id2, peer2, tx) = (id.clone(), peer.clone(), events.clone());
    channel.on_open(Box::new(move || {
        let _ = tx.send(ProviderEvent::ChannelOpen(peer2, id2));
        Box::pin(async {})
    }));
    let (id2, peer2, tx) = (id.clone(), peer.clone(), events.clone());
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = tx.send(ProviderEvent::ChannelData(peer2.clone(), id2.clone(), message.data));
        Box::pin(async {})
    }));
    let (id2, peer2, tx) = (id.clone(), peer.clone(), events.clone());
    channel.on_close(Box::new(move || {
        let _ = tx.send(ProviderEvent::ChannelClose(peer2.clone(), id2.clone()));
        let _ = closed.send(id2.clone());
        Box::pin(async {})
    }));
    let (id2, peer2, tx) = (id.clone(), peer.clone(), events);
    channel.on_error(Box::new(move |err| {
        warn!("data channel {id2} to {peer2} failed: {err}");
        let err = ProviderError::Negotiation(peer2.clone());
        let _ = tx.send(ProviderEvent::ChannelError(peer2.clone(), id2.clone(), err));
        Box::pin(async {})
    }));
}

#[async_trait]
impl Channel for RtcChannel {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.data
            .get()
            .is_some_and(|channel| channel.ready_state() == RTCDataChannelState::Open)
    }

    async fn send(&self, text: String) -> Result<(), ProviderError> {
        let Some(channel) = self.data.get() else {
            return Err(ProviderError::PeerUnavailable(self.peer.clone()));
        };
        channel
            .send_text(text)
            .await
            .map_err(|_| ProviderError::PeerUnavailable(self.peer.clone()))?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.rtc.close().await {
            debug!("failed to close peer connection to {}: {err}", self.peer);
        }
    }
}
