use std::{collections::HashMap, ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::interval,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{RTCPeerConnection, sdp::session_description::RTCSessionDescription},
};

use crate::{
    config::Config,
    errors::ProviderError,
    provider::{
        Channel, ChannelProvider, ConnectionId, EventSender, Identity, ProviderEvent,
        rtc::{ClosedSender, RtcChannel, create_rtc_connection},
    },
    room::PeerId,
};

// messages understood by a PeerJS signaling server
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
enum ClientMessage {
    Heartbeat,
    Offer { dst: PeerId, payload: OfferPayload },
    Answer { dst: PeerId, payload: AnswerPayload },
    Candidate { dst: PeerId, payload: CandidatePayload },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
enum ServerMessage {
    Open,
    IdTaken {
        #[serde(default)]
        payload: ErrorPayload,
    },
    InvalidKey {
        #[serde(default)]
        payload: ErrorPayload,
    },
    Error {
        #[serde(default)]
        payload: ErrorPayload,
    },
    Offer { src: PeerId, payload: OfferPayload },
    Answer { src: PeerId, payload: AnswerPayload },
    Candidate { src: PeerId, payload: CandidatePayload },
    Leave { src: PeerId },
    Expire { src: PeerId },
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    sdp: RTCSessionDescription,
    #[serde(rename = "type")]
    kind: String,
    connection_id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    reliable: bool,
    #[serde(default)]
    serialization: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerPayload {
    sdp: RTCSessionDescription,
    #[serde(rename = "type")]
    kind: String,
    connection_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePayload {
    candidate: RTCIceCandidateInit,
    #[serde(rename = "type")]
    kind: String,
    connection_id: String,
}

const DATA_CONNECTION: &str = "data";

#[derive(derive_more::Debug)]
enum Command {
    #[debug("Connect({target})")]
    Connect {
        target: PeerId,
        reply: oneshot::Sender<Result<RtcChannel, ProviderError>>,
    },
    Signal(ClientMessage),
    Destroy,
}

pub struct PeerJsProvider {
    config: Arc<Config>,
}

impl PeerJsProvider {
    pub fn new(config: Config) -> Self {
        PeerJsProvider { config: Arc::new(config) }
    }
}

#[async_trait]
impl ChannelProvider for PeerJsProvider {
    async fn register(&self, desired_id: Option<PeerId>, events: EventSender) -> Result<Box<dyn Identity>, ProviderError> {
        let id = desired_id.unwrap_or_else(|| PeerId::new(Uuid::new_v4().to_string()));
        let url = self.config.signaling.url(id.as_str(), &random_token(16));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = mpsc::unbounded_channel();
        let signaling = Signaling {
            id: id.clone(),
            config: self.config.clone(),
            events,
            commands: commands.clone(),
            closed,
            links: HashMap::new(),
        };
        tokio::spawn(signaling.run(url, commands_rx, closed_rx));
        Ok(Box::new(PeerJsIdentity { id, commands }))
    }
}

struct PeerJsIdentity {
    id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl Identity for PeerJsIdentity {
    async fn connect(&self, target: &PeerId) -> Result<Box<dyn Channel>, ProviderError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { target: target.clone(), reply })
            .map_err(|_| ProviderError::Disconnected)?;
        let channel = rx.await.map_err(|_| ProviderError::Disconnected)??;
        Ok(Box::new(channel))
    }

    async fn destroy(&self) {
        debug!("destroying identity {}", self.id);
        let _ = self.commands.send(Command::Destroy);
    }
}

// owns the websocket and every peer connection negotiated through it
struct Signaling {
    id: PeerId,
    config: Arc<Config>,
    events: EventSender,
    commands: mpsc::UnboundedSender<Command>,
    closed: ClosedSender,
    links: HashMap<ConnectionId, RtcChannel>,
}

impl Signaling {
    async fn run(
        mut self,
        url: String,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut closed: mpsc::UnboundedReceiver<ConnectionId>,
    ) {
        info!("connecting to signaling server as {}", self.id);
        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                error!("failed to connect to signaling server: {err}");
                let _ = self.events.send(ProviderEvent::Error(ProviderError::Network(err.to_string())));
                return;
            },
        };
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        loop {
            let outgoing = select! {
                _ = heartbeat.tick() => ClientMessage::Heartbeat,
                command = commands.recv() => match command {
                    None | Some(Command::Destroy) => break,
                    Some(Command::Connect { target, reply }) => {
                        let _ = reply.send(self.connect(target).await);
                        continue;
                    },
                    Some(Command::Signal(message)) => message,
                },
                Some(id) = closed.recv() => {
                    self.forget(&id).await;
                    continue;
                },
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) if message.is_text() || message.is_binary() => message,
                        Some(Ok(Message::Close(_))) | None => {
                            error!("signaling server closed the connection");
                            let _ = self.events.send(ProviderEvent::Error(ProviderError::Network("connection closed".to_string())));
                            break;
                        },
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            error!("signaling connection failed: {err}");
                            let _ = self.events.send(ProviderEvent::Error(ProviderError::Network(err.to_string())));
                            break;
                        },
                    };
                    match serde_json::from_slice::<ServerMessage>(&message.into_data()) {
                        Ok(message) => match self.handle(message).await {
                            ControlFlow::Continue(()) => continue,
                            ControlFlow::Break(()) => break,
                        },
                        Err(err) => {
                            warn!("malformed message from signaling server: {err}");
                            continue;
                        },
                    }
                },
            };
            let data = match serde_json::to_string(&outgoing) {
                Ok(data) => data,
                Err(err) => {
                    warn!("failed to encode {outgoing:?}: {err}");
                    continue;
                },
            };
            if let Err(err) = sink.send(Message::text(data)).await {
                error!("failed to send to signaling server: {err}");
                let _ = self.events.send(ProviderEvent::Error(ProviderError::Network(err.to_string())));
                break;
            }
        }
        for (_, link) in self.links.drain() {
            link.close().await;
        }
        let _ = sink.close().await;
        info!("identity {} closed", self.id);
    }

    async fn handle(&mut self, message: ServerMessage) -> ControlFlow<()> {
        debug!("signaling message: {message:?}");
        match message {
            ServerMessage::Open => {
                info!("identity {} is open", self.id);
                let _ = self.events.send(ProviderEvent::Open(self.id.clone()));
            },
            ServerMessage::IdTaken { .. } => {
                let _ = self.events.send(ProviderEvent::Error(ProviderError::IdTaken(self.id.clone())));
                return ControlFlow::Break(());
            },
            ServerMessage::InvalidKey { payload } => {
                let _ = self.events.send(ProviderEvent::Error(ProviderError::InvalidKey(payload.msg)));
                return ControlFlow::Break(());
            },
            ServerMessage::Error { payload } => {
                let _ = self.events.send(ProviderEvent::Error(ProviderError::Server(payload.msg)));
            },
            ServerMessage::Offer { src, payload } => {
                let id = ConnectionId::new(payload.connection_id.clone());
                if let Err(err) = self.accept(src.clone(), payload).await {
                    warn!("failed to answer offer {id} from {src}: {err}");
                    let _ = self.events.send(ProviderEvent::ChannelError(src.clone(), id, ProviderError::Negotiation(src)));
                }
            },
            ServerMessage::Answer { src, payload } => {
                let id = ConnectionId::new(payload.connection_id);
                let Some(link) = self.links.get(&id) else {
                    warn!("answer from {src} for unknown connection {id}");
                    return ControlFlow::Continue(());
                };
                let applied = link.rtc().set_remote_description(payload.sdp).await;
                if let Err(err) = applied {
                    warn!("failed to apply answer from {src}: {err}");
                    let _ = self.events.send(ProviderEvent::ChannelError(src.clone(), id.clone(), ProviderError::Negotiation(src)));
                    self.forget(&id).await;
                }
            },
            ServerMessage::Candidate { src, payload } => {
                let Some(link) = self.links.get(&ConnectionId::new(payload.connection_id.clone())) else {
                    debug!("candidate from {src} for unknown connection {}", payload.connection_id);
                    return ControlFlow::Continue(());
                };
                if let Err(err) = link.rtc().add_ice_candidate(payload.candidate).await {
                    warn!("failed to add candidate from {src}: {err}");
                }
            },
            ServerMessage::Leave { src } => {
                info!("peer {src} left");
                for id in self.links_to(&src) {
                    self.forget(&id).await;
                }
            },
            ServerMessage::Expire { src } => {
                warn!("could not reach peer {src}");
                for id in self.links_to(&src) {
                    let err = ProviderError::PeerUnavailable(src.clone());
                    let _ = self.events.send(ProviderEvent::ChannelError(src.clone(), id.clone(), err));
                    self.forget(&id).await;
                }
            },
            ServerMessage::Heartbeat | ServerMessage::Unknown => {},
        }
        ControlFlow::Continue(())
    }

    async fn connect(&mut self, target: PeerId) -> Result<RtcChannel, ProviderError> {
        let id = ConnectionId::new(format!("dc_{}", random_token(10)));
        let rtc = match create_rtc_connection(self.config.ice_servers.clone()).await {
            Ok(rtc) => Arc::new(rtc),
            Err(err) => {
                warn!("failed to create connection to {target}: {err}");
                return Err(ProviderError::Negotiation(target));
            },
        };
        let channel = RtcChannel::new(id.clone(), target.clone(), rtc.clone(), self.events.clone(), self.closed.clone());
        if let Err(err) = self.offer(&channel).await {
            warn!("failed to offer connection {id} to {target}: {err}");
            let _ = rtc.close().await;
            return Err(ProviderError::Negotiation(target));
        }
        info!("offered connection {id} to {target}");
        self.links.insert(id, channel.clone());
        Ok(channel)
    }

    async fn offer(&self, channel: &RtcChannel) -> Result<(), webrtc::Error> {
        let (rtc, id, target) = (channel.rtc(), channel.id(), channel.peer());
        let data = rtc.create_data_channel(id.as_str(), None).await?;
        channel.attach(data, self.events.clone(), self.closed.clone());
        self.trickle(rtc, target, id);

        let offer = rtc.create_offer(None).await?;
        rtc.set_local_description(offer.clone()).await?;
        let _ = self.commands.send(Command::Signal(ClientMessage::Offer {
            dst: target.clone(),
            payload: OfferPayload {
                sdp: offer,
                kind: DATA_CONNECTION.to_string(),
                connection_id: id.to_string(),
                label: Some(id.to_string()),
                reliable: true,
                serialization: Some("json".to_string()),
                metadata: serde_json::Value::Null,
            },
        }));
        Ok(())
    }

    async fn accept(&mut self, src: PeerId, offer: OfferPayload) -> Result<(), webrtc::Error> {
        if offer.kind != DATA_CONNECTION {
            debug!("ignoring {} connection from {src}", offer.kind);
            return Ok(());
        }
        let id = ConnectionId::new(offer.connection_id);
        let rtc = Arc::new(create_rtc_connection(self.config.ice_servers.clone()).await?);
        let channel = RtcChannel::new(id.clone(), src.clone(), rtc.clone(), self.events.clone(), self.closed.clone());
        let attach = channel.attacher();
        let (events, closed) = (self.events.clone(), self.closed.clone());
        rtc.on_data_channel(Box::new(move |data| {
            attach(data, events.clone(), closed.clone());
            Box::pin(async {})
        }));
        self.trickle(&rtc, &src, &id);

        if let Err(err) = self.answer(&channel, offer.sdp).await {
            let _ = rtc.close().await;
            return Err(err);
        }
        info!("accepted connection {id} from {src}");
        self.links.insert(id, channel.clone());
        let _ = self.events.send(ProviderEvent::Connection(Box::new(channel)));
        Ok(())
    }

    async fn answer(&self, channel: &RtcChannel, sdp: RTCSessionDescription) -> Result<(), webrtc::Error> {
        let rtc = channel.rtc();
        rtc.set_remote_description(sdp).await?;
        let answer = rtc.create_answer(None).await?;
        rtc.set_local_description(answer.clone()).await?;
        let _ = self.commands.send(Command::Signal(ClientMessage::Answer {
            dst: channel.peer().clone(),
            payload: AnswerPayload {
                sdp: answer,
                kind: DATA_CONNECTION.to_string(),
                connection_id: channel.id().to_string(),
            },
        }));
        Ok(())
    }

    fn trickle(&self, rtc: &RTCPeerConnection, dst: &PeerId, id: &ConnectionId) {
        let commands = self.commands.clone();
        let (dst, connection_id) = (dst.clone(), id.to_string());
        rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate
                && let Ok(candidate) = candidate.to_json()
            {
                let _ = commands.send(Command::Signal(ClientMessage::Candidate {
                    dst: dst.clone(),
                    payload: CandidatePayload {
                        candidate,
                        kind: DATA_CONNECTION.to_string(),
                        connection_id: connection_id.clone(),
                    },
                }));
            }
            Box::pin(async {})
        }));
    }

    fn links_to(&self, peer: &PeerId) -> Vec<ConnectionId> {
        self.links
            .iter()
            .filter(|(_, link)| link.peer() == peer)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // drops a failed or finished link; repeated calls for the same id are no-ops
    async fn forget(&mut self, id: &ConnectionId) {
        let Some(link) = self.links.remove(id) else {
            return;
        };
        debug!("dropping connection {id} to {}", link.peer());
        link.close().await;
        let _ = self.events.send(ProviderEvent::ChannelClose(link.peer().clone(), id.clone()));
    }
}

fn random_token(len: usize) -> String {
    rand::rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}
