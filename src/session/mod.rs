use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, async_trait, call, cast};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    errors::{Error, ProviderError, SessionError},
    provider::{Channel, ChannelProvider, ConnectionId, Identity, ProviderEvent},
    room::{self, PeerId, RoomCode},
};

pub mod protocol;

pub use protocol::{PlayerData, Position, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => f.write_str("Connecting..."),
            ConnectionStatus::Connected => f.write_str("Connected"),
            ConnectionStatus::Disconnected => f.write_str("Disconnected"),
            ConnectionStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PlayerJoined { peer: PeerId, player: PlayerData },
    PlayerLeft { peer: PeerId },
    StatusChanged(ConnectionStatus),
    PositionUpdate { peer: PeerId, position: Position },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

pub enum SessionMsg {
    // requests from the application
    Host(Option<RoomCode>, PlayerData, RpcReplyPort<Result<RoomCode, SessionError>>),
    Join(RoomCode, PlayerData, RpcReplyPort<Result<PeerId, SessionError>>),
    SendPosition(Position),
    Disconnect(RpcReplyPort<()>),
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
    LocalId(RpcReplyPort<Option<PeerId>>),
    Peers(RpcReplyPort<Vec<PeerId>>),

    // events from the provider, tagged with the attempt they belong to
    Provider(u64, ProviderEvent),
}

enum Pending {
    Host(RpcReplyPort<Result<RoomCode, SessionError>>),
    Join(RpcReplyPort<Result<PeerId, SessionError>>),
}

struct Active {
    role: Role,
    code: RoomCode,
    player: PlayerData,
    identity: Box<dyn Identity>,
    local_id: Option<PeerId>,
    pending: Option<Pending>,
}

pub struct SessionState {
    provider: Arc<dyn ChannelProvider>,
    generation: u64,
    active: Option<Active>,
    connections: HashMap<PeerId, Box<dyn Channel>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionState {
    fn emit(&self, event: SessionEvent) {
        debug!("session event: {event:?}");
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    // events from a replaced or dropped channel are stale
    fn is_current(&self, peer: &PeerId, id: &ConnectionId) -> bool {
        self.connections.get(peer).is_some_and(|channel| channel.id() == id)
    }

    fn set_status(&self, status: ConnectionStatus) {
        info!("connection status: {status}");
        self.emit(SessionEvent::StatusChanged(status));
    }

    // tears the identity down and answers whoever is still waiting
    async fn teardown(&mut self, reason: SessionError) {
        self.generation += 1;
        if let Some(active) = self.active.take() {
            active.identity.destroy().await;
            match active.pending {
                Some(Pending::Host(reply)) => {
                    let _ = reply.send(Err(reason));
                },
                Some(Pending::Join(reply)) => {
                    let _ = reply.send(Err(reason));
                },
                None => {},
            }
        }
        for (_, channel) in self.connections.drain() {
            channel.close().await;
        }
    }

    async fn fail_attempt(&mut self, err: ProviderError) {
        self.teardown(SessionError::Provider(err)).await;
    }

    async fn send(&self, channel: &dyn Channel, message: &WireMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode {message:?}: {err}");
                return;
            },
        };
        if let Err(err) = channel.send(text).await {
            warn!("failed to send to {}: {err}", channel.peer());
        }
    }
}

pub struct SessionActor;

impl SessionActor {
    async fn start(
        myself: &ActorRef<SessionMsg>,
        state: &mut SessionState,
        role: Role,
        code: RoomCode,
        player: PlayerData,
    ) -> Result<(), ProviderError> {
        state.generation += 1;
        let generation = state.generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let myself = myself.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if cast!(myself, SessionMsg::Provider(generation, event)).is_err() {
                    break;
                }
            }
        });
        let desired_id = match role {
            Role::Host => Some(code.peer_id()),
            Role::Joiner => None,
        };
        let identity = state.provider.register(desired_id, tx).await?;
        state.active = Some(Active { role, code, player, identity, local_id: None, pending: None });
        Ok(())
    }

    async fn handle_provider(state: &mut SessionState, event: ProviderEvent) {
        let (role, pending) = match &state.active {
            Some(active) => (active.role, active.pending.is_some()),
            None => return,
        };
        match event {
            ProviderEvent::Open(id) => {
                info!("identity open as {id}");
                let Some(active) = state.active.as_mut() else {
                    return;
                };
                active.local_id = Some(id);
                if role == Role::Host {
                    let code = active.code.clone();
                    if let Some(Pending::Host(reply)) = active.pending.take() {
                        let _ = reply.send(Ok(code));
                    }
                    state.set_status(ConnectionStatus::Connected);
                    return;
                }

                let target = active.code.peer_id();
                state.set_status(ConnectionStatus::Connecting);
                let Some(active) = state.active.as_ref() else {
                    return;
                };
                let connected = active.identity.connect(&target).await;
                match connected {
                    Ok(channel) => {
                        state.connections.insert(target, channel);
                    },
                    Err(err) => {
                        warn!("failed to connect to {target}: {err}");
                        state.set_status(ConnectionStatus::Error(err.kind().to_string()));
                        state.fail_attempt(err).await;
                    },
                }
            },
            ProviderEvent::Error(err) => {
                error!("provider error: {err}");
                state.set_status(ConnectionStatus::Error(err.kind().to_string()));
                if pending {
                    state.fail_attempt(err).await;
                }
            },
            ProviderEvent::Connection(channel) => {
                let peer = channel.peer().clone();
                if role != Role::Host {
                    info!("refusing inbound connection from {peer}");
                    channel.close().await;
                    return;
                }
                info!("new connection {} from {peer}", channel.id());
                if let Some(old) = state.connections.insert(peer.clone(), channel) {
                    info!("replacing connection {} from {peer}", old.id());
                    old.close().await;
                }
            },
            ProviderEvent::ChannelOpen(peer, id) => Self::handle_open(state, role, peer, id).await,
            ProviderEvent::ChannelData(peer, id, data) => Self::handle_message(state, peer, id, data),
            ProviderEvent::ChannelClose(peer, id) => {
                if !state.is_current(&peer, &id) {
                    debug!("ignoring close of stale connection {id} with {peer}");
                    return;
                }
                if let Some(channel) = state.connections.remove(&peer) {
                    channel.close().await;
                }
                info!("connection {id} closed with {peer}");
                if role == Role::Joiner {
                    state.set_status(ConnectionStatus::Disconnected);
                    if pending {
                        state.teardown(SessionError::ClosedBeforeOpen(peer.clone())).await;
                    }
                }
                state.emit(SessionEvent::PlayerLeft { peer });
            },
            ProviderEvent::ChannelError(peer, id, err) => {
                if !state.is_current(&peer, &id) {
                    debug!("ignoring error on stale connection {id} with {peer}: {err}");
                    return;
                }
                warn!("connection {id} error with {peer}: {err}");
                state.set_status(ConnectionStatus::Error("Connection failed".to_string()));
                if role == Role::Joiner && pending {
                    state.fail_attempt(err).await;
                }
            },
        }
    }

    async fn handle_open(state: &mut SessionState, role: Role, peer: PeerId, id: ConnectionId) {
        if !state.is_current(&peer, &id) {
            debug!("open event for unknown connection {id} with {peer}");
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };
        let (message, pending) = match role {
            Role::Host => {
                let Some(local_id) = active.local_id.clone() else {
                    return;
                };
                (WireMessage::PlayerData { player_id: local_id, player_data: active.player.clone() }, None)
            },
            Role::Joiner => (WireMessage::Join { player_data: active.player.clone() }, active.pending.take()),
        };
        let Some(channel) = state.connections.get(&peer) else {
            return;
        };
        info!("connection opened with {peer}");
        state.send(channel.as_ref(), &message).await;
        if role == Role::Joiner {
            state.set_status(ConnectionStatus::Connected);
            if let Some(Pending::Join(reply)) = pending {
                let _ = reply.send(Ok(peer));
            }
        }
    }

    fn handle_message(state: &SessionState, peer: PeerId, id: ConnectionId, data: Bytes) {
        let Some(active) = &state.active else {
            return;
        };
        if !state.is_current(&peer, &id) {
            debug!("data from unknown connection {id} with {peer}");
            return;
        }
        let message = match WireMessage::decode(&data) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed message from {peer}: {err}");
                return;
            },
        };
        debug!("received {message:?} from {peer}");
        match (active.role, message) {
            (Role::Host, WireMessage::Join { player_data }) => {
                state.emit(SessionEvent::PlayerJoined { peer, player: player_data });
            },
            (Role::Joiner, WireMessage::PlayerData { player_id, player_data }) => {
                state.emit(SessionEvent::PlayerJoined { peer: player_id, player: player_data });
            },
            // positions are reported under the connection they came from, never relayed
            (Role::Host, WireMessage::Position { position }) => {
                state.emit(SessionEvent::PositionUpdate { peer, position });
            },
            (Role::Joiner, WireMessage::Position { position }) => {
                state.emit(SessionEvent::PositionUpdate { peer: active.code.peer_id(), position });
            },
            (role, message) => {
                debug!("ignoring {message:?} from {peer} as {role:?}");
            },
        }
    }
}

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;
    type State = SessionState;
    type Arguments = Arc<dyn ChannelProvider>;

    async fn pre_start(
        &self,
        _: ActorRef<Self::Msg>,
        provider: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(SessionState {
            provider,
            generation: 0,
            active: None,
            connections: HashMap::new(),
            events: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMsg::Host(code, player, reply) => {
                if state.active.is_some() {
                    let _ = reply.send(Err(SessionError::AlreadyActive));
                    return Ok(());
                }
                let code = code.unwrap_or_else(room::generate);
                info!("hosting room {code}");
                match Self::start(&myself, state, Role::Host, code, player).await {
                    Ok(()) => {
                        if let Some(active) = state.active.as_mut() {
                            active.pending = Some(Pending::Host(reply));
                        }
                    },
                    Err(err) => {
                        state.set_status(ConnectionStatus::Error("Failed to create peer".to_string()));
                        let _ = reply.send(Err(err.into()));
                    },
                }
            },
            SessionMsg::Join(code, player, reply) => {
                if state.active.is_some() {
                    let _ = reply.send(Err(SessionError::AlreadyActive));
                    return Ok(());
                }
                info!("joining room {code}");
                match Self::start(&myself, state, Role::Joiner, code, player).await {
                    Ok(()) => {
                        if let Some(active) = state.active.as_mut() {
                            active.pending = Some(Pending::Join(reply));
                        }
                    },
                    Err(err) => {
                        state.set_status(ConnectionStatus::Error("Failed to create peer".to_string()));
                        let _ = reply.send(Err(err.into()));
                    },
                }
            },
            SessionMsg::SendPosition(position) => {
                let message = WireMessage::Position { position };
                for channel in state.connections.values().filter(|channel| channel.is_open()) {
                    state.send(channel.as_ref(), &message).await;
                }
            },
            SessionMsg::Disconnect(reply) => {
                state.teardown(SessionError::Disconnected).await;
                state.set_status(ConnectionStatus::Disconnected);
                let _ = reply.send(());
            },
            SessionMsg::Subscribe(events) => {
                state.events = Some(events);
            },
            SessionMsg::LocalId(reply) => {
                let _ = reply.send(state.active.as_ref().and_then(|active| active.local_id.clone()));
            },
            SessionMsg::Peers(reply) => {
                let _ = reply.send(state.connections.keys().cloned().collect());
            },
            SessionMsg::Provider(generation, event) => {
                if generation != state.generation {
                    debug!("dropping stale provider event {event:?}");
                    return Ok(());
                }
                Self::handle_provider(state, event).await;
            },
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.teardown(SessionError::Disconnected).await;
        Ok(())
    }
}

// handle to the session actor, cheap to clone
#[derive(Clone)]
pub struct Session {
    actor: ActorRef<SessionMsg>,
}

impl Session {
    pub async fn spawn(provider: Arc<dyn ChannelProvider>) -> Result<(Session, JoinHandle<()>), Error> {
        let (actor, handle) = Actor::spawn(None, SessionActor, provider)
            .await
            .map_err(|err| Error::Actor(err.to_string()))?;
        Ok((Session { actor }, handle))
    }

    // replaces the previous subscriber, whose receiver then yields None
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        cast!(self.actor, SessionMsg::Subscribe(tx)).map_err(|err| Error::Actor(err.to_string()))?;
        Ok(rx)
    }

    pub async fn host(&self, player: PlayerData) -> Result<RoomCode, Error> {
        Ok(call!(self.actor, SessionMsg::Host, None, player).map_err(|err| Error::Actor(err.to_string()))??)
    }

    pub async fn host_with_code(&self, code: RoomCode, player: PlayerData) -> Result<RoomCode, Error> {
        Ok(call!(self.actor, SessionMsg::Host, Some(code), player).map_err(|err| Error::Actor(err.to_string()))??)
    }

    pub async fn join(&self, code: RoomCode, player: PlayerData) -> Result<PeerId, Error> {
        Ok(call!(self.actor, SessionMsg::Join, code, player).map_err(|err| Error::Actor(err.to_string()))??)
    }

    pub fn send_position_to_all(&self, position: Position) -> Result<(), Error> {
        cast!(self.actor, SessionMsg::SendPosition(position)).map_err(|err| Error::Actor(err.to_string()))
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        call!(self.actor, SessionMsg::Disconnect).map_err(|err| Error::Actor(err.to_string()))
    }

    pub async fn local_id(&self) -> Result<Option<PeerId>, Error> {
        call!(self.actor, SessionMsg::LocalId).map_err(|err| Error::Actor(err.to_string()))
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>, Error> {
        call!(self.actor, SessionMsg::Peers).map_err(|err| Error::Actor(err.to_string()))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
