use std::{future::Future, time::Duration};

use tokio::{
    select,
    sync::{mpsc::UnboundedReceiver, watch},
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{
    errors::{Error, SessionError},
    game::{self, Input, Renderer, World},
    room::{PeerId, RoomCode},
    session::{PlayerData, Session, SessionEvent},
};

pub const DEFAULT_COLOR: &str = "#ff0000";
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

pub struct App<R> {
    session: Session,
    events: UnboundedReceiver<SessionEvent>,
    world: World,
    renderer: R,
}

impl<R: Renderer> App<R> {
    pub fn new(session: Session, renderer: R) -> Result<Self, Error> {
        let events = session.subscribe()?;
        Ok(App { session, events, world: World::new(), renderer })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub async fn host_game(&mut self, name: &str, color: &str) -> Result<RoomCode, Error> {
        self.host_game_with(None, name, color).await
    }

    pub async fn host_game_with(&mut self, code: Option<RoomCode>, name: &str, color: &str) -> Result<RoomCode, Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::MissingName);
        }
        let player = PlayerData::new(name, color);
        let code = match code {
            Some(code) => self.session.host_with_code(code, player.clone()).await?,
            None => self.session.host(player.clone()).await?,
        };
        info!("Room Code: {code}");
        self.enter(code.peer_id(), player);
        Ok(code)
    }

    pub async fn join_game(&mut self, code: &str, name: &str, color: &str) -> Result<(), Error> {
        let name = name.trim();
        if code.trim().is_empty() || name.is_empty() {
            return Err(Error::MissingJoinDetails);
        }
        let code: RoomCode = code.parse()?;
        let player = PlayerData::new(name, color);
        self.session.join(code, player.clone()).await?;
        let local_id = self
            .session
            .local_id()
            .await?
            .ok_or(Error::Session(SessionError::Disconnected))?;
        self.enter(local_id, player);
        Ok(())
    }

    fn enter(&mut self, local_id: PeerId, player: PlayerData) {
        self.world.add_player(local_id.clone(), player);
        self.world.set_local_player_id(local_id);
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PlayerJoined { peer, player } => self.world.add_player(peer, player),
            SessionEvent::PlayerLeft { peer } => {
                self.world.remove_player(&peer);
            },
            SessionEvent::PositionUpdate { peer, position } => self.world.update_player_position(&peer, position),
            SessionEvent::StatusChanged(status) => info!("{status}"),
        }
    }

    pub fn frame(&mut self, input: &Input) {
        game::advance(&mut self.world, input, &self.session, &mut self.renderer);
    }

    /// Drives the game until `shutdown` resolves or the session goes away,
    /// then disconnects.
    pub async fn run(
        &mut self,
        mut input: watch::Receiver<Input>,
        frame_interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let mut ticker = interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut held = *input.borrow_and_update();
        let mut input_open = true;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("session event stream closed");
                        break;
                    },
                },
                changed = input.changed(), if input_open => match changed {
                    Ok(()) => held = *input.borrow_and_update(),
                    Err(_) => input_open = false,
                },
                _ = ticker.tick() => self.frame(&held),
            }
        }

        info!("leaving game");
        self.session.disconnect().await
    }
}

// logs the scene whenever it changes
#[derive(Default)]
pub struct LogRenderer {
    last: String,
}

impl Renderer for LogRenderer {
    fn render(&mut self, world: &World) {
        let mut scene = world.player_count_label();
        for (id, player) in world.players() {
            let p = player.position;
            scene.push_str(&format!(" | {} ({}) {} at ({:.1}, {:.1})", player.name, player.color, id, p.x, p.z));
        }
        if scene != self.last {
            info!("{scene}");
            self.last = scene;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tokio::time::sleep;

    use super::*;
    use crate::provider::memory::MemoryNetwork;

    #[derive(Default)]
    struct Frames(usize);

    impl Renderer for Frames {
        fn render(&mut self, _: &World) {
            self.0 += 1;
        }
    }

    async fn app(network: &MemoryNetwork) -> Result<App<Frames>> {
        let (session, _) = Session::spawn(Arc::new(network.provider())).await?;
        Ok(App::new(session, Frames::default())?)
    }

    #[tokio::test]
    async fn missing_details_are_rejected_before_connecting() -> Result<()> {
        let network = MemoryNetwork::new();
        let mut app = app(&network).await?;
        assert!(matches!(app.host_game("  ", DEFAULT_COLOR).await, Err(Error::MissingName)));
        assert!(matches!(app.join_game("", "Ann", DEFAULT_COLOR).await, Err(Error::MissingJoinDetails)));
        assert!(matches!(app.join_game("482913", "", DEFAULT_COLOR).await, Err(Error::MissingJoinDetails)));
        assert!(matches!(app.join_game("48291", "Ann", DEFAULT_COLOR).await, Err(Error::InvalidRoomCode(_))));
        assert_eq!(Error::MissingName.to_string(), "Please enter your name");
        assert_eq!(Error::MissingJoinDetails.to_string(), "Please enter both room code and your name");
        assert_eq!(app.world().players().count(), 0);
        assert_eq!(app.session.local_id().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn hosting_places_the_local_player() -> Result<()> {
        let network = MemoryNetwork::new();
        let mut app = app(&network).await?;
        let code = app.host_game_with(Some("482913".parse()?), "Ann", DEFAULT_COLOR).await?;
        assert_eq!(app.world().local_player_id(), Some(&code.peer_id()));
        assert_eq!(app.world().player_count_label(), "Players: 1/3");

        // a failed second attempt leaves the world as it was
        assert!(app.host_game("Ann", DEFAULT_COLOR).await.is_err());
        assert_eq!(app.world().player_count_label(), "Players: 1/3");
        Ok(())
    }

    #[tokio::test]
    async fn joiner_moves_are_seen_by_host() -> Result<()> {
        let network = MemoryNetwork::new();
        let mut host = app(&network).await?;
        let mut joiner = app(&network).await?;
        let code = host.host_game("Host", "#0000ff").await?;
        joiner.join_game(code.as_str(), "Ann", DEFAULT_COLOR).await?;
        let joiner_id = joiner.world().local_player_id().cloned().expect("joiner is placed");

        let (_keys, held) = watch::channel("d".parse::<Input>()?);
        let (_idle, idle) = watch::channel(Input::default());
        let frame = Duration::from_millis(10);
        let (hosted, joined) = tokio::join!(
            host.run(idle, frame, sleep(Duration::from_millis(300))),
            joiner.run(held, frame, sleep(Duration::from_millis(500))),
        );
        hosted?;
        joined?;

        let seen = host.world().player(&joiner_id).expect("host sees the joiner");
        assert_eq!(seen.name, "Ann");
        assert!(seen.position.x > 0.0);
        assert_eq!(seen.position.z, 0.0);
        assert!(host.renderer.0 > 0);

        // the host left first, so the joiner is alone again
        assert!(joiner.world().player(&code.peer_id()).is_none());
        assert_eq!(joiner.world().player_count_label(), "Players: 1/3");
        Ok(())
    }

    #[test]
    fn log_renderer_only_logs_changes() {
        let mut world = World::new();
        let mut renderer = LogRenderer::default();
        world.add_player(PeerId::from("482913"), PlayerData::new("Ann", DEFAULT_COLOR));
        renderer.render(&world);
        let first = renderer.last.clone();
        renderer.render(&world);
        assert_eq!(renderer.last, first);
        assert!(first.starts_with("Players: 1/3 | Ann (#ff0000) 482913"));
    }
}
