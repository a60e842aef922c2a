use std::{collections::BTreeMap, str::FromStr};

use tracing::{debug, info, warn};

use crate::{
    errors::Error,
    room::PeerId,
    session::{PlayerData, Position, Session},
};

pub const SPEED: f64 = 0.1;
pub const MAX_PLAYERS: usize = 3;
// players sit just above the ground plane
pub const SPAWN: Position = Position { x: 0.0, y: 0.01, z: 0.0 };

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub name: String,
    pub color: String,
    pub position: Position,
}

#[derive(Debug, Default)]
pub struct World {
    players: BTreeMap<PeerId, Player>,
    local: Option<PeerId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_player(&mut self, id: PeerId, data: PlayerData) {
        info!("adding player {} ({id})", data.name);
        let player = Player { name: data.name, color: data.color, position: SPAWN };
        self.players.insert(id, player);
    }

    pub fn remove_player(&mut self, id: &PeerId) -> Option<Player> {
        let player = self.players.remove(id)?;
        info!("removed player {} ({id})", player.name);
        Some(player)
    }

    pub fn update_player_position(&mut self, id: &PeerId, position: Position) {
        match self.players.get_mut(id) {
            Some(player) => player.position = position,
            None => debug!("position for unknown player {id}"),
        }
    }

    pub fn set_local_player_id(&mut self, id: PeerId) {
        info!("local player is {id}");
        self.local = Some(id);
    }

    pub fn local_player_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    pub fn player(&self, id: &PeerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn players(&self) -> impl Iterator<Item = (&PeerId, &Player)> {
        self.players.iter()
    }

    pub fn player_count_label(&self) -> String {
        format!("Players: {}/{MAX_PLAYERS}", self.players.len())
    }

    /// Moves the local player by one frame of held input.
    ///
    /// Returns the new position, or `None` when nothing moved.
    pub fn step(&mut self, input: &Input) -> Option<Position> {
        let (dx, dz) = input.direction();
        if dx == 0.0 && dz == 0.0 {
            return None;
        }
        let player = self.local.as_ref().and_then(|id| self.players.get_mut(id))?;
        player.position.x += dx * SPEED;
        player.position.z += dz * SPEED;
        Some(player.position)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Input {
    pub up: bool,
    pub left: bool,
    pub down: bool,
    pub right: bool,
}

impl Input {
    fn direction(&self) -> (f64, f64) {
        let axis = |pos: bool, neg: bool| f64::from(u8::from(pos)) - f64::from(u8::from(neg));
        (axis(self.right, self.left), axis(self.down, self.up))
    }
}

// "wd" holds w and d, anything else is ignored
impl FromStr for Input {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut input = Input::default();
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'w' => input.up = true,
                'a' => input.left = true,
                's' => input.down = true,
                'd' => input.right = true,
                _ => {},
            }
        }
        Ok(input)
    }
}

pub trait PositionSink {
    fn send_position(&self, position: Position) -> Result<(), Error>;
}

impl PositionSink for Session {
    fn send_position(&self, position: Position) -> Result<(), Error> {
        self.send_position_to_all(position)
    }
}

pub trait Renderer {
    fn render(&mut self, world: &World);
}

// one frame: move the local player, publish the move, draw
pub fn advance(world: &mut World, input: &Input, sink: &dyn PositionSink, renderer: &mut dyn Renderer) {
    if let Some(position) = world.step(input)
        && let Err(err) = sink.send_position(position)
    {
        warn!("failed to publish position: {err}");
    }
    renderer.render(world);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_with_local() -> World {
        let mut world = World::new();
        world.add_player(PeerId::from("482913"), PlayerData::new("Ann", "#ff0000"));
        world.set_local_player_id(PeerId::from("482913"));
        world
    }

    #[test]
    fn players_spawn_above_ground() {
        let world = world_with_local();
        let player = world.player(&PeerId::from("482913")).unwrap();
        assert_eq!(player.position, Position::new(0.0, 0.01, 0.0));
        assert_eq!(player.color, "#ff0000");
        assert_eq!(world.player_count_label(), "Players: 1/3");
    }

    #[test]
    fn step_moves_by_speed() {
        let mut world = world_with_local();
        let moved = world.step(&"d".parse().unwrap()).unwrap();
        assert!((moved.x - 0.1).abs() < 1e-9);
        assert_eq!(moved.z, 0.0);
        let moved = world.step(&"WA".parse().unwrap()).unwrap();
        assert!(moved.x.abs() < 1e-9);
        assert!((moved.z + 0.1).abs() < 1e-9);
        assert_eq!(moved.y, 0.01);
    }

    #[test]
    fn idle_or_cancelled_input_does_not_move() {
        let mut world = world_with_local();
        assert_eq!(world.step(&Input::default()), None);
        assert_eq!(world.step(&"ad".parse().unwrap()), None);
        assert_eq!(world.step(&"x".parse().unwrap()), None);
    }

    #[test]
    fn step_without_local_player_is_a_no_op() {
        let mut world = World::new();
        assert_eq!(world.step(&"w".parse().unwrap()), None);
        world.set_local_player_id(PeerId::from("123456"));
        assert_eq!(world.step(&"w".parse().unwrap()), None);
    }

    #[test]
    fn updates_for_unknown_players_are_ignored() {
        let mut world = world_with_local();
        world.update_player_position(&PeerId::from("nobody"), Position::new(5.0, 0.01, 5.0));
        assert_eq!(world.players().count(), 1);
        world.update_player_position(&PeerId::from("482913"), Position::new(5.0, 0.01, 5.0));
        assert_eq!(world.player(&PeerId::from("482913")).unwrap().position.x, 5.0);
    }

    #[derive(Default)]
    struct Recorder {
        sent: std::cell::RefCell<Vec<Position>>,
        frames: usize,
    }

    impl PositionSink for Recorder {
        fn send_position(&self, position: Position) -> Result<(), Error> {
            self.sent.borrow_mut().push(position);
            Ok(())
        }
    }

    impl Renderer for Recorder {
        fn render(&mut self, _: &World) {
            self.frames += 1;
        }
    }

    #[test]
    fn advance_publishes_only_moves() {
        let mut world = world_with_local();
        let sink = Recorder::default();
        let mut renderer = Recorder::default();
        for keys in ["", "s", "s", "", "wasd"] {
            advance(&mut world, &keys.parse().unwrap(), &sink, &mut renderer);
        }
        assert_eq!(renderer.frames, 5);
        let sent = sink.sent.into_inner();
        assert_eq!(sent.len(), 2);
        assert!((sent[1].z - 0.2).abs() < 1e-9);
    }

    #[test]
    fn remove_player_updates_count() {
        let mut world = world_with_local();
        world.add_player(PeerId::from("other"), PlayerData::new("Bob", "#00ff00"));
        assert_eq!(world.player_count_label(), "Players: 2/3");
        assert!(world.remove_player(&PeerId::from("other")).is_some());
        assert!(world.remove_player(&PeerId::from("other")).is_none());
        assert_eq!(world.player_count_label(), "Players: 1/3");
    }
}
