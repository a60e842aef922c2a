use serde::{Deserialize, Serialize};

use crate::room::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerData {
    pub name: String,
    pub color: String,
}

impl PlayerData {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        PlayerData { name: name.into(), color: color.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }
}

// messages exchanged over a data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Join { player_data: PlayerData },
    PlayerData { player_id: PeerId, player_data: PlayerData },
    Position { position: Position },
}

impl WireMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
