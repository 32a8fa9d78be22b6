use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Pause/resume broadcast. Travels as JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A player's order to move units. Travels as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArmyMove {
    pub player: String,
    pub unit_ids: Vec<u32>,
    pub to_location: String,
}

/// Game event recorded by the server. Travels with the binary codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameLog {
    pub current_time: SystemTime,
    pub message: String,
    pub username: String,
}

impl GameLog {
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            current_time: SystemTime::now(),
            message: message.into(),
            username: username.into(),
        }
    }
}

impl std::fmt::Display for GameLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self
            .current_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        write!(f, "{} {}: {}", secs, self.username, self.message)
    }
}
