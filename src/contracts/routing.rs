//! Exchange names and routing key conventions used by the game.
//!
//! Keys are `<category>.<participant>`; bindings that want every participant
//! use `<category>.*`. The messaging layer treats all of these as opaque.

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Routing key for messages originating from `participant`.
pub fn key(category: &str, participant: &str) -> String {
    format!("{}.{}", category, participant)
}

/// Topic binding matching every participant in `category`.
pub fn any_participant(category: &str) -> String {
    format!("{}.*", category)
}
