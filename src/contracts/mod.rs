pub mod ack;
pub mod messages;
pub mod routing;

pub use ack::AckType;
pub use messages::{ArmyMove, GameLog, PlayingState};
