pub mod channel;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod handler;
pub mod publisher;
pub mod redelivery;
pub mod subscriber;
pub mod topology;

pub use channel::{ChannelError, ChannelProvider};
pub use connection::{BrokerConnection, ConnectionError};
pub use consumer::{ConsumeLoop, LoopExit, RequeuePolicy};
pub use delivery::{AckError, Acknowledger, InboundDelivery};
pub use handler::{HandlerError, MessageHandler};
pub use publisher::{publish, publish_binary, publish_json, PublishError, Publisher};
pub use redelivery::RedeliveryTracker;
pub use subscriber::{
    subscribe, subscribe_binary, subscribe_json, SubscribeError, SubscribeOptions, Subscription,
};
pub use topology::{QueueDurability, QueueSpec, Topology, TopologyError};
