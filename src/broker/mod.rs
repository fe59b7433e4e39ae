pub mod engine;
pub mod message;
pub(crate) mod redis;
pub mod topic;

pub use engine::{Broker, BrokerState};
pub use message::Message;
pub use topic::{Registry, Subscriber, SubscriberId};
