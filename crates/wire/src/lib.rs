pub mod channels;
pub mod connection;
pub mod error;
pub mod message;
pub mod messages;
pub mod pubsub;
pub mod reqrep;
pub mod routed;
pub mod traits;
pub mod transport;

pub use channels::{Channel, ChannelMap};
pub use connection::{ConnectionInfo, Side};
pub use error::WireError;
pub use message::{Message, Metadata};
pub use messages::{msg_types, topics};
pub use pubsub::{ZmqPublisher, ZmqSubscriber};
pub use reqrep::ZmqRequestClient;
pub use routed::{
    monitor_frames, parse_monitor_frames, recv_frames, send_frames, Routed, DELIM,
};
pub use traits::{EventPublisher, EventSubscriber, RequestSender};
pub use transport::Transport;
