use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket};

use crate::error::WireError;
use crate::message::Message;
use crate::routed::{frames_of, monitor_frames, zmq_from_frames, Routed};
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Transport;

/// ZeroMQ PUB socket.
///
/// Messages are sent as two frames: the topic string (for SUB prefix
/// filtering) and the MessagePack-encoded [`Message`] envelope.
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Connect to a SUB socket that binds, e.g. the hub monitor.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, WireError> {
        let mut socket = PubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting PUB socket");
        socket.connect(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Bind so subscribers can connect, e.g. the notification feed.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, WireError> {
        transport.prepare_bind()?;
        let mut socket = PubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PUB socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Publish raw frames unchanged (heartbeat pings, relayed iopub traffic).
    pub async fn publish_frames(&self, frames: Vec<Vec<u8>>) -> Result<(), WireError> {
        let msg = zmq_from_frames(frames)?;
        let mut socket = self.socket.lock().await;
        socket.send(msg).await?;
        Ok(())
    }

    /// Publish a copy of routed traffic to the hub monitor: `[topic, frames...]`.
    pub async fn publish_monitor(&self, topic: &str, routed: &Routed) -> Result<(), WireError> {
        self.publish_frames(monitor_frames(topic, routed)?).await
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), WireError> {
        let envelope_bytes = message.to_bytes()?;
        self.publish_frames(vec![topic.as_bytes().to_vec(), envelope_bytes])
            .await?;
        debug!(topic = %topic, msg_type = %message.msg_type, "published message");
        Ok(())
    }
}

/// ZeroMQ SUB socket.
pub struct ZmqSubscriber {
    socket: Mutex<SubSocket>,
}

impl ZmqSubscriber {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, WireError> {
        let mut socket = SubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting SUB socket");
        socket.connect(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Bind a SUB socket that many publishers connect to (the hub monitor).
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, WireError> {
        transport.prepare_bind()?;
        let mut socket = SubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding SUB socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Receive the next message as raw frames.
    pub async fn recv_frames(&self) -> Result<Vec<Vec<u8>>, WireError> {
        let mut socket = self.socket.lock().await;
        let msg = socket.recv().await?;
        Ok(frames_of(&msg))
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    /// An empty prefix subscribes to every topic.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), WireError> {
        let mut socket = self.socket.lock().await;
        socket.subscribe(topic_prefix).await?;
        info!(topic_prefix = %topic_prefix, "subscribed to topic prefix");
        Ok(())
    }

    /// Expects two frames: `[topic, envelope]`.
    async fn recv(&self) -> Result<(String, Message), WireError> {
        let frames = self.recv_frames().await?;
        if frames.len() < 2 {
            return Err(WireError::Frames(format!(
                "expected [topic, envelope], got {} frames",
                frames.len()
            )));
        }
        let topic = String::from_utf8_lossy(&frames[0]).into_owned();
        let message = Message::from_bytes(&frames[1])?;
        debug!(topic = %topic, msg_type = %message.msg_type, "received message");
        Ok((topic, message))
    }
}
