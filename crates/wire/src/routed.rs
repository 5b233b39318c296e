//! Multi-part framing shared by every ROUTER/DEALER hop.
//!
//! ## Frame layout
//!
//! ```text
//! [ident_n, ..., ident_1, "<IDS|MSG>", msg_type, envelope]
//! ```
//!
//! zeromq-rs ROUTER sockets push the sender identity on recv and pop the
//! first frame as destination on send, so identities stack up naturally as a
//! message travels through relays and broadcast nodes, and unwind on the way
//! back. The delimiter separates routing from content so a hop never needs
//! to know how many identities precede it.

use zeromq::prelude::*;
use zeromq::ZmqMessage;

use crate::error::WireError;
use crate::message::Message;

/// Delimiter frame between routing identities and message content.
pub const DELIM: &[u8] = b"<IDS|MSG>";

/// A message together with the identity stack that routes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub idents: Vec<Vec<u8>>,
    pub message: Message,
}

impl Routed {
    pub fn new(idents: Vec<Vec<u8>>, message: Message) -> Self {
        Self { idents, message }
    }

    /// A message with no routing prefix, as sent by a DEALER.
    pub fn bare(message: Message) -> Self {
        Self {
            idents: Vec::new(),
            message,
        }
    }

    /// Route `message` back along this message's identity stack.
    pub fn reply(&self, message: Message) -> Self {
        Self {
            idents: self.idents.clone(),
            message,
        }
    }

    /// Outermost identity: the peer a ROUTER received this from.
    pub fn first_ident(&self) -> Option<&[u8]> {
        self.idents.first().map(Vec::as_slice)
    }

    pub fn push_front_ident(&mut self, ident: Vec<u8>) {
        self.idents.insert(0, ident);
    }

    pub fn pop_front_ident(&mut self) -> Option<Vec<u8>> {
        if self.idents.is_empty() {
            None
        } else {
            Some(self.idents.remove(0))
        }
    }

    pub fn to_frames(&self) -> Result<Vec<Vec<u8>>, WireError> {
        let mut frames = Vec::with_capacity(self.idents.len() + 3);
        frames.extend(self.idents.iter().cloned());
        frames.push(DELIM.to_vec());
        frames.push(self.message.msg_type.as_bytes().to_vec());
        frames.push(self.message.to_bytes()?);
        Ok(frames)
    }

    pub fn from_frames(mut frames: Vec<Vec<u8>>) -> Result<Self, WireError> {
        let pos = frames
            .iter()
            .position(|f| f.as_slice() == DELIM)
            .ok_or_else(|| WireError::Frames("missing <IDS|MSG> delimiter".into()))?;
        let content = frames.split_off(pos);
        if content.len() < 3 {
            return Err(WireError::Frames(format!(
                "expected [delim, msg_type, envelope], got {} frames",
                content.len()
            )));
        }
        let message = Message::from_bytes(&content[2])?;
        Ok(Self {
            idents: frames,
            message,
        })
    }

    pub fn to_zmq(&self) -> Result<ZmqMessage, WireError> {
        zmq_from_frames(self.to_frames()?)
    }
}

/// Frames of a monitor copy: `[topic, routed frames...]`.
pub fn monitor_frames(topic: &str, routed: &Routed) -> Result<Vec<Vec<u8>>, WireError> {
    let mut frames = vec![topic.as_bytes().to_vec()];
    frames.extend(routed.to_frames()?);
    Ok(frames)
}

/// Split a monitor copy into its topic and routed message.
pub fn parse_monitor_frames(mut frames: Vec<Vec<u8>>) -> Result<(String, Routed), WireError> {
    if frames.is_empty() {
        return Err(WireError::Frames("empty monitor message".into()));
    }
    let topic = String::from_utf8(frames.remove(0))
        .map_err(|_| WireError::Frames("monitor topic is not UTF-8".into()))?;
    Ok((topic, Routed::from_frames(frames)?))
}

pub fn zmq_from_frames(frames: Vec<Vec<u8>>) -> Result<ZmqMessage, WireError> {
    let mut iter = frames.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| WireError::Frames("cannot send zero frames".into()))?;
    let mut msg = ZmqMessage::from(first);
    for frame in iter {
        msg.push_back(frame.into());
    }
    Ok(msg)
}

pub fn frames_of(msg: &ZmqMessage) -> Vec<Vec<u8>> {
    msg.iter().map(|f| f.to_vec()).collect()
}

pub async fn recv_frames<S>(socket: &mut S) -> Result<Vec<Vec<u8>>, WireError>
where
    S: SocketRecv + Send,
{
    let msg = socket.recv().await?;
    Ok(frames_of(&msg))
}

pub async fn send_frames<S>(socket: &mut S, frames: Vec<Vec<u8>>) -> Result<(), WireError>
where
    S: SocketSend + Send,
{
    socket.send(zmq_from_frames(frames)?).await?;
    Ok(())
}
