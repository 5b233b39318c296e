//! Request side of DEALER/ROUTER exchanges with the hub.
//!
//! [`ZmqRequestClient`] sends [`Routed`] frames from a DEALER:
//! `[<IDS|MSG>, msg_type, envelope]`. The hub's ROUTER sees the client
//! identity in front, answers along the same stack, and replies are matched
//! to waiting requests by `parent_id`. Any number of requests may be in
//! flight at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::error::WireError;
use crate::message::Message;
use crate::routed::{frames_of, Routed};
use crate::traits::RequestSender;
use crate::transport::Transport;

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>;

/// DEALER-socket client for issuing requests and awaiting replies.
///
/// The socket is owned by a background task that multiplexes outbound
/// requests (from an mpsc channel) and inbound replies with `select!`.
pub struct ZmqRequestClient {
    send_tx: mpsc::Sender<ZmqMessage>,
    pending: PendingMap,
    _loop_handle: tokio::task::JoinHandle<()>,
}

impl ZmqRequestClient {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, WireError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting DEALER socket");
        socket.connect(&endpoint).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (send_tx, send_rx) = mpsc::channel::<ZmqMessage>(256);

        let loop_pending = Arc::clone(&pending);
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, loop_pending).await;
        });

        Ok(Self {
            send_tx,
            pending,
            _loop_handle: loop_handle,
        })
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<ZmqMessage>,
        pending: PendingMap,
    ) {
        loop {
            tokio::select! {
                Some(msg) = send_rx.recv() => {
                    if let Err(e) = socket.send(msg).await {
                        warn!(error = %e, "DEALER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => Self::dispatch_reply(&pending, zmq_msg).await,
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    async fn dispatch_reply(pending: &Mutex<HashMap<Uuid, oneshot::Sender<Message>>>, zmq_msg: ZmqMessage) {
        let routed = match Routed::from_frames(frames_of(&zmq_msg)) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to decode reply");
                return;
            }
        };
        let Some(parent) = routed.message.parent_id else {
            debug!(msg_type = %routed.message.msg_type, "reply without parent id");
            return;
        };
        match pending.lock().await.remove(&parent) {
            Some(tx) => {
                let _ = tx.send(routed.message);
            }
            None => debug!(parent_id = %parent, "received reply for unknown request"),
        }
    }
}

#[async_trait]
impl RequestSender for ZmqRequestClient {
    async fn request(&self, msg: Message, timeout_dur: Duration) -> Result<Message, WireError> {
        let id = msg.msg_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let zmq_msg = Routed::bare(msg).to_zmq()?;
        self.send_tx
            .send(zmq_msg)
            .await
            .map_err(|_| WireError::Transport("client event loop closed".into()))?;
        debug!(msg_id = %id, "sent request");

        match tokio::time::timeout(timeout_dur, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(WireError::Transport("reply channel closed unexpectedly".into()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(WireError::Timeout(timeout_dur))
            }
        }
    }
}
