//! Raw socket setup for units that multiplex several sockets in one loop.

use kluster_wire::{send_frames, Routed, Transport, WireError};
use tracing::info;
use zeromq::prelude::*;
use zeromq::{DealerSocket, PubSocket, RouterSocket, SubSocket};

pub async fn bind_router(transport: &Transport) -> Result<RouterSocket, WireError> {
    transport.prepare_bind()?;
    let mut socket = RouterSocket::new();
    socket.bind(&transport.endpoint()).await?;
    info!(endpoint = %transport, "bound ROUTER socket");
    Ok(socket)
}

pub async fn bind_dealer(transport: &Transport) -> Result<DealerSocket, WireError> {
    transport.prepare_bind()?;
    let mut socket = DealerSocket::new();
    socket.bind(&transport.endpoint()).await?;
    info!(endpoint = %transport, "bound DEALER socket");
    Ok(socket)
}

pub async fn connect_dealer(transport: &Transport) -> Result<DealerSocket, WireError> {
    let mut socket = DealerSocket::new();
    socket.connect(&transport.endpoint()).await?;
    info!(endpoint = %transport, "connected DEALER socket");
    Ok(socket)
}

pub async fn bind_pub(transport: &Transport) -> Result<PubSocket, WireError> {
    transport.prepare_bind()?;
    let mut socket = PubSocket::new();
    socket.bind(&transport.endpoint()).await?;
    info!(endpoint = %transport, "bound PUB socket");
    Ok(socket)
}

/// Bound SUB socket subscribed to every topic.
pub async fn bind_sub_all(transport: &Transport) -> Result<SubSocket, WireError> {
    transport.prepare_bind()?;
    let mut socket = SubSocket::new();
    socket.bind(&transport.endpoint()).await?;
    socket.subscribe("").await?;
    info!(endpoint = %transport, "bound SUB socket");
    Ok(socket)
}

pub async fn send_routed<S>(socket: &mut S, routed: &Routed) -> Result<(), WireError>
where
    S: SocketSend + Send,
{
    send_frames(socket, routed.to_frames()?).await
}
