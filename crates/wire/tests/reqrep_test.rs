//! Integration tests for `ZmqRequestClient` against a bare ROUTER, the
//! same socket shape the hub answers on.
//!
//! Covers parent-id matching, concurrent requests, timeouts and stray replies.

use std::sync::Arc;
use std::time::Duration;

use zeromq::prelude::*;
use zeromq::RouterSocket;

use kluster_wire::messages::{QueueReply, QueueRequest};
use kluster_wire::msg_types;
use kluster_wire::transport::Transport;
use kluster_wire::{recv_frames, send_frames, Message, RequestSender, Routed, WireError, ZmqRequestClient};

const SETTLE: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(5);

async fn bind_router(transport: &Transport) -> RouterSocket {
    let mut socket = RouterSocket::new();
    socket.bind(&transport.endpoint()).await.unwrap();
    socket
}

async fn recv_request(socket: &mut RouterSocket) -> Routed {
    let routed = Routed::from_frames(recv_frames(socket).await.unwrap()).unwrap();
    assert_eq!(routed.idents.len(), 1, "ROUTER prefixes the client identity");
    routed
}

async fn answer(socket: &mut RouterSocket, request: &Routed, reply: Message) {
    send_frames(socket, request.reply(reply).to_frames().unwrap()).await.unwrap();
}

#[tokio::test]
async fn single_request_reply() {
    let transport = Transport::tcp("127.0.0.1", 16500);
    let mut server = bind_router(&transport).await;
    tokio::time::sleep(SETTLE).await;

    let client = ZmqRequestClient::connect(&transport).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let request = Message::new(msg_types::QUEUE_REQUEST, &QueueRequest::default()).unwrap();
    let request_id = request.msg_id;

    let server_handle = tokio::spawn(async move {
        let routed = recv_request(&mut server).await;
        assert_eq!(routed.message.msg_type, msg_types::QUEUE_REQUEST);
        let reply = Message::reply_to(&routed.message, msg_types::QUEUE_REPLY, &QueueReply::default()).unwrap();
        answer(&mut server, &routed, reply).await;
    });

    let reply = client.request(request, TIMEOUT).await.unwrap();
    assert_eq!(reply.parent_id, Some(request_id));
    assert_eq!(reply.msg_type, msg_types::QUEUE_REPLY);
    assert_eq!(reply.decode::<QueueReply>().unwrap(), QueueReply::default());

    server_handle.await.unwrap();
}

#[tokio::test]
async fn concurrent_requests() {
    let transport = Transport::tcp("127.0.0.1", 16510);
    let mut server = bind_router(&transport).await;
    tokio::time::sleep(SETTLE).await;

    let client = Arc::new(ZmqRequestClient::connect(&transport).await.unwrap());
    tokio::time::sleep(SETTLE).await;

    let num_requests = 5u32;

    let server_handle = tokio::spawn(async move {
        for _ in 0..num_requests {
            let routed = recv_request(&mut server).await;
            let value: u32 = routed.message.decode().unwrap();
            let reply = Message::reply_to(&routed.message, "echo_reply", &(value * 10)).unwrap();
            answer(&mut server, &routed, reply).await;
        }
    });

    let mut handles = Vec::new();
    for i in 0..num_requests {
        let c = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let msg = Message::new("echo_request", &i).unwrap();
            let id = msg.msg_id;
            let reply = c.request(msg, TIMEOUT).await.unwrap();
            assert_eq!(reply.parent_id, Some(id));
            assert_eq!(reply.decode::<u32>().unwrap(), i * 10);
        }));
    }

    for h in handles {
        h.await.unwrap();
    }
    server_handle.await.unwrap();
}

#[tokio::test]
async fn request_timeout() {
    let transport = Transport::tcp("127.0.0.1", 16520);
    let _server = bind_router(&transport).await;
    tokio::time::sleep(SETTLE).await;

    let client = ZmqRequestClient::connect(&transport).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let msg = Message::new("black_hole_request", &"hello".to_string()).unwrap();
    let short_timeout = Duration::from_millis(300);

    match client.request(msg, short_timeout).await {
        Err(WireError::Timeout(d)) => assert_eq!(d, short_timeout),
        other => panic!("expected Timeout error, got: {other:?}"),
    }
}

#[tokio::test]
async fn reply_without_matching_parent_is_ignored() {
    let transport = Transport::tcp("127.0.0.1", 16530);
    let mut server = bind_router(&transport).await;
    tokio::time::sleep(SETTLE).await;

    let client = ZmqRequestClient::connect(&transport).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let request = Message::new("status_request", &()).unwrap();

    let server_handle = tokio::spawn(async move {
        let routed = recv_request(&mut server).await;
        // unrelated message first, then the real reply
        answer(&mut server, &routed, Message::new("status_reply", &0u8).unwrap()).await;
        let reply = Message::reply_to(&routed.message, "status_reply", &1u8).unwrap();
        answer(&mut server, &routed, reply).await;
    });

    let reply = client.request(request, TIMEOUT).await.unwrap();
    assert_eq!(reply.decode::<u8>().unwrap(), 1);
    server_handle.await.unwrap();
}
