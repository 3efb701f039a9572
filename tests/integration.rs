//! Integration tests for hybrid-transport.
//!
//! Real loopback sockets: a server on an ephemeral port and one or more
//! clients talking to it over TCP and UDP.

use std::time::Duration;

use bytes::Bytes;
use hybrid_transport::codec::MsgPackCodec;
use hybrid_transport::{
    ChannelState, Client, ClientBuilder, Delivery, Dispatcher, EventDelivery, FrameKind, PeerId,
    Server, ServerBuilder, TransportError,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ServerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(PeerId, Bytes, Delivery),
}

#[derive(Debug)]
enum ClientEvent {
    Connected,
    Failed(String),
    Disconnected,
    Message(Bytes, Delivery),
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn start_server(builder: ServerBuilder) -> (Server, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (t1, t2, t3) = (tx.clone(), tx.clone(), tx);

    let server = builder
        .on_peer_connected(move |peer| {
            let _ = t1.send(ServerEvent::Connected(peer.id()));
        })
        .on_peer_disconnected(move |peer| {
            let _ = t2.send(ServerEvent::Disconnected(peer.id()));
        })
        .on_message(move |peer, payload, delivery| {
            let _ = t3.send(ServerEvent::Message(peer.id(), payload, delivery));
        })
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    (server, rx)
}

fn build_client(builder: ClientBuilder) -> (Client, UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (t1, t2, t3, t4) = (tx.clone(), tx.clone(), tx.clone(), tx);

    let client = builder
        .on_connected(move || {
            let _ = t1.send(ClientEvent::Connected);
        })
        .on_connection_failed(move |e| {
            let _ = t2.send(ClientEvent::Failed(e.to_string()));
        })
        .on_disconnected(move || {
            let _ = t3.send(ClientEvent::Disconnected);
        })
        .on_message(move |payload, delivery| {
            let _ = t4.send(ClientEvent::Message(payload, delivery));
        })
        .build();

    (client, rx)
}

/// Connect a default client and wait until both sides report the rendezvous.
async fn connect(
    server: &Server,
    server_rx: &mut UnboundedReceiver<ServerEvent>,
) -> (Client, UnboundedReceiver<ClientEvent>, PeerId) {
    let (client, mut client_rx) = build_client(Client::builder());
    client.connect(server.local_addr()).unwrap();

    assert!(matches!(next(&mut client_rx).await, ClientEvent::Connected));
    let peer = match next(server_rx).await {
        ServerEvent::Connected(peer) => peer,
        other => panic!("expected PeerConnected, got {:?}", other),
    };

    (client, client_rx, peer)
}

#[tokio::test]
async fn test_rendezvous_binds_udp_endpoint() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    assert_eq!(server.udp_local_addr().port(), server.local_addr().port());

    let (client, _client_rx, id) = connect(&server, &mut server_rx).await;

    assert!(client.is_connected());
    assert_eq!(client.remote_tcp_addr(), Some(server.local_addr()));

    let peer = server.peer(id).expect("peer registered");
    assert!(peer.is_udp_ready());
    assert_eq!(
        peer.udp_remote_addr().map(|addr| addr.port()),
        client.local_udp_addr().map(|addr| addr.port())
    );
    assert_eq!(
        peer.tcp_remote_addr().port(),
        client.local_tcp_addr().unwrap().port()
    );
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn test_tcp_messages_both_ways_in_order() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, mut client_rx, id) = connect(&server, &mut server_rx).await;

    for i in 0..100u32 {
        client.send(&i.to_le_bytes(), Delivery::Tcp).unwrap();
    }
    for i in 0..100u32 {
        match next(&mut server_rx).await {
            ServerEvent::Message(from, payload, Delivery::Tcp) => {
                assert_eq!(from, id);
                assert_eq!(&payload[..], &i.to_le_bytes());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    let peer = server.peer(id).unwrap();
    server.send(&peer, b"world", Delivery::Tcp).unwrap();
    match next(&mut client_rx).await {
        ClientEvent::Message(payload, Delivery::Tcp) => assert_eq!(&payload[..], b"world"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_udp_messages_both_ways() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, mut client_rx, id) = connect(&server, &mut server_rx).await;

    client.send(b"fast up", Delivery::Udp).unwrap();
    match next(&mut server_rx).await {
        ServerEvent::Message(from, payload, Delivery::Udp) => {
            assert_eq!(from, id);
            assert_eq!(&payload[..], b"fast up");
        }
        other => panic!("unexpected {:?}", other),
    }

    let peer = server.peer(id).unwrap();
    server.send(&peer, b"fast down", Delivery::Udp).unwrap();
    match next(&mut client_rx).await {
        ClientEvent::Message(payload, Delivery::Udp) => assert_eq!(&payload[..], b"fast down"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_and_maximum_payloads() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, _client_rx, _id) = connect(&server, &mut server_rx).await;

    assert!(matches!(
        client.send(&[0u8; 1020], Delivery::Tcp),
        Err(TransportError::PayloadTooLarge { size: 1020, max: 1019 })
    ));

    client.send(b"", Delivery::Tcp).unwrap();
    client.send(&[0xAB; 1019], Delivery::Tcp).unwrap();

    match next(&mut server_rx).await {
        ServerEvent::Message(_, payload, _) => assert!(payload.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
    match next(&mut server_rx).await {
        ServerEvent::Message(_, payload, _) => {
            assert_eq!(payload.len(), 1019);
            assert!(payload.iter().all(|&b| b == 0xAB));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_kinds_are_delivered() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, _client_rx, _id) = connect(&server, &mut server_rx).await;

    client
        .send_kind(FrameKind::Custom(42), b"custom", Delivery::Tcp)
        .unwrap();
    match next(&mut server_rx).await {
        ServerEvent::Message(_, payload, Delivery::Tcp) => assert_eq!(&payload[..], b"custom"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_reserved_kinds_rejected_by_wire_value() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, _client_rx, id) = connect(&server, &mut server_rx).await;
    let peer = server.peer(id).expect("peer registered");

    for kind in [
        FrameKind::UdpInformation,
        FrameKind::Ping,
        FrameKind::Custom(1),
        FrameKind::Custom(2),
    ] {
        assert!(matches!(
            server.send_kind(&peer, kind, b"", Delivery::Tcp),
            Err(TransportError::Usage(_))
        ));
        assert!(matches!(
            client.send_kind(kind, b"", Delivery::Tcp),
            Err(TransportError::Usage(_))
        ));
    }

    // Byte 0 is an ordinary application message.
    server
        .send_kind(&peer, FrameKind::Custom(0), b"zero", Delivery::Tcp)
        .unwrap();
}

#[tokio::test]
async fn test_send_encoded_roundtrip() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Position {
        entity: u32,
        x: f32,
        y: f32,
    }

    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, _client_rx, _id) = connect(&server, &mut server_rx).await;

    let sent = Position {
        entity: 3,
        x: 10.5,
        y: -4.0,
    };
    client.send_encoded(&sent, Delivery::Tcp).unwrap();

    match next(&mut server_rx).await {
        ServerEvent::Message(_, payload, _) => {
            let received: Position = MsgPackCodec::decode(&payload).unwrap();
            assert_eq!(received, sent);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_server_disconnect_tears_down_both_sides() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, mut client_rx, id) = connect(&server, &mut server_rx).await;

    let peer = server.peer(id).unwrap();
    server.disconnect(&peer);

    assert!(matches!(next(&mut client_rx).await, ClientEvent::Disconnected));
    assert!(matches!(next(&mut server_rx).await, ServerEvent::Disconnected(gone) if gone == id));

    assert_eq!(server.peer_count(), 0);
    assert!(server.peer(id).is_none());
    assert!(!peer.is_udp_ready());
    assert_eq!(client.state(), ChannelState::Disconnected);
    assert!(client.local_udp_addr().is_none());
    assert!(matches!(
        client.send(b"late", Delivery::Tcp),
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_client_disconnect_and_reconnect() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, mut client_rx, id) = connect(&server, &mut server_rx).await;

    client.disconnect();
    assert!(matches!(next(&mut client_rx).await, ClientEvent::Disconnected));
    assert!(matches!(next(&mut server_rx).await, ServerEvent::Disconnected(gone) if gone == id));

    client.connect(server.local_addr()).unwrap();
    assert!(matches!(next(&mut client_rx).await, ClientEvent::Connected));
    match next(&mut server_rx).await {
        ServerEvent::Connected(again) => assert_ne!(again, id),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnect_as_soon_as_state_resets() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (client, mut client_rx, id) = connect(&server, &mut server_rx).await;

    client.disconnect();
    tokio::time::timeout(WAIT, async {
        while client.state() != ChannelState::Disconnected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("client never disconnected");
    assert!(client.local_udp_addr().is_none());

    client.connect(server.local_addr()).unwrap();
    assert!(matches!(next(&mut client_rx).await, ClientEvent::Disconnected));
    assert!(matches!(next(&mut client_rx).await, ClientEvent::Connected));

    // The old peer's teardown and the new rendezvous may land in either order.
    let mut again = None;
    let mut old_gone = false;
    while again.is_none() || !old_gone {
        match next(&mut server_rx).await {
            ServerEvent::Disconnected(gone) if gone == id => old_gone = true,
            ServerEvent::Connected(peer) => again = Some(peer),
            other => panic!("unexpected {:?}", other),
        }
    }
    let again = again.unwrap();
    assert_ne!(again, id);

    client.send(b"after reconnect", Delivery::Udp).unwrap();
    match next(&mut server_rx).await {
        ServerEvent::Message(from, payload, Delivery::Udp) => {
            assert_eq!(from, again);
            assert_eq!(&payload[..], b"after reconnect");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_failed_to_closed_port() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let (client, mut client_rx) = build_client(Client::builder());
    client.connect(addr).unwrap();

    assert!(matches!(next(&mut client_rx).await, ClientEvent::Failed(_)));
    assert_eq!(client.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_keepalive_pings_are_not_surfaced() {
    let (server, mut server_rx) = start_server(
        Server::builder().keepalive_interval(Some(Duration::from_millis(20))),
    )
    .await;
    let (client, mut client_rx, _id) = connect(&server, &mut server_rx).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(client.is_connected());
    assert!(client_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_send_all_reaches_every_peer() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (_a, mut a_rx, _) = connect(&server, &mut server_rx).await;
    let (_b, mut b_rx, _) = connect(&server, &mut server_rx).await;

    assert_eq!(server.send_all(b"everyone", Delivery::Tcp), 2);

    for rx in [&mut a_rx, &mut b_rx] {
        match next(rx).await {
            ClientEvent::Message(payload, Delivery::Tcp) => assert_eq!(&payload[..], b"everyone"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (server, mut server_rx) = start_server(Server::builder()).await;
    let (_client, mut client_rx, _id) = connect(&server, &mut server_rx).await;

    server.shutdown();

    assert!(matches!(next(&mut client_rx).await, ClientEvent::Disconnected));
}

#[tokio::test]
async fn test_queued_delivery_runs_on_drain() {
    let dispatcher = Dispatcher::new();
    let (server, mut server_rx) =
        start_server(Server::builder().event_delivery(EventDelivery::Queued(dispatcher))).await;

    let (client, mut client_rx) = build_client(Client::builder());
    client.connect(server.local_addr()).unwrap();
    assert!(matches!(next(&mut client_rx).await, ClientEvent::Connected));

    // Nothing fires until the owner drains.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server_rx.try_recv().is_err());

    let deadline = tokio::time::Instant::now() + WAIT;
    while server.drain_events() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no queued events");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(server_rx.try_recv(), Ok(ServerEvent::Connected(_))));
}
