use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use noderpc::{make_handler, Node, Record};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const POLL: Duration = Duration::from_millis(50);

async fn until<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let start = tokio::time::Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            return false;
        }
        sleep(POLL).await;
    }
    true
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Echoes back whatever body it receives.
fn echo_handler() -> noderpc::Handler {
    make_handler(|r: Record| Some(Record::new("echo", r.body)))
}

#[tokio::test]
async fn handshake_then_echo_round_trips_through_both_directions() {
    let port = free_port();

    let server = Arc::new(Node::new());
    let mut server_api = AHashMap::new();
    server_api.insert("echo".to_string(), echo_handler());
    server.set_api(server_api);

    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();
    let client = Arc::new(Node::new());
    let mut client_api = AHashMap::new();
    client_api.insert(
        "echo".to_string(),
        make_handler(move |r: Record| {
            let _ = reply_tx.send(r.body);
            None
        }),
    );
    client.set_api(client_api);

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let client_run = client.clone();
    tokio::spawn(async move { client_run.client(addr).await });

    assert!(
        until(Duration::from_secs(5), || client.count_nodes() == 1).await,
        "client never completed the handshake"
    );

    client.request(Value::from("ping"), "echo", None).await;

    let body = timeout(Duration::from_secs(5), reply_rx.recv())
        .await
        .expect("echo reply never arrived")
        .unwrap();
    assert_eq!(body, Value::from("ping"));
}

#[tokio::test]
async fn handshake_binds_the_peer_uid_so_the_server_can_address_the_client_directly() {
    let port = free_port();

    let server = Arc::new(Node::new());
    server.set_api(AHashMap::new());
    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();
    let client = Arc::new(Node::new());
    client.set_uid("client-under-test");
    let mut client_api = AHashMap::new();
    client_api.insert(
        "ping".to_string(),
        make_handler(move |r: Record| {
            let _ = reply_tx.send(r.body);
            None
        }),
    );
    client.set_api(client_api);

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let client_run = client.clone();
    tokio::spawn(async move { client_run.client(addr).await });

    assert!(
        until(Duration::from_secs(5), || server.count_nodes() == 1).await,
        "server never saw the client connect"
    );

    server.request(Value::from("hello"), "ping", Some("client-under-test")).await;

    let body = timeout(Duration::from_secs(5), reply_rx.recv())
        .await
        .expect("client never received the uid-addressed request")
        .unwrap();
    assert_eq!(body, Value::from("hello"));
}

#[tokio::test]
async fn idle_client_keeps_the_connection_alive_with_heartbeats() {
    let port = free_port();

    let server = Arc::new(Node::new());
    server.set_api(AHashMap::new());
    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    let client = Arc::new(Node::new());
    client.set_timeout(Duration::from_millis(300));
    client.set_api(AHashMap::new());
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let client_run = client.clone();
    tokio::spawn(async move { client_run.client(addr).await });

    assert!(
        until(Duration::from_secs(5), || server.count_nodes() == 1).await,
        "handshake never completed"
    );

    // no application traffic is sent; only heartbeats should flow. Give the
    // server's timeout (5s default, well above our 300ms client heartbeat
    // interval) plenty of room to have been refreshed a few times.
    sleep(Duration::from_millis(1200)).await;

    assert_eq!(server.count_nodes(), 1, "connection should not have been dropped by the read deadline");
}

#[tokio::test]
async fn three_connected_clients_and_pick_any_hits_exactly_one() {
    let port = free_port();

    let (hit_tx, mut hit_rx) = mpsc::unbounded_channel::<String>();

    let server = Arc::new(Node::new());
    server.set_api(AHashMap::new());
    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let mut clients = Vec::new();
    for name in ["a", "b", "c"] {
        let client = Arc::new(Node::new());
        client.set_uid(name);
        let tx = hit_tx.clone();
        let name = name.to_string();
        let mut api = AHashMap::new();
        api.insert(
            "ping".to_string(),
            make_handler(move |_: Record| {
                let _ = tx.send(name.clone());
                None
            }),
        );
        client.set_api(api);

        let run = client.clone();
        tokio::spawn(async move { run.client(addr).await });
        clients.push(client);
    }

    assert!(
        until(Duration::from_secs(5), || server.count_nodes() == 3).await,
        "not all three clients connected"
    );

    server.request(Value::from("ping"), "ping", None).await;

    let hit = timeout(Duration::from_secs(5), hit_rx.recv()).await.unwrap().unwrap();
    assert!(["a", "b", "c"].contains(&hit.as_str()));

    assert!(
        timeout(Duration::from_millis(300), hit_rx.recv()).await.is_err(),
        "pick-any must deliver to exactly one client, not all of them"
    );
}

#[tokio::test]
async fn client_keeps_redialing_until_a_server_appears_on_the_port() {
    // picks a port, then releases it immediately so nothing is listening yet.
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let client = Arc::new(Node::new());
    client.set_api(AHashMap::new());
    let client_run = client.clone();
    tokio::spawn(async move { client_run.client(addr).await });

    // the dial loop should be failing and retrying every second; nothing is
    // listening yet, so the registry must stay empty.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(client.count_nodes(), 0, "client should not be connected to anything yet");

    let server = Arc::new(Node::new());
    server.set_api(AHashMap::new());
    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    assert!(
        until(Duration::from_secs(10), || client.count_nodes() == 1).await,
        "client never connected once a server appeared on the dialed port"
    );
    assert!(
        until(Duration::from_secs(5), || server.count_nodes() == 1).await,
        "server side of the handshake never completed"
    );
}

#[tokio::test]
async fn client_reconnects_after_the_server_restarts_on_the_same_port() {
    use noderpc::frame::Framer;
    use noderpc::record::IDENTITY;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    // a bare-bones listener that completes the identity handshake by hand,
    // so the client's connection is genuinely established (not just dialed)
    // before the socket underneath it is severed.
    let first_listener = TcpListener::bind(addr).await.unwrap();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();
    let client = Arc::new(Node::new());
    let mut client_api = AHashMap::new();
    client_api.insert(
        "ping".to_string(),
        make_handler(move |r: Record| {
            let _ = reply_tx.send(r.body);
            None
        }),
    );
    client.set_api(client_api);
    let client_run = client.clone();
    tokio::spawn(async move { client_run.client(addr).await });

    let (mut stream, _) = timeout(Duration::from_secs(5), first_listener.accept())
        .await
        .expect("client never dialed the first listener")
        .unwrap();

    let framer = Framer::default();
    let mut residue = bytes::BytesMut::new();
    let mut buf = vec![0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before completing the handshake");
        residue.extend_from_slice(&buf[..n]);
        if !framer.unpack(&mut residue).is_empty() {
            break;
        }
    }

    let reply = Record {
        from: stream.local_addr().unwrap().to_string(),
        to: stream.peer_addr().unwrap().to_string(),
        operation: IDENTITY.to_string(),
        body: Value::String("first-incarnation".to_string()),
    };
    let payload = serde_json::to_vec(&reply).unwrap();
    stream.write_all(&framer.pack(&payload)).await.unwrap();

    assert!(
        until(Duration::from_secs(5), || client.count_nodes() == 1).await,
        "client never completed the handshake against the first listener"
    );

    // sever the connection and free the port so a restarted server can rebind it.
    drop(stream);
    drop(first_listener);

    assert!(
        until(Duration::from_secs(5), || client.count_nodes() == 0).await,
        "client never noticed the severed connection"
    );

    let server = Arc::new(Node::new());
    server.set_api(AHashMap::new());
    let server_run = server.clone();
    tokio::spawn(async move { server_run.server(port).await });

    assert!(
        until(Duration::from_secs(10), || client.count_nodes() == 1).await,
        "client never reconnected to the restarted server"
    );
    assert!(
        until(Duration::from_secs(5), || server.count_nodes() == 1).await,
        "restarted server never completed the handshake with the client"
    );

    server.request(Value::from("ping-after-restart"), "ping", None).await;
    let body = timeout(Duration::from_secs(5), reply_rx.recv())
        .await
        .expect("no reply after reconnecting")
        .unwrap();
    assert_eq!(body, Value::from("ping-after-restart"));
}
