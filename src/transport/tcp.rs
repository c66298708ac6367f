use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::Shared;
use crate::config::Mode;
use crate::connection::Connection;
use crate::frame::Framer;
use crate::record::{Record, HEARTBEAT, IDENTITY};

const REDIAL_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_READ_BUF: usize = 1024;

/// Accepts connections on `port` until the process exits. Each accepted
/// socket is handshaken and spun up on its own task, so a slow or hostile
/// peer during handshake never blocks the accept loop.
pub async fn serve(shared: Arc<Shared>, port: u16) -> Result<()> {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("failed to bind tcp listener on port {port}: {err}");
            return Err(err).with_context(|| format!("failed to bind tcp listener on port {port}"));
        }
    };

    log::info!("node listening: addr={:?}", listener.local_addr()?);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("accept failed: {err}");
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = accept_one(shared, stream, remote_addr).await {
                log::warn!("connection setup failed for {remote_addr}: {err}");
            }
        });
    }
}

async fn accept_one(shared: Arc<Shared>, mut stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
    let local_addr = stream.local_addr()?;
    stream.set_nodelay(true).ok();

    let our_uid = shared.uid.clone().unwrap_or_else(|| local_addr.to_string());
    let hs = handshake(&mut stream, &shared.framer, &our_uid, remote_addr, local_addr).await?;

    let registry = shared.registry.clone();
    spawn_connection(shared, stream, remote_addr, local_addr, hs.pending_frames, hs.residue);
    registry.bind_uid(hs.peer_uid, remote_addr);

    Ok(())
}

/// Dials `server_addr`, runs the connection to completion, then reconnects.
/// Runs until the process exits; dial and connection failures are logged
/// and retried rather than propagated.
pub async fn connect(shared: Arc<Shared>, server_addr: SocketAddr) -> Result<()> {
    loop {
        match TcpStream::connect(server_addr).await {
            Ok(stream) => {
                log::info!("dialed server: addr={server_addr}");
                if let Err(err) = run_client_connection(shared.clone(), stream, server_addr).await {
                    log::warn!("client connection ended: {err}");
                }
            }
            Err(err) => {
                log::warn!("dial failed: addr={server_addr}, err={err}");
            }
        }

        tokio::time::sleep(REDIAL_INTERVAL).await;
    }
}

async fn run_client_connection(shared: Arc<Shared>, mut stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
    let local_addr = stream.local_addr()?;
    stream.set_nodelay(true).ok();

    let our_uid = shared.uid.clone().unwrap_or_else(|| local_addr.to_string());
    let hs = handshake(&mut stream, &shared.framer, &our_uid, remote_addr, local_addr).await?;

    spawn_connection(shared.clone(), stream, remote_addr, local_addr, hs.pending_frames, hs.residue);
    shared.registry.bind_uid(hs.peer_uid, remote_addr);

    while !shared.registry.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}

struct HandshakeResult {
    peer_uid: String,
    pending_frames: Vec<Vec<u8>>,
    residue: BytesMut,
}

/// Exchanges an `IDENTITY` record immediately after connecting. The first
/// record received is consumed here to resolve the peer's UID and is never
/// forwarded to the dispatcher; any additional frames already decoded out
/// of the same read are carried forward so the reader task picks up exactly
/// where the handshake left off.
async fn handshake(
    stream: &mut TcpStream,
    framer: &Framer,
    our_uid: &str,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<HandshakeResult> {
    write_record(
        stream,
        framer,
        &Record {
            from: local_addr.to_string(),
            to: remote_addr.to_string(),
            operation: IDENTITY.to_string(),
            body: serde_json::Value::String(our_uid.to_string()),
        },
    )
    .await
    .context("handshake: failed to send identity")?;

    let mut residue = BytesMut::new();
    let mut buf = vec![0u8; HANDSHAKE_READ_BUF];
    let mut frames: Vec<Vec<u8>> = Vec::new();

    while frames.is_empty() {
        let n = stream.read(&mut buf).await.context("handshake: read failed")?;
        if n == 0 {
            bail!("handshake: peer {remote_addr} closed before identifying");
        }
        residue.extend_from_slice(&buf[..n]);
        frames = framer.unpack(&mut residue);
    }

    let mut frames = frames.into_iter();
    let first = frames.next().expect("loop exits only once a frame is present");
    let pending_frames: Vec<Vec<u8>> = frames.collect();

    let peer_uid = match serde_json::from_slice::<Record>(&first) {
        Ok(record) if record.is_identity() => match record.body.as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => remote_addr.to_string(),
        },
        _ => remote_addr.to_string(),
    };

    Ok(HandshakeResult { peer_uid, pending_frames, residue })
}

async fn write_record(stream: &mut TcpStream, framer: &Framer, record: &Record) -> Result<()> {
    let payload = serde_json::to_vec(record)?;
    stream.write_all(&framer.pack(&payload)).await?;
    Ok(())
}

fn spawn_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    pending_frames: Vec<Vec<u8>>,
    residue: BytesMut,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel(shared.conn_queue);
    let conn = Arc::new(Connection::new(remote_addr, local_addr, outbox_tx));

    shared.registry.insert(conn.clone());
    shared.statistics.register(remote_addr);

    tokio::spawn(reader_task(read_half, conn.clone(), shared.clone(), residue, pending_frames));
    tokio::spawn(writer_task(write_half, conn, shared, outbox_rx));
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    conn: Arc<Connection>,
    shared: Arc<Shared>,
    mut residue: BytesMut,
    pending: Vec<Vec<u8>>,
) {
    for payload in pending {
        deliver(&shared, conn.remote_addr, payload).await;
    }

    let mut buf = vec![0u8; shared.conn_buffer];

    loop {
        let read_outcome = if shared.mode == Mode::Server {
            tokio::select! {
                biased;
                _ = conn.closed_signal() => break,
                res = tokio::time::timeout(shared.timeout, read_half.read(&mut buf)) => match res {
                    Ok(inner) => inner,
                    Err(_) => {
                        log::warn!("reader: read deadline elapsed for {}", conn.remote_addr);
                        break;
                    }
                },
            }
        } else {
            tokio::select! {
                biased;
                _ = conn.closed_signal() => break,
                res = read_half.read(&mut buf) => res,
            }
        };

        let n = match read_outcome {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        shared.statistics.report_received(&conn.remote_addr, n as u64, 1);

        residue.extend_from_slice(&buf[..n]);
        for payload in shared.framer.unpack(&mut residue) {
            deliver(&shared, conn.remote_addr, payload).await;
        }
    }

    teardown(&shared, &conn);
}

async fn deliver(shared: &Arc<Shared>, remote_addr: SocketAddr, payload: Vec<u8>) {
    match serde_json::from_slice::<Record>(&payload) {
        Ok(mut record) => {
            if record.from.is_empty() {
                record.from = remote_addr.to_string();
            }
            if shared.inbound_tx.send(record).await.is_err() {
                log::warn!("reader: inbound queue closed, dropping record from {remote_addr}");
            }
        }
        Err(err) => log::debug!("reader: dropping malformed payload from {remote_addr}: {err}"),
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    conn: Arc<Connection>,
    shared: Arc<Shared>,
    mut outbox_rx: mpsc::Receiver<Record>,
) {
    let mut heartbeat_counter: u64 = 0;

    loop {
        let record = if shared.mode == Mode::Client {
            tokio::select! {
                biased;
                _ = conn.closed_signal() => break,
                maybe = outbox_rx.recv() => match maybe {
                    Some(r) => r,
                    None => break,
                },
                _ = tokio::time::sleep(shared.timeout) => {
                    heartbeat_counter += 1;
                    Record {
                        from: conn.local_addr.to_string(),
                        to: conn.remote_addr.to_string(),
                        operation: HEARTBEAT.to_string(),
                        body: serde_json::Value::from(heartbeat_counter),
                    }
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = conn.closed_signal() => break,
                maybe = outbox_rx.recv() => match maybe {
                    Some(r) => r,
                    None => break,
                },
            }
        };

        let payload = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("writer: failed to encode record: {err}");
                continue;
            }
        };

        let framed = shared.framer.pack(&payload);
        let len = framed.len() as u64;
        if write_half.write_all(&framed).await.is_err() {
            break;
        }
        shared.statistics.report_sent(&conn.remote_addr, len, 1);
    }

    teardown(&shared, &conn);
}

fn teardown(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    shared.registry.remove(&conn.remote_addr);
    shared.statistics.unregister(&conn.remote_addr);
}
