// kafkagate/src/listener/socket.rs
//
// Raw socket listeners (TCP and UDP).
//
// TCP: one acceptor task plus N worker tasks chosen at construction. The
// acceptor sets keepalive, rejects blacklisted sources and hands each
// connection to a worker over a per-worker channel, round robin. Workers read
// up to 4 KiB per call and feed the bytes to the decoder session; after the
// first successful read the optional greeting (the `response` config file) is
// written back once.
//
// UDP: one shared socket, N workers looping on recv_from; every datagram is a
// session of its own.
//
// Shutdown: the cancellation token is observed by every loop; workers drain
// and are awaited before the acceptor handle resolves.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::config::ListenerConfig;
use crate::decode::RequestVars;

/// Fixed read chunk for both TCP reads and UDP datagrams.
const READ_BUFFER_SIZE: usize = 4096;
/// Backlog of accepted connections waiting per worker.
const WORKER_QUEUE_DEPTH: usize = 64;

// ── TCP ───────────────────────────────────────────────────────────────────────

pub async fn spawn_tcp(
    app: Arc<App>,
    cfg: ListenerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!(
        "tcp listener on port {}, {} workers, decoder {}",
        cfg.port,
        cfg.num_threads,
        cfg.decoder.name()
    );

    let mut workers = JoinSet::new();
    let mut handoff: Vec<mpsc::Sender<(TcpStream, SocketAddr)>> =
        Vec::with_capacity(cfg.num_threads);
    for _ in 0..cfg.num_threads {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        handoff.push(tx);
        workers.spawn(tcp_worker(app.clone(), cfg.clone(), rx, cancel.clone()));
    }

    Ok(tokio::spawn(tcp_accept_loop(
        app, cfg, listener, handoff, workers, cancel,
    )))
}

async fn tcp_accept_loop(
    app: Arc<App>,
    cfg: ListenerConfig,
    listener: TcpListener,
    handoff: Vec<mpsc::Sender<(TcpStream, SocketAddr)>>,
    mut workers: JoinSet<()>,
    cancel: CancellationToken,
) {
    let mut next_worker = 0usize;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!("accept failed on port {}: {err}", cfg.port);
                continue;
            }
        };

        if app.blacklist.contains(&peer.ip()) {
            debug!("connection rejected: {} in blacklist", peer.ip());
            continue;
        }

        if cfg.socket.tcp_keepalive {
            if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
                debug!("can't set SO_KEEPALIVE option: {err}");
            }
        }

        debug!("accepted connection from {peer}");
        let worker = next_worker % handoff.len();
        next_worker = next_worker.wrapping_add(1);
        if handoff[worker].send((stream, peer)).await.is_err() {
            break; // worker gone, shutting down
        }
    }

    // Close the channels so workers drain their queues and exit.
    drop(handoff);
    while workers.join_next().await.is_some() {}
    debug!("tcp listener on port {} stopped", cfg.port);
}

async fn tcp_worker(
    app: Arc<App>,
    cfg: ListenerConfig,
    mut rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = rx.recv() => match incoming {
                Some((stream, peer)) => {
                    connections.spawn(tcp_connection(
                        app.clone(),
                        cfg.clone(),
                        stream,
                        peer,
                    ));
                }
                None => break,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn tcp_connection(app: Arc<App>, cfg: ListenerConfig, mut stream: TcpStream, peer: SocketAddr) {
    let vars = RequestVars {
        client_ip: peer.ip().to_string(),
        ..Default::default()
    };
    let mut session = match cfg.decoder.new_session(
        app.sink.clone(),
        &app.topics,
        cfg.topic.as_deref().or(app.default_topic.as_deref()),
        &vars,
        None,
    ) {
        Ok(session) => session,
        Err(err) => {
            warn!("can't create session for {peer}: {err}");
            return;
        }
    };

    let mut greeted = false;
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let read = stream.read_buf(&mut buf).await;
        match read {
            Ok(0) => break, // EOF
            Ok(_) => {
                let chunk = buf.split().freeze();
                if let Err(err) = session.on_chunk(chunk) {
                    if app.throttle.should_log(&format!("tcp-decode:{}", peer.ip())) {
                        warn!("decode error from {peer}: {err}");
                    }
                }
                if !greeted {
                    greeted = true;
                    if let Some(greeting) = &app.greeting {
                        debug!("sending first response to {peer}");
                        if let Err(err) = stream.write_all(greeting).await {
                            warn!("cannot send first response to {peer}: {err}");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                debug!("read error from {peer}: {err}");
                break;
            }
        }
    }

    if let Err(err) = session.end_of_body() {
        if app.throttle.should_log(&format!("tcp-decode:{}", peer.ip())) {
            warn!("decode error from {peer}: {err}");
        }
    }
}

// ── UDP ───────────────────────────────────────────────────────────────────────

pub async fn spawn_udp(
    app: Arc<App>,
    cfg: ListenerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", cfg.port)).await?);
    info!(
        "udp listener on port {}, {} workers, decoder {}",
        cfg.port,
        cfg.num_threads,
        cfg.decoder.name()
    );

    let mut workers = JoinSet::new();
    for _ in 0..cfg.num_threads {
        workers.spawn(udp_worker(
            app.clone(),
            cfg.clone(),
            socket.clone(),
            cancel.clone(),
        ));
    }

    let port = cfg.port;
    Ok(tokio::spawn(async move {
        while workers.join_next().await.is_some() {}
        debug!("udp listener on port {port} stopped");
    }))
}

async fn udp_worker(
    app: Arc<App>,
    cfg: ListenerConfig,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(pair) => pair,
            Err(err) => {
                warn!("udp receive error on port {}: {err}", cfg.port);
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        handle_datagram(&app, &cfg, Bytes::copy_from_slice(&buf[..len]), peer);
    }
}

/// One datagram, one session, one record.
fn handle_datagram(app: &Arc<App>, cfg: &ListenerConfig, datagram: Bytes, peer: SocketAddr) {
    let vars = RequestVars {
        client_ip: peer.ip().to_string(),
        ..Default::default()
    };
    let mut session = match cfg.decoder.new_session(
        app.sink.clone(),
        &app.topics,
        cfg.topic.as_deref().or(app.default_topic.as_deref()),
        &vars,
        None,
    ) {
        Ok(session) => session,
        Err(err) => {
            if app.throttle.should_log("udp-session") {
                warn!("can't create session for datagram from {peer}: {err}");
            }
            return;
        }
    };
    let result = session
        .on_chunk(datagram)
        .and_then(|_| session.end_of_body());
    if let Err(err) = result {
        if app.throttle.should_log(&format!("udp-decode:{}", peer.ip())) {
            warn!("decode error from {peer}: {err}");
        }
    }
}
