//! Socket listeners and per-connection sessions.
//!
//! This module is responsible for:
//!
//! 1. Binding the read-write and read-only local sockets, and the TCP
//!    listener when `listen_tcp` is set.
//! 2. Admitting clients up to `max_clients` and refusing the rest.
//! 3. Running one session per client: a reader that frames inbound bytes, a
//!    writer that drains the outbound queue, and a keep-alive timer.
//! 4. Handing every CALL to a blocking worker thread, at most
//!    `max_client_requests` per client and `max_workers` overall.
//! 5. Tearing the client context down when the session ends, whatever the
//!    reason.
//!
//! # Reply ordering
//!
//! Calls of one client run concurrently, so replies may leave in a different
//! order than the calls arrived. Clients match them by serial.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use virtd_core::protocol::codec::{decode_frame, encode_frame, frame_body_len};
use virtd_core::protocol::messages::{
    KeepaliveProcedure, MessageHeader, MessageType, HEADER_SIZE, KEEPALIVE_PROGRAM, LEN_PREFIX_SIZE,
};

use crate::application::connection::{ClientContext, TransportInfo, TransportKind};
use crate::application::dispatch::Dispatcher;
use crate::application::keepalive::{KeepaliveAction, KeepaliveMonitor};
use crate::infrastructure::credentials::peer_identity;
use crate::infrastructure::storage::config::{AuthConfig, DaemonConfig, KeepaliveConfig};

/// How often the accept loop wakes up to check the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Frames a client may have queued for sending before events are dropped.
const OUTBOUND_QUEUE_LEN: usize = 64;

const PAYLOAD_OFFSET: usize = LEN_PREFIX_SIZE + HEADER_SIZE;

// ── Public API ────────────────────────────────────────────────────────────────

/// Bound listeners, ready to serve.
pub struct Server {
    rw: UnixListener,
    ro: UnixListener,
    tcp: Option<TcpListener>,
    socket_paths: Vec<PathBuf>,
    config: DaemonConfig,
}

impl Server {
    /// Binds every configured listener.
    ///
    /// Stale socket files left by a previous run are removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket directory cannot be created or a
    /// listener cannot be bound.
    pub async fn bind(config: DaemonConfig) -> anyhow::Result<Self> {
        let rw = bind_unix(&config.listen.unix_sock_rw, 0o700)?;
        let ro = bind_unix(&config.listen.unix_sock_ro, 0o777)?;
        info!("listening on {}", config.listen.unix_sock_rw.display());
        info!("listening on {} (read-only)", config.listen.unix_sock_ro.display());

        let tcp = if config.listen.listen_tcp {
            let listener = TcpListener::bind(&config.listen.tcp_addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {}", config.listen.tcp_addr))?;
            info!("listening on tcp {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        Ok(Self {
            rw,
            ro,
            tcp,
            socket_paths: vec![config.listen.unix_sock_rw.clone(), config.listen.unix_sock_ro.clone()],
            config,
        })
    }

    /// Address the TCP listener is bound to, when it is enabled.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and do not end the loop; this currently
    /// always returns `Ok`.
    pub async fn serve(self, dispatcher: Dispatcher, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        let limits = &self.config.limits;
        let clients = Arc::new(Semaphore::new(limits.max_clients));
        let shared = Arc::new(Shared {
            dispatcher,
            workers: Arc::new(Semaphore::new(limits.max_workers)),
            max_client_requests: limits.max_client_requests,
            keepalive: self.config.keepalive.clone(),
            auth: self.config.auth.clone(),
            next_id: AtomicU64::new(1),
        });

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            let accepted = timeout(ACCEPT_POLL, async {
                tokio::select! {
                    r = self.rw.accept() => r.map(|(stream, _)| Accepted::Unix { stream, read_only: false }),
                    r = self.ro.accept() => r.map(|(stream, _)| Accepted::Unix { stream, read_only: true }),
                    r = accept_tcp(self.tcp.as_ref()) => r.map(|(stream, addr)| Accepted::Tcp { stream, addr }),
                }
            })
            .await;

            match accepted {
                Ok(Ok(client)) => {
                    let permit = match Arc::clone(&clients).try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!(max_clients = limits.max_clients, "client limit reached; refusing connection");
                            continue;
                        }
                    };
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        handle_client(client, shared).await;
                        drop(permit);
                    });
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // Timeout; loop back to check the `running` flag.
                }
            }
        }

        for path in &self.socket_paths {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("cannot remove {}: {e}", path.display());
            }
        }
        Ok(())
    }
}

/// Binds the configured listeners and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run_server(config: DaemonConfig, dispatcher: Dispatcher, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    Server::bind(config).await?.serve(dispatcher, running).await
}

// ── Listeners ─────────────────────────────────────────────────────────────────

enum Accepted {
    Unix { stream: UnixStream, read_only: bool },
    Tcp { stream: TcpStream, addr: SocketAddr },
}

fn bind_unix(path: &Path, mode: u32) -> anyhow::Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove stale socket {}", path.display())),
    }
    let listener = UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(listener)
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

/// State every session shares.
struct Shared {
    dispatcher: Dispatcher,
    workers: Arc<Semaphore>,
    max_client_requests: usize,
    keepalive: KeepaliveConfig,
    auth: AuthConfig,
    next_id: AtomicU64,
}

async fn handle_client(client: Accepted, shared: Arc<Shared>) {
    let keepalive_required = shared.keepalive.required;
    let outcome = match client {
        Accepted::Unix { stream, read_only } => {
            let peer = match peer_identity(&stream) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("cannot read peer credentials: {e}");
                    None
                }
            };
            let peer_addr = match &peer {
                Some(p) => format!("unix:pid={},uid={}", p.pid, p.uid),
                None => "unix".to_string(),
            };
            let auth_type = if read_only {
                shared.auth.auth_unix_ro
            } else {
                shared.auth.auth_unix_rw
            };
            let transport = TransportInfo {
                kind: TransportKind::Unix,
                read_only,
                auth_type,
                peer,
                peer_addr,
                keepalive_required,
            };
            run_session(stream, transport, Arc::clone(&shared)).await
        }
        Accepted::Tcp { stream, addr } => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("cannot set TCP_NODELAY for {addr}: {e}");
            }
            let transport = TransportInfo {
                kind: TransportKind::Tcp,
                read_only: false,
                auth_type: shared.auth.auth_tcp,
                peer: None,
                peer_addr: addr.to_string(),
                keepalive_required,
            };
            run_session(stream, transport, Arc::clone(&shared)).await
        }
    };

    match outcome {
        Ok(conn) => info!(conn, "session closed normally"),
        Err(e) => warn!("session closed with error: {e:#}"),
    }
}

/// Runs one client session to completion and returns its connection id.
///
/// The session ends when the peer disconnects, sends a frame that cannot be
/// framed, stops answering keep-alive, or the writer fails.
///
/// # Errors
///
/// Returns an error for transport failures and unframeable input.
async fn run_session<S>(stream: S, transport: TransportInfo, shared: Arc<Shared>) -> anyhow::Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    info!(conn = id, peer = %transport.peer_addr, read_only = transport.read_only, "client connected");

    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_LEN);
    let ctx = ClientContext::init(id, transport, tx.clone());
    let monitor = Arc::new(Mutex::new(KeepaliveMonitor::new(
        shared.keepalive.interval,
        shared.keepalive.count,
    )));

    let mut writer_task = tokio::spawn(write_frames(writer, rx, id));
    let mut keepalive_task = tokio::spawn(run_keepalive(Arc::clone(&ctx), Arc::clone(&monitor), tx.clone()));
    let requests = Arc::new(Semaphore::new(shared.max_client_requests));

    let result = tokio::select! {
        r = read_loop(&mut reader, &ctx, &monitor, &tx, &requests, &shared) => r,
        _ = &mut writer_task => {
            debug!(conn = id, "writer task ended");
            Ok(())
        }
        _ = &mut keepalive_task => {
            warn!(conn = id, "peer stopped answering keepalive; closing");
            Ok(())
        }
    };
    writer_task.abort();
    keepalive_task.abort();

    let teardown_ctx = Arc::clone(&ctx);
    if let Err(e) = tokio::task::spawn_blocking(move || teardown_ctx.teardown()).await {
        error!(conn = id, "teardown task failed: {e}");
    }
    result.map(|()| id)
}

async fn read_loop<R>(
    reader: &mut R,
    ctx: &Arc<ClientContext>,
    monitor: &Mutex<KeepaliveMonitor>,
    tx: &mpsc::Sender<Vec<u8>>,
    requests: &Arc<Semaphore>,
    shared: &Arc<Shared>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let conn = ctx.id();
    loop {
        let frame = match read_frame(reader).await? {
            Some(f) => f,
            None => {
                debug!(conn, "peer closed the connection");
                return Ok(());
            }
        };
        monitor.lock().unwrap_or_else(PoisonError::into_inner).on_inbound();

        let (header, _, _) = decode_frame(&frame).context("malformed frame header")?;
        if header.program == KEEPALIVE_PROGRAM {
            answer_keepalive(conn, &header, tx);
            continue;
        }
        if header.msg_type != MessageType::Call {
            debug!(conn, proc = header.procedure, msg_type = ?header.msg_type, "ignoring non-call message");
            continue;
        }

        let request_permit = Arc::clone(requests).acquire_owned().await?;
        let worker_permit = Arc::clone(&shared.workers).acquire_owned().await?;
        let ctx = Arc::clone(ctx);
        let tx = tx.clone();
        let shared = Arc::clone(shared);
        tokio::task::spawn_blocking(move || {
            let _permits = (request_permit, worker_permit);
            if let Some(reply) = shared.dispatcher.handle_call(&ctx, &header, &frame[PAYLOAD_OFFSET..]) {
                if tx.blocking_send(reply).is_err() {
                    debug!(conn = ctx.id(), serial = header.serial, "reply dropped; connection closing");
                }
            }
        });
    }
}

/// Reads one whole frame, length prefix included.
///
/// Returns `Ok(None)` on a clean end of stream between frames. The length
/// prefix is validated before the body buffer is allocated.
async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }
    let body_len = frame_body_len(prefix).context("rejected frame length")?;
    let mut frame = vec![0u8; LEN_PREFIX_SIZE + body_len];
    frame[..LEN_PREFIX_SIZE].copy_from_slice(&prefix);
    reader
        .read_exact(&mut frame[LEN_PREFIX_SIZE..])
        .await
        .context("connection closed mid-frame")?;
    Ok(Some(frame))
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>, conn: u64)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(conn, "write failed: {e}");
            break;
        }
    }
}

// ── Keep-alive ────────────────────────────────────────────────────────────────

fn answer_keepalive(conn: u64, header: &MessageHeader, tx: &mpsc::Sender<Vec<u8>>) {
    match KeepaliveProcedure::try_from(header.procedure) {
        Ok(KeepaliveProcedure::Ping) => match encode_frame(&MessageHeader::keepalive(KeepaliveProcedure::Pong), &[]) {
            Ok(pong) => {
                if tx.try_send(pong).is_err() {
                    debug!(conn, "pong dropped; outbound queue full");
                }
            }
            Err(e) => error!(conn, "cannot encode pong: {e}"),
        },
        Ok(KeepaliveProcedure::Pong) => debug!(conn, "keepalive pong received"),
        Err(()) => debug!(conn, proc = header.procedure, "unknown keepalive procedure"),
    }
}

/// Ticks the keep-alive monitor. Returns once the peer is considered dead;
/// never returns when keep-alive is disabled.
async fn run_keepalive(ctx: Arc<ClientContext>, monitor: Arc<Mutex<KeepaliveMonitor>>, tx: mpsc::Sender<Vec<u8>>) {
    let period = monitor.lock().unwrap_or_else(PoisonError::into_inner).interval();
    let Some(period) = period else {
        return std::future::pending().await;
    };

    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let action = monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_tick(ctx.keepalive_supported());
        match action {
            KeepaliveAction::Idle => {}
            KeepaliveAction::SendPing => match encode_frame(&MessageHeader::keepalive(KeepaliveProcedure::Ping), &[]) {
                Ok(ping) => {
                    if tx.try_send(ping).is_err() {
                        debug!(conn = ctx.id(), "ping dropped; outbound queue full");
                    }
                }
                Err(e) => error!(conn = ctx.id(), "cannot encode ping: {e}"),
            },
            KeepaliveAction::Dead => return,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
