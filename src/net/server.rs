//! Staged server: an acceptor, one I/O task per connection, a pool of
//! command workers fed through a channel, and the periodic maintenance
//! tasks (expiration sweep, stats line, memory check).
//!
//! A connection task never reads the next frame before the reply to the
//! previous one has been written, so responses on a connection are delivered
//! in request order. Across connections there is no ordering.

use super::cluster::Cluster;
use super::codec::{self, ProtocolError};
use super::handlers::{self, Outcome};
use super::message::{Request, Response};
use super::session::{Session, SessionTable};
use crate::config::{Config, Mode};
use crate::stats::{process_rss_kb, ServerStats};
use crate::store::Keyspace;
use crate::types::{now, DEFAULT_DB};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command worker pool size.
const COMMAND_WORKERS: usize = 4;

/// Depth of the channel between the I/O and command stages.
const COMMAND_QUEUE_DEPTH: usize = 1024;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("cluster: {0}")]
    Cluster(#[from] super::cluster::ClusterError),
}

/// Everything guarded by the store lock: the keyspace (all databases plus
/// the expiration index) and the session table.
#[derive(Default)]
pub struct State {
    pub keyspace: Keyspace,
    pub sessions: SessionTable,
}

/// Shared server context, one per process, passed into every task.
pub struct ServerContext {
    pub config: Config,
    /// The store lock.
    pub state: Mutex<State>,
    pub stats: ServerStats,
    pub cluster: Option<Arc<Cluster>>,
}

/// Baton carrying a decoded request from a connection task to a command
/// worker, and the encoded reply back.
struct IoEvent {
    session_id: u128,
    request: Request,
    reply: oneshot::Sender<CommandReply>,
}

struct CommandReply {
    /// Encoded response frame; empty means "write nothing".
    bytes: Vec<u8>,
    /// Tear the connection down after this command.
    close: bool,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A running server and its background tasks.
pub struct Server {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
}

impl Server {
    /// Bind sockets, spawn every stage, and return the running server.
    /// `seed` announces this node to an existing cluster member on startup.
    pub async fn start(config: Config, seed: Option<(String, u16)>) -> Result<Self, ServerError> {
        let (listener, local_addr, unix_path) = bind_listener(&config)?;

        let cluster = match config.mode {
            Mode::Cluster => {
                // Port 0 binds resolve to an ephemeral port; announce that one.
                let port = local_addr.map_or(config.ip_port, |a| a.port());
                Some(Arc::new(Cluster::bind(&config.ip_address, port).await?))
            }
            Mode::Standalone => None,
        };

        let ctx = Arc::new(ServerContext {
            config,
            state: Mutex::new(State::default()),
            stats: ServerStats::new(),
            cluster: cluster.clone(),
        });
        ctx.state.lock().await.keyspace.ensure_db(DEFAULT_DB);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel::<IoEvent>(COMMAND_QUEUE_DEPTH);
        let cmd_rx = Arc::new(Mutex::new(cmd_rx));

        let mut tasks = Vec::new();
        for _ in 0..COMMAND_WORKERS {
            tasks.push(tokio::spawn(command_worker(
                ctx.clone(),
                cmd_rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweeper(ctx.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(stats_reporter(ctx.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(memory_watcher(ctx.clone(), shutdown_rx.clone())));

        if let Some(cluster) = &cluster {
            let cluster_run = cluster.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { cluster_run.run(shutdown).await }));

            if let Some((host, port)) = seed {
                if let Err(e) = cluster.announce(&host, port).await {
                    warn!("cluster announce to {}:{} failed: {}", host, port, e);
                }
            }
        }

        tasks.push(tokio::spawn(accept_loop(
            ctx.clone(),
            listener,
            cmd_tx,
            shutdown_rx,
        )));

        match (&local_addr, &unix_path) {
            (Some(addr), _) => info!("listening on {}", addr),
            (None, Some(path)) => info!("listening on unix socket {}", path.display()),
            _ => {}
        }

        Ok(Self {
            shutdown_tx,
            tasks,
            local_addr,
            unix_path,
        })
    }

    /// Bound TCP address, when listening on TCP. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal every loop, join the background tasks, clean up.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(path) = &self.unix_path {
            std::fs::remove_file(path).ok();
        }
        info!("shutdown complete");
    }
}

fn bind_listener(
    config: &Config,
) -> Result<(Listener, Option<SocketAddr>, Option<PathBuf>), ServerError> {
    if let Some(path) = &config.unix_socket {
        // A previous unclean exit can leave the socket file behind.
        std::fs::remove_file(path).ok();
        let listener = std::os::unix::net::UnixListener::bind(path).map_err(|source| {
            ServerError::Bind {
                addr: path.display().to_string(),
                source,
            }
        })?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        return Ok((Listener::Unix(listener), None, Some(path.clone())));
    }

    let addr = format!("{}:{}", config.ip_address, config.ip_port);
    let listener =
        std::net::TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    // Re-listen with the configured backlog, clamped to the system maximum.
    let backlog = config.tcp_backlog.clamp(1, somaxconn());
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(ServerError::Io(io::Error::last_os_error()));
    }
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let listener = TcpListener::from_std(listener)?;
    Ok((Listener::Tcp(listener), Some(local_addr), None))
}

fn somaxconn() -> i32 {
    std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(128)
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    listener: Listener,
    cmd_tx: mpsc::Sender<IoEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Connection tasks get their own shutdown receiver.
    let client_shutdown = shutdown.clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = async {
                match &listener {
                    Listener::Tcp(l) => l.accept().await.map(|(stream, addr)| {
                        stream.set_nodelay(true).ok();
                        spawn_client(
                            ctx.clone(),
                            stream,
                            addr.to_string(),
                            cmd_tx.clone(),
                            client_shutdown.clone(),
                        );
                    }),
                    Listener::Unix(l) => l.accept().await.map(|(stream, _)| {
                        spawn_client(
                            ctx.clone(),
                            stream,
                            "unix".to_string(),
                            cmd_tx.clone(),
                            client_shutdown.clone(),
                        );
                    }),
                }
            } => accepted,
        };
        if let Err(e) = accepted {
            warn!("accept failed: {}", e);
        }
    }
    debug!("accept loop exited");
}

fn spawn_client<S>(
    ctx: Arc<ServerContext>,
    stream: S,
    addr: String,
    cmd_tx: mpsc::Sender<IoEvent>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let session_id: u128 = rand::random();
        ctx.state
            .lock()
            .await
            .sessions
            .insert(Session::new(session_id, addr.clone()));
        ctx.stats.on_connect();
        debug!("client connected from {}", addr);

        serve_client(&ctx, stream, session_id, cmd_tx, shutdown).await;

        ctx.state.lock().await.sessions.remove(session_id);
        ctx.stats.on_disconnect();
        debug!("client {} disconnected", addr);
    });
}

/// The I/O stage of one connection: read a frame, hand it to a command
/// worker, write the reply, repeat. Reading the next frame only after the
/// reply is out is what gives per-connection FIFO ordering.
async fn serve_client<S>(
    ctx: &ServerContext,
    mut stream: S,
    session_id: u128,
    cmd_tx: mpsc::Sender<IoEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max_body = ctx.config.max_request_size;
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = codec::read_frame(&mut stream, max_body) => frame,
        };
        let (header, body) = match frame {
            Ok(frame) => frame,
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!("dropping client on protocol error: {}", e);
                break;
            }
        };
        if !header.request {
            debug!("dropping client: response frame on request path");
            break;
        }
        ctx.stats
            .on_request(1 + codec::length_size(body.len()) + body.len());

        let request = match Request::decode(header, &body) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping client on bad request body: {}", e);
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx
            .send(IoEvent {
                session_id,
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let reply = tokio::select! {
            _ = shutdown.changed() => break,
            reply = reply_rx => match reply {
                Ok(reply) => reply,
                Err(_) => break,
            },
        };

        if !reply.bytes.is_empty() {
            if stream.write_all(&reply.bytes).await.is_err() {
                break;
            }
            ctx.stats.on_response(reply.bytes.len());
        }
        if reply.close {
            break;
        }
    }
}

/// Command stage: pull IO events off the shared channel, run the handler
/// under the store lock, send the encoded reply back.
async fn command_worker(
    ctx: Arc<ServerContext>,
    cmd_rx: Arc<Mutex<mpsc::Receiver<IoEvent>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = {
            let mut rx = cmd_rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => event,
            }
        };
        let Some(event) = event else { break };

        let reply = match handlers::dispatch(&ctx, event.session_id, event.request).await {
            Outcome::Reply(response) => match response.encode(false) {
                Ok(bytes) => CommandReply {
                    bytes,
                    close: false,
                },
                Err(e) => {
                    warn!("response encode failed: {}", e);
                    CommandReply {
                        bytes: Response::nok().encode(false).unwrap_or_default(),
                        close: false,
                    }
                }
            },
            Outcome::Drop => CommandReply {
                bytes: Vec::new(),
                close: true,
            },
        };
        // The connection may be gone already; nothing to do then.
        let _ = event.reply.send(reply);
    }
    debug!("command worker exited");
}

/// Periodic expiration sweep, on its own timer, under the store lock.
async fn sweeper(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(ctx.config.sweep_time_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let swept = ctx.state.lock().await.keyspace.sweep(now());
                if swept > 0 {
                    ctx.stats.on_expired(swept);
                    debug!("sweep evicted {} keys", swept);
                }
            }
        }
    }
    debug!("sweeper exited");
}

async fn stats_reporter(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.stats_time_secs.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let keys = ctx.state.lock().await.keyspace.total_keys();
                info!("{}", ctx.stats.summary(keys));
            }
        }
    }
}

/// Advisory memory cap: warn when RSS exceeds `max_memory`.
async fn memory_watcher(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.mem_reclaim_time.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let rss_bytes = process_rss_kb() * 1024;
                if rss_bytes > ctx.config.max_memory {
                    warn!(
                        "rss {} bytes exceeds max_memory {} bytes",
                        rss_bytes, ctx.config.max_memory
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::Opcode;
    use crate::net::message::Tuple;
    use crate::types::NO_TTL;

    fn test_context() -> ServerContext {
        ServerContext {
            config: Config::default(),
            state: Mutex::new(State::default()),
            stats: ServerStats::new(),
            cluster: None,
        }
    }

    async fn with_session(ctx: &ServerContext) -> u128 {
        let id = 42u128;
        let mut state = ctx.state.lock().await;
        state.keyspace.ensure_db(DEFAULT_DB);
        state
            .sessions
            .insert(Session::new(id, "test".to_string()));
        id
    }

    async fn run(ctx: &ServerContext, id: u128, request: Request) -> Response {
        match handlers::dispatch(ctx, id, request).await {
            Outcome::Reply(response) => response,
            Outcome::Drop => panic!("unexpected drop"),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let ctx = test_context();
        let id = with_session(&ctx).await;

        let put = run(
            &ctx,
            id,
            Request::Put {
                prefix: false,
                ttl: 0,
                key: b"foo".to_vec(),
                value: b"bar".to_vec(),
            },
        )
        .await;
        assert!(put.is_ok());

        let get = run(
            &ctx,
            id,
            Request::Get {
                prefix: false,
                key: b"foo".to_vec(),
            },
        )
        .await;
        // Wire ttl 0 stores as "no expiration".
        assert_eq!(
            get,
            Response::Single {
                opcode: Opcode::Get,
                tuple: Tuple {
                    ttl: NO_TTL,
                    key: b"foo".to_vec(),
                    value: b"bar".to_vec(),
                },
            }
        );
    }

    #[tokio::test]
    async fn test_get_missing_is_nok() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        let get = run(
            &ctx,
            id,
            Request::Get {
                prefix: false,
                key: b"ghost".to_vec(),
            },
        )
        .await;
        assert_eq!(get, Response::nok());
    }

    #[tokio::test]
    async fn test_prefix_count_and_delete() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        for (key, value) in [(&b"alpha"[..], &b"1"[..]), (b"alphax", b"2")] {
            run(
                &ctx,
                id,
                Request::Put {
                    prefix: false,
                    ttl: 0,
                    key: key.to_vec(),
                    value: value.to_vec(),
                },
            )
            .await;
        }

        let count = run(
            &ctx,
            id,
            Request::Count {
                prefix: true,
                key: b"alpha".to_vec(),
            },
        )
        .await;
        assert_eq!(count, Response::Count(2));

        let del = run(
            &ctx,
            id,
            Request::Del {
                prefix: true,
                key: b"alpha".to_vec(),
            },
        )
        .await;
        assert!(del.is_ok());

        let count = run(
            &ctx,
            id,
            Request::Count {
                prefix: true,
                key: b"alpha".to_vec(),
            },
        )
        .await;
        assert_eq!(count, Response::Count(0));
    }

    #[tokio::test]
    async fn test_inc_non_numeric_is_nok() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        run(
            &ctx,
            id,
            Request::Put {
                prefix: false,
                ttl: 0,
                key: b"n".to_vec(),
                value: b"abc".to_vec(),
            },
        )
        .await;

        let inc = run(
            &ctx,
            id,
            Request::Inc {
                prefix: false,
                key: b"n".to_vec(),
            },
        )
        .await;
        assert_eq!(inc, Response::nok());

        let get = run(
            &ctx,
            id,
            Request::Get {
                prefix: false,
                key: b"n".to_vec(),
            },
        )
        .await;
        match get {
            Response::Single { tuple, .. } => assert_eq!(tuple.value, b"abc"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_use_switches_database() {
        let ctx = test_context();
        let id = with_session(&ctx).await;

        assert!(run(
            &ctx,
            id,
            Request::Use {
                name: b"scratch".to_vec()
            }
        )
        .await
        .is_ok());
        run(
            &ctx,
            id,
            Request::Put {
                prefix: false,
                ttl: 0,
                key: b"x".to_vec(),
                value: b"1".to_vec(),
            },
        )
        .await;

        assert!(run(
            &ctx,
            id,
            Request::Use {
                name: b"db0".to_vec()
            }
        )
        .await
        .is_ok());
        assert_eq!(
            run(
                &ctx,
                id,
                Request::Get {
                    prefix: false,
                    key: b"x".to_vec()
                }
            )
            .await,
            Response::nok()
        );

        let db = run(&ctx, id, Request::DbName).await;
        match db {
            Response::Single { opcode, tuple } => {
                assert_eq!(opcode, Opcode::Db);
                assert_eq!(tuple.key, b"db0");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quit_drops_client() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        assert!(matches!(
            handlers::dispatch(&ctx, id, Request::Quit).await,
            Outcome::Drop
        ));
    }

    #[tokio::test]
    async fn test_info_reports_keys() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        run(
            &ctx,
            id,
            Request::Put {
                prefix: false,
                ttl: 0,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
        )
        .await;

        let info = run(&ctx, id, Request::Info).await;
        match info {
            Response::Single { opcode, tuple } => {
                assert_eq!(opcode, Opcode::Info);
                let text = String::from_utf8(tuple.value).unwrap();
                assert!(text.contains("keys:1"));
                assert!(text.contains("uptime_secs:"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_without_cluster_is_nok() {
        let ctx = test_context();
        let id = with_session(&ctx).await;
        assert_eq!(
            run(
                &ctx,
                id,
                Request::Join {
                    addr: b"1.2.3.4:5".to_vec()
                }
            )
            .await,
            Response::nok()
        );
    }
}
