//! The lock daemon: one accept loop, one task per connection, and one
//! grant task per outstanding `ACQUIRE`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::net::{Listener, SocketFamily, Stream};
use crate::wire::{self, ProtocolError};

mod lock;

use lock::{ContextId, LockTable};

/// Daemon configuration, fed from the command line or environment by the
/// `quarry-syncd` binary and built directly by `no_fork` clients.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub family: SocketFamily,
    /// Grace period before the daemon shuts itself down once the last
    /// client is gone.
    pub idle_timeout: Duration,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            family: SocketFamily::default(),
            idle_timeout: Duration::from_secs(300),
            debug: false,
        }
    }
}

/// A lock-ownership scope created by one client connection.
struct ServerContext {
    id: ContextId,
    shared: bool,
    /// The connection that created the context; disconnect closes it.
    connection: u64,
    /// Keys this context holds or waits on.
    keys: Mutex<Vec<String>>,
}

struct ServerState {
    locks: LockTable,
    contexts: DashMap<ContextId, Arc<ServerContext>>,
    next_context: AtomicU32,
    connections: AtomicUsize,
    last_used: Mutex<Instant>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl ServerState {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn expired(&self) -> bool {
        self.connections.load(Ordering::SeqCst) == 0
            && self.last_used.lock().elapsed() >= self.idle_timeout
    }
}

/// A bound but not yet serving daemon. [`Server::serve`] runs until `STOP`,
/// idle expiry, or [`Server::shutdown_token`] cancellation, and returns
/// `Ok` on a graceful shutdown.
pub struct Server {
    listener: Listener,
    address: String,
    family: SocketFamily,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> std::io::Result<Server> {
        let (listener, address) = Listener::bind(config.family).await?;
        tracing::debug!("lock daemon bound to {}:{address}", config.family);
        Ok(Server {
            listener,
            address,
            family: config.family,
            state: Arc::new(ServerState {
                locks: LockTable::default(),
                contexts: DashMap::new(),
                next_context: AtomicU32::new(1),
                connections: AtomicUsize::new(0),
                last_used: Mutex::new(Instant::now()),
                idle_timeout: config.idle_timeout,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// The dialable address of the bound endpoint.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// A token that cancels the daemon from the outside, e.g. a signal
    /// handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Dials the spawning client's one-shot rendezvous endpoint and
    /// advertises the nonce and the final listening address.
    pub async fn handshake(&self, rendezvous: &str, nonce: &str) -> std::io::Result<()> {
        let mut stream = Stream::connect(self.family, rendezvous).await?;
        let io_error = |error: ProtocolError| match error {
            ProtocolError::Io(error) => error,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        };
        wire::write_string(&mut stream, nonce).await.map_err(io_error)?;
        wire::write_string(&mut stream, &self.address)
            .await
            .map_err(io_error)?;
        stream.flush().await
    }

    /// Runs the accept loop and the idle-expiry timer.
    pub async fn serve(self) -> std::io::Result<()> {
        let state = self.state;
        state.touch();

        // Poll for expiry often enough that short timeouts fire promptly.
        let poll = (state.idle_timeout / 4)
            .clamp(Duration::from_millis(50), Duration::from_secs(5));
        let mut connection_id: u64 = 0;

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => {
                    tracing::debug!("lock daemon stopping");
                    break;
                }
                _ = tokio::time::sleep(poll) => {
                    if state.expired() {
                        tracing::debug!("lock daemon idle for {:?}, shutting down", state.idle_timeout);
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(error) => {
                            tracing::warn!("failed to accept connection: {error}");
                            continue;
                        }
                    };
                    connection_id += 1;
                    state.touch();
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let connection = connection_id;
                        if let Err(error) = serve_connection(&state, stream, connection).await {
                            tracing::debug!("connection {connection} closed: {error}");
                        }
                        release_connection(&state, connection);
                        state.connections.fetch_sub(1, Ordering::SeqCst);
                        state.touch();
                    });
                }
            }
        }
        Ok(())
    }
}

type ConnectionWriter = Arc<tokio::sync::Mutex<BufWriter<WriteHalf<Stream>>>>;

/// Reads requests off one connection until it closes, the daemon stops, or
/// the peer violates the protocol.
async fn serve_connection(
    state: &Arc<ServerState>,
    stream: Stream,
    connection: u64,
) -> Result<(), ProtocolError> {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let writer: ConnectionWriter = Arc::new(tokio::sync::Mutex::new(BufWriter::new(writer)));

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => return Ok(()),
            frame = wire::read_frame(&mut reader) => frame?,
        };
        state.touch();

        let Some((command, args)) = frame.args.split_first() else {
            return Err(ProtocolError::UnknownCommand(String::new()));
        };
        match command.as_str() {
            wire::CMD_CONTEXT => {
                let shared = parse_bool(args.first())?;
                let id = state.next_context.fetch_add(1, Ordering::Relaxed);
                state.contexts.insert(
                    id,
                    Arc::new(ServerContext {
                        id,
                        shared,
                        connection,
                        keys: Mutex::new(Vec::new()),
                    }),
                );
                tracing::debug!("new {} context {id:08x}", if shared { "shared" } else { "exclusive" });
                let context_id = format!("{id:08x}");
                reply(&writer, frame.request_id, &[wire::CMD_CONTEXT, context_id.as_str()]).await?;
            }
            wire::CMD_ACQUIRE => {
                let context = resolve_context(state, args.first())?;
                acquire(state, &writer, frame.request_id, context, &args[1..]);
            }
            wire::CMD_CLOSE => {
                let context = resolve_context(state, args.first())?;
                close_context(state, &context);
                reply(&writer, frame.request_id, &[wire::CMD_CLOSE]).await?;
            }
            wire::CMD_STOP => {
                reply(&writer, frame.request_id, &[wire::CMD_STOP]).await?;
                state.shutdown.cancel();
                return Ok(());
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn parse_bool(arg: Option<&String>) -> Result<bool, ProtocolError> {
    match arg.map(String::as_str) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(ProtocolError::InvalidArgument(
            other.unwrap_or_default().to_string(),
            "shared flag",
        )),
    }
}

fn resolve_context(
    state: &ServerState,
    arg: Option<&String>,
) -> Result<Arc<ServerContext>, ProtocolError> {
    let raw = arg.map(String::as_str).unwrap_or_default();
    u32::from_str_radix(raw, 16)
        .ok()
        .and_then(|id| state.contexts.get(&id).map(|entry| Arc::clone(entry.value())))
        .ok_or_else(|| ProtocolError::InvalidArgument(raw.to_string(), "context id"))
}

/// Enqueues the keys synchronously, so queue positions follow request
/// order, then finishes the wait and the reply on a separate task.
fn acquire(
    state: &Arc<ServerState>,
    writer: &ConnectionWriter,
    request_id: u32,
    context: Arc<ServerContext>,
    keys: &[String],
) {
    let mut pending = Vec::with_capacity(keys.len());
    {
        let mut owned = context.keys.lock();
        for key in keys {
            let granted = state.locks.lock(key, context.id, context.shared);
            owned.push(key.clone());
            pending.push(granted);
        }
    }

    let state = Arc::clone(state);
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        for granted in pending.into_iter().flatten() {
            if granted.await.is_err() {
                // the wait was cancelled by CLOSE or disconnect; the
                // reply is dropped with it
                return;
            }
        }
        if !state.contexts.contains_key(&context.id) {
            return;
        }
        state.touch();
        if let Err(error) = reply(&writer, request_id, &[wire::CMD_ACQUIRE]).await {
            tracing::debug!("failed to deliver grant to context {:08x}: {error}", context.id);
            // kick the read loop so the implicit CLOSE runs
            let _ = writer.lock().await.shutdown().await;
        }
    });
}

/// Releases everything a context holds or waits on, then forgets it.
fn close_context(state: &ServerState, context: &ServerContext) {
    state.contexts.remove(&context.id);
    let keys = std::mem::take(&mut *context.keys.lock());
    for key in &keys {
        state.locks.unlock(key, context.id);
    }
    if !keys.is_empty() {
        tracing::debug!("context {:08x} released {} keys", context.id, keys.len());
    }
}

/// Implicit close of every context the connection created.
fn release_connection(state: &ServerState, connection: u64) {
    let stale: Vec<Arc<ServerContext>> = state
        .contexts
        .iter()
        .filter(|entry| entry.value().connection == connection)
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    for context in stale {
        close_context(state, &context);
    }
}

async fn reply(
    writer: &ConnectionWriter,
    request_id: u32,
    args: &[&str],
) -> Result<(), ProtocolError> {
    let mut writer = writer.lock().await;
    wire::write_frame(&mut *writer, request_id, args).await
}
