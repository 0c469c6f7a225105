//! The client side of the lock daemon: one multiplexed connection, a
//! context per lock-ownership scope, and optional auto-spawn of the
//! daemon process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{BufReader, BufWriter};
use tokio::sync::oneshot;

use crate::net::{Listener, OwnedReadHalf, OwnedWriteHalf, SocketFamily, Stream};
use crate::server::{Server, ServerConfig};
use crate::wire::{self, ProtocolError};

/// How long the spawning client waits for the daemon to dial back.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side failures. Neither variant is retryable at this layer:
/// protocol violations indicate mismatched implementations, and an
/// unavailable daemon after auto-spawn already exhausted the one recovery
/// path there is.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("lock daemon protocol violation")]
    IpcProtocol(#[from] ProtocolError),
    #[error("lock daemon unavailable: {reason}")]
    IpcUnavailable {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl SyncError {
    fn unavailable(reason: impl Into<String>, source: Option<std::io::Error>) -> Self {
        SyncError::IpcUnavailable {
            reason: reason.into(),
            source,
        }
    }
}

fn connection_lost() -> SyncError {
    SyncError::unavailable("connection to the lock daemon was lost", None)
}

/// Configuration of [`SyncClient::connect`].
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    pub family: SocketFamily,
    /// Dial this address instead of spawning a daemon.
    pub address: Option<String>,
    /// Run the daemon in-process instead of spawning one; for tests.
    pub no_fork: bool,
    /// Idle timeout handed to a spawned or in-process daemon.
    pub idle_timeout: Duration,
    pub debug: bool,
    /// The daemon executable; defaults to the `QUARRY_SYNCD` environment
    /// variable or `quarry-syncd` on the search path.
    pub daemon_program: Option<PathBuf>,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            family: SocketFamily::default(),
            address: None,
            no_fork: false,
            idle_timeout: Duration::from_secs(300),
            debug: false,
            daemon_program: None,
        }
    }
}

impl SyncClientConfig {
    /// Reads the documented `QUARRY_SYNC_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(family) = std::env::var("QUARRY_SYNC_FAMILY") {
            match family.parse() {
                Ok(family) => config.family = family,
                Err(error) => tracing::warn!("{error}"),
            }
        }
        if let Ok(timeout) = std::env::var("QUARRY_SYNC_IDLE_TIMEOUT") {
            match parse_idle_timeout(&timeout) {
                Ok(timeout) => config.idle_timeout = timeout,
                Err(error) => tracing::warn!("{error}"),
            }
        }
        config.no_fork = std::env::var("QUARRY_SYNC_NO_FORK").is_ok_and(|v| v == "true");
        config.debug = std::env::var("QUARRY_SYNC_DEBUG").is_ok_and(|v| v == "true");
        config.daemon_program = std::env::var_os("QUARRY_SYNCD").map(PathBuf::from);
        config
    }
}

/// Parses an idle timeout: bare digits or a trailing `s` mean seconds, a
/// trailing `ms` means milliseconds.
pub fn parse_idle_timeout(value: &str) -> Result<Duration, String> {
    let (digits, unit): (&str, fn(u64) -> Duration) = match value.strip_suffix("ms") {
        Some(digits) => (digits, Duration::from_millis),
        None => (value.strip_suffix('s').unwrap_or(value), Duration::from_secs),
    };
    digits
        .trim()
        .parse()
        .map(unit)
        .map_err(|_| format!("invalid idle timeout {value:?}, expected seconds or `<n>ms`"))
}

struct ClientInner {
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    pending: Arc<DashMap<u32, oneshot::Sender<Vec<String>>>>,
    next_request: AtomicU32,
}

impl ClientInner {
    async fn request(&self, args: Vec<String>) -> Result<Vec<String>, SyncError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (sender, response) = oneshot::channel();
        self.pending.insert(request_id, sender);

        {
            let mut writer = self.writer.lock().await;
            if let Err(error) = wire::write_frame(&mut *writer, request_id, &args).await {
                self.pending.remove(&request_id);
                return Err(match error {
                    ProtocolError::Io(error) => SyncError::unavailable(
                        "failed to send request to the lock daemon",
                        Some(error),
                    ),
                    other => other.into(),
                });
            }
        }

        response.await.map_err(|_| connection_lost())
    }

    /// Sends a request and checks that the response echoes `command` as its
    /// only argument.
    async fn request_ack(&self, command: &'static str, args: Vec<String>) -> Result<(), SyncError> {
        let response = self.request(args).await?;
        match response.as_slice() {
            [echoed] if echoed == command => Ok(()),
            _ => Err(ProtocolError::UnexpectedResponse(response.join(" ")).into()),
        }
    }
}

/// One connection to the lock daemon. Cloning is cheap and all clones
/// multiplex the same connection; dropping the last clone (and every
/// [`SyncContext`] created from it) disconnects, which the daemon treats
/// as an implicit close of all owned contexts.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Connects to the daemon, spawning one first if needed.
    pub async fn connect(config: SyncClientConfig) -> Result<SyncClient, SyncError> {
        if let Some(address) = &config.address {
            let stream = Stream::connect(config.family, address).await.map_err(|e| {
                SyncError::unavailable(format!("failed to dial lock daemon at {address}"), Some(e))
            })?;
            return Ok(Self::from_stream(stream));
        }

        if config.no_fork {
            let server = Server::bind(ServerConfig {
                family: config.family,
                idle_timeout: config.idle_timeout,
                debug: config.debug,
            })
            .await
            .map_err(|e| SyncError::unavailable("failed to start in-process lock daemon", Some(e)))?;
            let address = server.address().to_string();
            tokio::spawn(server.serve());
            let stream = Stream::connect(config.family, &address).await.map_err(|e| {
                SyncError::unavailable("failed to dial in-process lock daemon", Some(e))
            })?;
            return Ok(Self::from_stream(stream));
        }

        Self::spawn_and_connect(&config).await
    }

    /// Binds a one-shot rendezvous endpoint, spawns the daemon with the
    /// rendezvous address and a nonce, and dials the address the daemon
    /// advertises back.
    async fn spawn_and_connect(config: &SyncClientConfig) -> Result<SyncClient, SyncError> {
        let (rendezvous, rendezvous_address) = Listener::bind(config.family).await.map_err(|e| {
            SyncError::unavailable("failed to bind handshake endpoint", Some(e))
        })?;
        let nonce = format!("{:016x}", rand::random::<u64>());

        let program = config
            .daemon_program
            .clone()
            .or_else(|| std::env::var_os("QUARRY_SYNCD").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("quarry-syncd"));
        let mut command = std::process::Command::new(&program);
        command
            .arg(config.family.as_str())
            .arg(&rendezvous_address)
            .arg(&nonce)
            .arg("--idle-timeout")
            .arg(format!("{}ms", config.idle_timeout.as_millis()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if config.debug {
            command.arg("--debug");
        }
        command.spawn().map_err(|e| {
            SyncError::unavailable(
                format!("failed to spawn lock daemon {}", program.display()),
                Some(e),
            )
        })?;
        tracing::debug!("spawned lock daemon {}", program.display());

        let mut handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, rendezvous.accept())
            .await
            .map_err(|_| SyncError::unavailable("lock daemon did not dial back in time", None))?
            .map_err(|e| SyncError::unavailable("handshake with lock daemon failed", Some(e)))?;

        let advertised_nonce = wire::read_string(&mut handshake).await?;
        let address = wire::read_string(&mut handshake).await?;
        if advertised_nonce != nonce {
            return Err(ProtocolError::NonceMismatch.into());
        }

        let stream = Stream::connect(config.family, &address).await.map_err(|e| {
            SyncError::unavailable(
                format!("failed to dial spawned lock daemon at {address}"),
                Some(e),
            )
        })?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: Stream) -> SyncClient {
        let (reader, writer) = stream.into_split();
        let pending: Arc<DashMap<u32, oneshot::Sender<Vec<String>>>> = Arc::new(DashMap::new());
        tokio::spawn(read_responses(reader, Arc::clone(&pending)));
        SyncClient {
            inner: Arc::new(ClientInner {
                writer: tokio::sync::Mutex::new(BufWriter::new(writer)),
                pending,
                next_request: AtomicU32::new(0),
            }),
        }
    }

    /// Opens a lock-ownership scope on the daemon.
    pub async fn new_context(&self, shared: bool) -> Result<SyncContext, SyncError> {
        let response = self
            .inner
            .request(vec![wire::CMD_CONTEXT.to_string(), shared.to_string()])
            .await?;
        match response.as_slice() {
            [command, id] if command == wire::CMD_CONTEXT => Ok(SyncContext {
                inner: Arc::clone(&self.inner),
                id: id.clone(),
            }),
            _ => Err(ProtocolError::UnexpectedResponse(response.join(" ")).into()),
        }
    }

    /// Asks the daemon to shut down.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.inner
            .request_ack(wire::CMD_STOP, vec![wire::CMD_STOP.to_string()])
            .await
    }
}

/// One lock-ownership scope. All keys acquired through a context are
/// released together when it closes.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ClientInner>,
    id: String,
}

impl SyncContext {
    /// The daemon-assigned context id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocks until every key is granted. The key set is sorted and
    /// deduplicated before it is sent, which keeps concurrent
    /// multi-key acquisitions across processes deadlock-free. Re-acquiring
    /// a key this context already holds is a caller bug the daemon does
    /// not detect.
    pub async fn acquire<I, S>(&self, keys: I) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sorted: Vec<String> = keys.into_iter().map(Into::into).collect();
        sorted.sort();
        sorted.dedup();

        let mut args = Vec::with_capacity(sorted.len() + 2);
        args.push(wire::CMD_ACQUIRE.to_string());
        args.push(self.id.clone());
        args.extend(sorted);
        self.inner.request_ack(wire::CMD_ACQUIRE, args).await
    }

    /// Releases every key this context holds or waits on. Pending
    /// [`SyncContext::acquire`] calls on clones of this context are
    /// cancelled without a response.
    pub async fn close(self) -> Result<(), SyncError> {
        self.inner
            .request_ack(
                wire::CMD_CLOSE,
                vec![wire::CMD_CLOSE.to_string(), self.id.clone()],
            )
            .await
    }
}

async fn read_responses(
    reader: OwnedReadHalf,
    pending: Arc<DashMap<u32, oneshot::Sender<Vec<String>>>>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        match wire::read_frame(&mut reader).await {
            Ok(frame) => {
                if let Some((_, sender)) = pending.remove(&frame.request_id) {
                    let _ = sender.send(frame.args);
                } else {
                    tracing::debug!("response for unknown request {}", frame.request_id);
                }
            }
            Err(error) => {
                tracing::debug!("lock daemon connection closed: {error}");
                // fail everything still in flight
                pending.clear();
                return;
            }
        }
    }
}
