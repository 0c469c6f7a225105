//! Stream-socket plumbing shared by the daemon and the client: a unified
//! listener/stream pair over Unix-domain sockets and loopback TCP.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

#[cfg(unix)]
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{tcp, TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{unix, UnixListener, UnixStream};

/// The socket family the daemon serves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    /// A Unix-domain socket in the system temporary directory.
    Unix,
    /// TCP on the loopback interface.
    Inet,
}

impl Default for SocketFamily {
    fn default() -> Self {
        #[cfg(unix)]
        {
            SocketFamily::Unix
        }
        #[cfg(not(unix))]
        {
            SocketFamily::Inet
        }
    }
}

impl SocketFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketFamily::Unix => "unix",
            SocketFamily::Inet => "inet",
        }
    }
}

impl Display for SocketFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unknown socket family {0:?}, expected 'unix' or 'inet'")]
pub struct ParseSocketFamilyError(pub String);

impl FromStr for SocketFamily {
    type Err = ParseSocketFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(SocketFamily::Unix),
            "inet" => Ok(SocketFamily::Inet),
            other => Err(ParseSocketFamilyError(other.to_string())),
        }
    }
}

#[cfg(not(unix))]
fn unix_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix-domain sockets are not supported on this platform",
    )
}

/// A bound endpoint of either family. Unix listeners clean up their socket
/// file when dropped.
pub(crate) enum Listener {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Inet(TcpListener),
}

impl Listener {
    /// Binds a fresh endpoint and returns it with its dialable address.
    pub(crate) async fn bind(family: SocketFamily) -> io::Result<(Listener, String)> {
        match family {
            SocketFamily::Unix => {
                #[cfg(unix)]
                {
                    let path = std::env::temp_dir()
                        .join(format!("quarry-sync-{:08x}.socket", rand::random::<u32>()));
                    let listener = UnixListener::bind(&path)?;
                    let address = path.display().to_string();
                    Ok((Listener::Unix { listener, path }, address))
                }
                #[cfg(not(unix))]
                {
                    Err(unix_unsupported())
                }
            }
            SocketFamily::Inet => {
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let address = listener.local_addr()?.to_string();
                Ok((Listener::Inet(listener), address))
            }
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
            Listener::Inet(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Inet(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A connected stream of either family.
pub(crate) enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Inet(TcpStream),
}

impl Stream {
    pub(crate) async fn connect(family: SocketFamily, address: &str) -> io::Result<Stream> {
        match family {
            SocketFamily::Unix => {
                #[cfg(unix)]
                {
                    Ok(Stream::Unix(UnixStream::connect(address).await?))
                }
                #[cfg(not(unix))]
                {
                    let _ = address;
                    Err(unix_unsupported())
                }
            }
            SocketFamily::Inet => Ok(Stream::Inet(TcpStream::connect(address).await?)),
        }
    }

    /// Splits into owned halves; dropping the write half shuts down the
    /// sending direction, which is what signals a client disconnect to the
    /// daemon.
    pub(crate) fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        match self {
            #[cfg(unix)]
            Stream::Unix(stream) => {
                let (read, write) = stream.into_split();
                (OwnedReadHalf::Unix(read), OwnedWriteHalf::Unix(write))
            }
            Stream::Inet(stream) => {
                let (read, write) = stream.into_split();
                (OwnedReadHalf::Inet(read), OwnedWriteHalf::Inet(write))
            }
        }
    }
}

pub(crate) enum OwnedReadHalf {
    #[cfg(unix)]
    Unix(unix::OwnedReadHalf),
    Inet(tcp::OwnedReadHalf),
}

pub(crate) enum OwnedWriteHalf {
    #[cfg(unix)]
    Unix(unix::OwnedWriteHalf),
    Inet(tcp::OwnedWriteHalf),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Inet(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Inet(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Inet(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Inet(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for OwnedReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            OwnedReadHalf::Unix(half) => Pin::new(half).poll_read(cx, buf),
            OwnedReadHalf::Inet(half) => Pin::new(half).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OwnedWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            OwnedWriteHalf::Unix(half) => Pin::new(half).poll_write(cx, buf),
            OwnedWriteHalf::Inet(half) => Pin::new(half).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            OwnedWriteHalf::Unix(half) => Pin::new(half).poll_flush(cx),
            OwnedWriteHalf::Inet(half) => Pin::new(half).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            OwnedWriteHalf::Unix(half) => Pin::new(half).poll_shutdown(cx),
            OwnedWriteHalf::Inet(half) => Pin::new(half).poll_shutdown(cx),
        }
    }
}
