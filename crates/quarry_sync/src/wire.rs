//! The framed wire protocol between daemon and client.
//!
//! Each frame is a 32-bit big-endian request id, a 32-bit big-endian
//! argument count, then that many UTF-8 strings prefixed by a 16-bit
//! big-endian byte length. The first argument of a request is a command;
//! responses echo the request id of the request they answer.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CMD_CONTEXT: &str = "CONTEXT";
pub(crate) const CMD_ACQUIRE: &str = "ACQUIRE";
pub(crate) const CMD_CLOSE: &str = "CLOSE";
pub(crate) const CMD_STOP: &str = "STOP";

/// Upper bound on arguments per frame; a key set never comes close, so
/// anything above it is a corrupt or hostile frame.
pub(crate) const MAX_ARGS: u32 = 1024;

/// A violation of the wire protocol. The daemon answers any of these by
/// closing the offending connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame declares {0} arguments, limit is {MAX_ARGS}")]
    TooManyArguments(u32),
    #[error("argument is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("argument of {0} bytes exceeds the 16-bit length prefix")]
    ArgumentTooLong(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed argument {0:?} for {1}")]
    InvalidArgument(String, &'static str),
    #[error("unexpected response {0:?}")]
    UnexpectedResponse(String),
    #[error("handshake nonce mismatch")]
    NonceMismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub request_id: u32,
    pub args: Vec<String>,
}

pub(crate) async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u16().await? as usize;
    let mut bytes = vec![0; length];
    reader.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}

pub(crate) async fn write_string<W>(writer: &mut W, value: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let length =
        u16::try_from(value.len()).map_err(|_| ProtocolError::ArgumentTooLong(value.len()))?;
    writer.write_u16(length).await?;
    writer.write_all(value.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let request_id = reader.read_u32().await?;
    let count = reader.read_u32().await?;
    if count > MAX_ARGS {
        return Err(ProtocolError::TooManyArguments(count));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(read_string(reader).await?);
    }
    Ok(Frame { request_id, args })
}

pub(crate) async fn write_frame<W, S>(
    writer: &mut W,
    request_id: u32,
    args: &[S],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    writer.write_u32(request_id).await?;
    writer.write_u32(args.len() as u32).await?;
    for arg in args {
        write_string(writer, arg.as_ref()).await?;
    }
    writer.flush().await?;
    Ok(())
}
