//! Peer wire format — framed chat payloads on the TCP links between clients.
//!
//! Every payload is preceded by a 5-byte zero-padded decimal length:
//!
//! ```text
//! [ 5 ASCII bytes: payload length, e.g. "00042" ]
//! [ N bytes: bincode-encoded NetworkMsg ]
//! ```
//!
//! There is no unframed special case. The first frame on a fresh connection
//! (the hello) uses the same layout as every later one.

use bincode::{Decode, Encode};
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded payload size in bytes. Oversize payloads are dropped by
/// the sender without tearing the connection down.
pub const MAX_PAYLOAD: usize = 65_535;

/// Length header size. Five decimal digits cover MAX_PAYLOAD.
const SIZE_HEADER_LEN: usize = 5;

/// TCP connect timeout for outbound peer dials, in seconds.
pub const DIAL_TIMEOUT_SECS: u64 = 4;

/// Deadline for the first frame on an accepted socket, in seconds.
/// Later frames have no deadline.
pub const HELLO_TIMEOUT_SECS: u64 = 5;

/// Capacity of a peer connection's outbound queue. A full queue blocks the
/// submitter until the writer drains.
pub const SEND_QUEUE_CAPACITY: usize = 5;

/// The chat payload both peers agree on. The receiver trusts only
/// `chat_id`/`user_id` for routing; display names are resolved locally.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct NetworkMsg {
    pub user_id: String,
    pub chat_id: String,
    pub message: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub at_millis: i64,
}

impl NetworkMsg {
    pub fn new(user_id: String, chat_id: String, message: String, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            chat_id,
            message,
            at_millis: at.timestamp_millis(),
        }
    }

    /// The timestamp carried on the wire. Out-of-range values clamp to the
    /// epoch rather than failing the frame.
    pub fn at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.at_millis)
            .single()
            .unwrap_or_default()
    }
}

/// Errors from interpreting wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("invalid content: size unparseable")]
    SizeUnparseable,

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),

    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode a message into a complete frame, header included.
pub fn encode_frame(msg: &NetworkMsg) -> Result<Vec<u8>, WireError> {
    let payload = bincode::encode_to_vec(msg, bincode::config::standard())?;
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut frame = format!("{:05}", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one framed message to the stream.
pub async fn write_message<W>(writer: &mut W, msg: &NetworkMsg) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one framed message from the stream.
///
/// Reads exactly five header bytes, parses them as decimal, then reads
/// exactly that many payload bytes and decodes. Any short read surfaces as
/// [`WireError::UnexpectedEof`]; a non-decimal header as
/// [`WireError::SizeUnparseable`]; decode failures verbatim.
pub async fn read_message<R>(reader: &mut R) -> Result<NetworkMsg, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; SIZE_HEADER_LEN];
    read_full(reader, &mut size_buf).await?;

    let size: usize = std::str::from_utf8(&size_buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::SizeUnparseable)?;

    let mut payload = vec![0u8; size];
    read_full(reader, &mut payload).await?;

    let (msg, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
    Ok(msg)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
        Err(e) => Err(WireError::Io(e)),
    }
}
