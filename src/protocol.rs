//! Phone ↔ relay wire protocol.
//!
//! Every message on a client connection is a length-prefixed frame:
//! `[1-byte type][4-byte big-endian length][payload]`. The codec never
//! interprets payloads; framing and the type byte are the whole contract.
//!
//! Wire values are fixed for interoperability with deployed clients.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client opens the session: `[2B version BE][1B peer-ID len][peer ID][optional 32B cert hash]`.
pub const FRAME_HELLO: u8 = 0x01;
/// Relay answers HELLO: `[32B nonce][1B difficulty]`.
pub const FRAME_CHALLENGE: u8 = 0x02;
/// Client answers CHALLENGE: `[8B BE solution]`.
pub const FRAME_SOLUTION: u8 = 0x03;
/// Handshake succeeded; empty payload.
pub const FRAME_ACCEPT: u8 = 0x04;
/// Handshake failed; payload is a UTF-8 reason.
pub const FRAME_REJECT: u8 = 0x05;
/// Opaque application packet, either direction.
pub const FRAME_DATA: u8 = 0x10;
/// Client keepalive probe; empty payload.
pub const FRAME_PING: u8 = 0x20;
/// Relay keepalive answer; empty payload.
pub const FRAME_PONG: u8 = 0x21;

/// Handshake protocol version expected in HELLO.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the frame header: type(1) + length(4).
pub const FRAME_HEADER_SIZE: usize = 5;

/// One decoded frame. The type byte is kept raw so unknown types can be
/// logged and skipped instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Frame with an empty payload (ACCEPT, PING, PONG).
    pub fn empty(frame_type: u8) -> Self {
        Self { frame_type, payload: Vec::new() }
    }
}

/// Frame decode failures.
#[derive(Debug)]
pub enum FrameError {
    /// Underlying stream error (includes EOF and read timeouts).
    Io(io::Error),
    /// Declared payload length exceeds the configured maximum.
    Oversized { length: u32, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(err) => write!(f, "read frame: {err}"),
            FrameError::Oversized { length, max } => {
                write!(f, "frame too large: {length} > {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(err) => Some(err),
            FrameError::Oversized { .. } => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Read one complete frame: the 5-byte header, then exactly `length`
/// payload bytes. A declared length above `max_payload` is a protocol
/// violation and fails the read before any payload allocation.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let frame_type = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    if length as usize > max_payload {
        return Err(FrameError::Oversized { length, max: max_payload });
    }

    let mut payload = vec![0u8; length as usize];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Frame { frame_type, payload })
}

/// Write a complete frame with a single `write_all` so that it lands in one
/// TLS record where possible.
pub async fn write_frame<W>(writer: &mut W, frame_type: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}
