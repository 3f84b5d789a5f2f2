//! Piece transfer frames
//!
//! Tagged binary layout shared by the UDP and TCP data paths. Strings are
//! a big-endian `u16` length followed by UTF-8 bytes; integers are
//! big-endian `u32`.
//!
//! ```text
//! PIECE   := str("PIECE")   str(file_hash) u32(index) str(piece_hash) u32(len) bytes[len]
//! REQUEST := str("REQUEST") str(file_hash) u32(index)
//! ERROR   := str("ERROR")   str(file_hash) u32(index) str(message)
//! ```

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use crate::error::NodeError;
use crate::storage::piece::{Piece, HASH_HEX_LEN};

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Framing bytes around the data of a PIECE frame with 64-character hashes
pub const PIECE_FRAME_OVERHEAD: usize = (2 + TAG_PIECE.len()) + (2 + HASH_HEX_LEN) + 4 + (2 + HASH_HEX_LEN) + 4;

/// Largest piece that fits a single datagram
pub const MAX_UDP_PIECE_DATA: usize = MAX_UDP_PAYLOAD - PIECE_FRAME_OVERHEAD;

/// Upper bound on piece data accepted from a stream
pub const MAX_FRAME_DATA: usize = 64 * 1024 * 1024;

const TAG_PIECE: &str = "PIECE";
const TAG_REQUEST: &str = "REQUEST";
const TAG_ERROR: &str = "ERROR";

/// A data-path frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Piece bytes with their declared hash
    Piece(Piece),
    /// Ask for one piece
    Request { file_hash: String, index: u32 },
    /// The peer cannot serve a requested piece
    Error { file_hash: String, index: u32, message: String },
}

impl Frame {
    /// Tag written at the start of the frame
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Piece(_) => TAG_PIECE,
            Frame::Request { .. } => TAG_REQUEST,
            Frame::Error { .. } => TAG_ERROR,
        }
    }

    /// (file hash, index) the frame refers to
    pub fn key(&self) -> (&str, u32) {
        match self {
            Frame::Piece(piece) => (&piece.file_hash, piece.index),
            Frame::Request { file_hash, index } | Frame::Error { file_hash, index, .. } => (file_hash, *index),
        }
    }

    /// Serialize the frame
    pub fn encode(&self) -> BytesMut {
        trace!("Encoding {} frame", self.tag());
        let mut buf = BytesMut::new();
        put_str(&mut buf, self.tag());
        match self {
            Frame::Piece(piece) => {
                buf.reserve(PIECE_FRAME_OVERHEAD + piece.data.len());
                put_str(&mut buf, &piece.file_hash);
                buf.put_u32(piece.index);
                put_str(&mut buf, &piece.hash);
                buf.put_u32(piece.data.len() as u32);
                buf.put_slice(&piece.data);
            }
            Frame::Request { file_hash, index } => {
                put_str(&mut buf, file_hash);
                buf.put_u32(*index);
            }
            Frame::Error { file_hash, index, message } => {
                put_str(&mut buf, file_hash);
                buf.put_u32(*index);
                put_str(&mut buf, message);
            }
        }
        buf
    }

    /// Parse a complete frame, e.g. one datagram
    pub fn decode(mut buf: &[u8]) -> Result<Frame> {
        let tag = get_str(&mut buf)?;
        let file_hash = get_str(&mut buf)?;
        let index = get_u32(&mut buf)?;
        let frame = match tag.as_str() {
            TAG_PIECE => {
                let hash = get_str(&mut buf)?;
                let len = get_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(truncated("piece data"));
                }
                let data = buf[..len].to_vec();
                buf.advance(len);
                Frame::Piece(Piece::new(file_hash, index, data, hash))
            }
            TAG_REQUEST => Frame::Request { file_hash, index },
            TAG_ERROR => {
                let message = get_str(&mut buf)?;
                Frame::Error { file_hash, index, message }
            }
            other => return Err(unknown_tag(other)),
        };
        if buf.has_remaining() {
            trace!("Ignoring {} trailing bytes after {} frame", buf.remaining(), frame.tag());
        }
        Ok(frame)
    }
}

/// Read one frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let tag = read_str(reader).await?;
    let file_hash = read_str(reader).await?;
    let index = reader.read_u32().await?;
    match tag.as_str() {
        TAG_PIECE => {
            let hash = read_str(reader).await?;
            let len = reader.read_u32().await? as usize;
            if len > MAX_FRAME_DATA {
                error!("Piece frame declares {} bytes, limit is {}", len, MAX_FRAME_DATA);
                return Err(NodeError::protocol_error_with_source("Piece frame too large", format!("{} bytes", len)).into());
            }
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data).await?;
            Ok(Frame::Piece(Piece::new(file_hash, index, data, hash)))
        }
        TAG_REQUEST => Ok(Frame::Request { file_hash, index }),
        TAG_ERROR => {
            let message = read_str(reader).await?;
            Ok(Frame::Error { file_hash, index, message })
        }
        other => Err(unknown_tag(other)),
    }
}

/// Write one frame to a stream and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated("u32"));
    }
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated("string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated("string"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| NodeError::protocol_error_with_source("Frame string is not valid UTF-8", e.to_string()))?;
    buf.advance(len);
    Ok(s)
}

async fn read_str<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map_err(|e| NodeError::protocol_error_with_source("Frame string is not valid UTF-8", e.to_string()).into())
}

fn truncated(what: &str) -> anyhow::Error {
    NodeError::protocol_error_with_source("Truncated frame", format!("missing {}", what)).into()
}

fn unknown_tag(tag: &str) -> anyhow::Error {
    error!("Unknown frame tag '{}'", tag);
    NodeError::protocol_error_with_source("Unknown frame tag", tag.to_string()).into()
}
