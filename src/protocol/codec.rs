//! NDJSON codec
//!
//! One control message per newline-terminated UTF-8 line. Lines longer
//! than the configured cap are a framing error.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::NodeError;
use crate::protocol::message::ControlMessage;

/// Default cap on a control line (1 MiB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Incremental line reader with a length cap.
///
/// Partially read lines are kept inside the reader, so `read_line` can be
/// wrapped in a timeout and called again without losing data.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Create a new line reader
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Read the next line, trimmed. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Final line without a terminator
                return self.take_line().map(Some);
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.buf.extend_from_slice(&available[..pos]);
                    self.reader.consume(pos + 1);
                    self.check_len()?;
                    return self.take_line().map(Some);
                }
                None => {
                    let n = available.len();
                    self.buf.extend_from_slice(available);
                    self.reader.consume(n);
                    self.check_len()?;
                }
            }
        }
    }

    /// Read and decode the next non-empty line as a control message
    pub async fn read_message(&mut self) -> Result<Option<ControlMessage>> {
        loop {
            match self.read_line().await? {
                Some(line) if line.is_empty() => continue,
                Some(line) => return ControlMessage::decode(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn check_len(&mut self) -> Result<()> {
        if self.buf.len() > self.max_len {
            let len = self.buf.len();
            self.buf.clear();
            warn!("Control line exceeds {} bytes", self.max_len);
            return Err(NodeError::protocol_error_with_source(
                "Control line too long",
                format!("more than {} bytes (read {})", self.max_len, len),
            )
            .into());
        }
        Ok(())
    }

    fn take_line(&mut self) -> Result<String> {
        let bytes = std::mem::take(&mut self.buf);
        let line = String::from_utf8(bytes)
            .map_err(|e| NodeError::protocol_error_with_source("Control line is not valid UTF-8", e.to_string()))?;
        trace!("Read control line ({} bytes)", line.len());
        Ok(line.trim().to_string())
    }
}

/// Write a control message as one line and flush
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &ControlMessage) -> Result<()> {
    let mut line = message.encode()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_lines_trimmed() {
        let input: &[u8] = b"  first \nsecond\r\n\nlast";
        let mut reader = LineReader::new(input, 1024);

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_line_is_error() {
        let mut input = vec![b'x'; 2048];
        input.push(b'\n');
        // A small internal buffer forces the line to arrive in chunks
        let mut reader = LineReader::new(BufReader::with_capacity(64, input.as_slice()), 1024);

        let err = reader.read_line().await.unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_line_at_cap_is_accepted() {
        let mut input = vec![b'y'; 1024];
        input.push(b'\n');
        let mut reader = LineReader::new(input.as_slice(), 1024);
        assert_eq!(reader.read_line().await.unwrap().unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_write_then_read_message() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);

        let ping = ControlMessage::ping("a", 9);
        write_message(&mut client_write, &ping).await.unwrap();
        drop(client_write);

        let mut reader = LineReader::new(BufReader::new(server_read), MAX_LINE_LENGTH);
        assert_eq!(reader.read_message().await.unwrap(), Some(ping));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_error() {
        let input: &[u8] = &[0xff, 0xfe, b'\n'];
        let mut reader = LineReader::new(input, 1024);
        assert!(reader.read_line().await.is_err());
    }
}
