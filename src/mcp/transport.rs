//! MCP Transport Layer
//!
//! Newline-delimited JSON over a byte stream: one message per line. The
//! server reads requests from stdin and writes responses to stdout; tests use
//! in-memory duplex pipes.
//!
//! # Architecture
//!
//! The transport layer is responsible only for framing. Parsing and dispatch
//! happen in the server, so a malformed line can still be answered.

use crate::mcp::protocol::McpResponse;
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads one message per line
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next non-empty line, `None` at end of input
    ///
    /// Invalid UTF-8 is replaced rather than rejected; the JSON parser will
    /// reject the line and the client gets a parse error.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .context("Failed to read from client")?;
            if n == 0 {
                return Ok(None);
            }

            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Writes one message per line
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, response: &McpResponse) -> Result<()> {
        let json = serde_json::to_string(response).context("Failed to serialize response")?;

        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write to client")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to client")?;
        self.writer
            .flush()
            .await
            .context("Failed to flush client output")?;

        tracing::trace!("Sent response: {}", json);
        Ok(())
    }
}
