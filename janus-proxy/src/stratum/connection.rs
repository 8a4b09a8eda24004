//! Framed connection management with line-delimited I/O.
//!
//! Wraps a byte stream (plain TCP or TLS) with buffered reading and
//! writing of complete JSON-RPC messages. The [`Transport`] trait
//! abstracts message I/O, allowing channel-based mocks for deterministic
//! testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use super::MAX_LINE_BYTES;

/// Message-level I/O for the Stratum protocol.
///
/// Abstracts reading and writing JSON-RPC messages so sessions can run
/// over TCP or TLS in production and over channels in tests.
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message followed by a newline.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// Buffered framed connection over an arbitrary byte stream.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,

    /// Line accumulator. Persists across poll cancellations so a partial
    /// read resumes instead of corrupting the frame; cleared only after a
    /// complete line has been consumed.
    line_buf: String,
}

impl<S: AsyncRead + AsyncWrite + Send> Connection<S> {
    /// Create a new connection from a byte stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::with_capacity(4096),
        }
    }
}

/// Establish a connection to `host:port`, optionally wrapped in TLS.
///
/// TLS validates against the Mozilla root store. The returned transport
/// erases the underlying stream type so TCP and TLS share one code path.
pub async fn connect(host: &str, port: u16, tls: bool) -> StratumResult<Box<dyn Transport>> {
    debug!(host, port, tls, "Connecting to pool");

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| StratumError::ConnectionFailed(e.to_string()))?;

    if !tls {
        return Ok(Box::new(Connection::new(stream)));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| StratumError::ConnectionFailed(format!("invalid TLS name: {e}")))?;

    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| StratumError::ConnectionFailed(format!("TLS handshake: {e}")))?;

    Ok(Box::new(Connection::new(stream)))
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> Transport for Connection<S> {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let n = self
                .reader
                .read_line(&mut self.line_buf)
                .await
                .map_err(StratumError::Io)?;

            if self.line_buf.len() > MAX_LINE_BYTES {
                return Err(StratumError::LineTooLong);
            }

            if n == 0 && self.line_buf.is_empty() {
                // EOF with nothing buffered
                return Ok(None);
            }

            if !self.line_buf.ends_with('\n') && n != 0 {
                // Partial line, keep reading
                continue;
            }

            let line = self.line_buf.trim().to_owned();
            self.line_buf.clear();

            if line.is_empty() {
                if n == 0 {
                    return Ok(None);
                }
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(&line).map_err(|e| {
                StratumError::InvalidMessage(format!("failed to parse JSON: {e}, line: {line}"))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// session's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: session_rx,
            tx: session_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the session.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a message the session wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }
}
