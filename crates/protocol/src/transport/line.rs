//! Newline-delimited JSON over TCP.
//!
//! The catalog session itself (CM server selection, encryption, anonymous
//! account bootstrap) is held by a gateway process; this transport speaks one
//! JSON [`Envelope`] per line to it.

use crate::error::{ErrorKind, Result};
use crate::messages::{Envelope, Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use exn::ResultExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

pub struct LineTransport {
    name: String,
    reader: Mutex<Lines<BufReader<OwnedReadHalf>>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl LineTransport {
    /// Open a connection to the gateway, bounded by `timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .or_raise(|| ErrorKind::Timeout {
                operation: "connect",
                after: timeout,
            })?
            .or_raise(|| ErrorKind::Connect(addr.to_string()))?;
        // Frames are small and latency matters more than throughput.
        let _ = stream.set_nodelay(true);
        tracing::debug!(%addr, "connected to catalog gateway");
        Ok(Self::from_stream(addr.to_string(), stream))
    }

    pub fn from_stream(name: impl Into<String>, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            name: name.into(),
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: Envelope<Request>) -> Result<()> {
        let mut line = serde_json::to_vec(&frame).or_raise(|| ErrorKind::Protocol("unencodable request".to_string()))?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.or_raise(|| ErrorKind::Transport)?;
        writer.flush().await.or_raise(|| ErrorKind::Transport)
    }

    async fn recv(&self) -> Result<Option<Envelope<Response>>> {
        let mut reader = self.reader.lock().await;
        loop {
            let Some(line) = reader.next_line().await.or_raise(|| ErrorKind::Transport)? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let frame = serde_json::from_str(&line)
                .or_raise(|| ErrorKind::Protocol("malformed response frame".to_string()))?;
            return Ok(Some(frame));
        }
    }
}
