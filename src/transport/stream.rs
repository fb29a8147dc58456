//! TCP byte-stream adapter with message framing.
//!
//! Wire packets are delimited by a 4-byte big-endian length prefix so
//! message boundaries survive the byte stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::constants::CONNECT_TIMEOUT;
use crate::core::{TransportError, TransportResult};

use super::{Transport, TransportEvent, TransportKind};

/// Reject framed messages larger than this (corrupt prefix guard).
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Stream transport over TCP with length-prefixed framing.
pub struct StreamTransport {
    remote: SocketAddr,
    writer: Option<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl StreamTransport {
    /// Create an adapter targeting `remote`. No I/O until `connect`.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            writer: None,
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        self.close().await;

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.remote))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        self.writer = Some(write_half);
        self.connected.store(true, Ordering::Relaxed);
        debug!(remote = %self.remote, "stream transport connected");

        let connected = Arc::clone(&self.connected);
        let name = self.name();
        self.reader = Some(tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf);
                if len > MAX_MESSAGE_SIZE {
                    warn!(len, "oversized framed message, closing stream");
                    break;
                }
                let mut payload = vec![0u8; len as usize];
                if read_half.read_exact(&mut payload).await.is_err() {
                    break;
                }
                if events
                    .send(TransportEvent::Packet {
                        transport: name,
                        payload: Bytes::from(payload),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            connected.store(false, Ordering::Relaxed);
            let _ = events.send(TransportEvent::Closed { transport: name }).await;
        }));

        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}
