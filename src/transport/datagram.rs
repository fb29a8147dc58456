//! UDP datagram adapter.
//!
//! One wire packet per datagram; no ordering, no delivery guarantee.
//! Fragment sizing keeps packets inside a single datagram, so no extra
//! framing is needed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::constants::CONNECT_TIMEOUT;
use crate::core::{TransportError, TransportResult};

use super::{Transport, TransportEvent, TransportKind};

/// Receive buffer size, large enough for any single datagram.
const RECV_BUFFER_SIZE: usize = 65535;

/// Datagram transport over a connected UDP socket.
pub struct DatagramTransport {
    remote: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl DatagramTransport {
    /// Create an adapter targeting `remote`. No I/O until `connect`.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            socket: None,
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn name(&self) -> &'static str {
        "datagram"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        self.close().await;

        let bind_addr: SocketAddr = if self.remote.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| TransportError::NotConnected)?
        } else {
            "[::]:0".parse().map_err(|_| TransportError::NotConnected)?
        };
        let socket = timeout(CONNECT_TIMEOUT, async {
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(self.remote).await?;
            Ok::<_, std::io::Error>(socket)
        })
        .await
        .map_err(|_| TransportError::ConnectTimeout)??;

        let socket = Arc::new(socket);
        self.socket = Some(Arc::clone(&socket));
        self.connected.store(true, Ordering::Relaxed);
        debug!(remote = %self.remote, "datagram transport connected");

        let connected = Arc::clone(&self.connected);
        let name = self.name();
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        if events
                            .send(TransportEvent::Packet {
                                transport: name,
                                payload,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "datagram receive failed");
                        connected.store(false, Ordering::Relaxed);
                        let _ = events.send(TransportEvent::Closed { transport: name }).await;
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        let socket = self
            .socket
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or(TransportError::NotConnected)?;
        socket.send(data).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_send_receive() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut transport = DatagramTransport::new(peer_addr);
        assert!(!transport.is_connected());

        transport.connect(tx).await.unwrap();
        assert!(transport.is_connected());

        transport.send(b"probe").await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"probe");

        peer.send_to(b"echo", from).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Packet { transport, payload } => {
                assert_eq!(transport, "datagram");
                assert_eq!(&payload[..], b"echo");
            }
            other => panic!("unexpected event {other:?}"),
        }

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let mut transport = DatagramTransport::new("127.0.0.1:9".parse().unwrap());
        let err = transport.send(b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
