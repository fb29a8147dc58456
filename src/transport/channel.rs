//! In-process peer data channel.
//!
//! A cross-connected mpsc pair with data-channel semantics: ordered,
//! message-oriented, closed when either side drops. This is the transport
//! used by the test harness and by embedders that bridge their own peer
//! connection (e.g. a WebRTC data channel) into the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{TransportError, TransportResult};

use super::{Transport, TransportEvent, TransportKind};

/// Buffered messages per direction before senders are backpressured.
const CHANNEL_DEPTH: usize = 256;

/// One end of an in-process peer channel.
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ChannelTransport {
    /// Create a cross-connected pair of channel ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let a = Self {
            tx: b_tx,
            rx: Some(a_rx),
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        };
        let b = Self {
            tx: a_tx,
            rx: Some(b_rx),
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        };
        (a, b)
    }

    /// Raw peer-side handles for embedders driving the far end directly:
    /// a sender that injects inbound packets and the receiver of outbound
    /// ones. Consumes this end.
    pub fn into_raw(mut self) -> (mpsc::Sender<Bytes>, Option<mpsc::Receiver<Bytes>>) {
        (self.tx.clone(), self.rx.take())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        let mut rx = self.rx.take().ok_or(TransportError::ChannelClosed)?;
        self.connected.store(true, Ordering::Relaxed);

        let connected = Arc::clone(&self.connected);
        let name = self.name();
        self.reader = Some(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if events
                    .send(TransportEvent::Packet {
                        transport: name,
                        payload,
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
        self.tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut a, b) = ChannelTransport::pair();
        let (peer_tx, peer_rx) = b.into_raw();
        let mut peer_rx = peer_rx.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        a.connect(tx).await.unwrap();
        assert!(a.is_connected());

        a.send(b"to-peer").await.unwrap();
        assert_eq!(&peer_rx.recv().await.unwrap()[..], b"to-peer");

        peer_tx.send(Bytes::from_static(b"to-session")).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Packet { transport, payload } => {
                assert_eq!(transport, "channel");
                assert_eq!(&payload[..], b"to-session");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_drop_closes_link() {
        let (mut a, b) = ChannelTransport::pair();
        let (tx, mut rx) = mpsc::channel(8);
        a.connect(tx).await.unwrap();

        drop(b);
        match rx.recv().await.unwrap() {
            TransportEvent::Closed { transport } => assert_eq!(transport, "channel"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!a.is_connected());
        assert!(matches!(
            a.send(b"x").await.unwrap_err(),
            TransportError::NotConnected
        ));
    }
}
