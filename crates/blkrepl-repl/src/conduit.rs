//! In-process two-channel link between two nodes.
//!
//! A connection consists of a data channel for bulk traffic and a meta
//! channel for acknowledgements and pings, each delivering frames in order.
//! [`Conduit::new_pair`] builds both endpoints over tokio mpsc channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{ReplError, ReplResult};
use crate::protocol::{Channel, Packet};

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
struct ConduitStatsInner {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
}

/// Statistics for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConduitStats {
    /// Frames sent on both channels.
    pub packets_sent: u64,
    /// Frames received on both channels.
    pub packets_received: u64,
    /// Bytes sent including headers.
    pub bytes_sent: u64,
    /// Bytes received including headers.
    pub bytes_received: u64,
    /// Sends that failed because the link was down.
    pub send_errors: u64,
}

/// State of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConduitState {
    /// Both channels usable.
    #[default]
    Connected,
    /// Shut down locally; the peer sees end of stream.
    Shutdown,
}

/// One endpoint of a node-to-node link.
pub struct Conduit {
    name: String,
    initiator: bool,
    state: Mutex<ConduitState>,
    stats: Arc<ConduitStatsInner>,
    data_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    meta_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    data_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    meta_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("name", &self.name)
            .field("initiator", &self.initiator)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Conduit {
    /// Create both endpoints of a link.
    ///
    /// The first endpoint is the initiator: it wins concurrent cluster-wide
    /// state changes and breaks split-brain ties towards its peer.
    pub fn new_pair(name_a: &str, name_b: &str) -> (Self, Self) {
        let (data_a, data_rx_b) = mpsc::unbounded_channel();
        let (meta_a, meta_rx_b) = mpsc::unbounded_channel();
        let (data_b, data_rx_a) = mpsc::unbounded_channel();
        let (meta_b, meta_rx_a) = mpsc::unbounded_channel();

        let make = |name: &str, initiator, data_tx, meta_tx, data_rx, meta_rx| Self {
            name: name.to_string(),
            initiator,
            state: Mutex::new(ConduitState::Connected),
            stats: Arc::new(ConduitStatsInner::default()),
            data_tx: Mutex::new(Some(data_tx)),
            meta_tx: Mutex::new(Some(meta_tx)),
            data_rx: tokio::sync::Mutex::new(data_rx),
            meta_rx: tokio::sync::Mutex::new(meta_rx),
            closed: watch::channel(false).0,
        };

        (
            make(name_a, true, data_a, meta_a, data_rx_a, meta_rx_a),
            make(name_b, false, data_b, meta_b, data_rx_b, meta_rx_b),
        )
    }

    /// Name of the local end.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this endpoint initiated the link.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Current state.
    pub fn state(&self) -> ConduitState {
        *self.state.lock()
    }

    /// Encode `packet` and queue it on its channel.
    pub fn send(&self, packet: &Packet) -> ReplResult<()> {
        let frame = packet.encode()?;
        self.send_frame(packet.channel(), frame)
    }

    /// Queue a raw frame on `channel`.
    pub fn send_frame(&self, channel: Channel, frame: Bytes) -> ReplResult<()> {
        let slot = match channel {
            Channel::Data => &self.data_tx,
            Channel::Meta => &self.meta_tx,
        };
        let len = frame.len() as u64;
        let sent = match slot.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::Disconnected {
                msg: format!("{}: {channel:?} channel closed", self.name),
            });
        }
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        trace!(conduit = %self.name, ?channel, len, "frame sent");
        Ok(())
    }

    /// Wait for the next frame on `channel`.
    ///
    /// Fails once the peer closed its side or this endpoint was shut down.
    pub async fn recv_frame(&self, channel: Channel) -> ReplResult<Bytes> {
        let mut closed = self.closed.subscribe();
        let lost = || ReplError::Disconnected {
            msg: format!("{}: {channel:?} channel closed", self.name),
        };
        if *closed.borrow() {
            return Err(lost());
        }
        let mut rx = match channel {
            Channel::Data => self.data_rx.lock().await,
            Channel::Meta => self.meta_rx.lock().await,
        };
        let frame = tokio::select! {
            frame = rx.recv() => frame.ok_or_else(lost)?,
            _ = closed.wait_for(|c| *c) => return Err(lost()),
        };
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(frame)
    }

    /// Wait for and decode the next packet on `channel`.
    pub async fn recv(&self, channel: Channel) -> ReplResult<Packet> {
        let frame = self.recv_frame(channel).await?;
        Packet::decode(frame)
    }

    /// Close both channels.
    ///
    /// Local receivers return an error and the peer sees end of stream once
    /// it drained what was already queued.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state == ConduitState::Shutdown {
            return;
        }
        *state = ConduitState::Shutdown;
        self.data_tx.lock().take();
        self.meta_tx.lock().take();
        self.closed.send_replace(true);
        debug!(conduit = %self.name, "conduit shut down");
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> ConduitStats {
        ConduitStats {
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pair() {
        let (a, b) = Conduit::new_pair("alpha", "bravo");
        assert_eq!(a.state(), ConduitState::Connected);
        assert_eq!(b.state(), ConduitState::Connected);
        assert!(a.is_initiator());
        assert!(!b.is_initiator());
        assert_eq!(b.name(), "bravo");
    }

    #[tokio::test]
    async fn test_packets_routed_by_channel() {
        let (a, b) = Conduit::new_pair("a", "b");
        a.send(&Packet::Ping).unwrap();
        a.send(&Packet::ReportState(7)).unwrap();

        assert_eq!(b.recv(Channel::Data).await.unwrap(), Packet::ReportState(7));
        assert_eq!(b.recv(Channel::Meta).await.unwrap(), Packet::Ping);
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let (a, b) = Conduit::new_pair("a", "b");
        for nr in 1..=5u32 {
            a.send(&Packet::Barrier(nr)).unwrap();
        }
        for nr in 1..=5u32 {
            assert_eq!(b.recv(Channel::Data).await.unwrap(), Packet::Barrier(nr));
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let (a, b) = Conduit::new_pair("a", "b");
        a.send(&Packet::Ping).unwrap();
        let _ = b.recv(Channel::Meta).await.unwrap();
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.stats().bytes_sent, 8);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (a, _b) = Conduit::new_pair("a", "b");
        a.shutdown();
        assert!(a.send(&Packet::Ping).is_err());
        assert_eq!(a.stats().send_errors, 1);
        assert_eq!(a.state(), ConduitState::Shutdown);
    }

    #[tokio::test]
    async fn test_peer_sees_end_of_stream() {
        let (a, b) = Conduit::new_pair("a", "b");
        a.send(&Packet::Ping).unwrap();
        a.shutdown();
        // queued frames are still delivered
        assert_eq!(b.recv(Channel::Meta).await.unwrap(), Packet::Ping);
        assert!(matches!(
            b.recv(Channel::Meta).await,
            Err(ReplError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_local_receiver() {
        let (a, _b) = Conduit::new_pair("a", "b");
        let a = Arc::new(a);
        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.recv(Channel::Data).await })
        };
        tokio::task::yield_now().await;
        a.shutdown();
        assert!(waiter.await.unwrap().is_err());
    }
}
