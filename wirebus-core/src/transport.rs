//! Duplex stream abstraction.
//!
//! A `Transport` is the write side of one duplex byte connection. The
//! inbound direction does not appear here: whoever owns the socket read
//! half feeds bytes straight into a framer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wirebus_protocol::KEEPALIVE_BYTE;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write side of a duplex byte stream.
pub trait Transport: Send + Sync {
    /// Queues `data` for the wire.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Writes the single-byte keepalive probe, with no framing.
    fn send_keepalive(&self) -> Result<(), TransportError> {
        self.send(Bytes::from_static(&[KEEPALIVE_BYTE]))
    }

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Channel-backed transport.
///
/// Outbound bytes go onto an unbounded channel drained by a writer task
/// that owns the socket write half. When the writer task dies (I/O error
/// or shutdown) the channel closes and every later `send` fails, which is
/// how write failures surface to the caller.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Creates the transport plus the receiver for its writer task.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| {
                self.closed.store(true, Ordering::Release);
                TransportError::Closed
            }),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender ends the writer task's recv loop.
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_reaches_receiver() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(Bytes::from_static(b"abc")).unwrap();

        assert_eq!(rx.try_recv().unwrap().as_ref(), b"abc");
        assert!(!transport.is_closed());
    }

    #[test]
    fn test_keepalive_is_single_zero_byte() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send_keepalive().unwrap();
        assert_eq!(rx.try_recv().unwrap().as_ref(), &[KEEPALIVE_BYTE]);
    }

    #[test]
    fn test_close_stops_sends() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.close();

        assert!(transport.is_closed());
        assert!(matches!(
            transport.send(Bytes::from_static(b"late")).unwrap_err(),
            TransportError::Closed
        ));
        // Writer task sees end-of-channel.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_receiver_marks_closed() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);

        assert!(transport.send(Bytes::from_static(b"x")).is_err());
        assert!(transport.is_closed());
    }
}
