//! Single duplex connection.

use crate::error::CoreError;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wirebus_protocol::{encode_frame, Packet, PacketCodec};

/// One duplex packet connection.
///
/// The id starts as a transport-generated value and is reassigned exactly
/// once, when authentication succeeds (via the registry's replace).
///
/// Packets accepted while the connection is closed, or whose send attempt
/// failed, land on a backup list that is flushed oldest-first before the
/// next successful send. Callers must not invoke `send` for one connection
/// from two tasks at a time; the backup lock keeps the list consistent but
/// ordering across concurrent senders is unspecified.
pub struct Connection {
    id: RwLock<String>,
    transport: RwLock<Arc<dyn Transport>>,
    codec: Arc<PacketCodec>,
    closed: AtomicBool,
    backup: Mutex<VecDeque<Packet>>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        codec: Arc<PacketCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: RwLock::new(id.into()),
            transport: RwLock::new(transport),
            codec,
            closed: AtomicBool::new(false),
            backup: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    /// Encodes, frames and sends one packet.
    ///
    /// On a closed connection the packet goes to the backup list and the
    /// call reports success (the packet is accepted, not delivered). A
    /// transport failure closes the connection and re-enqueues the packet
    /// for a retry after the link is rebound.
    pub fn send(&self, packet: &Packet) -> Result<(), CoreError> {
        if self.is_closed() {
            tracing::debug!("connection {} closed, backing up packet {}", self.id(), packet.request_id);
            self.backup.lock().push_back(packet.clone());
            return Ok(());
        }

        // Flush backlog oldest-first before the new packet.
        loop {
            let queued = self.backup.lock().pop_front();
            let Some(queued) = queued else { break };
            if let Err(e) = self.write_packet(&queued) {
                self.closed.store(true, Ordering::Release);
                let mut backup = self.backup.lock();
                backup.push_front(queued);
                backup.push_back(packet.clone());
                return Err(e);
            }
        }

        match self.write_packet(packet) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                self.backup.lock().push_back(packet.clone());
                Err(e)
            }
        }
    }

    fn write_packet(&self, packet: &Packet) -> Result<(), CoreError> {
        let payload = self.codec.encode(packet)?;
        let frame = encode_frame(&payload);
        self.transport.read().send(frame.freeze())?;
        Ok(())
    }

    /// Writes the unframed keepalive probe.
    pub fn send_keepalive(&self) -> Result<(), CoreError> {
        self.transport.read().send_keepalive()?;
        Ok(())
    }

    /// Probes liveness: closed connections report false, otherwise a
    /// keepalive is sent and the result reflects whether the link held.
    pub fn validate(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.send_keepalive().is_err() {
            self.closed.store(true, Ordering::Release);
            return false;
        }
        !self.is_closed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.transport.read().close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.transport.read().is_closed()
    }

    /// Installs a fresh transport after the link is re-established.
    ///
    /// The backup list is kept; it drains on the next successful send.
    pub fn rebind(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = transport;
        self.closed.store(false, Ordering::Release);
    }

    /// Number of packets waiting on the backup list.
    pub fn backlog(&self) -> usize {
        self.backup.lock().len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("backlog", &self.backlog())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    fn connection() -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (transport, rx) = ChannelTransport::new();
        let conn = Connection::new("c-1", transport, Arc::new(PacketCodec::default()));
        (conn, rx)
    }

    #[test]
    fn test_send_writes_frame() {
        let (conn, mut rx) = connection();
        conn.send(&Packet::new("1", "echo.ping", json!("hi"))).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[0], wirebus_protocol::START_BYTE);
    }

    #[test]
    fn test_send_on_closed_backs_up() {
        let (conn, mut rx) = connection();
        conn.close();

        conn.send(&Packet::new("1", "echo.ping", json!(1))).unwrap();
        conn.send(&Packet::new("2", "echo.ping", json!(2))).unwrap();

        assert_eq!(conn.backlog(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_backlog_flushes_oldest_first_after_rebind() {
        let (conn, _rx) = connection();
        conn.close();
        conn.send(&Packet::new("1", "echo.ping", json!(1))).unwrap();
        conn.send(&Packet::new("2", "echo.ping", json!(2))).unwrap();

        let (transport, mut rx2) = ChannelTransport::new();
        conn.rebind(transport);
        conn.send(&Packet::new("3", "echo.ping", json!(3))).unwrap();

        assert_eq!(conn.backlog(), 0);
        let codec = PacketCodec::default();
        let mut ids = Vec::new();
        while let Ok(frame) = rx2.try_recv() {
            let mut framer = wirebus_protocol::ByteFramer::new();
            framer.feed(&frame).unwrap();
            ids.push(codec.decode(&framer.next().unwrap()).unwrap().request_id);
        }
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_transport_failure_closes_and_requeues() {
        let (transport, rx) = ChannelTransport::new();
        let conn = Connection::new("c-1", transport, Arc::new(PacketCodec::default()));
        drop(rx); // writer task gone, sends now fail

        let err = conn.send(&Packet::new("1", "echo.ping", json!(1)));
        assert!(err.is_err());
        assert!(conn.is_closed());
        assert_eq!(conn.backlog(), 1);
    }

    #[test]
    fn test_validate() {
        let (conn, _rx) = connection();
        assert!(conn.validate());

        conn.close();
        assert!(!conn.validate());
    }

    #[test]
    fn test_id_reassignment() {
        let (conn, _rx) = connection();
        assert_eq!(conn.id(), "c-1");
        conn.set_id("user-42");
        assert_eq!(conn.id(), "user-42");
    }
}
