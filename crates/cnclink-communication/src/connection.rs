//! Connection multiplexer.
//!
//! Fans serial-response events out to every subscribed client and correlates
//! echoes of individual client-sent commands back to the originating client
//! via each connection's `last_sent_command`.

use cnclink_core::{ClientEvent, ClientHandle};
use tokio::sync::mpsc::UnboundedSender;

/// A subscribed client.
#[derive(Debug)]
pub struct Connection {
    /// Identity of the client
    pub handle: ClientHandle,
    /// Delivery channel; sends are best-effort
    tx: UnboundedSender<ClientEvent>,
    /// Most recent data written on behalf of this client, for echo
    /// correlation. Cleared once the matching response has been routed.
    pub last_sent_command: Option<String>,
}

/// The set of connections subscribed to one controller.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    connections: Vec<Connection>,
}

impl ConnectionHub {
    /// An empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a client. Returns false when the handle is already present.
    pub fn add(&mut self, handle: ClientHandle, tx: UnboundedSender<ClientEvent>) -> bool {
        if self.connections.iter().any(|c| c.handle == handle) {
            tracing::warn!("Connection {} already subscribed", handle);
            return false;
        }
        self.connections.push(Connection {
            handle,
            tx,
            last_sent_command: None,
        });
        true
    }

    /// Drop a client by identity. Returns whether it was present.
    pub fn remove(&mut self, handle: &ClientHandle) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| &c.handle != handle);
        self.connections.len() != before
    }

    /// Drop every client
    pub fn clear(&mut self) {
        self.connections.clear();
    }

    /// Number of subscribed clients
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no clients are subscribed
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Deliver an event to every connection, best-effort and independent:
    /// a closed client channel never affects the others.
    pub fn broadcast(&self, event: ClientEvent) {
        for connection in &self.connections {
            let _ = connection.tx.send(event.clone());
        }
    }

    /// Deliver an event to a single client
    pub fn send_to(&self, handle: &ClientHandle, event: ClientEvent) {
        if let Some(connection) = self.connections.iter().find(|c| &c.handle == handle) {
            let _ = connection.tx.send(event);
        }
    }

    /// Record data written on behalf of a client for echo correlation
    pub fn note_sent(&mut self, handle: &ClientHandle, data: &str) {
        if let Some(connection) = self.connections.iter_mut().find(|c| &c.handle == handle) {
            connection.last_sent_command = Some(data.to_string());
        }
    }

    /// Route an event to every client whose outstanding command starts with
    /// `prefix`, clearing the correlation. Returns the number of matches.
    pub fn route_prefix(&mut self, prefix: &str, event: &ClientEvent) -> usize {
        let mut matched = 0;
        for connection in &mut self.connections {
            let hit = connection
                .last_sent_command
                .as_ref()
                .is_some_and(|cmd| cmd.starts_with(prefix));
            if hit {
                let _ = connection.tx.send(event.clone());
                connection.last_sent_command = None;
                matched += 1;
            }
        }
        matched
    }

    /// Deliver an event to every client whose outstanding command starts
    /// with `prefix`, leaving the correlation in place (for exchanges whose
    /// completion arrives in a later message). Returns the number of matches.
    pub fn send_prefix(&self, prefix: &str, event: &ClientEvent) -> usize {
        let mut matched = 0;
        for connection in &self.connections {
            let hit = connection
                .last_sent_command
                .as_ref()
                .is_some_and(|cmd| cmd.starts_with(prefix));
            if hit {
                let _ = connection.tx.send(event.clone());
                matched += 1;
            }
        }
        matched
    }

    /// Clear correlations matching `prefix` without delivering anything.
    /// Returns the number cleared.
    pub fn clear_prefix(&mut self, prefix: &str) -> usize {
        let mut cleared = 0;
        for connection in &mut self.connections {
            let hit = connection
                .last_sent_command
                .as_ref()
                .is_some_and(|cmd| cmd.starts_with(prefix));
            if hit {
                connection.last_sent_command = None;
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn read_event(line: &str) -> ClientEvent {
        ClientEvent::SerialRead {
            line: line.to_string(),
        }
    }

    #[test]
    fn broadcast_reaches_all_clients() {
        let mut hub = ConnectionHub::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        hub.add(ClientHandle::new(), tx_a);
        hub.add(ClientHandle::new(), tx_b);

        hub.broadcast(read_event("ALARM:1"));
        assert_eq!(rx_a.try_recv().unwrap(), read_event("ALARM:1"));
        assert_eq!(rx_b.try_recv().unwrap(), read_event("ALARM:1"));
    }

    #[test]
    fn prefix_routing_clears_correlation() {
        let mut hub = ConnectionHub::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = ClientHandle::new();
        let b = ClientHandle::new();
        hub.add(a, tx_a);
        hub.add(b, tx_b);

        hub.note_sent(&a, "$G\n");
        assert_eq!(hub.route_prefix("$G", &read_event("[GC:G0 G54]")), 1);
        assert_eq!(rx_a.try_recv().unwrap(), read_event("[GC:G0 G54]"));
        assert!(rx_b.try_recv().is_err());

        // Correlation consumed: a second route finds nothing.
        assert_eq!(hub.route_prefix("$G", &read_event("[GC:G0 G54]")), 0);
    }

    #[test]
    fn closed_client_does_not_poison_broadcast() {
        let mut hub = ConnectionHub::new();
        let (tx_a, rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        hub.add(ClientHandle::new(), tx_a);
        hub.add(ClientHandle::new(), tx_b);
        drop(rx_a);

        hub.broadcast(read_event("ok"));
        assert_eq!(rx_b.try_recv().unwrap(), read_event("ok"));
    }

    #[test]
    fn remove_by_identity() {
        let mut hub = ConnectionHub::new();
        let (tx, _rx) = unbounded_channel();
        let a = ClientHandle::new();
        hub.add(a, tx);
        assert!(hub.remove(&a));
        assert!(!hub.remove(&a));
        assert!(hub.is_empty());
    }
}
