use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use shared::domain::InstanceId;
use shared::protocol::ServerEvent;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one participant connection. Clones of this live in the
/// session table; the socket task owns the receiving half and drains it onto
/// the wire.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(tx: UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Delivery to an already-closed connection is not an error; the peer is
    /// gone and its disconnect handler will catch up.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Per-connection identity, owned by the socket task and passed by reference
/// into handlers. Nothing here is trusted from payloads once bound.
#[derive(Default)]
pub struct SessionRecord {
    pub bound_name: Option<String>,
    pub bound_instance_id: Option<InstanceId>,
}

/// Display name to connection handle, scoped to the engine's lifetime. One
/// binding per name: a participant reconnecting under the same name
/// displaces the old handle.
#[derive(Default)]
pub struct SessionTable {
    bindings: HashMap<String, ConnectionHandle>,
}

impl SessionTable {
    pub fn bind(&mut self, name: impl Into<String>, handle: ConnectionHandle) {
        self.bindings.insert(name.into(), handle);
    }

    pub fn unbind(&mut self, name: &str) {
        self.bindings.remove(name);
    }

    pub fn resolve(&self, name: &str) -> Option<&ConnectionHandle> {
        self.bindings.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn rebinding_a_name_displaces_the_old_handle() {
        let mut table = SessionTable::default();
        let (first, _first_rx) = handle();
        let (second, _second_rx) = handle();
        let second_id = second.id();

        table.bind("alice", first);
        table.bind("alice", second);

        assert_eq!(table.resolve("alice").expect("bound").id(), second_id);
    }

    #[test]
    fn unbind_removes_the_binding() {
        let mut table = SessionTable::default();
        let (first, _rx) = handle();
        table.bind("alice", first);
        table.unbind("alice");
        assert!(table.resolve("alice").is_none());
    }

    #[test]
    fn send_to_dropped_receiver_is_silent() {
        let (handle, rx) = handle();
        drop(rx);
        handle.send(ServerEvent::ResetSession);
    }
}
