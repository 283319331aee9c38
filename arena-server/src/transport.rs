//! Connection registry and outbound fan-out.
//!
//! Game code never touches a socket. Every connection owns an unbounded
//! channel of pre-encoded frames; the per-socket send task drains it into the
//! WebSocket. Broadcasts encode once and clone the cheap [`Bytes`] handle per
//! receiver. Metadata slots bind a connection to its identity and room.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use protocol::ServerEvent;
use protocol::wire::PlayerKey;
use tokio::sync::mpsc;

pub type ConnId = u64;

/// Per-socket metadata slots.
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub persistent_id: Option<String>,
    pub profile_id: Option<String>,
    pub room_code: Option<String>,
    pub player_key: Option<PlayerKey>,
    pub remote_ip: String,
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    meta: ConnMeta,
}

/// Serializes an event into its wire frame.
pub fn encode_event(event: &ServerEvent) -> Bytes {
    match serde_json::to_vec(event) {
        Ok(buf) => Bytes::from(buf),
        Err(err) => {
            tracing::error!(?err, "Outbound event serialization failed");
            Bytes::new()
        }
    }
}

/// The registry of live connections.
#[derive(Debug, Default)]
pub struct Transport {
    connections: DashMap<ConnId, Connection>,
    next_id: AtomicU64,
}

impl Transport {
    /// Registers a socket and hands back its connection id.
    pub fn register(&self, remote_ip: String, tx: mpsc::UnboundedSender<Bytes>) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(
            id,
            Connection { tx, meta: ConnMeta { remote_ip, ..ConnMeta::default() } },
        );
        id
    }

    /// Drops the connection; returns its last metadata for cleanup.
    pub fn unregister(&self, conn_id: ConnId) -> Option<ConnMeta> {
        self.connections.remove(&conn_id).map(|(_, c)| c.meta)
    }

    pub fn meta(&self, conn_id: ConnId) -> Option<ConnMeta> {
        self.connections.get(&conn_id).map(|c| c.meta.clone())
    }

    pub fn set_identity(&self, conn_id: ConnId, persistent_id: &str, profile_id: Option<&str>) {
        if let Some(mut c) = self.connections.get_mut(&conn_id) {
            c.meta.persistent_id = Some(persistent_id.to_string());
            c.meta.profile_id = profile_id.map(str::to_string);
        }
    }

    pub fn set_room(&self, conn_id: ConnId, room_code: &str, player_key: PlayerKey) {
        if let Some(mut c) = self.connections.get_mut(&conn_id) {
            c.meta.room_code = Some(room_code.to_string());
            c.meta.player_key = Some(player_key);
        }
    }

    pub fn clear_room(&self, conn_id: ConnId) {
        if let Some(mut c) = self.connections.get_mut(&conn_id) {
            c.meta.room_code = None;
            c.meta.player_key = None;
        }
    }

    fn send_frame(&self, conn_id: ConnId, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        if let Some(c) = self.connections.get(&conn_id) {
            if c.tx.send(frame).is_err() {
                tracing::debug!(conn_id, "Send to closed connection dropped");
            }
        }
    }

    /// Direct emit to one connection.
    pub fn send(&self, conn_id: ConnId, event: &ServerEvent) {
        self.send_frame(conn_id, encode_event(event));
    }

    /// Encode-once fan-out to a list of connections.
    pub fn broadcast<I: IntoIterator<Item = ConnId>>(&self, targets: I, event: &ServerEvent) {
        let frame = encode_event(event);
        for conn_id in targets {
            self.send_frame(conn_id, frame.clone());
        }
    }

    /// All live connections bound to a persistent device id.
    pub fn conns_for_pid(&self, persistent_id: &str) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|e| e.meta.persistent_id.as_deref() == Some(persistent_id))
            .map(|e| *e.key())
            .collect()
    }

    /// All live connections bound to a profile id.
    pub fn conns_for_profile(&self, profile_id: &str) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|e| e.meta.profile_id.as_deref() == Some(profile_id))
            .map(|e| *e.key())
            .collect()
    }

    /// Emits to every live connection of a device (there is usually one).
    pub fn send_to_pid(&self, persistent_id: &str, event: &ServerEvent) {
        self.broadcast(self.conns_for_pid(persistent_id), event);
    }

    pub fn all_conn_ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Unregisters connections whose send task is gone. Returns their
    /// metadata so the caller can run the normal disconnect path.
    pub fn sweep_closed(&self) -> Vec<(ConnId, ConnMeta)> {
        let dead: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|e| e.tx.is_closed())
            .map(|e| *e.key())
            .collect();
        dead.into_iter()
            .filter_map(|id| self.unregister(id).map(|meta| (id, meta)))
            .collect()
    }
}
