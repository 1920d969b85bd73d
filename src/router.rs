//! Central packet hub.
//!
//! The router owns the session set, the dedup filter, the store-and-forward
//! buffer, and the global rate limiter. Packets from a local client are
//! deduplicated, buffered, fanned out to every other local session, and
//! forwarded to the mesh; packets from the mesh are deduplicated, buffered,
//! and fanned out to all local sessions.
//!
//! The session-set lock is only ever held across non-blocking enqueues,
//! never across a network await.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, info};

use crate::buffer::PacketBuffer;
use crate::config::RelayConfig;
use crate::dedup::{packet_hash, DedupFilter};
use crate::mesh::MeshLink;
use crate::ratelimit::TokenBucket;
use crate::session::ClientSession;

pub struct Router {
    sessions: RwLock<HashMap<u64, Arc<ClientSession>>>,
    buffer: PacketBuffer,
    dedup: DedupFilter,
    /// Aggregate admission bucket, consulted by session readers after the
    /// per-session bucket.
    pub global_limiter: TokenBucket,
    mesh: OnceLock<Arc<MeshLink>>,
}

impl Router {
    pub fn new(cfg: &RelayConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer: PacketBuffer::new(cfg.buffer_size),
            dedup: DedupFilter::new(cfg.dedup_max_entries),
            global_limiter: TokenBucket::new(cfg.global_packets_per_sec, cfg.global_burst_size),
            mesh: OnceLock::new(),
        }
    }

    /// Attach the mesh link once it is up. Without one the router runs in
    /// standalone mode and fan-out stays local.
    pub fn set_mesh(&self, mesh: Arc<MeshLink>) {
        let _ = self.mesh.set(mesh);
    }

    /// Register a session and synchronously replay the buffered packets to
    /// it, oldest first. Holding the set lock through the replay keeps
    /// later-arriving live packets behind the buffered ones; the enqueues
    /// cannot block.
    pub fn add_session(&self, session: Arc<ClientSession>) {
        let count = {
            let mut sessions = self.sessions.write().expect("session set lock poisoned");
            sessions.insert(session.id(), Arc::clone(&session));

            for pkt in self.buffer.get_all() {
                session.send_data(&pkt);
            }
            sessions.len()
        };

        info!(
            addr = %session.addr(),
            peer = %session.peer_id(),
            total = count,
            "client connected"
        );
    }

    /// Remove a session from the set. Idempotent.
    pub fn remove_session(&self, session: &ClientSession) {
        let removed;
        let count = {
            let mut sessions = self.sessions.write().expect("session set lock poisoned");
            removed = sessions.remove(&session.id()).is_some();
            sessions.len()
        };

        if removed {
            info!(
                addr = %session.addr(),
                peer = %session.peer_id(),
                remaining = count,
                "client disconnected"
            );
        }
    }

    /// Current number of registered sessions.
    pub fn client_count(&self) -> usize {
        self.sessions.read().expect("session set lock poisoned").len()
    }

    /// Handle a packet sent by a connected client: dedup, buffer, fan out to
    /// every other local session, then forward to the mesh.
    pub async fn route_from_client(&self, sender: &ClientSession, data: &[u8]) {
        if self.dedup.is_duplicate(packet_hash(data)) {
            return;
        }

        self.buffer.add(data);

        {
            let sessions = self.sessions.read().expect("session set lock poisoned");
            for (id, session) in sessions.iter() {
                if *id != sender.id() {
                    session.send_data(data);
                }
            }
        }

        if let Some(mesh) = self.mesh.get() {
            mesh.send(data).await;
        }
    }

    /// Handle a packet received from another relay over the mesh: dedup,
    /// buffer, deliver to every local session.
    pub async fn route_from_mesh(&self, data: &[u8]) {
        if self.dedup.is_duplicate(packet_hash(data)) {
            return;
        }

        self.buffer.add(data);

        let delivered = {
            let sessions = self.sessions.read().expect("session set lock poisoned");
            for session in sessions.values() {
                session.send_data(data);
            }
            sessions.len()
        };

        debug!(bytes = data.len(), delivered, "mesh packet delivered to local clients");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("clients", &self.client_count())
            .field("buffered", &self.buffer.len())
            .field("mesh", &self.mesh.get().is_some())
            .finish()
    }
}
