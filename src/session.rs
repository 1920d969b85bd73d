//! Per-client session lifecycle.
//!
//! Every authenticated connection gets a `ClientSession` plus two tasks: a
//! reader that owns inbound I/O and a writer that owns outbound I/O. All
//! other tasks (router fan-out, store-and-forward, the PONG path) reach the
//! socket only through the session's bounded frame queue, so writes are
//! serialized without holding a lock across the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::protocol::{
    read_frame, write_frame, Frame, FrameError, FRAME_DATA, FRAME_PING, FRAME_PONG,
};
use crate::ratelimit::TokenBucket;
use crate::router::Router;

/// Depth of the per-session outbound queue. Overflow drops the new frame
/// rather than blocking the enqueuer behind a stalled client.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One live client connection. Created after a successful handshake,
/// destroyed on any I/O error, keepalive expiry, or shutdown.
pub struct ClientSession {
    id: u64,
    peer_id: String,
    addr: SocketAddr,
    limiter: TokenBucket,
    // `None` once closed. Enqueue and close take the same lock, so a frame
    // can never be pushed onto a queue that is being torn down.
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    closed: Notify,
    last_active: Mutex<Instant>,
    established: Instant,
}

impl ClientSession {
    /// Create a session and hand back the receiving end of its outbound
    /// queue for the writer task.
    pub fn new(
        peer_id: String,
        addr: SocketAddr,
        cfg: &RelayConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            addr,
            limiter: TokenBucket::new(cfg.client_packets_per_sec, cfg.client_burst_size),
            tx: Mutex::new(Some(tx)),
            closed: Notify::new(),
            last_active: Mutex::new(Instant::now()),
            established: Instant::now(),
        });
        (session, rx)
    }

    /// Process-unique session identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Printable identifier the client chose in HELLO. Unauthenticated;
    /// used for logging and by higher layers only.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Non-blocking enqueue onto the outbound queue. Returns false when the
    /// session is closed; a full queue drops the frame and logs.
    pub fn enqueue(&self, frame: Frame) -> bool {
        let guard = self.tx.lock().expect("session queue lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(addr = %self.addr, peer = %self.peer_id, "write queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue an opaque packet as a DATA frame.
    pub fn send_data(&self, data: &[u8]) {
        self.enqueue(Frame::new(FRAME_DATA, data.to_vec()));
    }

    /// Idempotent close: drops the queue sender so the writer drains and
    /// terminates, and wakes the reader.
    pub fn close(&self) {
        let mut guard = self.tx.lock().expect("session queue lock poisoned");
        if guard.take().is_some() {
            self.closed.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().expect("session queue lock poisoned").is_none()
    }

    /// Time since the last inbound frame.
    pub fn idle(&self) -> std::time::Duration {
        self.last_active
            .lock()
            .expect("session activity lock poisoned")
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .expect("session activity lock poisoned") = Instant::now();
    }

    async fn wait_closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            self.closed.notified().await;
        }
    }

    /// Reader loop: owns inbound I/O until disconnect. Each iteration reads
    /// under the keepalive deadline; expiry counts as disconnect. On return
    /// the session is closed and deregistered.
    pub async fn read_loop<R>(&self, reader: &mut R, router: &Router, cfg: &RelayConfig)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.wait_closed() => break,
                read = timeout(cfg.keepalive_timeout, read_frame(reader, cfg.max_packet_size)) => {
                    match read {
                        Err(_) => {
                            debug!(addr = %self.addr, peer = %self.peer_id, "keepalive timeout");
                            break;
                        }
                        Ok(Err(FrameError::Oversized { length, max })) => {
                            warn!(addr = %self.addr, peer = %self.peer_id, length, max,
                                "oversized frame, closing session");
                            break;
                        }
                        Ok(Err(FrameError::Io(err))) => {
                            debug!(addr = %self.addr, peer = %self.peer_id, error = %err, "read failed");
                            break;
                        }
                        Ok(Ok(frame)) => frame,
                    }
                }
            };

            self.touch();

            match frame.frame_type {
                FRAME_DATA => {
                    if !self.limiter.allow() {
                        debug!(addr = %self.addr, peer = %self.peer_id, "client rate limited, dropping");
                        continue;
                    }
                    if !router.global_limiter.allow() {
                        debug!(addr = %self.addr, peer = %self.peer_id, "global rate limit, dropping");
                        continue;
                    }
                    router.route_from_client(self, &frame.payload).await;
                }
                FRAME_PING => {
                    self.enqueue(Frame::empty(FRAME_PONG));
                }
                other => {
                    warn!(addr = %self.addr, peer = %self.peer_id, frame_type = other,
                        "unexpected frame");
                }
            }
        }

        self.close();
        router.remove_session(self);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writer loop: sole owner of outbound I/O. Drains the queue until the
/// session closes (sender dropped) or a write fails.
pub async fn write_loop<W>(session: Arc<ClientSession>, mut rx: mpsc::Receiver<Frame>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, frame.frame_type, &frame.payload).await {
            debug!(addr = %session.addr(), peer = %session.peer_id(), error = %err, "write failed");
            session.close();
            break;
        }
    }
    debug!(
        addr = %session.addr(),
        peer = %session.peer_id(),
        uptime_secs = session.established.elapsed().as_secs(),
        "writer terminated"
    );
}
