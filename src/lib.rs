//! # BitChat Relay - WiFi Mesh Relay Daemon
//!
//! A relay daemon for offline peer-to-peer messaging, built to run on
//! inexpensive mesh routers. Each daemon terminates encrypted client
//! sessions from nearby phones and cooperates with sibling daemons over a
//! layer-2 mesh (batman-adv) to carry opaque application packets across the
//! network.
//!
//! The daemon never inspects or modifies payloads; it routes, deduplicates,
//! buffers, and authenticates:
//!
//! - **Sessions**: TLS 1.3 termination, proof-of-work admission, framed
//!   I/O, rate limiting, keepalive-bounded lifetime
//! - **Routing**: fan-out between local sessions and the mesh, content-hash
//!   deduplication, store-and-forward for newly joining clients
//! - **Trust plane**: Ed25519-signed mesh packets, optional CA verification
//!   of peer relays, hot-reloadable revocation list
//!
//! ## Concurrency Model
//!
//! Long-lived tasks: the TLS acceptor, the mesh receive loop, and the CRL
//! reloader. Each session adds a reader task (sole owner of inbound I/O)
//! and a writer task (sole owner of outbound I/O) joined by a bounded frame
//! queue. Shared structures (session set, buffers, buckets, revocation set)
//! are internally synchronized and never hold a lock across network I/O.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `config` | Read-only configuration record |
//! | `protocol` | `[type][len][payload]` frame codec and frame types |
//! | `pow` | Proof-of-work challenges and verification |
//! | `ratelimit` | Token buckets (per-session and global) |
//! | `dedup` | Packet fingerprints and duplicate suppression |
//! | `buffer` | Store-and-forward ring buffer |
//! | `auth` | Relay identity, CA verification, CRL |
//! | `handshake` | HELLO → CHALLENGE → SOLUTION → ACCEPT/REJECT |
//! | `session` | Per-client reader/writer lifecycle |
//! | `mesh` | Signed UDP multicast link between relays |
//! | `router` | Central hub: dedup, buffer, fan-out |
//! | `server` | TLS listener and connection admission |

pub mod auth;
pub mod buffer;
pub mod config;
pub mod dedup;
pub mod handshake;
pub mod mesh;
pub mod pow;
pub mod protocol;
pub mod ratelimit;
pub mod router;
pub mod server;
pub mod session;

pub use auth::RelayAuth;
pub use config::RelayConfig;
pub use mesh::MeshLink;
pub use router::Router;
pub use server::Server;
pub use session::ClientSession;
