//! Relay daemon configuration.
//!
//! `RelayConfig` is a read-only record consumed by every subsystem. It is
//! populated once at startup (defaults, then CLI flags) and shared behind an
//! `Arc`; nothing mutates it afterwards.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for one relay daemon process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TLS listen port for phone connections.
    pub tls_port: u16,
    /// UDP multicast port for the inter-relay mesh.
    pub mesh_port: u16,
    /// Network interface carrying the layer-2 mesh (batman-adv).
    pub mesh_interface: String,
    /// Multicast group joined by all relay daemons.
    pub mesh_multicast: Ipv4Addr,
    /// Directory holding the TLS certificate and key.
    pub cert_dir: PathBuf,
    /// Directory holding the relay Ed25519 signing key and certificate.
    pub key_dir: PathBuf,

    /// Upper bound on concurrent client sessions; excess connections are
    /// closed at accept time.
    pub max_clients: usize,
    /// Hard cap on frame payload length, client and mesh alike.
    pub max_packet_size: usize,

    /// Per-session token bucket refill rate (packets per second).
    pub client_packets_per_sec: f64,
    /// Per-session token bucket capacity.
    pub client_burst_size: u32,
    /// Aggregate token bucket refill rate across all sessions.
    pub global_packets_per_sec: f64,
    /// Aggregate token bucket capacity.
    pub global_burst_size: u32,

    /// Required leading zero bits in the proof-of-work hash.
    pub pow_difficulty: u8,

    /// Capacity of the store-and-forward ring buffer.
    pub buffer_size: usize,
    /// Dedup set size that triggers a wholesale reset.
    pub dedup_max_entries: usize,

    /// Suggested client PING cadence. Carried for clients; the relay itself
    /// only enforces `keepalive_timeout`.
    pub keepalive_interval: Duration,
    /// Read deadline per reader iteration; expiry counts as disconnect.
    pub keepalive_timeout: Duration,
    /// Absolute bound on the admission handshake.
    pub handshake_timeout: Duration,

    /// Permitted client attestation (APK cert) hashes, lowercase hex.
    /// Empty means any client is accepted.
    pub allowed_cert_hashes: HashSet<String>,

    /// Hex-encoded CA public key; empty string means open mesh.
    pub ca_pubkey_hex: String,
    /// Certificate revocation list file, polled for changes.
    pub crl_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tls_port: 7275,
            mesh_port: 7276,
            mesh_interface: "bat0".to_string(),
            mesh_multicast: Ipv4Addr::new(239, 0, 7, 2),
            cert_dir: PathBuf::from("/etc/bitchat"),
            key_dir: PathBuf::from("/etc/bitchat"),

            max_clients: 20,
            max_packet_size: 65536,

            client_packets_per_sec: 10.0,
            client_burst_size: 20,
            global_packets_per_sec: 100.0,
            global_burst_size: 200,

            pow_difficulty: 20,

            buffer_size: 1000,
            dedup_max_entries: 10_000,

            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(30),

            allowed_cert_hashes: HashSet::new(),

            ca_pubkey_hex: String::new(),
            crl_path: Some(PathBuf::from("/etc/bitchat/revoked.crl")),
        }
    }
}

impl RelayConfig {
    /// True when client attestation hashes are being enforced.
    pub fn attestation_enforced(&self) -> bool {
        !self.allowed_cert_hashes.is_empty()
    }
}
