use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use bitchat_relay::{MeshLink, RelayAuth, RelayConfig, Router, Server};

#[derive(Parser, Debug)]
#[command(name = "bitchat-relay")]
#[command(author, version, about = "WiFi-mesh relay daemon for offline peer-to-peer messaging", long_about = None)]
struct Args {
    /// TLS listen port for phone connections.
    #[arg(long = "port")]
    port: Option<u16>,

    /// UDP multicast port for the inter-daemon mesh.
    #[arg(long = "mesh-port")]
    mesh_port: Option<u16>,

    /// batman-adv network interface.
    #[arg(long = "mesh-iface")]
    mesh_iface: Option<String>,

    /// Multicast group address.
    #[arg(long = "mesh-group")]
    mesh_group: Option<std::net::Ipv4Addr>,

    /// TLS certificate directory.
    #[arg(long = "cert-dir")]
    cert_dir: Option<PathBuf>,

    /// Directory for the relay Ed25519 signing key.
    #[arg(long = "key-dir")]
    key_dir: Option<PathBuf>,

    /// Maximum simultaneous phone connections.
    #[arg(long = "max-clients")]
    max_clients: Option<usize>,

    /// Proof-of-work difficulty (leading zero bits).
    #[arg(long = "pow-difficulty")]
    pow_difficulty: Option<u8>,

    /// Comma-separated APK cert SHA-256 hashes (hex); empty = open.
    #[arg(long = "allowed-cert-hash", default_value = "")]
    allowed_cert_hashes: String,

    /// CA public key (hex) for relay certificate verification; empty = open.
    #[arg(long = "ca-pubkey")]
    ca_pubkey: Option<String>,

    /// Path to the certificate revocation list file.
    #[arg(long = "crl-path")]
    crl_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let mut cfg = RelayConfig::default();

        if let Some(port) = self.port {
            cfg.tls_port = port;
        }
        if let Some(port) = self.mesh_port {
            cfg.mesh_port = port;
        }
        if let Some(iface) = self.mesh_iface {
            cfg.mesh_interface = iface;
        }
        if let Some(group) = self.mesh_group {
            cfg.mesh_multicast = group;
        }
        if let Some(dir) = self.cert_dir {
            cfg.cert_dir = dir;
        }
        if let Some(dir) = self.key_dir {
            cfg.key_dir = dir;
        }
        if let Some(max) = self.max_clients {
            cfg.max_clients = max;
        }
        if let Some(difficulty) = self.pow_difficulty {
            cfg.pow_difficulty = difficulty;
        }
        if let Some(ca) = self.ca_pubkey {
            cfg.ca_pubkey_hex = ca;
        }
        if let Some(path) = self.crl_path {
            cfg.crl_path = Some(path);
        }

        cfg.allowed_cert_hashes = self
            .allowed_cert_hashes
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cfg = Arc::new(args.into_config());

    info!("BitChat relay daemon starting");
    info!(port = cfg.tls_port, "  TLS port");
    info!(port = cfg.mesh_port, group = %cfg.mesh_multicast, "  mesh port");
    info!(iface = %cfg.mesh_interface, "  mesh interface");
    info!(max = cfg.max_clients, "  max clients");
    info!(bits = cfg.pow_difficulty, "  PoW difficulty");
    info!(dir = %cfg.cert_dir.display(), "  cert directory");

    let auth = Arc::new(
        RelayAuth::load(&cfg.key_dir, &cfg.ca_pubkey_hex, cfg.crl_path.clone())
            .context("relay auth init failed")?,
    );
    auth.spawn_crl_reloader();

    info!(pubkey = %auth.public_key_hex(), "  relay identity");
    if auth.has_ca() {
        info!("  CA mode: enabled");
        if auth.has_certificate() {
            info!("  relay cert: loaded");
        } else {
            warn!("  relay cert: MISSING (run mesh-ca sign to issue one)");
        }
    } else {
        info!("  CA mode: disabled (open mesh)");
    }
    if cfg.attestation_enforced() {
        info!(allowed = cfg.allowed_cert_hashes.len(), "  APK attestation: enforced");
    } else {
        info!("  APK attestation: open (any app accepted)");
    }

    let router = Arc::new(Router::new(&cfg));

    match MeshLink::open(&cfg, Arc::clone(&auth)) {
        Ok(mesh) => {
            let mesh = Arc::new(mesh);
            router.set_mesh(Arc::clone(&mesh));
            mesh.spawn_recv_loop(Arc::clone(&router));
            info!(
                iface = %cfg.mesh_interface,
                group = %cfg.mesh_multicast,
                port = cfg.mesh_port,
                ca_verified = auth.has_ca(),
                "mesh link active"
            );
        }
        Err(err) => {
            warn!(error = %err, "mesh link unavailable");
            warn!("running in standalone mode (no inter-router forwarding)");
        }
    }

    let server = Server::bind(Arc::clone(&cfg), Arc::clone(&router))
        .await
        .context("server start failed")?;
    tokio::spawn(server.serve());

    tokio::signal::ctrl_c()
        .await
        .context("install shutdown handler")?;
    info!("received shutdown signal, exiting");

    Ok(())
}
