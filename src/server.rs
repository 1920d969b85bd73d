//! TLS session server.
//!
//! Accepts phone connections, terminates TLS 1.3, runs the admission
//! handshake, and hands accepted clients to the router as sessions. The
//! server credential is loaded from the certificate directory or, on first
//! run, generated as a self-signed P-256 certificate.
//!
//! Client certificates are not requested; client trust comes from the
//! proof-of-work handshake, optional attestation hashes, and the
//! application-layer signatures above this transport.

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::{create_private_dir, write_private_file};
use crate::config::RelayConfig;
use crate::handshake::perform_handshake;
use crate::router::Router;
use crate::session::{write_loop, ClientSession};

/// File name of the PEM server certificate inside the cert directory.
pub const TLS_CERT_FILE: &str = "relay.crt";

/// File name of the PEM server private key inside the cert directory.
pub const TLS_KEY_FILE: &str = "relay.key";

/// Common name on the auto-issued certificate. Fixed for client pinning.
const TLS_CERT_COMMON_NAME: &str = "bitchat-relay";

/// Validity of the auto-issued certificate.
const TLS_CERT_VALIDITY_DAYS: i64 = 10 * 365;

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// TLS listener plus everything needed to run accepted connections.
pub struct Server {
    cfg: Arc<RelayConfig>,
    router: Arc<Router>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl Server {
    /// Load or generate the TLS credential and bind the listen socket.
    /// Failures here are fatal; client service cannot start without them.
    pub async fn bind(cfg: Arc<RelayConfig>, router: Arc<Router>) -> Result<Self> {
        let (certs, key) = load_or_generate_cert(&cfg.cert_dir)?;

        let tls_config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("configure TLS 1.3")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("build TLS server config")?;

        let listener = TcpListener::bind(("0.0.0.0", cfg.tls_port))
            .await
            .with_context(|| format!("listen on port {}", cfg.tls_port))?;

        Ok(Self {
            cfg,
            router,
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. New connections are rejected outright while the session
    /// set is at capacity; everything else gets its own task.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "TLS server listening");
        }

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            if self.router.client_count() >= self.cfg.max_clients {
                warn!(
                    %peer_addr,
                    max_clients = self.cfg.max_clients,
                    "at capacity, rejecting connection"
                );
                drop(stream);
                continue;
            }

            let acceptor = self.acceptor.clone();
            let cfg = Arc::clone(&self.cfg);
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                handle_connection(acceptor, stream, peer_addr, cfg, router).await;
            });
        }
    }
}

/// One connection: TLS accept, bounded handshake, then session lifetime.
async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cfg: Arc<RelayConfig>,
    router: Arc<Router>,
) {
    let mut tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%peer_addr, error = %err, "TLS accept failed");
            return;
        }
    };

    let peer_id = match timeout(cfg.handshake_timeout, perform_handshake(&mut tls_stream, &cfg)).await
    {
        Err(_) => {
            warn!(%peer_addr, "handshake timed out");
            return;
        }
        Ok(Err(err)) => {
            warn!(%peer_addr, error = %err, "handshake failed");
            return;
        }
        Ok(Ok(peer_id)) => peer_id,
    };

    let (session, outbound_rx) = ClientSession::new(peer_id, peer_addr, &cfg);
    let (mut read_half, write_half) = tokio::io::split(tls_stream);

    tokio::spawn(write_loop(Arc::clone(&session), outbound_rx, write_half));
    router.add_session(Arc::clone(&session));

    session.read_loop(&mut read_half, &router, &cfg).await;
}

/// Load the TLS keypair from `cert_dir`, or generate a self-signed P-256
/// certificate valid for ten years and persist it (certificate world-readable,
/// key owner-only).
pub fn load_or_generate_cert(
    cert_dir: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = cert_dir.join(TLS_CERT_FILE);
    let key_path = cert_dir.join(TLS_KEY_FILE);

    if !cert_path.exists() {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("generate TLS key")?;

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
            .context("create certificate params")?;
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            rcgen::DnValue::Utf8String(TLS_CERT_COMMON_NAME.to_string()),
        );
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(TLS_CERT_VALIDITY_DAYS);
        params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .self_signed(&key_pair)
            .context("self-sign TLS certificate")?;

        create_private_dir(cert_dir)
            .with_context(|| format!("create cert dir {}", cert_dir.display()))?;
        fs::write(&cert_path, cert.pem())
            .with_context(|| format!("write {}", cert_path.display()))?;
        write_private_file(&key_path, key_pair.serialize_pem().as_bytes())
            .with_context(|| format!("write {}", key_path.display()))?;

        info!(path = %cert_path.display(), "generated self-signed TLS certificate");
    }

    let mut cert_reader = BufReader::new(
        fs::File::open(&cert_path).with_context(|| format!("open {}", cert_path.display()))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("parse {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in {}", cert_path.display());
    }

    let mut key_reader = BufReader::new(
        fs::File::open(&key_path).with_context(|| format!("open {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    Ok((certs, key))
}
