//! Inter-relay mesh link.
//!
//! Relay daemons exchange signed UDP multicast datagrams over the
//! batman-adv interface. Outbound packets carry this relay's public key, an
//! Ed25519 signature over the payload, and (in CA mode) the relay's CA
//! certificate. Inbound packets run a short-circuiting pipeline: length,
//! self-echo, revocation, certificate, signature; only then does the
//! payload reach the router.
//!
//! Wire layouts (signature always covers the payload only):
//!
//! - CA mode:   `[32B pubkey][64B certificate][64B signature][payload]`
//! - Open mode: `[32B pubkey][64B signature][payload]`

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::auth::RelayAuth;
use crate::config::RelayConfig;
use crate::router::Router;

/// Sender public key prefix length.
pub const PUBKEY_LEN: usize = 32;
/// CA certificate length (an Ed25519 signature over the sender pubkey).
pub const CERT_LEN: usize = 64;
/// Packet signature length.
pub const SIG_LEN: usize = 64;
/// Open-mode header: `[pubkey][signature]`.
pub const OPEN_HEADER_LEN: usize = PUBKEY_LEN + SIG_LEN;
/// CA-mode header: `[pubkey][certificate][signature]`.
pub const CA_HEADER_LEN: usize = PUBKEY_LEN + CERT_LEN + SIG_LEN;

/// Receive buffer requested on the inbound socket.
const RECV_BUFFER_SIZE: usize = 1 << 20;

/// UDP multicast endpoints on the mesh interface plus the signing state
/// applied to every datagram.
pub struct MeshLink {
    send_sock: UdpSocket,
    recv_sock: UdpSocket,
    auth: Arc<RelayAuth>,
    max_packet_size: usize,
}

impl MeshLink {
    /// Open both mesh sockets on the configured interface. Fails when the
    /// interface is missing or carries no IPv4 address; the caller is
    /// expected to fall back to standalone mode.
    pub fn open(cfg: &RelayConfig, auth: Arc<RelayAuth>) -> Result<Self> {
        let local_ip = interface_ipv4(&cfg.mesh_interface)?;
        let group = SocketAddrV4::new(cfg.mesh_multicast, cfg.mesh_port);

        // Outbound: a unicast-source socket dialed to the group, pinned to
        // the mesh interface so packets never leave on another NIC.
        let send = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create mesh send socket")?;
        send.bind(&SocketAddr::new(IpAddr::V4(local_ip), 0).into())
            .with_context(|| format!("bind mesh send socket to {local_ip}"))?;
        send.set_multicast_if_v4(&local_ip)
            .context("pin multicast egress interface")?;
        send.connect(&SocketAddr::from(group).into())
            .with_context(|| format!("dial multicast group {group}"))?;
        send.set_nonblocking(true)?;

        // Inbound: bound to the group address and joined on the mesh
        // interface's IPv4 address.
        let recv = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create mesh recv socket")?;
        recv.set_reuse_address(true)?;
        if let Err(err) = recv.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!(error = %err, "could not enlarge mesh receive buffer");
        }
        recv.bind(&SocketAddr::from(group).into())
            .with_context(|| format!("bind multicast listener {group}"))?;
        recv.join_multicast_v4(&cfg.mesh_multicast, &local_ip)
            .with_context(|| format!("join multicast group {group}"))?;
        recv.set_nonblocking(true)?;

        Ok(Self {
            send_sock: UdpSocket::from_std(send.into()).context("register mesh send socket")?,
            recv_sock: UdpSocket::from_std(recv.into()).context("register mesh recv socket")?,
            auth,
            max_packet_size: cfg.max_packet_size,
        })
    }

    /// Sign `data` and transmit it to the multicast group. Send failures are
    /// logged and dropped; the sibling gossip layer redelivers.
    pub async fn send(&self, data: &[u8]) {
        let msg = encode_datagram(&self.auth, data);
        match self.send_sock.send(&msg).await {
            Ok(_) => {
                debug!(
                    bytes = data.len(),
                    ca_mode = self.auth.has_ca() && self.auth.has_certificate(),
                    "mesh send"
                );
            }
            Err(err) => warn!(error = %err, "mesh send failed"),
        }
    }

    /// Spawn the receive loop: authenticate each datagram and deliver the
    /// surviving payloads to the router. Runs until process shutdown.
    pub fn spawn_recv_loop(self: Arc<Self>, router: Arc<Router>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; self.max_packet_size + CA_HEADER_LEN];
            loop {
                let len = match self.recv_sock.recv_from(&mut buf).await {
                    Ok((len, _from)) => len,
                    Err(err) => {
                        warn!(error = %err, "mesh recv failed");
                        continue;
                    }
                };
                if let Some(payload) = authenticate_datagram(&self.auth, &buf[..len]) {
                    debug!(bytes = payload.len(), "mesh recv");
                    router.route_from_mesh(payload).await;
                }
            }
        })
    }
}

impl std::fmt::Debug for MeshLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLink")
            .field("send", &self.send_sock.local_addr().ok())
            .field("recv", &self.recv_sock.local_addr().ok())
            .finish()
    }
}

/// Build the signed wire form of `payload`. CA layout requires both a
/// configured CA and an issued certificate; otherwise the open layout is
/// used.
fn encode_datagram(auth: &RelayAuth, payload: &[u8]) -> Vec<u8> {
    let sig = auth.sign(payload);

    if let (true, Some(cert)) = (auth.has_ca(), auth.certificate()) {
        let mut msg = Vec::with_capacity(CA_HEADER_LEN + payload.len());
        msg.extend_from_slice(auth.public_key_bytes());
        msg.extend_from_slice(cert);
        msg.extend_from_slice(&sig);
        msg.extend_from_slice(payload);
        msg
    } else {
        let mut msg = Vec::with_capacity(OPEN_HEADER_LEN + payload.len());
        msg.extend_from_slice(auth.public_key_bytes());
        msg.extend_from_slice(&sig);
        msg.extend_from_slice(payload);
        msg
    }
}

/// Run the inbound trust pipeline over one datagram. Returns the payload
/// when every check passes, `None` when the packet must be dropped. Checks
/// short-circuit in a fixed order so revoked peers cost no signature
/// verification.
fn authenticate_datagram<'a>(auth: &RelayAuth, datagram: &'a [u8]) -> Option<&'a [u8]> {
    if datagram.len() <= OPEN_HEADER_LEN {
        return None;
    }

    let pubkey: [u8; PUBKEY_LEN] = datagram[..PUBKEY_LEN].try_into().expect("checked length");

    if auth.is_self(&pubkey) {
        trace!("mesh recv: own multicast echo");
        return None;
    }

    if auth.is_revoked(&pubkey) {
        warn!(pubkey = %&hex::encode(pubkey)[..16], "mesh recv: REVOKED key");
        return None;
    }

    if auth.has_ca() {
        if datagram.len() <= CA_HEADER_LEN {
            return None;
        }
        let cert = &datagram[PUBKEY_LEN..PUBKEY_LEN + CERT_LEN];
        let sig = &datagram[PUBKEY_LEN + CERT_LEN..CA_HEADER_LEN];
        let payload = &datagram[CA_HEADER_LEN..];

        if !auth.verify_certificate(&pubkey, cert) {
            warn!(pubkey = %&hex::encode(pubkey)[..16], "mesh recv: invalid CA cert");
            return None;
        }
        if !auth.verify(&pubkey, sig, payload) {
            debug!(pubkey = %&hex::encode(pubkey)[..16], "mesh recv: invalid signature");
            return None;
        }
        Some(payload)
    } else {
        let sig = &datagram[PUBKEY_LEN..OPEN_HEADER_LEN];
        let payload = &datagram[OPEN_HEADER_LEN..];

        if !auth.verify(&pubkey, sig, payload) {
            debug!(pubkey = %&hex::encode(pubkey)[..16], "mesh recv: invalid signature");
            return None;
        }
        Some(payload)
    }
}

/// Resolve a network interface name to its IPv4 address.
fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs().context("enumerate network interfaces")?;

    let mut found = false;
    for iface in &interfaces {
        if iface.name != name {
            continue;
        }
        found = true;
        if let IpAddr::V4(v4) = iface.ip() {
            return Ok(v4);
        }
    }

    if found {
        bail!("no IPv4 address on interface {name}");
    }
    bail!("interface {name} not found");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::fs;
    use tempfile::tempdir;

    fn open_auth() -> (RelayAuth, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let auth = RelayAuth::load(dir.path(), "", None).unwrap();
        (auth, dir)
    }

    /// Build a CA-mode relay: generate its identity, issue a certificate
    /// from `ca_key`, then reload with the CA root configured.
    fn ca_auth(ca_key: &SigningKey) -> (RelayAuth, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bootstrap = RelayAuth::load(dir.path(), "", None).unwrap();
        let cert = ca_key.sign(bootstrap.public_key_bytes()).to_bytes();
        fs::write(dir.path().join(crate::auth::RELAY_CERT_FILE), hex::encode(cert)).unwrap();

        let ca_hex = hex::encode(ca_key.verifying_key().to_bytes());
        let auth = RelayAuth::load(dir.path(), &ca_hex, None).unwrap();
        assert!(auth.has_ca() && auth.has_certificate());
        (auth, dir)
    }

    #[test]
    fn open_mode_roundtrip() {
        let (sender, _s) = open_auth();
        let (receiver, _r) = open_auth();

        let msg = encode_datagram(&sender, b"across the mesh");
        assert_eq!(msg.len(), OPEN_HEADER_LEN + 15);
        assert_eq!(authenticate_datagram(&receiver, &msg), Some(b"across the mesh".as_slice()));
    }

    #[test]
    fn ca_mode_roundtrip() {
        let ca_key = SigningKey::generate(&mut OsRng);
        let (sender, _s) = ca_auth(&ca_key);
        let (receiver, _r) = ca_auth(&ca_key);

        let msg = encode_datagram(&sender, b"certified");
        assert_eq!(msg.len(), CA_HEADER_LEN + 9);
        assert_eq!(authenticate_datagram(&receiver, &msg), Some(b"certified".as_slice()));
    }

    #[test]
    fn own_echo_is_dropped_unrouted() {
        let (auth, _d) = open_auth();
        let msg = encode_datagram(&auth, b"echo");
        assert_eq!(authenticate_datagram(&auth, &msg), None);
    }

    #[test]
    fn short_datagrams_are_dropped() {
        let (auth, _d) = open_auth();
        assert_eq!(authenticate_datagram(&auth, &[0u8; OPEN_HEADER_LEN]), None);
        assert_eq!(authenticate_datagram(&auth, b""), None);
    }

    #[test]
    fn ca_mode_requires_full_header() {
        let ca_key = SigningKey::generate(&mut OsRng);
        let (receiver, _r) = ca_auth(&ca_key);
        // Long enough for the open header but not the CA header.
        assert_eq!(authenticate_datagram(&receiver, &[7u8; CA_HEADER_LEN]), None);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let (sender, _s) = open_auth();
        let (receiver, _r) = open_auth();

        let mut msg = encode_datagram(&sender, b"untouched");
        let last = msg.len() - 1;
        msg[last] ^= 1;
        assert_eq!(authenticate_datagram(&receiver, &msg), None);
    }

    #[test]
    fn revoked_sender_is_dropped_despite_valid_signature() {
        let (sender, _s) = open_auth();

        let dir = tempdir().unwrap();
        let crl = dir.path().join("revoked.crl");
        fs::write(&crl, sender.public_key_hex()).unwrap();
        let receiver = RelayAuth::load(dir.path(), "", Some(crl.clone())).unwrap();

        let msg = encode_datagram(&sender, b"from a revoked relay");
        assert_eq!(authenticate_datagram(&receiver, &msg), None);

        // Lifting the revocation restores delivery after the next reload.
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&crl, "# empty\n").unwrap();
        receiver.reload_crl();
        assert!(authenticate_datagram(&receiver, &msg).is_some());
    }

    #[test]
    fn revocation_also_applies_in_ca_mode() {
        let ca_key = SigningKey::generate(&mut OsRng);
        let (sender, _s) = ca_auth(&ca_key);

        let dir = tempdir().unwrap();
        let crl = dir.path().join("revoked.crl");
        fs::write(&crl, sender.public_key_hex()).unwrap();

        let bootstrap = RelayAuth::load(dir.path(), "", None).unwrap();
        let cert = ca_key.sign(bootstrap.public_key_bytes()).to_bytes();
        fs::write(dir.path().join(crate::auth::RELAY_CERT_FILE), hex::encode(cert)).unwrap();
        let ca_hex = hex::encode(ca_key.verifying_key().to_bytes());
        let receiver = RelayAuth::load(dir.path(), &ca_hex, Some(crl)).unwrap();

        let msg = encode_datagram(&sender, b"revoked but certified");
        assert_eq!(authenticate_datagram(&receiver, &msg), None);
    }

    #[test]
    fn certificate_from_wrong_ca_is_rejected() {
        let real_ca = SigningKey::generate(&mut OsRng);
        let rogue_ca = SigningKey::generate(&mut OsRng);

        let (sender, _s) = ca_auth(&rogue_ca);
        let (receiver, _r) = ca_auth(&real_ca);

        let msg = encode_datagram(&sender, b"wrong issuer");
        assert_eq!(authenticate_datagram(&receiver, &msg), None);
    }

    #[test]
    fn open_receiver_rejects_unsigned_noise() {
        let (receiver, _r) = open_auth();
        let mut noise = vec![0xA5u8; OPEN_HEADER_LEN + 32];
        // Random pubkey, garbage signature.
        noise[0] = 0x01;
        assert_eq!(authenticate_datagram(&receiver, &noise), None);
    }
}
