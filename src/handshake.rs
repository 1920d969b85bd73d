//! Connection admission handshake.
//!
//! Server side of the four-step exchange run on every fresh TLS connection:
//!
//! 1. Client → HELLO (protocol version, peer ID, optional attestation hash)
//! 2. Relay  → CHALLENGE (32-byte nonce, difficulty)
//! 3. Client → SOLUTION (8-byte big-endian proof-of-work answer)
//! 4. Relay  → ACCEPT, or REJECT with a reason
//!
//! The caller bounds the whole exchange with the configured handshake
//! timeout. Protocol violations get a REJECT where feasible, then the
//! connection is dropped.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::pow::{generate_challenge, verify_pow, CHALLENGE_NONCE_LEN};
use crate::protocol::{
    read_frame, write_frame, FRAME_ACCEPT, FRAME_CHALLENGE, FRAME_HELLO, FRAME_REJECT,
    FRAME_SOLUTION, PROTOCOL_VERSION,
};

/// Length of the attestation (APK certificate) hash a client may append to
/// its HELLO payload.
const CERT_HASH_LEN: usize = 32;

/// Run the server side of the handshake. Returns the client's peer ID on
/// success; any error means the connection must be closed.
pub async fn perform_handshake<S>(stream: &mut S, cfg: &RelayConfig) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // --- Step 1: HELLO ---
    let hello = read_frame(stream, cfg.max_packet_size)
        .await
        .context("read HELLO")?;
    if hello.frame_type != FRAME_HELLO {
        bail!("expected HELLO (0x{FRAME_HELLO:02x}), got 0x{:02x}", hello.frame_type);
    }
    if hello.payload.len() < 3 {
        bail!("HELLO too short: {} bytes", hello.payload.len());
    }

    let version = u16::from_be_bytes([hello.payload[0], hello.payload[1]]);
    let peer_id_len = hello.payload[2] as usize;
    if 3 + peer_id_len > hello.payload.len() {
        bail!("HELLO peer-ID length overflows payload");
    }
    let peer_id = String::from_utf8_lossy(&hello.payload[3..3 + peer_id_len]).into_owned();

    if version != PROTOCOL_VERSION {
        let reason = format!("unsupported version {version}");
        let _ = write_frame(stream, FRAME_REJECT, reason.as_bytes()).await;
        bail!("unsupported protocol version {version}");
    }

    // --- Step 1b: attestation hash, enforced when an allowlist is set ---
    let cert_hash_offset = 3 + peer_id_len;
    if cert_hash_offset + CERT_HASH_LEN <= hello.payload.len() {
        let cert_hash =
            hex::encode(&hello.payload[cert_hash_offset..cert_hash_offset + CERT_HASH_LEN]);
        if cfg.attestation_enforced() {
            if !cfg.allowed_cert_hashes.contains(&cert_hash) {
                let _ = write_frame(stream, FRAME_REJECT, b"certificate not authorized").await;
                bail!("rejected cert hash {cert_hash} from peer {peer_id}");
            }
            info!(peer = %peer_id, hash = %&cert_hash[..16], "client cert hash verified");
        } else {
            debug!(peer = %peer_id, hash = %&cert_hash[..16], "client cert hash presented, enforcement off");
        }
    } else if cfg.attestation_enforced() {
        let _ = write_frame(stream, FRAME_REJECT, b"certificate hash required").await;
        bail!("peer {peer_id} did not provide cert hash (required)");
    }

    // --- Step 2: CHALLENGE ---
    let nonce = generate_challenge();
    let mut challenge = Vec::with_capacity(CHALLENGE_NONCE_LEN + 1);
    challenge.extend_from_slice(&nonce);
    challenge.push(cfg.pow_difficulty);
    write_frame(stream, FRAME_CHALLENGE, &challenge)
        .await
        .context("write CHALLENGE")?;

    // --- Step 3: SOLUTION ---
    let solution_frame = read_frame(stream, cfg.max_packet_size)
        .await
        .context("read SOLUTION")?;
    if solution_frame.frame_type != FRAME_SOLUTION {
        bail!(
            "expected SOLUTION (0x{FRAME_SOLUTION:02x}), got 0x{:02x}",
            solution_frame.frame_type
        );
    }
    let solution_bytes: [u8; 8] = solution_frame
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("SOLUTION wrong size: {} (expected 8)", solution_frame.payload.len()))?;
    let solution = u64::from_be_bytes(solution_bytes);

    // --- Step 4: verify proof of work ---
    if !verify_pow(&nonce, solution, cfg.pow_difficulty) {
        let _ = write_frame(stream, FRAME_REJECT, b"invalid proof of work").await;
        bail!("invalid PoW from peer {peer_id}");
    }

    // --- Step 5: accept ---
    write_frame(stream, FRAME_ACCEPT, &[])
        .await
        .context("write ACCEPT")?;

    Ok(peer_id)
}
