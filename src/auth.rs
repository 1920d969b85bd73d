//! Inter-relay trust plane.
//!
//! Each relay holds a persistent Ed25519 keypair; the public key is its
//! stable mesh identity. Mesh packets are signed with the private key and,
//! when a certificate authority is configured, carry a 64-byte CA signature
//! over the sender's public key. Peers are screened against a revocation
//! list that is reloaded from disk while the daemon runs.
//!
//! Trust model:
//! - CA mode: a peer is accepted when its certificate verifies against the
//!   CA root and its key is not revoked. Verified certificates are cached
//!   positively for the life of the process; revocation is the negative
//!   channel.
//! - Open mode (no CA configured): any signed peer that is not our own echo
//!   and not revoked is accepted. Intentionally permissive; deployments
//!   that need peer authentication must configure a CA.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use lru::LruCache;
use rand::rngs::OsRng;
use tracing::{info, warn};

/// File name of the raw 64-byte Ed25519 keypair inside the key directory.
pub const RELAY_KEY_FILE: &str = "relay_ed25519.key";

/// File name of the hex-encoded CA signature over this relay's public key.
pub const RELAY_CERT_FILE: &str = "relay.cert";

/// Raw keypair size on disk: 32-byte seed followed by the 32-byte public key.
pub const RELAY_KEY_LEN: usize = ed25519_dalek::KEYPAIR_LENGTH;

/// Poll cadence for the revocation list file.
pub const CRL_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Verified peer certificates kept in the positive cache.
const CERT_CACHE_CAPACITY: usize = 1024;

/// Ed25519 identity, peer-certificate verification, and revocation state
/// for the mesh link. Internally synchronized; shared behind an `Arc`.
pub struct RelayAuth {
    signing_key: SigningKey,
    public_key: [u8; 32],
    certificate: Option<[u8; 64]>,
    ca_pubkey: Option<VerifyingKey>,

    revoked: RwLock<HashSet<String>>,
    crl_path: Option<PathBuf>,
    crl_mtime: Mutex<Option<SystemTime>>,

    // Positive-only memoization: hex is checked against `revoked` first, so
    // a cached-but-revoked peer is still rejected.
    cert_cache: Mutex<LruCache<[u8; 32], ()>>,
}

impl RelayAuth {
    /// Load the relay identity from `key_dir`, generating and persisting a
    /// fresh keypair on first run. Optionally decodes a hex CA public key,
    /// loads this relay's CA certificate, and performs the initial CRL load.
    ///
    /// A key file that exists but is not a valid 64-byte keypair is an error
    /// the operator must resolve; the key is only generated when absent.
    pub fn load(key_dir: &Path, ca_pubkey_hex: &str, crl_path: Option<PathBuf>) -> Result<Self> {
        let ca_pubkey = match ca_pubkey_hex.trim() {
            "" => None,
            hex_key => {
                let bytes = hex::decode(hex_key).context("CA public key is not valid hex")?;
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("CA public key must be 32 bytes"))?;
                Some(
                    VerifyingKey::from_bytes(&arr)
                        .context("CA public key is not a valid Ed25519 point")?,
                )
            }
        };

        let signing_key = load_or_generate_key(key_dir)?;
        let public_key = signing_key.verifying_key().to_bytes();

        let certificate = load_certificate(&key_dir.join(RELAY_CERT_FILE));

        let auth = Self {
            signing_key,
            public_key,
            certificate,
            ca_pubkey,
            revoked: RwLock::new(HashSet::new()),
            crl_path,
            crl_mtime: Mutex::new(None),
            cert_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CERT_CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        };
        auth.reload_crl();
        Ok(auth)
    }

    /// Sign mesh payload bytes with this relay's private key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a peer's packet signature. Malformed keys or signatures count
    /// as verification failure, never as an error.
    pub fn verify(&self, pubkey: &[u8], signature: &[u8], data: &[u8]) -> bool {
        let Ok(key_arr) = <[u8; 32]>::try_from(pubkey) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_arr) else {
            return false;
        };
        verifying_key
            .verify_strict(data, &Signature::from_bytes(&sig_arr))
            .is_ok()
    }

    /// True if `pubkey` is this relay's own key (multicast echo).
    pub fn is_self(&self, pubkey: &[u8]) -> bool {
        pubkey == self.public_key
    }

    /// True if `pubkey` appears on the revocation list.
    pub fn is_revoked(&self, pubkey: &[u8]) -> bool {
        self.revoked
            .read()
            .expect("revocation lock poisoned")
            .contains(&hex::encode(pubkey))
    }

    /// Verify a peer relay's certificate (the CA's signature over the peer's
    /// public key). A certificate that verified once is remembered, so
    /// steady-state packets skip the verification cost.
    pub fn verify_certificate(&self, pubkey: &[u8; 32], cert: &[u8]) -> bool {
        let Some(ca) = &self.ca_pubkey else {
            return false;
        };
        let Ok(sig_arr) = <[u8; 64]>::try_from(cert) else {
            return false;
        };

        if self
            .cert_cache
            .lock()
            .expect("cert cache lock poisoned")
            .get(pubkey)
            .is_some()
        {
            return true;
        }

        if ca
            .verify_strict(pubkey, &Signature::from_bytes(&sig_arr))
            .is_err()
        {
            return false;
        }

        self.cert_cache
            .lock()
            .expect("cert cache lock poisoned")
            .put(*pubkey, ());
        true
    }

    /// True when a CA root is configured (CA mesh mode).
    pub fn has_ca(&self) -> bool {
        self.ca_pubkey.is_some()
    }

    /// True when this relay holds a CA certificate over its own key.
    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    /// This relay's CA certificate, when present.
    pub fn certificate(&self) -> Option<&[u8; 64]> {
        self.certificate.as_ref()
    }

    /// This relay's 32-byte public key (its mesh identity).
    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Reload the CRL if its modification time advanced since the last load.
    /// A missing file is not an error; the current set is kept.
    pub fn reload_crl(&self) {
        let Some(path) = &self.crl_path else {
            return;
        };
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };
        let Ok(mtime) = metadata.modified() else {
            return;
        };

        {
            let last = self.crl_mtime.lock().expect("CRL mtime lock poisoned");
            if *last == Some(mtime) {
                return;
            }
        }

        let Ok(contents) = fs::read_to_string(path) else {
            return;
        };

        let new_revoked: HashSet<String> = contents
            .lines()
            .map(|line| line.trim().to_ascii_lowercase())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        let count = new_revoked.len();
        *self.revoked.write().expect("revocation lock poisoned") = new_revoked;
        *self.crl_mtime.lock().expect("CRL mtime lock poisoned") = Some(mtime);

        if count > 0 {
            info!(revoked = count, "CRL reloaded");
        }
    }

    /// Spawn the background task that polls the CRL file every
    /// [`CRL_RELOAD_INTERVAL`]. The task runs until the process shuts down.
    pub fn spawn_crl_reloader(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CRL_RELOAD_INTERVAL).await;
                auth.reload_crl();
            }
        })
    }
}

impl std::fmt::Debug for RelayAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayAuth")
            .field("public_key", &hex::encode(self.public_key))
            .field("has_ca", &self.has_ca())
            .field("has_certificate", &self.has_certificate())
            .finish_non_exhaustive()
    }
}

/// Load the keypair from disk, or generate one on first run. The key file
/// is written with owner-only permissions before any other state exists.
fn load_or_generate_key(key_dir: &Path) -> Result<SigningKey> {
    let key_path = key_dir.join(RELAY_KEY_FILE);

    if key_path.exists() {
        let data = fs::read(&key_path)
            .with_context(|| format!("read relay key {}", key_path.display()))?;
        let arr: [u8; RELAY_KEY_LEN] = data.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "relay key {} has {} bytes, expected {}; refusing to overwrite",
                key_path.display(),
                data.len(),
                RELAY_KEY_LEN
            )
        })?;
        let signing_key = SigningKey::from_keypair_bytes(&arr)
            .map_err(|_| anyhow::anyhow!("relay key {} is corrupt", key_path.display()))?;
        info!(
            pubkey = %&hex::encode(signing_key.verifying_key().to_bytes())[..16],
            "loaded relay signing key"
        );
        return Ok(signing_key);
    }

    let signing_key = SigningKey::generate(&mut OsRng);

    create_private_dir(key_dir)
        .with_context(|| format!("create key dir {}", key_dir.display()))?;
    write_private_file(&key_path, &signing_key.to_keypair_bytes())
        .with_context(|| format!("save relay key {}", key_path.display()))?;

    info!(
        pubkey = %&hex::encode(signing_key.verifying_key().to_bytes())[..16],
        "generated new relay signing key"
    );
    Ok(signing_key)
}

/// Load the hex-encoded CA signature over this relay's public key. A
/// malformed file is logged and ignored; the relay runs without a cert.
fn load_certificate(cert_path: &Path) -> Option<[u8; 64]> {
    let contents = fs::read_to_string(cert_path).ok()?;
    match hex::decode(contents.trim()) {
        Ok(bytes) => match <[u8; 64]>::try_from(bytes.as_slice()) {
            Ok(cert) => {
                info!("loaded relay certificate");
                Some(cert)
            }
            Err(_) => {
                warn!(path = %cert_path.display(), "invalid relay certificate file, running without cert");
                None
            }
        },
        Err(_) => {
            warn!(path = %cert_path.display(), "invalid relay certificate file, running without cert");
            None
        }
    }
}

pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Create the file with mode 0600 and write it in one shot. `create_new`
/// guarantees the key is written exactly once.
pub(crate) fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)
}
