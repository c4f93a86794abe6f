//! # Node Identity Generation and Persistence
//!
//! Every node carries two key pairs:
//!
//! | Kind | Scheme | Used for |
//! |------|--------|----------|
//! | consensus | BLS12-381 (`blst`, min_pk) | validator set membership |
//! | network | Ed25519 (`ed25519-dalek`) | peer id, enode URL, address |
//!
//! ## File Layout
//!
//! ```text
//! {workdir}/{node}/data/
//! ├── nodekey   # network private key, hex (0600)
//! ├── pub       # network public key, hex
//! ├── blskey    # consensus private key, hex (0600)
//! ├── blspub    # consensus public key, hex
//! └── addr      # derived address, hex
//! ```
//!
//! The `data` directory is created with mode `0700`. All writes use
//! `create(true).write(true).truncate(true)` followed by `flush()` and
//! `sync_all()`.
//!
//! ## Idempotence
//!
//! [`IdentityGenerator::ensure`] never generates twice for the same node.
//! Resolution order:
//!
//! 1. all four key files present: load, verify, compare with the stored identity
//! 2. identity already in the `NodeSpec`: restore it to disk
//! 3. otherwise: generate consensus + network pairs and persist them
//!
//! If the files on disk disagree with the stored identity,
//! [`IdentityError::Corruption`] is returned. No silent regeneration occurs.
//! Rotation is the explicit [`IdentityGenerator::regenerate`] call.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blst::min_pk as bls;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Identity, NodeSpec};

// ════════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════════

const NETWORK_KEY_FILE: &str = "nodekey";
const NETWORK_PUB_FILE: &str = "pub";
const CONSENSUS_KEY_FILE: &str = "blskey";
const CONSENSUS_PUB_FILE: &str = "blspub";
const ADDRESS_FILE: &str = "addr";

const KEY_FILES: [&str; 4] = [
    NETWORK_KEY_FILE,
    NETWORK_PUB_FILE,
    CONSENSUS_KEY_FILE,
    CONSENSUS_PUB_FILE,
];

// ════════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════════

/// Identity generation and persistence failures.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The key-generation primitive failed.
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Reading or writing an identity file failed.
    #[error("identity I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk keys disagree with each other or with the stored identity.
    #[error("identity corruption: {0}")]
    Corruption(String),

    /// A key file does not contain a valid key.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// KEY GENERATION
// ════════════════════════════════════════════════════════════════════════════════

/// Which of the two key pairs to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Consensus,
    Network,
}

/// Hex-encoded key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Key-generation primitive.
///
/// The default implementation uses real curves; tests substitute counting
/// or failing generators.
pub trait KeyGenerator: Send + Sync {
    /// Produces a fresh key pair of the given kind.
    fn generate(&self, kind: KeyKind) -> Result<KeyPair, IdentityError>;

    /// Checks that `pair.public_key` belongs to `pair.private_key`.
    fn verify(&self, _kind: KeyKind, _pair: &KeyPair) -> Result<(), IdentityError> {
        Ok(())
    }
}

/// BLS12-381 consensus keys and Ed25519 network keys from `OsRng`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyGenerator;

impl DefaultKeyGenerator {
    fn bls_public(secret: &[u8]) -> Result<String, IdentityError> {
        let sk = bls::SecretKey::from_bytes(secret)
            .map_err(|e| IdentityError::InvalidKey(format!("bls secret: {:?}", e)))?;
        Ok(hex::encode(sk.sk_to_pk().to_bytes()))
    }

    fn ed25519_public(secret: &[u8]) -> Result<String, IdentityError> {
        let seed: [u8; 32] = secret.try_into().map_err(|_| {
            IdentityError::InvalidKey(format!(
                "network secret must be 32 bytes, got {}",
                secret.len()
            ))
        })?;
        let signing_key = SigningKey::from_bytes(&seed);
        Ok(hex::encode(signing_key.verifying_key().to_bytes()))
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn generate(&self, kind: KeyKind) -> Result<KeyPair, IdentityError> {
        let mut ikm = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut ikm)
            .map_err(|e| IdentityError::Generation(format!("OsRng failed: {}", e)))?;

        match kind {
            KeyKind::Consensus => {
                let sk = bls::SecretKey::key_gen(&ikm, &[])
                    .map_err(|e| IdentityError::Generation(format!("bls key_gen: {:?}", e)))?;
                Ok(KeyPair {
                    private_key: hex::encode(sk.to_bytes()),
                    public_key: hex::encode(sk.sk_to_pk().to_bytes()),
                })
            }
            KeyKind::Network => {
                let signing_key = SigningKey::from_bytes(&ikm);
                Ok(KeyPair {
                    private_key: hex::encode(ikm),
                    public_key: hex::encode(signing_key.verifying_key().to_bytes()),
                })
            }
        }
    }

    fn verify(&self, kind: KeyKind, pair: &KeyPair) -> Result<(), IdentityError> {
        let secret = hex::decode(&pair.private_key)
            .map_err(|e| IdentityError::InvalidKey(format!("{:?} private key: {}", kind, e)))?;
        let derived = match kind {
            KeyKind::Consensus => Self::bls_public(&secret)?,
            KeyKind::Network => Self::ed25519_public(&secret)?,
        };
        if derived != pair.public_key {
            return Err(IdentityError::Corruption(format!(
                "{:?} public key does not match its private key",
                kind
            )));
        }
        Ok(())
    }
}

/// Address derived from a network public key: last 20 bytes of
/// SHA3-256 over the raw key bytes, lowercase hex.
pub fn derive_address(network_public_key: &str) -> Result<String, IdentityError> {
    let raw = hex::decode(network_public_key)
        .map_err(|e| IdentityError::InvalidKey(format!("network public key: {}", e)))?;
    let digest = Sha3_256::digest(&raw);
    Ok(hex::encode(&digest[12..]))
}

// ════════════════════════════════════════════════════════════════════════════════
// GENERATOR
// ════════════════════════════════════════════════════════════════════════════════

/// Ensures every node has exactly one persisted identity.
pub struct IdentityGenerator {
    workdir: PathBuf,
    keys: Arc<dyn KeyGenerator>,
}

impl IdentityGenerator {
    pub fn new(workdir: impl Into<PathBuf>, keys: Arc<dyn KeyGenerator>) -> Self {
        Self {
            workdir: workdir.into(),
            keys,
        }
    }

    /// Local identity directory of a node.
    pub fn node_dir(&self, node_name: &str) -> PathBuf {
        self.workdir.join(node_name).join("data")
    }

    /// Returns the node's identity, generating it only if none exists yet.
    pub fn ensure(&self, node: &NodeSpec) -> Result<Identity, IdentityError> {
        let dir = self.node_dir(&node.name);
        let present: Vec<&str> = KEY_FILES
            .iter()
            .copied()
            .filter(|f| dir.join(f).is_file())
            .collect();

        if present.len() == KEY_FILES.len() {
            let on_disk = self.load(&dir)?;
            if let Some(stored) = &node.identity {
                if *stored != on_disk {
                    return Err(IdentityError::Corruption(format!(
                        "keys in {} differ from the identity stored for '{}'",
                        dir.display(),
                        node.name
                    )));
                }
            }
            debug!(node = %node.name, "identity loaded from disk");
            return Ok(on_disk);
        }

        if let Some(stored) = &node.identity {
            info!(node = %node.name, "restoring stored identity to disk");
            self.verify(stored)?;
            self.save(&dir, stored)?;
            return Ok(stored.clone());
        }

        if !present.is_empty() {
            warn!(
                node = %node.name,
                present = ?present,
                "incomplete key set on disk, generating a fresh identity"
            );
        }

        let identity = self.generate()?;
        self.save(&dir, &identity)?;
        info!(node = %node.name, address = %identity.address, "identity generated");
        Ok(identity)
    }

    /// Removes a node's key files and generates a fresh identity.
    pub fn regenerate(&self, node: &NodeSpec) -> Result<Identity, IdentityError> {
        let dir = self.node_dir(&node.name);
        for file in KEY_FILES.iter().chain(std::iter::once(&ADDRESS_FILE)) {
            match fs::remove_file(dir.join(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let identity = self.generate()?;
        self.save(&dir, &identity)?;
        warn!(node = %node.name, address = %identity.address, "identity rotated");
        Ok(identity)
    }

    fn generate(&self) -> Result<Identity, IdentityError> {
        let consensus = self.keys.generate(KeyKind::Consensus)?;
        let network = self.keys.generate(KeyKind::Network)?;
        let address = derive_address(&network.public_key)?;
        Ok(Identity {
            consensus_private_key: consensus.private_key,
            consensus_public_key: consensus.public_key,
            network_private_key: network.private_key,
            network_public_key: network.public_key,
            address,
        })
    }

    fn verify(&self, identity: &Identity) -> Result<(), IdentityError> {
        self.keys.verify(
            KeyKind::Consensus,
            &KeyPair {
                private_key: identity.consensus_private_key.clone(),
                public_key: identity.consensus_public_key.clone(),
            },
        )?;
        self.keys.verify(
            KeyKind::Network,
            &KeyPair {
                private_key: identity.network_private_key.clone(),
                public_key: identity.network_public_key.clone(),
            },
        )
    }

    fn load(&self, dir: &Path) -> Result<Identity, IdentityError> {
        let network_public_key = read_key(dir, NETWORK_PUB_FILE)?;
        let identity = Identity {
            consensus_private_key: read_key(dir, CONSENSUS_KEY_FILE)?,
            consensus_public_key: read_key(dir, CONSENSUS_PUB_FILE)?,
            network_private_key: read_key(dir, NETWORK_KEY_FILE)?,
            address: derive_address(&network_public_key)?,
            network_public_key,
        };
        self.verify(&identity)?;

        // addr is informational, a stale one is rewritten
        let addr_path = dir.join(ADDRESS_FILE);
        let stored_addr = fs::read_to_string(&addr_path).ok();
        if stored_addr.as_deref().map(str::trim) != Some(identity.address.as_str()) {
            write_file(&addr_path, identity.address.as_bytes(), false)?;
        }
        Ok(identity)
    }

    fn save(&self, dir: &Path, identity: &Identity) -> Result<(), IdentityError> {
        ensure_directory(dir)?;
        write_file(&dir.join(NETWORK_KEY_FILE), identity.network_private_key.as_bytes(), true)?;
        write_file(&dir.join(NETWORK_PUB_FILE), identity.network_public_key.as_bytes(), false)?;
        write_file(&dir.join(CONSENSUS_KEY_FILE), identity.consensus_private_key.as_bytes(), true)?;
        write_file(&dir.join(CONSENSUS_PUB_FILE), identity.consensus_public_key.as_bytes(), false)?;
        write_file(&dir.join(ADDRESS_FILE), identity.address.as_bytes(), false)?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// FILE HELPERS
// ════════════════════════════════════════════════════════════════════════════════

fn read_key(dir: &Path, file: &str) -> Result<String, IdentityError> {
    let raw = fs::read_to_string(dir.join(file))?;
    let key = raw.trim().to_string();
    if key.is_empty() || hex::decode(&key).is_err() {
        return Err(IdentityError::InvalidKey(format!(
            "{} does not contain hex key material",
            file
        )));
    }
    Ok(key)
}

fn ensure_directory(dir: &Path) -> Result<(), io::Error> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        set_permission(dir, 0o700)?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<(), io::Error> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.flush()?;
    file.sync_all()?;
    if secret {
        set_permission(path, 0o600)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_permission(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permission(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::node;
    use crate::model::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
    }

    impl KeyGenerator for CountingGenerator {
        fn generate(&self, kind: KeyKind) -> Result<KeyPair, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DefaultKeyGenerator.generate(kind)
        }

        fn verify(&self, kind: KeyKind, pair: &KeyPair) -> Result<(), IdentityError> {
            DefaultKeyGenerator.verify(kind, pair)
        }
    }

    struct FailingGenerator;

    impl KeyGenerator for FailingGenerator {
        fn generate(&self, _kind: KeyKind) -> Result<KeyPair, IdentityError> {
            Err(IdentityError::Generation("entropy unavailable".into()))
        }
    }

    fn generator(dir: &Path) -> (IdentityGenerator, Arc<CountingGenerator>) {
        let counting = Arc::new(CountingGenerator {
            calls: AtomicUsize::new(0),
        });
        (IdentityGenerator::new(dir, counting.clone()), counting)
    }

    #[test]
    fn default_generator_produces_expected_key_sizes() {
        let bls_pair = DefaultKeyGenerator.generate(KeyKind::Consensus).expect("bls");
        assert_eq!(bls_pair.private_key.len(), 64);
        assert_eq!(bls_pair.public_key.len(), 96);

        let ed_pair = DefaultKeyGenerator.generate(KeyKind::Network).expect("ed25519");
        assert_eq!(ed_pair.private_key.len(), 64);
        assert_eq!(ed_pair.public_key.len(), 64);

        assert!(DefaultKeyGenerator.verify(KeyKind::Consensus, &bls_pair).is_ok());
        assert!(DefaultKeyGenerator.verify(KeyKind::Network, &ed_pair).is_ok());
    }

    #[test]
    fn verify_detects_mismatched_pair() {
        let a = DefaultKeyGenerator.generate(KeyKind::Network).expect("a");
        let b = DefaultKeyGenerator.generate(KeyKind::Network).expect("b");
        let mixed = KeyPair {
            private_key: a.private_key,
            public_key: b.public_key,
        };
        assert!(matches!(
            DefaultKeyGenerator.verify(KeyKind::Network, &mixed),
            Err(IdentityError::Corruption(_))
        ));
    }

    #[test]
    fn address_is_last_20_bytes_of_sha3() {
        let addr = derive_address(&"00".repeat(32)).expect("addr");
        assert_eq!(addr.len(), 40);
        let digest = Sha3_256::digest([0u8; 32]);
        assert_eq!(addr, hex::encode(&digest[12..]));
    }

    #[test]
    fn ensure_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, counting) = generator(tmp.path());
        let n = node("val-1", "h", Role::validator(), 0);

        let first = gen.ensure(&n).expect("first");
        let second = gen.ensure(&n).expect("second");

        assert_eq!(first, second);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2, "one consensus + one network");
    }

    #[test]
    fn ensure_writes_all_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, _) = generator(tmp.path());
        let n = node("val-1", "h", Role::validator(), 0);
        let id = gen.ensure(&n).expect("ensure");

        let dir = gen.node_dir("val-1");
        for f in ["nodekey", "pub", "blskey", "blspub", "addr"] {
            assert!(dir.join(f).is_file(), "{} missing", f);
        }
        let addr = fs::read_to_string(dir.join("addr")).expect("read addr");
        assert_eq!(addr, id.address);
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, _) = generator(tmp.path());
        gen.ensure(&node("v", "h", Role::validator(), 0)).expect("ensure");
        let dir = gen.node_dir("v");
        let mode = fs::metadata(dir.join("nodekey")).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(&dir).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn stored_identity_is_restored_without_generation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let seed_dir = tempfile::tempdir().expect("tempdir");
        let (seed_gen, _) = generator(seed_dir.path());
        let mut n = node("v", "h", Role::validator(), 0);
        n.identity = Some(seed_gen.ensure(&n).expect("seed"));

        let (gen, counting) = generator(tmp.path());
        let restored = gen.ensure(&n).expect("restore");
        assert_eq!(Some(restored), n.identity);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        assert!(gen.node_dir("v").join("blskey").is_file());
    }

    #[test]
    fn disagreement_with_stored_identity_is_corruption() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, _) = generator(tmp.path());
        let mut n = node("v", "h", Role::validator(), 0);
        gen.ensure(&n).expect("ensure");

        let other = tempfile::tempdir().expect("tempdir");
        let (other_gen, _) = generator(other.path());
        n.identity = Some(other_gen.ensure(&n).expect("other"));

        assert!(matches!(gen.ensure(&n), Err(IdentityError::Corruption(_))));
    }

    #[test]
    fn tampered_public_key_is_corruption() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, _) = generator(tmp.path());
        let n = node("v", "h", Role::validator(), 0);
        gen.ensure(&n).expect("ensure");

        let other = DefaultKeyGenerator.generate(KeyKind::Network).expect("other");
        fs::write(gen.node_dir("v").join("pub"), other.public_key).expect("tamper");
        assert!(matches!(gen.ensure(&n), Err(IdentityError::Corruption(_))));
    }

    #[test]
    fn regenerate_rotates_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gen, counting) = generator(tmp.path());
        let n = node("v", "h", Role::validator(), 0);
        let before = gen.ensure(&n).expect("ensure");
        let after = gen.regenerate(&n).expect("regenerate");
        assert_ne!(before.network_public_key, after.network_public_key);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 4);
        assert_eq!(gen.ensure(&n).expect("reload"), after);
    }

    #[test]
    fn generation_failure_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let gen = IdentityGenerator::new(tmp.path(), Arc::new(FailingGenerator));
        let err = gen
            .ensure(&node("v", "h", Role::validator(), 0))
            .expect_err("must fail");
        assert!(matches!(err, IdentityError::Generation(_)));
    }
}
