// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node identity: an Ed25519 keypair persisted at `data_dir/node_identity.key`,
//! optionally encrypted at rest with `MYCO_KEY_PASSPHRASE`.
//!
//! ## On-disk format
//! `MAGIC(8) || SALT(16) || NONCE(12) || CIPHERTEXT+TAG(..)` when a passphrase
//! is configured; bare PKCS#8 bytes otherwise.

use std::fs;
use std::io::Write;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use ring::aead;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use thiserror::Error;
use zeroize::Zeroize;

use crate::core::types::{NodeId, Signature};

const KEY_FILE_MAGIC: &[u8] = b"MYCOKEY1";
const KEY_SALT_LEN: usize = 16;
const KEY_NONCE_LEN: usize = 12;
const PBKDF2_ITERS_DEFAULT: u32 = 100_000;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// File I/O failed.
    #[error("identity io")]
    Io,
    /// Key bytes could not be parsed as PKCS#8 Ed25519.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Key file is encrypted and no passphrase was configured.
    #[error("missing passphrase (set MYCO_KEY_PASSPHRASE)")]
    MissingPassphrase,
    /// AEAD seal/open or key derivation failed.
    #[error("crypto")]
    Crypto,
    /// Signature verification failed.
    #[error("bad signature")]
    BadSignature,
}

fn pbkdf2_iters() -> NonZeroU32 {
    let iters = std::env::var("MYCO_PBKDF2_ITERS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(PBKDF2_ITERS_DEFAULT)
        .clamp(10_000, 10_000_000);
    NonZeroU32::new(iters).expect("nonzero after clamp")
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| IdentityError::Io)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| IdentityError::Io)?;
        f.write_all(bytes).map_err(|_| IdentityError::Io)?;
        let _ = f.sync_all();
    }
    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| IdentityError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

fn derive_key(passphrase: &[u8], salt: &[u8; KEY_SALT_LEN]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, pbkdf2_iters(), salt, passphrase, &mut out);
    out
}

fn encrypt(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, IdentityError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; KEY_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| IdentityError::Crypto)?;
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| IdentityError::Crypto)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_key(passphrase, &salt);
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| IdentityError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    less_safe
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| IdentityError::Crypto)?;
    key.zeroize();

    let mut out = Vec::with_capacity(KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + in_out.len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt(passphrase: &[u8], bytes: &[u8]) -> Result<Vec<u8>, IdentityError> {
    let header = KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN;
    if bytes.len() < header + 16 {
        return Err(IdentityError::InvalidKey);
    }
    let mut salt = [0u8; KEY_SALT_LEN];
    salt.copy_from_slice(&bytes[KEY_FILE_MAGIC.len()..KEY_FILE_MAGIC.len() + KEY_SALT_LEN]);
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    nonce_bytes.copy_from_slice(&bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN..header]);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_key(passphrase, &salt);
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| IdentityError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let mut in_out = bytes[header..].to_vec();
    let plain = less_safe
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| IdentityError::Crypto)?;
    key.zeroize();
    Ok(plain.to_vec())
}

/// A node's long-lived Ed25519 identity.
pub struct Identity {
    keypair: Ed25519KeyPair,
    node_id: NodeId,
}

impl Identity {
    /// Load `data_dir/node_identity.key`, creating it with a freshly
    /// generated keypair if absent. Honors `MYCO_KEY_PASSPHRASE` for
    /// encryption at rest.
    pub fn load_or_create(data_dir: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path: PathBuf = data_dir.as_ref().join("node_identity.key");
        let passphrase = std::env::var("MYCO_KEY_PASSPHRASE").ok();

        if path.exists() {
            let bytes = fs::read(&path).map_err(|_| IdentityError::Io)?;
            let pkcs8 = if bytes.starts_with(KEY_FILE_MAGIC) {
                let pass = passphrase.ok_or(IdentityError::MissingPassphrase)?;
                decrypt(pass.as_bytes(), &bytes)?
            } else {
                bytes
            };
            return Self::from_pkcs8(&pkcs8);
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::InvalidKey)?;
        let mut plain = pkcs8.as_ref().to_vec();

        let on_disk = if let Some(pass) = passphrase.as_deref() {
            let enc = encrypt(pass.as_bytes(), &plain)?;
            plain.zeroize();
            enc
        } else {
            plain.clone()
        };
        atomic_write_private(&path, &on_disk)?;
        let identity = Self::from_pkcs8(pkcs8.as_ref());
        plain.zeroize();
        identity
    }

    /// Deterministic identity from a 32-byte seed, for reproducible
    /// multi-node simulations. Never available outside the `simulation`
    /// feature — production nodes must not be able to derive each other's
    /// keys from a known seed.
    #[cfg(feature = "simulation")]
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, IdentityError> {
        let kp = Ed25519KeyPair::from_seed_unchecked(&seed).map_err(|_| IdentityError::InvalidKey)?;
        let node_id = node_id_from_keypair(&kp);
        Ok(Self { keypair: kp, node_id })
    }

    fn from_pkcs8(bytes: &[u8]) -> Result<Self, IdentityError> {
        let kp = Ed25519KeyPair::from_pkcs8(bytes).map_err(|_| IdentityError::InvalidKey)?;
        let node_id = node_id_from_keypair(&kp);
        Ok(Self { keypair: kp, node_id })
    }

    /// This node's identity, derived from its public key.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Sign `msg` with the node's Ed25519 key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.keypair.sign(msg).as_ref().to_vec())
    }
}

fn node_id_from_keypair(kp: &Ed25519KeyPair) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(kp.public_key().as_ref());
    NodeId::from_bytes(bytes)
}

/// Verify `sig` over `msg` under `node`'s public key.
pub fn verify(node: NodeId, msg: &[u8], sig: &Signature) -> Result<(), IdentityError> {
    if sig.0.len() != 64 {
        return Err(IdentityError::BadSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, node.as_bytes());
    pk.verify(msg, &sig.0).map_err(|_| IdentityError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_persists_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = Identity::load_or_create(dir.path()).unwrap();
        let id2 = Identity::load_or_create(dir.path()).unwrap();
        assert_eq!(id1.node_id(), id2.node_id());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load_or_create(dir.path()).unwrap();
        let sig = id.sign(b"hello mesh");
        verify(id.node_id(), b"hello mesh", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load_or_create(dir.path()).unwrap();
        let sig = id.sign(b"hello mesh");
        assert!(verify(id.node_id(), b"goodbye mesh", &sig).is_err());
    }

    #[test]
    fn encrypted_key_requires_passphrase_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MYCO_KEY_PASSPHRASE", "correct horse battery staple");
        let id1 = Identity::load_or_create(dir.path()).unwrap();
        std::env::remove_var("MYCO_KEY_PASSPHRASE");

        let err = Identity::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::MissingPassphrase));

        std::env::set_var("MYCO_KEY_PASSPHRASE", "correct horse battery staple");
        let id2 = Identity::load_or_create(dir.path()).unwrap();
        std::env::remove_var("MYCO_KEY_PASSPHRASE");
        assert_eq!(id1.node_id(), id2.node_id());
    }
}
