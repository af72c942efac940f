use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use p256::ecdsa::{SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

const NONCE_LEN: usize = 12;
const STATE_KEY_SALT: &[u8] = b"vigil-installation-state";

/// Identity material for one logical worker: a signing key that determines
/// the inbox id and an encryption key that seals local state.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    pub signing_key: String,
    pub encryption_key: String,
}

impl IdentityKeys {
    /// Builds keys from hex strings, rejecting anything that is not a valid
    /// P-256 scalar or a 32-byte encryption key.
    pub fn from_hex(signing_key: &str, encryption_key: &str) -> Result<Self, String> {
        let signing_bytes = hex::decode(signing_key.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        SigningKey::from_slice(&signing_bytes).map_err(|e| e.to_string())?;

        let encryption_bytes =
            hex::decode(encryption_key.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        if encryption_bytes.len() != 32 {
            return Err(format!(
                "encryption key must be 32 bytes, got {}",
                encryption_bytes.len()
            ));
        }

        Ok(Self {
            signing_key: hex::encode(signing_bytes),
            encryption_key: hex::encode(encryption_bytes),
        })
    }

    pub fn inbox_id(&self) -> Result<String, String> {
        derive_inbox_id(&self.signing_key)
    }
}

// Secrets stay out of logs.
impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys").finish_non_exhaustive()
    }
}

pub fn generate_identity_keys() -> IdentityKeys {
    let signing_key = SigningKey::random(&mut OsRng);

    let mut encryption_key = [0u8; 32];
    OsRng.fill_bytes(&mut encryption_key);

    IdentityKeys {
        signing_key: hex::encode(signing_key.to_bytes()),
        encryption_key: hex::encode(encryption_key),
    }
}

/// Inbox ids are the hex SHA-256 of the SEC1 public key, so the same signing
/// key always maps to the same inbox.
pub fn derive_inbox_id(signing_key_hex: &str) -> Result<String, String> {
    let signing_bytes = hex::decode(signing_key_hex).map_err(|e| e.to_string())?;
    let signing_key = SigningKey::from_slice(&signing_bytes).map_err(|e| e.to_string())?;
    let public_key = VerifyingKey::from(&signing_key);

    let digest = Sha256::digest(public_key.to_sec1_bytes());
    Ok(hex::encode(digest))
}

fn derive_state_key(encryption_key_hex: &str) -> Result<[u8; 32], String> {
    let key_bytes = hex::decode(encryption_key_hex).map_err(|e| e.to_string())?;

    let hk = Hkdf::<Sha256>::new(Some(STATE_KEY_SALT), &key_bytes);
    let mut okm = [0u8; 32];
    hk.expand(b"state", &mut okm).map_err(|e| e.to_string())?;

    Ok(okm)
}

/// Encrypts local state under the worker's encryption key. The random nonce
/// is prepended to the ciphertext.
pub fn seal(encryption_key_hex: &str, plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let key_material = derive_state_key(encryption_key_hex)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_material);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| e.to_string())?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(encryption_key_hex: &str, sealed: &[u8]) -> Result<Vec<u8>, String> {
    if sealed.len() < NONCE_LEN {
        return Err("sealed state is truncated".to_string());
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let key_material = derive_state_key(encryption_key_hex)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_material);
    let cipher = Aes256Gcm::new(key);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| e.to_string())
}
