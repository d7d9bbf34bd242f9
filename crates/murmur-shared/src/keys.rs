use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

use crate::constants::{KDF_CONTEXT_FINGERPRINT, PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::error::KeyError;

/// Long-lived X25519 keypair of the local user.
///
/// The public half is published on the identity row; the private half only
/// ever goes to local durable storage.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
}

/// Private half of a [`KeyPair`], used to decrypt received messages.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore from a persisted private key
    pub fn from_private(private: &PrivateKey) -> Self {
        Self {
            secret: private.0.clone(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        DalekPublic::from(&self.secret).to_bytes()
    }

    /// Base64 public key as stored on the identity row
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key_bytes())
    }

    pub fn private_key(&self) -> PrivateKey {
        PrivateKey(self.secret.clone())
    }

    /// Short hex fingerprint of the public key, safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }
}

impl PrivateKey {
    /// Serialize for local durable storage
    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0.to_bytes())
    }

    pub fn from_b64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = decode_fixed::<SECRET_KEY_SIZE>(encoded)?;
        Ok(Self(StaticSecret::from(bytes)))
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.0
    }

    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        DalekPublic::from(&self.0).to_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Decode a base64 X25519 public key
pub fn public_key_from_b64(encoded: &str) -> Result<DalekPublic, KeyError> {
    decode_fixed::<PUBKEY_SIZE>(encoded).map(DalekPublic::from)
}

pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = blake3::derive_key(KDF_CONTEXT_FINGERPRINT, public_key);
    hex::encode(&hash[..8])
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], KeyError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}
