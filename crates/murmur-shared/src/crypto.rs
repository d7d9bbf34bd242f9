use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::constants::{
    KDF_CONTEXT_MESSAGE_KEY, MAX_PLAINTEXT_SIZE, NONCE_SIZE, PUBKEY_SIZE, TAG_SIZE,
    UNDECRYPTABLE_PLACEHOLDER,
};
use crate::error::CryptoError;
use crate::keys::{public_key_from_b64, PrivateKey};

pub type SymmetricKey = [u8; 32];

/// Outcome of [`decrypt_with`]. Decryption never fails loudly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    Plaintext(String),
    Undecryptable,
}

impl Decrypted {
    pub fn into_text(self) -> String {
        match self {
            Decrypted::Plaintext(text) => text,
            Decrypted::Undecryptable => UNDECRYPTABLE_PLACEHOLDER.to_string(),
        }
    }

    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Decrypted::Undecryptable)
    }
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// BLAKE3 KDF over the shared secret, bound to both public keys
fn derive_message_key(
    shared_secret: &[u8],
    ephemeral_pub: &[u8; PUBKEY_SIZE],
    recipient_pub: &[u8; PUBKEY_SIZE],
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(shared_secret);
    hasher.update(ephemeral_pub);
    hasher.update(recipient_pub);
    *hasher.finalize().as_bytes()
}

/// Encrypt `plaintext` so only the holder of `recipient_public_key_b64`'s
/// private half can read it.
///
/// Output is base64 of `ephemeral_pub (32) || nonce (24) || ciphertext`.
pub fn encrypt_for(plaintext: &str, recipient_public_key_b64: &str) -> Result<String, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(CryptoError::PlaintextTooLarge {
            len: plaintext.len(),
            max: MAX_PLAINTEXT_SIZE,
        });
    }

    let recipient =
        public_key_from_b64(recipient_public_key_b64).map_err(|_| CryptoError::InvalidPublicKey)?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let key = derive_message_key(shared.as_bytes(), &ephemeral_pub, recipient.as_bytes());
    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce_bytes = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(PUBKEY_SIZE + NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&ephemeral_pub);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(output))
}

/// Decrypt a message addressed to `private_key`.
///
/// Bad base64, truncated input, the wrong key and tampering all map to
/// [`Decrypted::Undecryptable`].
pub fn decrypt_with(ciphertext_b64: &str, private_key: &PrivateKey) -> Decrypted {
    let Ok(data) = STANDARD.decode(ciphertext_b64.trim()) else {
        return Decrypted::Undecryptable;
    };
    if data.len() < PUBKEY_SIZE + NONCE_SIZE + TAG_SIZE {
        return Decrypted::Undecryptable;
    }

    let (ephemeral_bytes, rest) = data.split_at(PUBKEY_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut ephemeral_pub = [0u8; PUBKEY_SIZE];
    ephemeral_pub.copy_from_slice(ephemeral_bytes);
    let shared = private_key
        .secret()
        .diffie_hellman(&PublicKey::from(ephemeral_pub));
    let own_pub = private_key.public_key_bytes();

    let key = derive_message_key(shared.as_bytes(), &ephemeral_pub, &own_pub);
    let cipher = XChaCha20Poly1305::new((&key).into());

    match cipher.decrypt(XNonce::from_slice(nonce_bytes), ciphertext) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Decrypted::Plaintext(text),
            Err(_) => Decrypted::Undecryptable,
        },
        Err(_) => Decrypted::Undecryptable,
    }
}
