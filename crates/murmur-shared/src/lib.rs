//! # murmur-shared
//!
//! Types, key material and the message codec shared by the Murmur store and
//! client crates.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod models;
pub mod types;

pub use crypto::{decrypt_with, encrypt_for, Decrypted};
pub use keys::{KeyPair, PrivateKey};
