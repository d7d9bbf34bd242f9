//! Login and session restore.
//!
//! A session is the local identity row plus the keypair whose public half is
//! published on it. Credentials live in [`LocalStorage`]; the private key is
//! never sent anywhere.

use chrono::Utc;
use murmur_shared::keys::{KeyPair, PrivateKey};
use murmur_shared::models::{Identity, IdentityPatch};
use murmur_store::LocalStorage;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::remote::{bounded, MessageStore};

/// An authenticated local user.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub keypair: KeyPair,
}

impl Session {
    pub fn private_key(&self) -> PrivateKey {
        self.keypair.private_key()
    }
}

/// Generate a keypair without blocking the runtime
pub async fn generate_keypair() -> EngineResult<KeyPair> {
    tokio::task::spawn_blocking(KeyPair::generate)
        .await
        .map_err(|e| EngineError::Auth(format!("key generation failed: {e}")))
}

/// Create or refresh the identity for `username` under a fresh keypair.
pub async fn login(
    store: &dyn MessageStore,
    storage: &dyn LocalStorage,
    username: &str,
    config: &EngineConfig,
) -> EngineResult<Session> {
    let username = username.trim();
    if username.is_empty() {
        return Err(EngineError::Auth("username must not be empty".into()));
    }

    let keypair = generate_keypair().await?;
    storage.set_username(username)?;
    storage.set_private_key(&keypair.private_key().to_b64())?;

    let limit = config.transport_timeout;
    let public_key = keypair.public_key_b64();
    let identity = match bounded(limit, store.find_identity_by_name(username)).await? {
        Some(mut existing) => {
            let patch = IdentityPatch {
                public_key: Some(public_key),
                ..IdentityPatch::presence(true, Utc::now())
            };
            bounded(limit, store.update_identity(existing.id, patch.clone())).await?;
            patch.apply_to(&mut existing);
            existing
        }
        None => bounded(limit, store.insert_identity(username, &public_key)).await?,
    };

    info!(
        user = %identity.id.short(),
        fingerprint = %keypair.fingerprint(),
        "logged in"
    );
    Ok(Session { identity, keypair })
}

/// Resume the session stored in `storage`.
///
/// Unusable credentials are cleared before the `Auth` error is returned.
/// Transport failures leave them in place.
pub async fn restore(
    store: &dyn MessageStore,
    storage: &dyn LocalStorage,
    config: &EngineConfig,
) -> EngineResult<Session> {
    let (Some(username), Some(encoded)) = (storage.username()?, storage.private_key()?) else {
        return Err(EngineError::Auth("no stored credentials".into()));
    };

    let private_key = match PrivateKey::from_b64(&encoded) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "stored private key is unusable");
            forget(storage);
            return Err(EngineError::Auth("stored key is corrupt".into()));
        }
    };
    let keypair = KeyPair::from_private(&private_key);

    let limit = config.transport_timeout;
    let Some(mut identity) = bounded(limit, store.find_identity_by_name(&username)).await? else {
        warn!(username = %username, "stored identity no longer exists");
        forget(storage);
        return Err(EngineError::Auth("identity no longer exists".into()));
    };

    let public_key = keypair.public_key_b64();
    if identity.public_key != public_key {
        info!(fingerprint = %keypair.fingerprint(), "re-publishing public key");
        let patch = IdentityPatch {
            public_key: Some(public_key),
            ..Default::default()
        };
        bounded(limit, store.update_identity(identity.id, patch.clone())).await?;
        patch.apply_to(&mut identity);
    }

    info!(user = %identity.id.short(), "session restored");
    Ok(Session { identity, keypair })
}

fn forget(storage: &dyn LocalStorage) {
    if let Err(e) = storage.clear_credentials() {
        warn!(error = %e, "failed to clear credentials");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use murmur_store::{Database, MemoryStorage};

    #[tokio::test]
    async fn test_login_registers_identity() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        let session = login(&backend, &storage, "  ana ", &EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(session.identity.display_name, "ana");
        assert_eq!(session.identity.public_key, session.keypair.public_key_b64());
        assert_eq!(storage.username().unwrap().as_deref(), Some("ana"));
        assert_eq!(
            storage.private_key().unwrap(),
            Some(session.private_key().to_b64())
        );
        assert!(backend.identity(session.identity.id).is_some());
    }

    #[tokio::test]
    async fn test_login_again_refreshes_key() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        let config = EngineConfig::default();
        let first = login(&backend, &storage, "ana", &config).await.unwrap();
        let second = login(&backend, &storage, "ana", &config).await.unwrap();

        assert_eq!(first.identity.id, second.identity.id);
        assert_ne!(first.identity.public_key, second.identity.public_key);
        let row = backend.identity(first.identity.id).unwrap();
        assert_eq!(row.public_key, second.keypair.public_key_b64());
        assert!(row.online);
    }

    #[tokio::test]
    async fn test_login_rejects_blank_username() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        let result = login(&backend, &storage, "   ", &EngineConfig::default()).await;
        assert!(matches!(result, Err(EngineError::Auth(_))));
        assert_eq!(storage.username().unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_resumes_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("murmur.db")).unwrap();
        let backend = MemoryBackend::new();
        let config = EngineConfig::default();
        let session = login(&backend, &db, "ana", &config).await.unwrap();

        let restored = restore(&backend, &db, &config).await.unwrap();
        assert_eq!(restored.identity.id, session.identity.id);
        assert_eq!(
            restored.keypair.public_key_b64(),
            session.keypair.public_key_b64()
        );
    }

    #[tokio::test]
    async fn test_restore_without_credentials_is_auth() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        let result = restore(&backend, &storage, &EngineConfig::default()).await;
        assert!(matches!(result, Err(EngineError::Auth(_))));
    }

    #[tokio::test]
    async fn test_restore_clears_credentials_of_deleted_identity() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        let config = EngineConfig::default();
        let session = login(&backend, &storage, "ana", &config).await.unwrap();
        backend.delete_identity(session.identity.id).await.unwrap();

        let result = restore(&backend, &storage, &config).await;
        assert!(matches!(result, Err(EngineError::Auth(_))));
        assert_eq!(storage.username().unwrap(), None);
        assert_eq!(storage.private_key().unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_clears_corrupt_key() {
        let backend = MemoryBackend::new();
        let storage = MemoryStorage::new();
        storage.set_username("ana").unwrap();
        storage.set_private_key("not a key").unwrap();

        let result = restore(&backend, &storage, &EngineConfig::default()).await;
        assert!(matches!(result, Err(EngineError::Auth(_))));
        assert_eq!(storage.private_key().unwrap(), None);
    }
}
