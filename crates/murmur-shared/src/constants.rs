/// Application name
pub const APP_NAME: &str = "Murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Poly1305 tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext accepted by `encrypt_for`, in bytes.
///
/// Matches the single-block payload of RSA-4096 / OAEP / SHA-512
/// (512 - 2 * 64 - 2). Messages are never chunked.
pub const MAX_PLAINTEXT_SIZE: usize = 382;

/// Shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "Unable to decrypt message";

/// Shown in place of a self-authored message whose plaintext is not cached here.
pub const UNAVAILABLE_PLACEHOLDER: &str = "[sent from another session]";

/// Prefix of locally generated ids for optimistic messages.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Key derivation context for per-message keys (BLAKE3)
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "murmur-message-key-v1";

/// Key derivation context for public key fingerprints (BLAKE3)
pub const KDF_CONTEXT_FINGERPRINT: &str = "murmur-key-fingerprint-v1";

// -- Scheduling defaults (milliseconds unless noted) --

/// Identity heartbeat interval
pub const HEARTBEAT_INTERVAL_MS: u64 = 60_000;

/// Quiet period after the last keystroke before `is_typing = false` is sent
pub const TYPING_QUIET_MS: u64 = 3_000;

/// A received `is_typing = true` is dropped after this long without refresh
pub const TYPING_EXPIRY_MS: u64 = 6_000;

/// Poll loop delay after a success
pub const BACKOFF_INITIAL_MS: u64 = 1_000;

/// Poll loop delay growth per consecutive failure
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Poll loop delay ceiling
pub const BACKOFF_CAP_MS: u64 = 10_000;

/// Per data fetch timeout
pub const FETCH_TIMEOUT_MS: u64 = 5_000;

/// Per underlying transport call timeout
pub const TRANSPORT_TIMEOUT_MS: u64 = 10_000;

/// Attempts for the very first peer-list fetch
pub const INITIAL_FETCH_RETRIES: u32 = 3;

/// Delay between initial peer-list attempts
pub const INITIAL_FETCH_RETRY_DELAY_MS: u64 = 2_000;

/// Coalescing window for remote identity change notifications
pub const USER_LIST_DEBOUNCE_MS: u64 = 300;

// -- Conversation cache bounds --

/// Conversations retained before the least recently used one is evicted
pub const CACHE_MAX_CONVERSATIONS: usize = 64;

/// Newest messages retained per cached conversation
pub const CACHE_MAX_MESSAGES: usize = 500;
