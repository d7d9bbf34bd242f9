pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod outbound;
pub mod presence;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod timers;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::EngineConfig;
pub use engine::{ChatEngine, EngineCommand, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use memory::{Fault, MemoryBackend};
pub use remote::{MessageStore, PresenceService, Remote, TeardownBeacon};
pub use session::{login, restore, Session};
pub use state::ChatState;

/// Install the log subscriber. `RUST_LOG` overrides the default filter.
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("murmur_client=debug,murmur_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
