//! # parley-client
//!
//! The synchronization engine: keeps a local, eventually-consistent mirror
//! of a user's conversations and the active conversation's messages
//! against a server-authoritative chat backend, across reconnects,
//! reloads, and concurrent user actions.
//!
//! The engine is library-style: a UI layer drives it through the action
//! methods on [`SyncEngine`] and reads [`EngineSnapshot`].

pub mod api;
pub mod engine;
pub mod snapshot;

mod events;

pub use api::{ApiError, ConversationApi, ConversationQuery, HttpApi, MessagePage};
pub use engine::{EngineConfig, SyncEngine};
pub use snapshot::{EngineSnapshot, LoadingFlags};

use tracing_subscriber::{fmt, EnvFilter};

/// Opt-in tracing setup for binaries embedding the engine.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_client=debug,parley_net=debug,parley_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
