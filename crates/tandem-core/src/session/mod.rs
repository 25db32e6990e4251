pub mod memory;
pub mod persist;
pub mod state;
pub mod store;

use thiserror::Error;

pub use memory::{EvictTrigger, MemoryGovernor, MemoryPressure};
pub use persist::PersistenceManager;
pub use state::{
    ChatMessage, MessageRole, Session, SessionId, SessionState, StreamHandle, TraceEntry, TraceKind,
};
pub use store::{SessionStore, StoreSnapshot};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(SessionId),
}
