mod pending;
mod replay;
mod store;

pub use pending::{PendingKind, PendingRequest, PendingRequestStore};
pub use replay::ReplayCache;
pub use store::{MemorySessionStore, Session, SessionError, SessionResult, SessionStore};
