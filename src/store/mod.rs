//! Hierarchical coordination store: a small service offering ephemeral
//! nodes, watches, and CAS-style creates over TCP, plus the thin client
//! capability wrapper the rest of the core is written against.

mod message;
mod service;
mod session;

pub use message::{Stat, WatchEvent, WatchKind, Xid};
pub use service::StoreService;
pub use session::{StoreSession, WatchRx};

pub(crate) use message::{StoreFault, StoreReply, StoreRequest};
