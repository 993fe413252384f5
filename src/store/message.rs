//! Coordination store wire protocol types.

use serde::{Deserialize, Serialize};

/// Client-chosen request correlation ID; unique per session.
pub type Xid = u64;

/// Metadata attached to a node.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize,
)]
pub struct Stat {
    /// Number of `set()`s applied to the node since creation.
    pub version: u64,
}

/// Which aspect of a node a watch subscription covers.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum WatchKind {
    /// The node's data changed (or the node was deleted).
    Data,

    /// The node's set of children changed.
    Children,
}

/// One firing of a watch subscription, pushed by the service.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: String,
}

/// Client -> service requests.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum StoreRequest {
    /// Create an ephemeral node owned by this session; fails if the path
    /// exists.
    Register {
        xid: Xid,
        path: String,
        data: Vec<u8>,
    },

    /// Create a persistent node; fails if the path exists.
    Create {
        xid: Xid,
        path: String,
        data: Vec<u8>,
    },

    /// Overwrite an existing node's data.
    Set {
        xid: Xid,
        path: String,
        data: Vec<u8>,
    },

    /// Read a node, optionally arming a data watch.
    Get { xid: Xid, path: String, watch: bool },

    /// List a node's children, optionally arming a children watch.
    Children { xid: Xid, path: String, watch: bool },

    /// Graceful session end; ephemerals are removed before the reply.
    Close { xid: Xid },
}

/// Faults a request can come back with; anything harsher kills the
/// connection instead.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum StoreFault {
    NodeExists,
    NoNode,
}

/// Service -> client replies and pushed watch events.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum StoreReply {
    /// Reply to Register / Create / Set.
    Stat {
        xid: Xid,
        result: Result<Stat, StoreFault>,
    },

    /// Reply to Get.
    Data {
        xid: Xid,
        result: Result<(Vec<u8>, Stat), StoreFault>,
    },

    /// Reply to Children.
    Children {
        xid: Xid,
        result: Result<Vec<String>, StoreFault>,
    },

    /// Reply to Close.
    Closed { xid: Xid },

    /// Pushed watch firing; not correlated to a request.
    Event(WatchEvent),
}

impl StoreReply {
    /// Correlation ID of a reply; `None` for pushed events.
    pub(crate) fn xid(&self) -> Option<Xid> {
        match self {
            StoreReply::Stat { xid, .. }
            | StoreReply::Data { xid, .. }
            | StoreReply::Children { xid, .. }
            | StoreReply::Closed { xid } => Some(*xid),
            StoreReply::Event(_) => None,
        }
    }
}
