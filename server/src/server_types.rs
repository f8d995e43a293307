use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use protocol::Command;

// server type definitions

pub type ConnId = u32;

/// Per-peer outbound queue depth; a peer that lets this fill without
/// draining its socket is treated as wedged and force-closed.
pub const PEER_QUEUE_DEPTH: usize = 64;

// queue side of every identified connection, approved or still pending
pub type Registry = Arc<Mutex<HashMap<ConnId, RegistryEntry>>>;

pub struct RegistryEntry {
    pub username: String,
    /// only approved members take part in broadcast fan-out
    pub approved: bool,
    /// feeds the peer's dedicated writer task; dropping it lets queued
    /// frames flush before the socket closes
    pub outbound: mpsc::Sender<Command>,
    /// wakes the owning handler's read loop for a forced close (kick, denial)
    pub closer: Arc<Notify>,
}

/// Delivery work item: handlers never touch peer queues directly, they
/// enqueue one of these for the single delivery task.
#[derive(Debug)]
pub enum Outbound {
    /// To every approved member except `except`.
    Broadcast { cmd: Command, except: ConnId },
    /// Unicast to one connection, approved or pending.
    ToClient { id: ConnId, cmd: Command },
    /// Force-close a connection after any queued writes to it have flushed.
    Drop { id: ConnId },
}

pub type OutboundTx = mpsc::Sender<Outbound>;

pub fn new_registry() -> Registry {
    Arc::new(Mutex::new(HashMap::new()))
}
