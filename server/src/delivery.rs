use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use protocol::Command;

use crate::server_types::{ConnId, Registry, RegistryEntry};

// handles msg delivery back to clients
pub struct Delivery {
    registry: Registry,
}

impl Delivery {
    pub fn new(registry: &Registry) -> Self {
        Delivery {
            registry: Arc::clone(registry),
        }
    }

    /// Unicast; a missing id means the peer is already gone.
    pub async fn send(&mut self, id: ConnId, cmd: Command) {
        let r = &mut *self.registry.lock().await;

        if let Some(entry) = r.get(&id) {
            if let Err(e) = entry.outbound.try_send(cmd) {
                warn!(
                    "queue for {} ({}) unavailable ({}), closing",
                    id,
                    entry.username,
                    stall_kind(&e)
                );
                evict(r, id);
            }
        } else {
            debug!("unicast to departed connection {}", id);
        }
    }

    /// Deliver to every approved member except `except`. Enqueue is
    /// non-blocking, so a wedged or dead peer cannot hold up the remaining
    /// queues; it is evicted instead, and its own read loop runs the
    /// cleanup.
    pub async fn broadcast_except(&mut self, cmd: Command, except: ConnId) {
        let r = &mut *self.registry.lock().await;

        let mut stalled = Vec::new();
        for (id, entry) in r.iter() {
            if *id == except || !entry.approved {
                continue;
            }
            if let Err(e) = entry.outbound.try_send(cmd.clone()) {
                warn!(
                    "failed broadcast to {} ({}): {}",
                    id,
                    entry.username,
                    stall_kind(&e)
                );
                stalled.push(*id);
            }
        }
        for id in stalled {
            evict(r, id);
        }
    }

    /// Force-close: drop the queue so frames already accepted for this peer
    /// flush first, and wake the owning read loop so it runs its normal
    /// teardown path.
    pub async fn drop_client(&mut self, id: ConnId) {
        evict(&mut *self.registry.lock().await, id);
    }
}

fn evict(r: &mut HashMap<ConnId, RegistryEntry>, id: ConnId) {
    if let Some(entry) = r.remove(&id) {
        debug!("closing connection {} ({})", id, entry.username);
        entry.closer.notify_one();
    }
}

fn stall_kind(e: &TrySendError<Command>) -> &'static str {
    match e {
        TrySendError::Full(_) => "queue full, peer not draining",
        TrySendError::Closed(_) => "writer task gone",
    }
}
