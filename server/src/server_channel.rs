use tokio::sync::mpsc::Receiver;
use tracing::{debug, info};

use crate::delivery::Delivery;
use crate::server_types::Outbound;

/// Single consumer of the outbound channel: every socket write in the
/// process funnels through here, so per-connection delivery order follows
/// enqueue order and broadcast iteration never races handler mutation.
pub struct ChannelReceiver;

impl ChannelReceiver {
    pub fn spawn_receive(
        mut local_rx: Receiver<Outbound>,
        mut outgoing: Delivery,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = local_rx.recv().await {
                    debug!("outbound channel item {:?}", &item);

                    match item {
                        Outbound::Broadcast { cmd, except } => {
                            outgoing.broadcast_except(cmd, except).await;
                        }
                        Outbound::ToClient { id, cmd } => {
                            outgoing.send(id, cmd).await;
                        }
                        Outbound::Drop { id } => {
                            outgoing.drop_client(id).await;
                        }
                    }
                } else {
                    info!("no more outbound senders, delivery task exiting");
                    break;
                }
            }
        })
    }
}
