use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use tracing::{info, warn};

use crate::client_handler::ClientHandler;
use crate::server_types::{OutboundTx, Registry};
use crate::session::SharedStore;

const COUNTER_SEED: u32 = 1;

pub struct ServerListener;

impl ServerListener {
    /// Accept loop: one spawned `ClientHandler` per peer, unbounded
    /// concurrency. The caller binds so a bad address fails fast.
    pub fn spawn_accept(
        listener: TcpListener,
        store: SharedStore,
        registry: Registry,
        outbound: OutboundTx,
    ) -> JoinHandle<()> {
        // connection ids are never reused within a session
        let counter = Arc::new(AtomicU32::new(COUNTER_SEED));

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp_socket, addr)) => {
                        info!("server received new client connection {:?}", &addr);
                        ClientHandler::spawn(
                            tcp_socket,
                            addr,
                            store.clone(),
                            registry.clone(),
                            outbound.clone(),
                            counter.clone(),
                        );
                    }
                    Err(e) => {
                        warn!("accept failed: {:?}", e);
                    }
                }
            }
        })
    }
}
