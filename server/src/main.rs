use tokio::io;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tracing::{info, Level};
use tracing_subscriber::fmt;

use server::delivery::Delivery;
use server::server_channel::ChannelReceiver;
use server::server_types::{new_registry, Outbound};
use server::session::SessionStore;
use server::listener::ServerListener;

const DEFAULT_ADDR: &str = "127.0.0.1:4321";
const BOUNDED_CHANNEL_SIZE: usize = 64;

#[tokio::main]
async fn main() -> io::Result<()> {
    fmt()
        .compact()
        .with_max_level(Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_owned());
    // the manager is whoever is approved first; the hint is informational
    if let Some(hint) = args.next() {
        info!("expecting {} to connect first as manager", hint);
    }

    info!("Server starting.. {:?}", &addr);
    let listener = TcpListener::bind(&addr).await?;

    let store = SessionStore::new_shared();
    let registry = new_registry();
    let outgoing = Delivery::new(&registry);

    let (local_tx, local_rx) = mpsc::channel::<Outbound>(BOUNDED_CHANNEL_SIZE);

    let delivery_handle = ChannelReceiver::spawn_receive(local_rx, outgoing);
    let accept_handle = ServerListener::spawn_accept(listener, store, registry, local_tx);

    let _ = tokio::try_join!(accept_handle, delivery_handle);
    Ok(())
}
