use std::sync::Arc;

use tokio::io;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use tracing::{info, Level};
use tracing_subscriber::fmt;

use client::session::{ClientError, Session, SessionHandle};
use client::surface::AutoApprove;

const DEFAULT_SERVER: &str = "127.0.0.1:4321";
const DEFAULT_USER: &str = "guest";
const LINES_MAX_LEN: usize = 256;

const GREETINGS: &str = "$ Welcome to the whiteboard!\n$ Commands: \\quit, \\clear, \\kick username; anything else is chat";

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    fmt()
        .compact() // use abbreviated log format
        .with_max_level(Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_SERVER.to_owned());
    let username = args.next().unwrap_or_else(|| DEFAULT_USER.to_owned());

    info!("client starting, connecting to server {:?}", &addr);
    let session = Session::connect(&addr, &username).await?;

    println!("{}", GREETINGS);

    spawn_input(session.handle());

    // the terminal client admits everyone; a GUI wires a real prompt here
    session.run(Arc::new(AutoApprove)).await;
    Ok(())
}

// Grab gestures from the command line; drawing needs a real surface, so the
// terminal client only produces chat and administrative commands.
fn spawn_input(handle: SessionHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stdin = FramedRead::new(io::stdin(), LinesCodec::new_with_max_length(LINES_MAX_LEN));
        let mut lines = stdin;

        while let Some(Ok(line)) = lines.next().await {
            let sent = match line.as_str() {
                "\\quit" => {
                    let _ = handle.quit().await;
                    break;
                }
                "\\clear" => handle.send_clear().await,
                value if value.starts_with("\\kick") => {
                    match value.splitn(3, ' ').nth(1) {
                        Some(name) => handle.kick(name.to_owned()).await,
                        None => continue,
                    }
                }
                "" => continue,
                text => handle.send_chat(text.to_owned()).await,
            };

            if sent.is_err() {
                break;
            }
        }
    })
}
