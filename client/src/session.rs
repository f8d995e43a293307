//! Server connection: one read task feeding the reconciliation engine and
//! one write task draining locally produced commands.

use std::sync::Arc;

use tokio::net::{tcp, TcpStream};
use tokio::select;
use tokio::sync::broadcast::{self, Sender as BSender};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::SinkExt;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use protocol::{BoardCodec, Command, RosterUpdate, Shape, Stroke, TextBlock, Verdict};

use crate::board::{Board, BoardEvent};
use crate::surface::ApprovalPrompt;

const SHUTDOWN: u8 = 1;
const CHANNEL_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unable to reach server: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed, command not sent")]
    ConnectionDown,
}

pub struct Session {
    username: String,
    board: Arc<Mutex<Board>>,
    shutdown_tx: BSender<u8>,
    fr: Option<FramedRead<tcp::OwnedReadHalf, BoardCodec>>,
    fw: Option<FramedWrite<tcp::OwnedWriteHalf, BoardCodec>>,
    local_tx: Sender<Command>,
    local_rx: Option<Receiver<Command>>,
}

impl Session {
    /// Open the transport and introduce the user; admission continues over
    /// the inbound stream (waiting notice or replay) once `run` starts.
    pub async fn connect(addr: &str, username: &str) -> Result<Session, ClientError> {
        info!("connecting to server {:?}", addr);

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            error!("unable to connect to server");
            e
        })?;

        // split tcpstream so we can hand off to r & w tasks
        let (client_read, client_write) = stream.into_split();
        let fr = FramedRead::new(client_read, BoardCodec);
        let mut fw = FramedWrite::new(client_write, BoardCodec);

        fw.send(Command::Hello {
            username: username.to_owned(),
        })
        .await?;

        let (shutdown_tx, _) = broadcast::channel(16);
        let (local_tx, local_rx) = mpsc::channel::<Command>(CHANNEL_SIZE);

        Ok(Session {
            username: username.to_owned(),
            board: Arc::new(Mutex::new(Board::new(username))),
            shutdown_tx,
            fr: Some(fr),
            fw: Some(fw),
            local_tx,
            local_rx: Some(local_rx),
        })
    }

    /// Gesture-side sender, cloneable into input/UI tasks.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            username: self.username.clone(),
            tx: self.local_tx.clone(),
        }
    }

    pub fn board(&self) -> Arc<Mutex<Board>> {
        Arc::clone(&self.board)
    }

    /// Spawn the read/write tasks and park until either signals shutdown.
    pub async fn run(mut self, prompt: Arc<dyn ApprovalPrompt>) {
        self.spawn_read(prompt);
        self.spawn_write();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("session finished");
    }

    fn spawn_read(&mut self, prompt: Arc<dyn ApprovalPrompt>) -> JoinHandle<()> {
        let mut fr = self.fr.take().expect("read half already taken");
        let board = Arc::clone(&self.board);
        let local_tx = self.local_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                select! {
                    frame = fr.next() => {
                        match frame {
                            Some(Ok(cmd)) => {
                                print_notice(&cmd);
                                let event = board.lock().await.apply(cmd);
                                match event {
                                    BoardEvent::ApprovalRequest(target) => {
                                        let verdict = if prompt.approve(&target).await {
                                            Verdict::Yes
                                        } else {
                                            Verdict::No
                                        };
                                        let reply = Command::Auth {
                                            target,
                                            verdict: Some(verdict),
                                        };
                                        if local_tx.send(reply).await.is_err() {
                                            break;
                                        }
                                    }
                                    BoardEvent::Disconnected(reason) => {
                                        println!(">>> Disconnected: {}", reason);
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            Some(Err(e)) => {
                                warn!("closing on protocol error: {:?}", e);
                                break;
                            }
                            None => {
                                info!("server closed the connection");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        return; // peer task already signalled
                    }
                }
            }
            let _ = shutdown_tx.send(SHUTDOWN);
        })
    }

    fn spawn_write(&mut self) -> JoinHandle<()> {
        let mut fw = self.fw.take().expect("write half already taken");
        let mut local_rx = self.local_rx.take().expect("local rx already taken");
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                select! {
                    cmd = local_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        let quitting = matches!(cmd, Command::Bye { .. });
                        if let Err(e) = fw.send(cmd).await {
                            warn!("unable to write to server: {:?}", e);
                            break;
                        }
                        if quitting {
                            info!("session terminated by user");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        return;
                    }
                }
            }
            let _ = shutdown_tx.send(SHUTDOWN);
        })
    }
}

// terminal notices, mirroring what a GUI would surface as toasts
fn print_notice(cmd: &Command) {
    match cmd {
        Command::Chat { username, text } => println!("> {}: {}", username, text),
        Command::User {
            update: RosterUpdate::Joined(name),
        } => println!(">>> {} joined", name),
        Command::Bye {
            username,
            reason: None,
        } => println!(">>> {} left", username),
        Command::MgrInfo { manager } => println!(">>> session manager is {}", manager),
        _ => {}
    }
}

/// Turns collaborator gestures into outbound commands.
#[derive(Clone)]
pub struct SessionHandle {
    username: String,
    tx: Sender<Command>,
}

impl SessionHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn send_stroke(&self, stroke: Stroke) -> Result<(), ClientError> {
        let author = Some(self.username.clone());
        self.send(Command::Stroke { stroke, author }).await
    }

    pub async fn send_shape(&self, shape: Shape) -> Result<(), ClientError> {
        let author = Some(self.username.clone());
        self.send(Command::Shape { shape, author }).await
    }

    pub async fn send_text(&self, text: TextBlock) -> Result<(), ClientError> {
        let author = Some(self.username.clone());
        self.send(Command::Text { text, author }).await
    }

    pub async fn send_chat(&self, text: String) -> Result<(), ClientError> {
        self.send(Command::Chat {
            username: self.username.clone(),
            text,
        })
        .await
    }

    pub async fn send_clear(&self) -> Result<(), ClientError> {
        self.send(Command::Clear).await
    }

    /// Manager-only on the server side; anyone else gets warned and ignored.
    pub async fn kick(&self, target: String) -> Result<(), ClientError> {
        self.send(Command::Kick { target }).await
    }

    pub async fn quit(&self) -> Result<(), ClientError> {
        self.send(Command::Bye {
            username: self.username.clone(),
            reason: None,
        })
        .await
    }

    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.tx.send(cmd).await.map_err(|_| ClientError::ConnectionDown)
    }
}
