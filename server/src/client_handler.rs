use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::SinkExt;
use tracing::{debug, info, warn};

use protocol::{BoardCodec, ChatEntry, Command, RosterUpdate, Verdict};

use crate::server_types::{ConnId, Outbound, OutboundTx, Registry, RegistryEntry, PEER_QUEUE_DEPTH};
use crate::session::{Admission, Departure, SessionStore, SharedStore};

const SERVER_USER: &str = "server";
const WAITING_NOTICE: &str = "Waiting for the manager to approve your request to join";
const DENIED_REASON: &str = "The manager denied your request to join";
const DUPLICATE_REASON: &str = "That username is already in use";

// Handles server communication from one client connection.
// Essentially this models a client actor on the server side, walking the
// admission states AwaitingHello -> {Manager | Pending} -> Approved -> Closed.
pub struct ClientHandler {
    id: ConnId,
    username: String,
    store: SharedStore,
    registry: Registry,
    outbound: OutboundTx,
    closer: Arc<Notify>,
}

impl ClientHandler {
    // Spawn a tokio task owning the read/dispatch loop for one peer
    pub fn spawn(
        stream: TcpStream,
        addr: SocketAddr,
        store: SharedStore,
        registry: Registry,
        outbound: OutboundTx,
        counter: Arc<AtomicU32>,
    ) {
        let _ = tokio::spawn(async move {
            let (tcp_read, tcp_write) = stream.into_split();
            let mut fr = FramedRead::new(tcp_read, BoardCodec);
            let fw = FramedWrite::new(tcp_write, BoardCodec);

            // the first frame on every connection must introduce the user
            let username = match fr.next().await {
                Some(Ok(Command::Hello { username })) => username,
                Some(Ok(cmd)) => {
                    warn!("{:?} opened with {:?} instead of Hello, rejecting", addr, cmd);
                    return;
                }
                Some(Err(e)) => {
                    warn!("{:?} sent a malformed first frame, rejecting: {:?}", addr, e);
                    return;
                }
                None => {
                    debug!("{:?} closed before identifying", addr);
                    return;
                }
            };

            let id = counter.fetch_add(1, Ordering::Relaxed);
            info!("{} connected from {:?} as conn {}", username, addr, id);

            let h = ClientHandler {
                id,
                username,
                store,
                registry,
                outbound,
                closer: Arc::new(Notify::new()),
            };

            // teardown must not run for a refused duplicate: the name in
            // question belongs to somebody else
            if h.register(fw).await {
                h.handle_read(fr).await;
                h.teardown().await;
            }
        });
    }

    /// Admission on `Hello`: the first member is auto-approved as manager,
    /// everyone later is parked until the manager's verdict. Returns whether
    /// the connection was registered at all.
    async fn register(&self, mut fw: FramedWrite<OwnedWriteHalf, BoardCodec>) -> bool {
        let store = &mut *self.store.lock().await;

        match store.admit(&self.username, self.id) {
            Admission::Duplicate => {
                warn!("rejecting duplicate username {}", self.username);
                let bye = Command::Bye {
                    username: self.username.clone(),
                    reason: Some(DUPLICATE_REASON.into()),
                };
                if let Err(e) = fw.send(bye).await {
                    debug!("could not deliver duplicate-name rejection: {:?}", e);
                }
                false
            }
            Admission::Manager => {
                self.install(fw, true).await;
                info!("{} auto-approved as session manager", self.username);
                self.setup_new_user(store, self.id, &self.username).await;
                true
            }
            Admission::Pending => {
                self.install(fw, false).await;
                info!("{} parked pending manager approval", self.username);

                self.send_to(
                    self.id,
                    Command::Chat {
                        username: SERVER_USER.into(),
                        text: WAITING_NOTICE.into(),
                    },
                )
                .await;

                if let Some(mgr_id) = store.manager_id() {
                    self.send_to(
                        mgr_id,
                        Command::Auth {
                            target: self.username.clone(),
                            verdict: None,
                        },
                    )
                    .await;
                } else {
                    warn!("no reachable manager to approve {}", self.username);
                }
                true
            }
        }
    }

    async fn install(&self, writer: FramedWrite<OwnedWriteHalf, BoardCodec>, approved: bool) {
        let (tx, rx) = mpsc::channel::<Command>(PEER_QUEUE_DEPTH);
        spawn_peer_writer(self.id, rx, writer);

        let entry = RegistryEntry {
            username: self.username.clone(),
            approved,
            outbound: tx,
            closer: Arc::clone(&self.closer),
        };
        self.registry.lock().await.insert(self.id, entry);
    }

    // Loop over inbound frames until the peer leaves, errors out, or is
    // force-closed by a kick/denial.
    async fn handle_read(&self, mut fr: FramedRead<tokio::net::tcp::OwnedReadHalf, BoardCodec>) {
        let closer = Arc::clone(&self.closer);

        loop {
            select! {
                frame = fr.next() => {
                    match frame {
                        Some(Ok(cmd)) => {
                            debug!("conn {} received: {:?}", self.id, cmd);
                            if !self.dispatch(cmd).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("protocol violation from {}: {:?}", self.username, e);
                            break;
                        }
                        None => {
                            info!("{} stream closed", self.username);
                            break;
                        }
                    }
                }
                _ = closer.notified() => {
                    info!("conn {} force closed", self.id);
                    break;
                }
            }
        }
    }

    // Returns false when the read loop should end.
    async fn dispatch(&self, cmd: Command) -> bool {
        let approved = self.store.lock().await.is_member(&self.username);

        match cmd {
            Command::Bye { .. } => {
                info!("{} requested disconnect", self.username);
                return false;
            }
            // parked users may only leave; everything else waits on approval
            _ if !approved => {
                debug!("ignoring command from pending user {}", self.username);
            }
            Command::Hello { .. } => {
                debug!("{} said Hello again, ignoring", self.username);
            }
            Command::Chat { text, .. } => {
                let store = &mut *self.store.lock().await;
                store.commit_chat(ChatEntry {
                    username: self.username.clone(),
                    text: text.clone(),
                });
                self.broadcast(Command::Chat {
                    username: self.username.clone(),
                    text,
                })
                .await;
            }
            Command::Stroke { stroke, .. } => {
                if stroke.is_empty() {
                    debug!("dropping empty stroke from {}", self.username);
                    return true;
                }
                let author = Some(self.username.clone());
                if stroke.intermediate {
                    // live preview: relayed, never stored
                    self.broadcast(Command::Stroke { stroke, author }).await;
                } else {
                    let store = &mut *self.store.lock().await;
                    store.commit_stroke(stroke.clone());
                    self.broadcast(Command::Stroke { stroke, author }).await;
                }
            }
            Command::Shape { shape, .. } => {
                let author = Some(self.username.clone());
                if shape.intermediate {
                    self.broadcast(Command::Shape { shape, author }).await;
                } else {
                    let store = &mut *self.store.lock().await;
                    store.commit_shape(shape.clone());
                    self.broadcast(Command::Shape { shape, author }).await;
                }
            }
            Command::Text { text, .. } => {
                let author = Some(self.username.clone());
                let store = &mut *self.store.lock().await;
                store.commit_text(text.clone());
                self.broadcast(Command::Text { text, author }).await;
            }
            Command::Clear => {
                let store = &mut *self.store.lock().await;
                store.clear();
                self.broadcast(Command::Clear).await;
            }
            Command::Auth { target, verdict } => {
                self.resolve_auth(target, verdict).await;
            }
            Command::Kick { target } => {
                self.kick(target).await;
            }
            Command::User { .. } | Command::MgrInfo { .. } => {
                debug!("ignoring server-only command from {}", self.username);
            }
        }
        true
    }

    /// Manager's verdict on a parked user. The pending lookup is an atomic
    /// check-and-remove, so a verdict racing the target's disconnect
    /// resolves to a silent no-op.
    async fn resolve_auth(&self, target: String, verdict: Option<Verdict>) {
        let Some(verdict) = verdict else {
            warn!("{} sent an auth request, dropping", self.username);
            return;
        };

        let store = &mut *self.store.lock().await;
        if !store.is_manager(&self.username) {
            warn!(
                "{} is not the manager, dropping verdict for {}",
                self.username, target
            );
            return;
        }
        let Some(target_id) = store.resolve_pending(&target) else {
            info!("verdict for {} arrived after they left, ignoring", target);
            return;
        };

        match verdict {
            Verdict::Yes => {
                store.insert_member(&target, target_id);
                if let Some(entry) = self.registry.lock().await.get_mut(&target_id) {
                    entry.approved = true;
                }
                info!("{} approved {}", self.username, target);
                self.setup_new_user(store, target_id, &target).await;
            }
            Verdict::No => {
                info!("{} denied {}", self.username, target);
                self.send_to(
                    target_id,
                    Command::Bye {
                        username: target,
                        reason: Some(DENIED_REASON.into()),
                    },
                )
                .await;
                self.drop_conn(target_id).await;
            }
        }
    }

    async fn kick(&self, target: String) {
        let store = self.store.lock().await;
        if !store.is_manager(&self.username) {
            warn!("{} attempted a kick without being manager", self.username);
            return;
        }
        if target == self.username {
            warn!("manager {} attempted to kick themself, ignoring", self.username);
            return;
        }
        let Some(target_id) = store.member_id(&target) else {
            warn!("manager tried to kick unknown user {}", target);
            return;
        };

        info!("{} kicked {}", self.username, target);
        self.send_to(
            target_id,
            Command::Bye {
                username: target,
                reason: Some(format!("You were kicked by the manager ({})", self.username)),
            },
        )
        .await;
        // the target's own handler runs the standard teardown on wake
        self.drop_conn(target_id).await;
    }

    /// One-time replay to a freshly approved member, enqueued under the
    /// store lock: roster, join broadcast, blank slate, manager identity,
    /// chat history, then committed objects in rendering layer order
    /// (shapes as backdrop, text above, freehand ink topmost).
    async fn setup_new_user(&self, store: &SessionStore, id: ConnId, name: &str) {
        self.send_to(
            id,
            Command::User {
                update: RosterUpdate::Full(store.roster()),
            },
        )
        .await;
        self.broadcast_from(
            id,
            Command::User {
                update: RosterUpdate::Joined(name.to_owned()),
            },
        )
        .await;
        self.send_to(id, Command::Clear).await;
        if let Some(manager) = store.manager() {
            self.send_to(
                id,
                Command::MgrInfo {
                    manager: manager.to_owned(),
                },
            )
            .await;
        }

        let snap = store.replay_snapshot();
        for entry in snap.chats {
            self.send_to(
                id,
                Command::Chat {
                    username: entry.username,
                    text: entry.text,
                },
            )
            .await;
        }
        for shape in snap.shapes {
            self.send_to(id, Command::Shape { shape, author: None }).await;
        }
        for text in snap.texts {
            self.send_to(id, Command::Text { text, author: None }).await;
        }
        for stroke in snap.strokes {
            self.send_to(id, Command::Stroke { stroke, author: None }).await;
        }
    }

    /// Single guaranteed-run cleanup path, idempotent across a forced close
    /// racing a voluntary Bye. Departure is broadcast only for users the
    /// other members ever learned about.
    async fn teardown(&self) {
        let store = &mut *self.store.lock().await;
        let departure = store.remove(&self.username);
        self.registry.lock().await.remove(&self.id);

        if departure == Departure::Member {
            info!("{} left the session", self.username);
            self.broadcast(Command::Bye {
                username: self.username.clone(),
                reason: None,
            })
            .await;
        } else {
            debug!("unapproved conn {} cleaned up silently", self.id);
        }
    }

    async fn broadcast(&self, cmd: Command) {
        self.broadcast_from(self.id, cmd).await;
    }

    async fn broadcast_from(&self, except: ConnId, cmd: Command) {
        if self
            .outbound
            .send(Outbound::Broadcast { cmd, except })
            .await
            .is_err()
        {
            warn!("outbound channel closed, dropping broadcast");
        }
    }

    async fn send_to(&self, id: ConnId, cmd: Command) {
        if self.outbound.send(Outbound::ToClient { id, cmd }).await.is_err() {
            warn!("outbound channel closed, dropping unicast");
        }
    }

    async fn drop_conn(&self, id: ConnId) {
        if self.outbound.send(Outbound::Drop { id }).await.is_err() {
            warn!("outbound channel closed, dropping force close");
        }
    }
}

// Owns the socket write half for one peer. Ends once the registry entry is
// gone, after draining whatever the queue already accepted, so a Bye sent
// right before a forced close still reaches the peer.
fn spawn_peer_writer(
    id: ConnId,
    mut rx: mpsc::Receiver<Command>,
    mut fw: FramedWrite<OwnedWriteHalf, BoardCodec>,
) {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = fw.send(cmd).await {
                warn!("write to conn {} failed, stopping its writer: {:?}", id, e);
                break;
            }
        }
        debug!("writer for conn {} finished", id);
    });
}
