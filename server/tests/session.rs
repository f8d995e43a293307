//! End-to-end session tests over real sockets: admission gating, approval
//! replay, denial, kicks, and departure cleanup.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::SinkExt;

use protocol::{
    BoardCodec, Color, Command, Point, RosterUpdate, Shape, ShapeKind, Stroke, TextBlock, Verdict,
};
use server::delivery::Delivery;
use server::listener::ServerListener;
use server::server_channel::ChannelReceiver;
use server::server_types::{new_registry, Outbound};
use server::session::SessionStore;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = SessionStore::new_shared();
    let registry = new_registry();
    let outgoing = Delivery::new(&registry);
    let (local_tx, local_rx) = mpsc::channel::<Outbound>(64);

    ChannelReceiver::spawn_receive(local_rx, outgoing);
    ServerListener::spawn_accept(listener, store, registry, local_tx);
    addr
}

struct TestClient {
    fr: FramedRead<OwnedReadHalf, BoardCodec>,
    fw: FramedWrite<OwnedWriteHalf, BoardCodec>,
}

impl TestClient {
    async fn join(addr: SocketAddr, name: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        let mut client = TestClient {
            fr: FramedRead::new(r, BoardCodec),
            fw: FramedWrite::new(w, BoardCodec),
        };
        client
            .send(Command::Hello {
                username: name.into(),
            })
            .await;
        client
    }

    /// Join as the very first user and consume the manager setup sequence.
    async fn join_as_manager(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::join(addr, name).await;
        assert_eq!(
            client.recv().await,
            Command::User {
                update: RosterUpdate::Full(vec![name.into()])
            }
        );
        assert_eq!(client.recv().await, Command::Clear);
        assert_eq!(
            client.recv().await,
            Command::MgrInfo {
                manager: name.into()
            }
        );
        client
    }

    async fn send(&mut self, cmd: Command) {
        self.fw.send(cmd).await.unwrap();
    }

    async fn recv(&mut self) -> Command {
        timeout(RECV_TIMEOUT, self.fr.next())
            .await
            .expect("timed out waiting for a command")
            .expect("stream ended unexpectedly")
            .expect("received malformed frame")
    }

    /// The server closed this connection.
    async fn expect_eof(&mut self) {
        let frame = timeout(RECV_TIMEOUT, self.fr.next())
            .await
            .expect("timed out waiting for stream end");
        assert!(frame.is_none(), "expected EOF, got {:?}", frame);
    }

    async fn expect_silence(&mut self) {
        let frame = timeout(SETTLE, self.fr.next()).await;
        assert!(frame.is_err(), "expected silence, got {:?}", frame);
    }
}

fn final_stroke(points: &[(i32, i32)]) -> Stroke {
    let mut stroke = Stroke::new(Color::BLACK, 2.0, false);
    for (x, y) in points {
        stroke.add_point(Point::new(*x, *y));
    }
    stroke
}

#[tokio::test]
async fn first_user_is_manager_and_second_needs_approval() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    let mut bo = TestClient::join(addr, "bo").await;
    // parked: only a waiting notice until the manager decides
    match bo.recv().await {
        Command::Chat { username, .. } => assert_eq!(username, "server"),
        other => panic!("expected waiting notice, got {:?}", other),
    }

    assert_eq!(
        ana.recv().await,
        Command::Auth {
            target: "bo".into(),
            verdict: None
        }
    );

    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;

    // replay for an empty session: roster, blank slate, manager identity
    assert_eq!(
        bo.recv().await,
        Command::User {
            update: RosterUpdate::Full(vec!["ana".into(), "bo".into()])
        }
    );
    assert_eq!(bo.recv().await, Command::Clear);
    assert_eq!(
        bo.recv().await,
        Command::MgrInfo {
            manager: "ana".into()
        }
    );

    // existing members hear about the join
    assert_eq!(
        ana.recv().await,
        Command::User {
            update: RosterUpdate::Joined("bo".into())
        }
    );
}

#[tokio::test]
async fn pending_user_commands_are_invisible_until_approved() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let auth_request = ana.recv().await;
    assert_eq!(
        auth_request,
        Command::Auth {
            target: "bo".into(),
            verdict: None
        }
    );

    // gated: a committed stroke from a parked user reaches nobody
    bo.send(Command::Stroke {
        stroke: final_stroke(&[(1, 1), (2, 2)]),
        author: None,
    })
    .await;
    ana.expect_silence().await;

    sleep(SETTLE).await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;

    // the dropped stroke is absent from bo's replay as well
    assert_eq!(
        bo.recv().await,
        Command::User {
            update: RosterUpdate::Full(vec!["ana".into(), "bo".into()])
        }
    );
    assert_eq!(bo.recv().await, Command::Clear);
    assert_eq!(
        bo.recv().await,
        Command::MgrInfo {
            manager: "ana".into()
        }
    );
    bo.expect_silence().await;
}

#[tokio::test]
async fn replay_delivers_chat_then_shapes_then_text_then_strokes() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    // committed content: deliberately authored in a different order than
    // the replay layering
    ana.send(Command::Stroke {
        stroke: final_stroke(&[(5, 5), (6, 6)]),
        author: None,
    })
    .await;
    ana.send(Command::Chat {
        username: "ana".into(),
        text: "welcome".into(),
    })
    .await;
    let shape = Shape::new(
        ShapeKind::Rectangle,
        Point::new(10, 10),
        Point::new(50, 50),
        2.0,
        Color::BLACK,
    );
    ana.send(Command::Shape {
        shape: shape.clone(),
        author: None,
    })
    .await;
    let text = TextBlock {
        text: "title".into(),
        pos: Point::new(30, 5),
        font_size: 16,
        color: Color::BLACK,
    };
    ana.send(Command::Text {
        text: text.clone(),
        author: None,
    })
    .await;

    // an in-progress preview must not be replayed
    let mut preview = shape.clone();
    preview.start = Point::new(200, 200);
    preview.intermediate = true;
    ana.send(Command::Shape {
        shape: preview,
        author: None,
    })
    .await;

    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;

    assert_eq!(
        bo.recv().await,
        Command::User {
            update: RosterUpdate::Full(vec!["ana".into(), "bo".into()])
        }
    );
    assert_eq!(bo.recv().await, Command::Clear);
    assert_eq!(
        bo.recv().await,
        Command::MgrInfo {
            manager: "ana".into()
        }
    );
    assert_eq!(
        bo.recv().await,
        Command::Chat {
            username: "ana".into(),
            text: "welcome".into()
        }
    );
    assert_eq!(
        bo.recv().await,
        Command::Shape {
            shape,
            author: None
        }
    );
    assert_eq!(bo.recv().await, Command::Text { text, author: None });
    assert_eq!(
        bo.recv().await,
        Command::Stroke {
            stroke: final_stroke(&[(5, 5), (6, 6)]),
            author: None
        }
    );
    bo.expect_silence().await;
}

#[tokio::test]
async fn denied_user_gets_reasoned_bye_and_is_closed() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;
    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;

    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::No),
    })
    .await;

    match bo.recv().await {
        Command::Bye {
            username,
            reason: Some(_),
        } => assert_eq!(username, "bo"),
        other => panic!("expected reasoned Bye, got {:?}", other),
    }
    bo.expect_eof().await;

    // the denied user never joined, so members hear nothing
    ana.expect_silence().await;
}

#[tokio::test]
async fn stale_verdict_after_disconnect_is_a_noop() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;
    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;

    drop(bo);
    sleep(SETTLE).await;

    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    ana.expect_silence().await;
}

#[tokio::test]
async fn kick_closes_target_and_notifies_members() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    let _roster = bo.recv().await;
    let _clear = bo.recv().await;
    let _mgr = bo.recv().await;
    let _joined = ana.recv().await;

    // self-kick is refused and changes nothing
    ana.send(Command::Kick {
        target: "ana".into(),
    })
    .await;
    ana.expect_silence().await;
    // so is kicking somebody who does not exist
    ana.send(Command::Kick {
        target: "nobody".into(),
    })
    .await;
    ana.expect_silence().await;

    ana.send(Command::Kick { target: "bo".into() }).await;
    match bo.recv().await {
        Command::Bye {
            username,
            reason: Some(reason),
        } => {
            assert_eq!(username, "bo");
            assert!(reason.contains("kicked"));
        }
        other => panic!("expected kick notice, got {:?}", other),
    }
    bo.expect_eof().await;

    // remaining members see a plain departure
    assert_eq!(
        ana.recv().await,
        Command::Bye {
            username: "bo".into(),
            reason: None
        }
    );
}

#[tokio::test]
async fn duplicate_username_is_refused() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    let mut imposter = TestClient::join(addr, "ana").await;
    match imposter.recv().await {
        Command::Bye {
            username,
            reason: Some(_),
        } => assert_eq!(username, "ana"),
        other => panic!("expected rejection, got {:?}", other),
    }
    imposter.expect_eof().await;

    // the real ana is untouched
    ana.expect_silence().await;
}

#[tokio::test]
async fn protocol_violation_on_first_frame_closes_connection() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    // a Chat before Hello is a violation; nothing is registered
    let stream = TcpStream::connect(addr).await.unwrap();
    let (r, w) = stream.into_split();
    let mut fw = FramedWrite::new(w, BoardCodec);
    fw.send(Command::Chat {
        username: "x".into(),
        text: "hi".into(),
    })
    .await
    .unwrap();
    let mut fr = FramedRead::new(r, BoardCodec);
    let frame = timeout(RECV_TIMEOUT, fr.next())
        .await
        .expect("timed out waiting for rejection");
    assert!(frame.is_none());

    ana.expect_silence().await;
}

#[tokio::test]
async fn departure_after_approval_leaves_no_stale_state() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;

    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    let _joined = ana.recv().await;

    // approved then immediately gone
    drop(bo);
    assert_eq!(
        ana.recv().await,
        Command::Bye {
            username: "bo".into(),
            reason: None
        }
    );

    // the name is free again and admission works from a clean table
    let mut bo2 = TestClient::join(addr, "bo").await;
    let _waiting = bo2.recv().await;
    assert_eq!(
        ana.recv().await,
        Command::Auth {
            target: "bo".into(),
            verdict: None
        }
    );
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    assert_eq!(
        bo2.recv().await,
        Command::User {
            update: RosterUpdate::Full(vec!["ana".into(), "bo".into()])
        }
    );
}

#[tokio::test]
async fn empty_strokes_are_dropped_not_relayed() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;
    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    let _roster = bo.recv().await;
    let _clear = bo.recv().await;
    let _mgr = bo.recv().await;
    let _joined = ana.recv().await;

    // a stroke with no geometry goes nowhere
    bo.send(Command::Stroke {
        stroke: Stroke::new(Color::BLACK, 2.0, false),
        author: None,
    })
    .await;
    ana.expect_silence().await;

    // the connection itself is unaffected
    bo.send(Command::Stroke {
        stroke: final_stroke(&[(1, 2), (3, 4)]),
        author: None,
    })
    .await;
    assert_eq!(
        ana.recv().await,
        Command::Stroke {
            stroke: final_stroke(&[(1, 2), (3, 4)]),
            author: Some("bo".into())
        }
    );
}

#[tokio::test]
async fn live_broadcast_reaches_other_members_but_not_the_author() {
    let addr = start_server().await;

    let mut ana = TestClient::join_as_manager(addr, "ana").await;
    let mut bo = TestClient::join(addr, "bo").await;
    let _waiting = bo.recv().await;
    let _auth_request = ana.recv().await;
    ana.send(Command::Auth {
        target: "bo".into(),
        verdict: Some(Verdict::Yes),
    })
    .await;
    let _roster = bo.recv().await;
    let _clear = bo.recv().await;
    let _mgr = bo.recv().await;
    let _joined = ana.recv().await;

    let stroke = final_stroke(&[(7, 7), (8, 8)]);
    bo.send(Command::Stroke {
        stroke: stroke.clone(),
        author: None,
    })
    .await;

    // the relay stamps the author
    assert_eq!(
        ana.recv().await,
        Command::Stroke {
            stroke,
            author: Some("bo".into())
        }
    );
    bo.expect_silence().await;
}
