use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use streamshare_proto::{decode_server_frame, encode_frame, ClientMessage, ServerMessage};
use streamshare_signal::{router, SessionRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> (SocketAddr, SessionRegistry) {
    let registry = SessionRegistry::new();
    let app = router(registry.clone(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    socket
}

async fn send(socket: &mut Socket, message: ClientMessage) {
    let text = encode_frame(&message).expect("encode");
    socket.send(Message::Text(text)).await.expect("send");
}

async fn recv(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return decode_server_frame(&text).expect("decode");
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let outcome = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(outcome.is_err(), "unexpected frame: {outcome:?}");
}

async fn subscribed(addr: SocketAddr, user: &str) -> Socket {
    let mut socket = connect(addr).await;
    send(
        &mut socket,
        ClientMessage::Subscribe {
            user_id: user.into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut socket).await,
        ServerMessage::Subscribed {
            user_id: user.into()
        }
    );
    socket
}

#[tokio::test]
async fn join_announces_roster_and_relays_offer() {
    let (addr, registry) = spawn_server().await;
    let mut x = subscribed(addr, "X").await;
    let mut y = subscribed(addr, "Y").await;

    send(
        &mut x,
        ClientMessage::StartSession {
            session_id: "room1".into(),
        },
    )
    .await;
    assert_eq!(recv(&mut x).await, ServerMessage::Peers { peers: vec![] });

    send(
        &mut y,
        ClientMessage::JoinSession {
            session_id: "room1".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut y).await,
        ServerMessage::Peers {
            peers: vec!["X".into()]
        }
    );
    assert_eq!(
        recv(&mut x).await,
        ServerMessage::PeerJoined {
            user_id: "Y".into()
        }
    );
    assert_eq!(registry.members("room1"), vec!["X".to_string(), "Y".to_string()]);

    send(
        &mut y,
        ClientMessage::Offer {
            to: "X".into(),
            sdp: "v=0 offer".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut x).await,
        ServerMessage::Offer {
            from: "Y".into(),
            sdp: "v=0 offer".into()
        }
    );
    assert_silent(&mut y).await;
}

#[tokio::test]
async fn leave_notifies_remaining_members_and_last_leave_closes_session() {
    let (addr, registry) = spawn_server().await;
    let mut x = subscribed(addr, "X").await;
    let mut y = subscribed(addr, "Y").await;

    send(
        &mut x,
        ClientMessage::StartSession {
            session_id: "room1".into(),
        },
    )
    .await;
    recv(&mut x).await;
    send(
        &mut y,
        ClientMessage::JoinSession {
            session_id: "room1".into(),
        },
    )
    .await;
    recv(&mut y).await;
    recv(&mut x).await;

    send(&mut y, ClientMessage::LeaveSession).await;
    assert_eq!(
        recv(&mut x).await,
        ServerMessage::PeerLeft {
            user_id: "Y".into()
        }
    );

    send(&mut x, ClientMessage::LeaveSession).await;
    timeout(RECV_TIMEOUT, async {
        while registry.session_exists("room1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session removed after last leave");
    assert_silent(&mut y).await;
}

#[tokio::test]
async fn disconnect_acts_as_leave() {
    let (addr, registry) = spawn_server().await;
    let mut x = subscribed(addr, "X").await;
    let mut y = subscribed(addr, "Y").await;

    send(
        &mut x,
        ClientMessage::JoinSession {
            session_id: "room1".into(),
        },
    )
    .await;
    recv(&mut x).await;
    send(
        &mut y,
        ClientMessage::JoinSession {
            session_id: "room1".into(),
        },
    )
    .await;
    recv(&mut y).await;
    recv(&mut x).await;

    y.close(None).await.expect("close");
    drop(y);

    assert_eq!(
        recv(&mut x).await,
        ServerMessage::PeerLeft {
            user_id: "Y".into()
        }
    );
    assert!(!registry.is_subscribed("Y"));
    assert_eq!(registry.members("room1"), vec!["X".to_string()]);
}

#[tokio::test]
async fn malformed_frames_keep_the_channel_open() {
    let (addr, _registry) = spawn_server().await;
    let mut x = subscribed(addr, "X").await;

    x.send(Message::Text("not json".into())).await.expect("send");
    x.send(Message::Text(r#"{"type":"teleport"}"#.into()))
        .await
        .expect("send");

    send(
        &mut x,
        ClientMessage::StartSession {
            session_id: "room1".into(),
        },
    )
    .await;
    assert_eq!(recv(&mut x).await, ServerMessage::Peers { peers: vec![] });
}

#[tokio::test]
async fn relay_to_unknown_target_is_dropped_silently() {
    let (addr, _registry) = spawn_server().await;
    let mut x = subscribed(addr, "X").await;

    send(
        &mut x,
        ClientMessage::Answer {
            to: "nobody".into(),
            sdp: "v=0".into(),
        },
    )
    .await;
    assert_silent(&mut x).await;

    send(
        &mut x,
        ClientMessage::JoinSession {
            session_id: "room2".into(),
        },
    )
    .await;
    assert_eq!(recv(&mut x).await, ServerMessage::Peers { peers: vec![] });
}

#[tokio::test]
async fn session_requests_before_subscribe_are_ignored() {
    let (addr, registry) = spawn_server().await;
    let mut anon = connect(addr).await;

    send(
        &mut anon,
        ClientMessage::StartSession {
            session_id: "room1".into(),
        },
    )
    .await;
    assert_silent(&mut anon).await;
    assert!(!registry.session_exists("room1"));
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (addr, _registry) = spawn_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut body = String::new();
    stream.read_to_string(&mut body).await.expect("read");
    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains(r#""status":"ok""#));
}
