use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use streamshare_client::transport::mock::{MockTransportFactory, TransportCall};
use streamshare_client::{
    ClientError, ClientOptions, ConnectionMode, MediaEvent, MediaStream, Phase, Role,
    StreamShareClient,
};
use streamshare_signal::{router, SessionRegistry};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_server() -> (SocketAddr, SessionRegistry) {
    let registry = SessionRegistry::new();
    let app = router(registry.clone(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, registry)
}

async fn client(addr: SocketAddr, user: &str, factory: &MockTransportFactory) -> StreamShareClient {
    let options = ClientOptions::new(user).with_signaling_url(format!("ws://{addr}/ws"));
    StreamShareClient::subscribe(options, Arc::new(factory.clone()))
        .await
        .expect("subscribe")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let outcome = timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {what}");
}

async fn phases(client: &StreamShareClient) -> Vec<(String, Role, Phase)> {
    client
        .peers()
        .await
        .expect("peers")
        .into_iter()
        .map(|p| (p.peer, p.role, p.phase))
        .collect()
}

#[tokio::test]
async fn two_peers_negotiate_and_renegotiate_on_publish() {
    let (addr, registry) = spawn_server().await;
    let x_factory = MockTransportFactory::new();
    let y_factory = MockTransportFactory::new();

    let x = client(addr, "X", &x_factory).await;
    let y = client(addr, "Y", &y_factory).await;
    let mut y_media = y.media_events();

    x.start_session("room1").expect("start");
    eventually("X in room1", || {
        let registry = registry.clone();
        async move { registry.members("room1") == vec!["X".to_string()] }
    })
    .await;
    eventually("Y subscribed", || {
        let registry = registry.clone();
        async move { registry.is_subscribed("Y") }
    })
    .await;

    y.join_session("room1").expect("join");

    let (xr, yr) = (&x, &y);
    eventually("both sides stable", || async move {
        phases(xr).await == vec![("Y".to_string(), Role::Responder, Phase::Stable)]
            && phases(yr).await == vec![("X".to_string(), Role::Initiator, Phase::Stable)]
    })
    .await;

    x.publish_stream(MediaStream::camera("x-cam")).expect("publish");

    let event = timeout(WAIT, y_media.recv())
        .await
        .expect("remote stream in time")
        .expect("media event");
    match event {
        MediaEvent::RemoteStream { peer, stream } => {
            assert_eq!(peer, "X");
            assert_eq!(stream.tracks[0].stream_id, "x-cam");
        }
        other => panic!("unexpected media event: {other:?}"),
    }

    eventually("renegotiation settles", || async move {
        phases(xr).await == vec![("Y".to_string(), Role::Responder, Phase::Stable)]
            && phases(yr).await == vec![("X".to_string(), Role::Initiator, Phase::Stable)]
    })
    .await;
    assert_eq!(x_factory.opened().len(), 1);
    assert_eq!(y_factory.opened().len(), 1);

    x.close().await;
    y.close().await;
}

#[tokio::test]
async fn departure_tears_down_the_remaining_peer_engine() {
    let (addr, registry) = spawn_server().await;
    let x_factory = MockTransportFactory::new();
    let y_factory = MockTransportFactory::new();

    let x = client(addr, "X", &x_factory).await;
    let y = client(addr, "Y", &y_factory).await;

    x.start_session("room1").expect("start");
    eventually("X in room1", || {
        let registry = registry.clone();
        async move { !registry.members("room1").is_empty() }
    })
    .await;
    y.join_session("room1").expect("join");
    let (xr, yr) = (&x, &y);
    eventually("X has an engine for Y", || async move { phases(xr).await.len() == 1 }).await;

    x.close().await;

    eventually("Y dropped its engine for X", || async move { phases(yr).await.is_empty() }).await;
    assert_eq!(registry.members("room1"), vec!["Y".to_string()]);
    assert!(y_factory.latest("X").expect("transport").is_closed());
    assert!(x.start_session("room2").is_err());

    y.close().await;
    eventually("session removed after last leave", || {
        let registry = registry.clone();
        async move { !registry.session_exists("room1") }
    })
    .await;
}

#[tokio::test]
async fn explicit_unreachable_server_is_fatal() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let options = ClientOptions::new("X")
        .with_signaling_url(format!("ws://{addr}/ws"))
        .with_connect_timeout(Duration::from_millis(500));
    let result =
        StreamShareClient::subscribe(options, Arc::new(MockTransportFactory::new())).await;
    assert!(matches!(
        result.map(|c| c.mode()),
        Err(ClientError::ConnectionUnavailable { .. })
    ));
}

#[tokio::test]
async fn connected_client_reports_signaling_mode() {
    let (addr, _registry) = spawn_server().await;
    let x = client(addr, "X", &MockTransportFactory::new()).await;
    assert_eq!(x.mode(), ConnectionMode::Signaling);
    assert_eq!(x.user_id(), "X");
    x.close().await;
    x.close().await;
}

#[tokio::test]
async fn close_abandons_a_stalled_answer_and_closes_engines() {
    let (addr, registry) = spawn_server().await;
    let x_factory = MockTransportFactory::new();
    x_factory.stall_answers();

    let x = client(addr, "X", &x_factory).await;
    let y = client(addr, "Y", &MockTransportFactory::new()).await;

    x.start_session("room1").expect("start");
    eventually("X in room1", || {
        let registry = registry.clone();
        async move { registry.members("room1") == vec!["X".to_string()] }
    })
    .await;
    y.join_session("room1").expect("join");

    let xf = &x_factory;
    eventually("X stuck answering Y", || async move {
        xf.latest("Y")
            .is_some_and(|t| t.count(&TransportCall::CreateAnswer) == 1)
    })
    .await;

    assert!(timeout(WAIT, x.close()).await.is_ok(), "close hung on a stalled step");
    let stalled = x_factory.latest("Y").expect("X transport for Y");
    assert!(stalled.is_closed());
    assert!(matches!(x.peers().await, Err(ClientError::Closed)));

    eventually("X left room1", || {
        let registry = registry.clone();
        async move { registry.members("room1") == vec!["Y".to_string()] }
    })
    .await;
    y.close().await;
}
