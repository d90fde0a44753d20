use std::net::SocketAddr;
use std::sync::Arc;

use beach_pier::auth::SharedSecretAuthenticator;
use beach_pier::config::{ServeArgs, ServerConfig};
use beach_pier::metrics::CountingSink;
use beach_pier::routes::{router, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_server() -> TestServer {
    let config = ServerConfig::try_from(ServeArgs {
        listen: "127.0.0.1:0".into(),
        insecure: true,
        ..ServeArgs::default()
    })
    .expect("config");
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        &config,
        Arc::new(SharedSecretAuthenticator::new("e2e-secret")),
        Arc::new(CountingSink::default()),
        None,
        shutdown.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let stopped = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(stopped.cancelled_owned())
            .await
            .ok();
    });
    TestServer { addr, shutdown }
}

async fn connect_user(addr: SocketAddr, user: &str) -> Socket {
    let response: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/rtm/connect?user={user}"))
        .send()
        .await
        .expect("connect request")
        .json()
        .await
        .expect("connect body");
    assert_eq!(response["ok"], true);
    assert_eq!(response["self"]["id"], user);
    let path = response["url"].as_str().expect("websocket url");

    let (mut socket, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect");
    let hello = next_json(&mut socket).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["self"]["id"], user);
    socket
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        match socket.next().await.expect("socket open").expect("frame") {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

#[test_timeout::tokio_timeout_test]
async fn peers_complete_a_call_through_the_relay() {
    let server = start_server().await;
    let mut alice = connect_user(server.addr, "alice").await;
    let mut bob = connect_user(server.addr, "bob").await;

    send_json(
        &mut alice,
        json!({
            "type": "webrtc", "subtype": "webrtc_call", "id": 1,
            "target": "bob", "initiator": true, "state": "ringing"
        }),
    )
    .await;
    let reply = next_json(&mut alice).await;
    assert_eq!(reply["subtype"], "webrtc_channel");
    assert_eq!(reply["reply_to"], 1);
    let channel = reply["channel"].clone();
    let hash = reply["hash"].clone();

    let call = next_json(&mut bob).await;
    assert_eq!(call["source"], "alice");
    assert_eq!(call["channel"], channel);
    assert_eq!(call["hash"], hash);

    send_json(
        &mut bob,
        json!({
            "type": "webrtc", "subtype": "webrtc_call", "id": 2,
            "target": "alice", "state": "accepted",
            "channel": channel, "hash": hash,
            "data": { "accept": true, "state": "accepted" }
        }),
    )
    .await;
    let answer = next_json(&mut alice).await;
    assert_eq!(answer["source"], "bob");
    assert_eq!(answer["data"]["accept"], true);

    send_json(&mut alice, json!({ "type": "ping", "id": 3, "ts": 7 })).await;
    let pong = next_json(&mut alice).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 7);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_websocket_key_is_not_found() {
    let server = start_server().await;
    let err = connect_async(format!("ws://{}/api/v1/rtm/websocket/nope", server.addr))
        .await
        .expect_err("upgrade must be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 404);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn connect_keys_are_single_use() {
    let server = start_server().await;
    let response: Value = reqwest::Client::new()
        .get(format!("http://{}/api/v1/rtm/connect?user=carol", server.addr))
        .send()
        .await
        .expect("connect request")
        .json()
        .await
        .expect("connect body");
    let url = format!("ws://{}{}", server.addr, response["url"].as_str().expect("url"));

    let (mut socket, _) = connect_async(url.as_str()).await.expect("first use");
    assert_eq!(next_json(&mut socket).await["type"], "hello");
    assert!(connect_async(url.as_str()).await.is_err());
}
