use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use quizlobby_core::net::messages::{
    ActionResultMsg, ClientMessage, CreateLobbyMsg, InviteToLobbyMsg, JoinLobbyMsg, ServerMessage,
};
use quizlobby_core::net::protocol::{decode_server_message, encode_client_message};
use quizlobby_core::session::GameSettings;

use quizlobby_server::build_app;
use quizlobby_server::config::ServerConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::from_config(ServerConfig::default()).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, _state) = build_app(config);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, user_id: &str, name: &str) -> String {
        format!("ws://{}/ws?user_id={user_id}&name={name}", self.addr)
    }

    /// Connect as `user_id` with display name `name`.
    pub async fn connect(&self, user_id: &str, name: &str) -> WsStream {
        ws_connect(&self.ws_url(user_id, name)).await
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn ws_send_client_msg(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Binary(encoded.into())).await.unwrap();
}

/// Read the next ServerMessage (5s timeout).
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return decode_server_message(&data).unwrap(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Skip messages until one matches `pred`.
pub async fn ws_wait_for(
    stream: &mut WsStream,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let msg = ws_read_server_msg(stream).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Skip broadcasts until the reply to our last action arrives.
pub async fn ws_action_result(stream: &mut WsStream) -> ActionResultMsg {
    match ws_wait_for(stream, |m| matches!(m, ServerMessage::ActionResult(_))).await {
        ServerMessage::ActionResult(result) => result,
        other => panic!("Expected ActionResult, got: {other:?}"),
    }
}

/// Send one action and return its reply.
pub async fn ws_act(stream: &mut WsStream, msg: ClientMessage) -> ActionResultMsg {
    ws_send_client_msg(stream, &msg).await;
    ws_action_result(stream).await
}

/// Create a lobby and return its id.
pub async fn ws_create_lobby(stream: &mut WsStream, settings: GameSettings, public: bool) -> String {
    let result = ws_act(
        stream,
        ClientMessage::CreateLobby(CreateLobbyMsg {
            name: "Quiz night".to_string(),
            settings,
            public,
        }),
    )
    .await;
    assert!(result.success, "Expected lobby creation to succeed: {result:?}");
    result.session_id.unwrap().to_string()
}

/// Host invites `target`, then `guest` joins.
pub async fn ws_invite_and_join(
    host: &mut WsStream,
    guest: &mut WsStream,
    session_id: &str,
    target: &str,
) {
    let invited = ws_act(
        host,
        ClientMessage::InviteToLobby(InviteToLobbyMsg {
            session_id: session_id.to_string(),
            target_id: target.to_string(),
        }),
    )
    .await;
    assert!(invited.success, "Expected invite to succeed: {invited:?}");
    let joined = ws_act(
        guest,
        ClientMessage::JoinLobby(JoinLobbyMsg {
            session_id: session_id.to_string(),
        }),
    )
    .await;
    assert!(joined.success, "Expected join to succeed: {joined:?}");
}
