//! End-to-end tests: a real server on a free port and real WebSocket
//! clients.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lectern_hub::hub::Hub;
use lectern_server::{
    ConnectRequest, HandshakeError, Identity, IdentityResolver, QueryIdentityResolver, ServerConfig,
    TransportServer,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port.
async fn start_test_server(config: ServerConfig) -> (SocketAddr, Arc<Hub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = TransportServer::new(config, Arc::new(Hub::default()));
    let hub = server.hub().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, hub)
}

async fn join(addr: SocketAddr, session: u64, participant: u64, role: &str) -> Client {
    let url = format!(
        "ws://{addr}/ws/sessions/{session}?participant_id={participant}&user_id={}&name=P{participant}&role={role}",
        participant * 100
    );
    let (client, _) = connect_async(url.as_str()).await.unwrap();
    client
}

/// Next JSON event, or `{"type":"closed"}` once the server closes.
async fn next_event(client: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for an event");
        match msg {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Close(_))) | None => return json!({"type": "closed"}),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {e}"),
        }
    }
}

async fn expect_types(client: &mut Client, types: &[&str]) -> Vec<Value> {
    let mut events = Vec::new();
    for expected in types {
        let event = next_event(client).await;
        assert_eq!(event["type"], *expected, "got {event}");
        events.push(event);
    }
    events
}

async fn send(client: &mut Client, action: Value) {
    client.send(Message::text(action.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_teacher_opens_and_student_joins() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;

    let mut teacher = join(addr, 1, 1, "teacher").await;
    let events = expect_types(&mut teacher, &["connected", "session_state"]).await;
    assert_eq!(events[0]["participant_id"], 1);
    assert_eq!(events[1]["participants"]["1"]["is_teacher"], true);

    let mut student = join(addr, 1, 2, "student").await;
    expect_types(&mut student, &["connected", "session_state"]).await;
    let joined = expect_types(&mut teacher, &["participant_joined"]).await;
    assert_eq!(joined[0]["participant_id"], 2);
    assert_eq!(joined[0]["name"], "P2");

    assert_eq!(hub.online(1).await, vec![1, 2]);
}

#[tokio::test]
async fn test_student_cannot_open_session() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;

    let mut student = join(addr, 7, 2, "student").await;
    let events = expect_types(&mut student, &["connected", "error", "closed"]).await;
    assert_eq!(events[1]["code"], "not_found");
    assert!(!hub.is_live(7).await);
}

#[tokio::test]
async fn test_playback_reaches_students() {
    let (addr, _hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 2, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    let mut student = join(addr, 2, 2, "student").await;
    expect_types(&mut student, &["connected", "session_state"]).await;

    send(&mut teacher, json!({"type": "select_audio", "audio_id": 5, "title": "Dialogue"})).await;
    send(&mut teacher, json!({"type": "play_audio", "position": 1.5})).await;
    send(&mut teacher, json!({"type": "seek_audio", "position": 30})).await;

    let events = expect_types(&mut student, &["audio_selected", "audio_play", "audio_play"]).await;
    assert_eq!(events[1]["audio_id"], 5);
    assert_eq!(events[1]["title"], "Dialogue");
    assert_eq!(events[2]["position"], 30.0);

    // A student trying the same gets a personal error only.
    send(&mut student, json!({"type": "pause_audio", "position": 2})).await;
    let error = expect_types(&mut student, &["error"]).await;
    assert_eq!(error[0]["code"], "permission_denied");
}

#[tokio::test]
async fn test_bad_frames_get_personal_errors() {
    let (addr, _hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 3, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;

    send(&mut teacher, json!({"type": "teleport"})).await;
    teacher.send(Message::text("{oops".to_string())).await.unwrap();
    send(&mut teacher, json!({"type": "chat", "text": ""})).await;

    let errors = expect_types(&mut teacher, &["error", "error", "error"]).await;
    assert_eq!(errors[0]["detail"], "unknown message type teleport");
    assert_eq!(errors[1]["code"], "bad_request");
    assert_eq!(errors[2]["code"], "invalid_argument");

    // The connection survives.
    send(&mut teacher, json!({"type": "raise_hand"})).await;
    expect_types(&mut teacher, &["hand_raised"]).await;
}

#[tokio::test]
async fn test_kick_closes_student_socket() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 4, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    let mut student = join(addr, 4, 2, "student").await;
    expect_types(&mut student, &["connected", "session_state"]).await;
    expect_types(&mut teacher, &["participant_joined"]).await;

    send(
        &mut teacher,
        json!({"type": "kick_participant", "target_participant_id": 2, "reason": "Bye"}),
    )
    .await;

    let events = expect_types(&mut student, &["kicked", "closed"]).await;
    assert_eq!(events[0]["reason"], "Bye");
    expect_types(&mut teacher, &["participant_kicked"]).await;
    assert!(hub.participant(4, 2).await.is_none());
}

#[tokio::test]
async fn test_leaving_is_announced() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 5, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    let mut student = join(addr, 5, 2, "student").await;
    expect_types(&mut student, &["connected", "session_state"]).await;
    expect_types(&mut teacher, &["participant_joined"]).await;

    student.close(None).await.unwrap();

    let left = expect_types(&mut teacher, &["participant_left"]).await;
    assert_eq!(left[0]["participant_id"], 2);
    assert!(hub.participant(5, 2).await.is_some());
    assert!(!hub.is_online(5, 2).await);
}

#[tokio::test]
async fn test_reconnect_replaces_old_socket() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 6, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    send(&mut teacher, json!({"type": "mute_self"})).await;
    expect_types(&mut teacher, &["participant_muted"]).await;

    let mut again = join(addr, 6, 1, "teacher").await;
    let events = expect_types(&mut again, &["connected", "session_state"]).await;
    assert_eq!(events[1]["participants"]["1"]["is_muted"], true);

    let old = expect_types(&mut teacher, &["disconnected", "closed"]).await;
    assert_eq!(old[0]["reason"], "Replaced by a newer connection");

    // The old socket's teardown must not detach the new one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(hub.is_online(6, 1).await);
}

#[tokio::test]
async fn test_end_session_closes_everyone() {
    let (addr, hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 8, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    let mut student = join(addr, 8, 2, "student").await;
    expect_types(&mut student, &["connected", "session_state"]).await;

    send(&mut teacher, json!({"type": "end_session"})).await;

    expect_types(&mut student, &["session_ended", "closed"]).await;
    expect_types(&mut teacher, &["participant_joined", "session_ended", "closed"]).await;
    assert!(!hub.is_live(8).await);
}

#[tokio::test]
async fn test_signal_is_targeted() {
    let (addr, _hub) = start_test_server(ServerConfig::default()).await;
    let mut teacher = join(addr, 9, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
    let mut a = join(addr, 9, 2, "student").await;
    expect_types(&mut a, &["connected", "session_state"]).await;
    let mut b = join(addr, 9, 3, "student").await;
    expect_types(&mut b, &["connected", "session_state"]).await;
    expect_types(&mut a, &["participant_joined"]).await;

    send(
        &mut b,
        json!({"type": "webrtc_signal", "target_participant_id": 2, "payload": {"sdp": "offer"}}),
    )
    .await;
    let signal = expect_types(&mut a, &["webrtc_signal"]).await;
    assert_eq!(signal[0]["from"], 3);
    assert_eq!(signal[0]["payload"]["sdp"], "offer");

    // The teacher saw the two joins and nothing else.
    expect_types(&mut teacher, &["participant_joined", "participant_joined"]).await;
    assert!(timeout(Duration::from_millis(100), teacher.next()).await.is_err());
}

#[tokio::test]
async fn test_handshake_rejections() {
    let (addr, _hub) = start_test_server(ServerConfig::default()).await;

    assert!(connect_async(format!("ws://{addr}/elsewhere")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws/sessions/1?user_id=3"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_auto_open_disabled() {
    let config = ServerConfig {
        auto_open_sessions: false,
        ..ServerConfig::default()
    };
    let (addr, hub) = start_test_server(config).await;

    let mut teacher = join(addr, 10, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "error", "closed"]).await;

    hub.open_session(10).await;
    let mut teacher = join(addr, 10, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
}

/// Refuses user 666, defers to the query for everyone else.
struct BlocklistResolver;

impl IdentityResolver for BlocklistResolver {
    fn resolve(&self, request: &ConnectRequest) -> Result<Identity, HandshakeError> {
        let identity = QueryIdentityResolver.resolve(request)?;
        if identity.user_id == 666 {
            return Err(HandshakeError::Rejected("account suspended".into()));
        }
        Ok(identity)
    }
}

#[tokio::test]
async fn test_custom_resolver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = TransportServer::new(ServerConfig::default(), Arc::new(Hub::default()))
        .with_resolver(Arc::new(BlocklistResolver));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let blocked = format!("ws://{addr}/ws/sessions/11?participant_id=1&user_id=666&role=teacher");
    assert!(connect_async(blocked.as_str()).await.is_err());

    let mut teacher = join(addr, 11, 1, "teacher").await;
    expect_types(&mut teacher, &["connected", "session_state"]).await;
}
