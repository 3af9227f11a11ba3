#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::Level;

use huddle::gateway::{GatewayError, RoomAuthority, RoomGrant};
use huddle::signaling::{
    RelayChannel, RelayConnector, RelayRemote, RoomId, SignalingError, VIDEOROOM_PLUGIN,
};
use huddle::{DescriptionOnlyEngine, Role, SessionConfig, SessionLifecycle, SessionSnapshot};

pub const ROOM: u64 = 1234;
pub const SESSION: u64 = 9000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Backend that always grants the same room, or always fails.
#[derive(Clone)]
pub struct StaticAuthority {
    nickname: Option<String>,
}

impl StaticAuthority {
    pub fn granting(nickname: &str) -> Self {
        Self {
            nickname: Some(nickname.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { nickname: None }
    }
}

impl RoomAuthority for StaticAuthority {
    async fn request_room(&self, _role: Role) -> Result<RoomGrant, GatewayError> {
        match &self.nickname {
            Some(nickname) => Ok(RoomGrant {
                room_id: RoomId(ROOM),
                nickname: nickname.clone(),
            }),
            None => Err(GatewayError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct RelayScript {
    unreachable: bool,
    frames: Vec<Value>,
    inject: Option<mpsc::UnboundedSender<String>>,
    next_handle: u64,
    own_feed: u64,
    publishers: Vec<Value>,
    participants: Vec<Value>,
    reject_list: bool,
    reject_join: bool,
    hold_attach: bool,
}

/// In-process relay speaking the video-room protocol with canned replies.
#[derive(Clone, Default)]
pub struct FakeRelay {
    script: Arc<Mutex<RelayScript>>,
}

impl FakeRelay {
    pub fn new(own_feed: u64) -> Self {
        let relay = Self::default();
        {
            let mut script = relay.script.lock().unwrap();
            script.own_feed = own_feed;
            script.next_handle = 100;
        }
        relay
    }

    pub fn unreachable() -> Self {
        let relay = Self::default();
        relay.script.lock().unwrap().unreachable = true;
        relay
    }

    /// Publishers listed in the join confirmation
    pub fn with_publishers(self, peers: &[(u64, &str)]) -> Self {
        self.script.lock().unwrap().publishers = peer_list(peers);
        self
    }

    /// What `listparticipants` returns from now on
    pub fn set_participants(&self, peers: &[(u64, &str)]) {
        self.script.lock().unwrap().participants = peer_list(peers);
    }

    pub fn reject_listing(&self) {
        self.script.lock().unwrap().reject_list = true;
    }

    /// Answer publisher joins with "No such room" while `reject` holds
    pub fn reject_join(&self, reject: bool) {
        self.script.lock().unwrap().reject_join = reject;
    }

    /// Record attach requests but never answer them
    pub fn hold_attach(&self) {
        self.script.lock().unwrap().hold_attach = true;
    }

    pub fn frames(&self) -> Vec<Value> {
        self.script.lock().unwrap().frames.clone()
    }

    pub fn count(&self, janus: &str) -> usize {
        self.frames().iter().filter(|f| f["janus"] == janus).count()
    }

    pub fn count_requests(&self, request: &str) -> usize {
        self.frames()
            .iter()
            .filter(|f| f["body"]["request"] == request)
            .count()
    }

    pub fn subscriber_joins(&self) -> Vec<u64> {
        self.frames()
            .iter()
            .filter(|f| f["body"]["ptype"] == "subscriber")
            .filter_map(|f| f["body"]["feed"].as_u64())
            .collect()
    }

    /// Push an unsolicited video-room event on `handle`
    pub fn push_event(&self, handle: u64, data: Value) {
        self.send(json!({
            "janus": "event",
            "session_id": SESSION,
            "sender": handle,
            "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": data}
        }));
    }

    pub fn send(&self, frame: Value) {
        let script = self.script.lock().unwrap();
        if let Some(inject) = &script.inject {
            let _ = inject.send(frame.to_string());
        }
    }

    /// Simulate the relay dropping the connection
    pub fn disconnect(&self) {
        self.script.lock().unwrap().inject = None;
    }

    fn respond(&self, text: &str) {
        let frame: Value = serde_json::from_str(text).expect("client sent invalid json");
        let mut replies = Vec::new();
        {
            let mut script = self.script.lock().unwrap();
            script.frames.push(frame.clone());
            let transaction = frame["transaction"].clone();
            let handle = frame["handle_id"].clone();

            match frame["janus"].as_str() {
                Some("create") => replies.push(json!({
                    "janus": "success", "transaction": transaction, "data": {"id": SESSION}
                })),
                Some("attach") if script.hold_attach => {}
                Some("attach") => {
                    script.next_handle += 1;
                    replies.push(json!({
                        "janus": "success", "transaction": transaction,
                        "data": {"id": script.next_handle}
                    }));
                }
                Some("message") => {
                    replies.push(json!({"janus": "ack", "transaction": transaction}));
                    let body = &frame["body"];
                    let reply = match (body["request"].as_str(), body["ptype"].as_str()) {
                        (Some("join"), Some("publisher")) if script.reject_join => Some(room_reply("event", &handle, &transaction, json!({
                            "videoroom": "event", "error_code": 426, "error": "No such room"
                        }), None)),
                        (Some("join"), Some("publisher")) => Some(room_reply("event", &handle, &transaction, json!({
                            "videoroom": "joined", "room": ROOM, "id": script.own_feed,
                            "publishers": script.publishers.clone()
                        }), None)),
                        (Some("join"), Some("subscriber")) => Some(room_reply("event", &handle, &transaction, json!({
                            "videoroom": "attached", "room": ROOM, "id": body["feed"].clone()
                        }), Some(json!({"type": "offer", "sdp": RELAY_OFFER})))),
                        (Some("configure"), _) => Some(room_reply("event", &handle, &transaction, json!({
                            "videoroom": "event", "configured": "ok"
                        }), Some(json!({"type": "answer", "sdp": RELAY_ANSWER})))),
                        (Some("start"), _) => Some(room_reply("event", &handle, &transaction, json!({
                            "videoroom": "event", "started": "ok"
                        }), None)),
                        (Some("listparticipants"), _) if script.reject_list => Some(room_reply("success", &handle, &transaction, json!({
                            "videoroom": "event", "error_code": 426, "error": "No such room"
                        }), None)),
                        (Some("listparticipants"), _) => Some(room_reply("success", &handle, &transaction, json!({
                            "videoroom": "participants", "room": ROOM,
                            "participants": script.participants.clone()
                        }), None)),
                        _ => None,
                    };
                    replies.extend(reply);
                }
                Some("keepalive") => replies.push(json!({"janus": "ack", "transaction": transaction})),
                Some("detach") | Some("destroy") => {
                    replies.push(json!({"janus": "success", "transaction": transaction}))
                }
                _ => {}
            }
        }
        for reply in replies {
            self.send(reply);
        }
    }
}

impl RelayConnector for FakeRelay {
    async fn connect(&self, _url: &str) -> Result<RelayChannel, SignalingError> {
        if self.script.lock().unwrap().unreachable {
            return Err(SignalingError::Unreachable("connection refused".to_string()));
        }

        let (channel, remote) = RelayChannel::in_memory();
        let RelayRemote {
            mut frames,
            replies,
        } = remote;
        self.script.lock().unwrap().inject = Some(replies);

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = frames.recv().await {
                relay.respond(msg.as_str());
            }
        });
        Ok(channel)
    }
}

const RELAY_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=sendonly\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=sendonly\r\n";
const RELAY_ANSWER: &str = "v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=recvonly\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n";

fn peer_list(peers: &[(u64, &str)]) -> Vec<Value> {
    peers
        .iter()
        .map(|(id, display)| json!({"id": id, "display": display}))
        .collect()
}

fn room_reply(janus: &str, handle: &Value, transaction: &Value, data: Value, jsep: Option<Value>) -> Value {
    let mut reply = json!({
        "janus": janus,
        "session_id": SESSION,
        "sender": handle,
        "transaction": transaction,
        "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": data}
    });
    if let Some(jsep) = jsep {
        reply["jsep"] = jsep;
    }
    reply
}

pub type TestSession = SessionLifecycle<StaticAuthority, FakeRelay, DescriptionOnlyEngine>;

pub fn session(nickname: &str, relay: &FakeRelay, config: SessionConfig) -> TestSession {
    init_tracing();
    SessionLifecycle::new(
        config,
        StaticAuthority::granting(nickname),
        relay.clone(),
        DescriptionOnlyEngine::new(),
    )
}

pub fn config() -> SessionConfig {
    SessionConfig::new("http://backend.test", "ws://relay.test").with_host_marker("testAccount")
}

/// Drive the session until `done` holds for its snapshot.
pub async fn drive_until(session: &mut TestSession, done: impl Fn(&SessionSnapshot) -> bool) {
    for _ in 0..64 {
        if done(&session.snapshot()) {
            return;
        }
        if !session.drive().await {
            break;
        }
    }
    assert!(done(&session.snapshot()), "condition never reached: {:?}", session.snapshot());
}
