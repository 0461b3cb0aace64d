//! End-to-end tests over real servlets and clients on localhost.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use herald_core::{
    Directory, Herald, HeraldConfig, HeraldError, LocalPeerConfig, Message, MessageListener,
    MessageReceived, Transport, SUBJECT_RAW,
};
use herald_http::{
    HttpAccess, HttpDirectory, HttpServlet, HttpServletConfig, HttpTransport, ACCESS_ID,
};

struct PeerStack {
    herald: Arc<Herald>,
    transport: Arc<HttpTransport>,
    servlet: Arc<HttpServlet>,
    access: HttpAccess,
}

impl PeerStack {
    async fn start(uid: &str) -> Self {
        let directory = Directory::new(LocalPeerConfig {
            uid: uid.to_string(),
            app_id: "demo".to_string(),
            ..Default::default()
        });
        let http_directory = Arc::new(HttpDirectory::new(directory.local_uid()));
        directory.register_transport_directory(http_directory.clone());

        let herald = Herald::new(Arc::clone(&directory), HeraldConfig::default());
        let transport = Arc::new(HttpTransport::new(Arc::clone(&directory)));
        herald.register_transport(transport.clone());

        let servlet = Arc::new(HttpServlet::new(
            directory,
            http_directory,
            HttpServletConfig {
                bind_host: "127.0.0.1".to_string(),
                advertised_host: "127.0.0.1".to_string(),
                port: 0,
                path: "/herald".to_string(),
            },
        ));
        let access = servlet.start(Arc::clone(&herald)).await.unwrap();
        transport.set_local_access(access.clone());

        Self {
            herald,
            transport,
            servlet,
            access,
        }
    }

    /// Registers `other` in this stack's directory, as discovery would.
    fn introduce(&self, other: &PeerStack) {
        let mut description = other.herald.directory().get_local_peer().description();
        description
            .accesses
            .insert(ACCESS_ID.to_string(), other.access.dump());
        self.herald
            .directory()
            .register(&description)
            .unwrap()
            .expect("peer must register");
    }

    async fn stop(&self) {
        self.herald.stop().await;
        self.servlet.stop().await;
    }
}

struct EchoListener;

#[async_trait]
impl MessageListener for EchoListener {
    async fn herald_message(&self, herald: &Arc<Herald>, message: MessageReceived) {
        let text = message.content().as_str().unwrap_or_default();
        herald
            .reply(&message, json!(format!("pong-{text}")), None)
            .await
            .expect("reply must go through");
    }
}

struct ForwardListener(mpsc::UnboundedSender<MessageReceived>);

#[async_trait]
impl MessageListener for ForwardListener {
    async fn herald_message(&self, _herald: &Arc<Herald>, message: MessageReceived) {
        let _ = self.0.send(message);
    }
}

#[tokio::test]
async fn send_and_reply_over_http() {
    let a = PeerStack::start("aaa").await;
    let b = PeerStack::start("bbb").await;
    a.introduce(&b);

    b.herald
        .add_listener(Arc::new(EchoListener), &["ping"])
        .unwrap();

    let request = Message::new("ping", json!("hi"));
    let request_uid = request.uid().to_string();
    let reply = a
        .herald
        .send("bbb", request, Duration::from_secs(5))
        .await
        .expect("send must succeed");

    assert_eq!(reply.content(), &json!("pong-hi"));
    assert_eq!(reply.reply_to(), Some(request_uid.as_str()));
    assert_eq!(reply.access(), ACCESS_ID);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn missing_listener_propagates_over_http() {
    let a = PeerStack::start("aaa").await;
    let b = PeerStack::start("bbb").await;
    a.introduce(&b);

    let request = Message::new("nope", Value::Null);
    let request_uid = request.uid().to_string();
    let error = a
        .herald
        .send("bbb", request, Duration::from_secs(5))
        .await
        .expect_err("send must fail");

    match error {
        HeraldError::NoListener { uid, subject } => {
            assert_eq!(uid, request_uid);
            assert_eq!(subject, "nope");
        }
        other => panic!("expected NoListener, got {other:?}"),
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn get_serves_the_local_peer_description() {
    let a = PeerStack::start("aaa").await;

    let body = reqwest::get(a.access.url())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let description: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(description["uid"], json!("aaa"));
    assert_eq!(description["app_id"], json!("demo"));
    assert!(description["accesses"]
        .as_object()
        .unwrap()
        .contains_key(ACCESS_ID));

    a.stop().await;
}

#[tokio::test]
async fn non_json_posts_become_raw_messages() {
    let b = PeerStack::start("bbb").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.herald
        .add_listener(Arc::new(ForwardListener(tx)), &[SUBJECT_RAW])
        .unwrap();

    let client = reqwest::Client::new();
    client
        .post(b.access.url())
        .header("content-type", "text/plain")
        .body("hello raw")
        .send()
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("raw message must be dispatched")
        .unwrap();
    assert_eq!(message.subject(), SUBJECT_RAW);
    assert_eq!(message.content(), &json!("hello raw"));
    assert_eq!(message.access(), ACCESS_ID);
    assert_eq!(message.extra()["raw"], json!(true));

    b.stop().await;
}

#[tokio::test]
async fn undecodable_json_falls_back_to_raw() {
    let b = PeerStack::start("bbb").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.herald
        .add_listener(Arc::new(ForwardListener(tx)), &[SUBJECT_RAW])
        .unwrap();

    let client = reqwest::Client::new();
    client
        .post(b.access.url())
        .header("content-type", "application/json")
        .body("{\"not\": \"a herald message\"}")
        .send()
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("raw fallback must be dispatched")
        .unwrap();
    assert_eq!(message.subject(), SUBJECT_RAW);

    b.stop().await;
}

#[tokio::test]
async fn group_fan_out_reaches_every_member() {
    let a = PeerStack::start("aaa").await;
    let b = PeerStack::start("bbb").await;
    let c = PeerStack::start("ccc").await;
    a.introduce(&b);
    a.introduce(&c);

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let (tx_c, mut rx_c) = mpsc::unbounded_channel();
    b.herald
        .add_listener(Arc::new(ForwardListener(tx_b)), &["broadcast"])
        .unwrap();
    c.herald
        .add_listener(Arc::new(ForwardListener(tx_c)), &["broadcast"])
        .unwrap();

    let reached = a
        .herald
        .fire_group("all", &Message::new("broadcast", json!(1)))
        .await
        .unwrap();
    assert_eq!(
        reached,
        HashSet::from(["bbb".to_string(), "ccc".to_string()])
    );

    for rx in [&mut rx_b, &mut rx_c] {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("broadcast must arrive")
            .unwrap();
        assert_eq!(message.content(), &json!(1));
    }

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn step1_contact_registers_both_sides() {
    use herald_core::contact::SUBJECT_DISCOVERY_STEP_1;

    let a = PeerStack::start("aaa").await;
    let b = PeerStack::start("bbb").await;

    // What multicast discovery does when it hears an unknown heart-beat:
    // fire step1 at the peer's servlet, addressed by extra only.
    let dump = serde_json::to_value(a.herald.directory().get_local_peer().description()).unwrap();
    let extra = json!({
        "host": "127.0.0.1",
        "port": b.access.port(),
        "path": b.access.path(),
    });
    a.transport
        .fire(None, &Message::new(SUBJECT_DISCOVERY_STEP_1, dump), Some(&extra))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = a.herald.directory().get_peer("bbb").is_ok()
            && b.herald.directory().get_peer("aaa").is_ok();
        if done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "handshake did not converge"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Both sides ended with a usable http access for the other one.
    let b_seen_by_a = a.herald.directory().get_peer("bbb").unwrap();
    assert!(b_seen_by_a.has_access(ACCESS_ID));
    let a_seen_by_b = b.herald.directory().get_peer("aaa").unwrap();
    let patched = HttpAccess::load(a_seen_by_b.get_access(ACCESS_ID).unwrap()).unwrap();
    assert_eq!(patched.host(), "127.0.0.1");
    assert_eq!(patched.port(), a.access.port());

    a.stop().await;
    b.stop().await;
}
