//! Handshake and messaging between in-process peers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use veilchat_core::content::{BlobMetadata, ContentStore};
use veilchat_core::crypto::SecureChannel;
use veilchat_core::identity::IdentityService;
use veilchat_core::messaging::{
    CloseOutcome, EstablishOutcome, LocalPeer, SessionProtocol, SessionRegistry, SessionState,
};
use veilchat_core::protocol::{
    canonical_json, CloseSessionRequest, FetchFileRequest, HandshakePayload, MessageEnvelope,
    RemoteFile, SignedEnvelope, StartSessionRequest,
};
use veilchat_core::transport::PeerTransport;
use veilchat_core::{Error, Result};

const TEST_BITS: usize = 1024;

/// Routes calls straight into the target peer's protocol. Remote errors
/// come back as `UpstreamRejected`, the way an HTTP status would.
#[derive(Default)]
struct Loopback {
    peers: RwLock<HashMap<String, Arc<SessionProtocol>>>,
    files: RwLock<HashMap<String, ContentStore>>,
}

impl Loopback {
    async fn peer(&self, address: &str) -> Result<Arc<SessionProtocol>> {
        self.peers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::UpstreamUnavailable(address.to_string()))
    }

    async fn disconnect(&self, address: &str) {
        self.peers.write().await.remove(address);
    }
}

fn rejected(e: Error) -> Error {
    Error::UpstreamRejected {
        status: e.http_status(),
        detail: e.to_string(),
    }
}

#[async_trait]
impl PeerTransport for Loopback {
    async fn start_session(&self, address: &str, request: &StartSessionRequest) -> Result<()> {
        let peer = self.peer(address).await?;
        peer.accept_incoming(request).await.map(|_| ()).map_err(rejected)
    }

    async fn close_session(&self, address: &str, request: &CloseSessionRequest) -> Result<()> {
        let peer = self.peer(address).await?;
        peer.accept_close(request).await.map(|_| ()).map_err(rejected)
    }

    async fn deliver_message(&self, address: &str, envelope: &SignedEnvelope) -> Result<()> {
        let peer = self.peer(address).await?;
        peer.receive_message(envelope).await.map_err(rejected)
    }

    async fn fetch_file(&self, address: &str, request: &FetchFileRequest) -> Result<RemoteFile> {
        let store = self
            .files
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::UpstreamUnavailable(address.to_string()))?;
        let blob = store.get(&request.file_id).await.map_err(rejected)?;
        Ok(RemoteFile {
            bytes: blob.bytes.to_vec(),
            content_type: Some(blob.content_type),
            file_name: Some(blob.original_name),
        })
    }
}

/// Hangs on every call.
struct Blackhole;

#[async_trait]
impl PeerTransport for Blackhole {
    async fn start_session(&self, _: &str, _: &StartSessionRequest) -> Result<()> {
        std::future::pending().await
    }

    async fn close_session(&self, _: &str, _: &CloseSessionRequest) -> Result<()> {
        std::future::pending().await
    }

    async fn deliver_message(&self, _: &str, _: &SignedEnvelope) -> Result<()> {
        std::future::pending().await
    }

    async fn fetch_file(&self, _: &str, _: &FetchFileRequest) -> Result<RemoteFile> {
        std::future::pending().await
    }
}

/// Holds every handshake for `delay` on the way out and on the way back.
struct SlowHandshakes {
    net: Arc<Loopback>,
    delay: Duration,
}

#[async_trait]
impl PeerTransport for SlowHandshakes {
    async fn start_session(&self, address: &str, request: &StartSessionRequest) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        let result = self.net.start_session(address, request).await;
        tokio::time::sleep(self.delay).await;
        result
    }

    async fn close_session(&self, address: &str, request: &CloseSessionRequest) -> Result<()> {
        self.net.close_session(address, request).await
    }

    async fn deliver_message(&self, address: &str, envelope: &SignedEnvelope) -> Result<()> {
        self.net.deliver_message(address, envelope).await
    }

    async fn fetch_file(&self, address: &str, request: &FetchFileRequest) -> Result<RemoteFile> {
        self.net.fetch_file(address, request).await
    }
}

fn protocol(transport: Arc<dyn PeerTransport>, address: &str, nickname: &str, timeout: Duration) -> SessionProtocol {
    SessionProtocol::new(
        Arc::new(IdentityService::new(TEST_BITS).expect("identity")),
        SessionRegistry::new(),
        transport,
        LocalPeer {
            address: address.to_string(),
            nickname: nickname.to_string(),
        },
        timeout,
    )
}

async fn join(net: &Arc<Loopback>, address: &str, nickname: &str) -> Arc<SessionProtocol> {
    join_via(net, net.clone(), address, nickname).await
}

async fn join_via(
    net: &Arc<Loopback>,
    transport: Arc<dyn PeerTransport>,
    address: &str,
    nickname: &str,
) -> Arc<SessionProtocol> {
    let peer = Arc::new(protocol(transport, address, nickname, Duration::from_secs(10)));
    net.peers
        .write()
        .await
        .insert(address.to_string(), Arc::clone(&peer));
    peer
}

fn public_key(peer: &SessionProtocol) -> String {
    peer.identity().public_key().expect("public key")
}

async fn establish(alice: &SessionProtocol, bob: &SessionProtocol) {
    let outcome = alice
        .initiate(&bob.local().address, &public_key(bob), &bob.local().nickname)
        .await
        .expect("initiate");
    assert_eq!(outcome, EstablishOutcome::Established);
}

/// A handshake from `sender` to `target`, built and signed by hand.
fn handshake(sender: &IdentityService, sender_address: &str, target_public_key: &str) -> StartSessionRequest {
    let channel = SecureChannel::open(target_public_key, "target").expect("open");
    let payload = HandshakePayload {
        sender_address: sender_address.to_string(),
        sender_nickname: "Carol".to_string(),
        sender_public_key: sender.public_key().expect("pk"),
        wrapped_session_key: channel.wrapped_session_key_base64(),
    };
    let signature = sender
        .sign(canonical_json(&payload).expect("json").as_bytes())
        .expect("sign");
    StartSessionRequest { payload, signature }
}

#[tokio::test]
async fn test_initiate_is_idempotent() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;

    establish(&alice, &bob).await;
    let again = alice
        .initiate("peerB", &public_key(&bob), "Bob")
        .await
        .expect("initiate");

    assert_eq!(again, EstablishOutcome::AlreadyEstablished);
    assert_eq!(alice.sessions().len().await, 1);
    assert_eq!(bob.sessions().len().await, 1);
    assert_eq!(bob.session_state("peerA").await, SessionState::Established);
}

#[tokio::test]
async fn test_message_exchange_is_non_draining() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    establish(&alice, &bob).await;

    alice.send_message("peerB", "hello").await.expect("send");
    bob.send_message("peerA", "hi back").await.expect("reply");

    for _ in 0..2 {
        let at_bob = bob.fetch_messages("peerA").await.expect("fetch");
        let texts: Vec<&str> = at_bob.iter().map(|m| m.plaintext.as_str()).collect();
        assert_eq!(texts, vec!["hello", "hi back"]);
        assert_eq!(at_bob[0].sender_label, "peerA");
        assert_eq!(at_bob[1].sender_label, "peerB");
    }

    let at_alice = alice.fetch_messages("peerB").await.expect("fetch");
    assert_eq!(at_alice.len(), 2);
    assert_eq!(at_alice[0].plaintext, "hello");
}

#[tokio::test]
async fn test_send_without_session() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let _bob = join(&net, "peerB", "Bob").await;

    assert!(matches!(
        alice.send_message("peerB", "hello").await,
        Err(Error::NoSession(_))
    ));
    assert!(alice.sessions().is_empty().await);
    assert!(matches!(
        alice.fetch_messages("peerB").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_establish_once() {
    let net = Arc::new(Loopback::default());
    let bob = join(&net, "peerB", "Bob").await;
    let carol = IdentityService::new(TEST_BITS).expect("identity");
    let bob_pk = public_key(&bob);

    let requests: Vec<StartSessionRequest> = (0..8).map(|_| handshake(&carol, "peerC", &bob_pk)).collect();
    let handles: Vec<_> = requests
        .iter()
        .cloned()
        .map(|request| {
            let bob = Arc::clone(&bob);
            tokio::spawn(async move { bob.accept_incoming(&request).await })
        })
        .collect();

    let outcomes: Vec<EstablishOutcome> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("accept"))
        .collect();

    let winners: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| **o == EstablishOutcome::Established)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(bob.sessions().len().await, 1);

    let channel = bob.sessions().channel("peerC").await.expect("channel");
    assert_eq!(
        channel.wrapped_session_key_base64(),
        requests[winners[0]].payload.wrapped_session_key
    );
}

#[tokio::test]
async fn test_handshake_with_bad_signature_is_rejected() {
    let net = Arc::new(Loopback::default());
    let bob = join(&net, "peerB", "Bob").await;
    let carol = IdentityService::new(TEST_BITS).expect("identity");
    let mallory = IdentityService::new(TEST_BITS).expect("identity");

    let mut request = handshake(&carol, "peerC", &public_key(&bob));
    request.payload.sender_public_key = mallory.public_key().expect("pk");

    assert!(matches!(
        bob.accept_incoming(&request).await,
        Err(Error::Authentication)
    ));
    assert!(bob.sessions().is_empty().await);
}

#[tokio::test]
async fn test_handshake_not_wrapped_for_us_fails_unwrap() {
    let net = Arc::new(Loopback::default());
    let bob = join(&net, "peerB", "Bob").await;
    let carol = IdentityService::new(TEST_BITS).expect("identity");
    let someone_else = IdentityService::new(TEST_BITS).expect("identity");

    let request = handshake(&carol, "peerC", &someone_else.public_key().expect("pk"));
    assert!(matches!(
        bob.accept_incoming(&request).await,
        Err(Error::UnwrapFailed)
    ));
    assert!(bob.sessions().is_empty().await);
}

#[tokio::test]
async fn test_close_requires_session_key() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    establish(&alice, &bob).await;

    let mallory = IdentityService::new(TEST_BITS).expect("identity");
    let forged = CloseSessionRequest {
        sender_address: "peerA".into(),
        signature: mallory.sign(b"peerA").expect("sign"),
    };
    assert!(matches!(bob.accept_close(&forged).await, Err(Error::Authentication)));
    assert_eq!(bob.session_state("peerA").await, SessionState::Established);

    let outcome = alice.close_session("peerB").await.expect("close");
    assert_eq!(outcome, CloseOutcome::Closed);
    assert_eq!(alice.session_state("peerB").await, SessionState::NoSession);
    assert_eq!(bob.session_state("peerA").await, SessionState::NoSession);

    // Closing again is a no-op on both sides.
    assert_eq!(alice.close_session("peerB").await.expect("close"), CloseOutcome::NoSession);
    assert_eq!(bob.accept_close(&forged).await.expect("close"), CloseOutcome::NoSession);
}

#[tokio::test]
async fn test_close_with_unreachable_counterpart_is_partial() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    establish(&alice, &bob).await;

    net.disconnect("peerB").await;
    let outcome = alice.close_session("peerB").await.expect("close");

    assert!(outcome.is_partial());
    assert_eq!(alice.session_state("peerB").await, SessionState::NoSession);
}

#[tokio::test]
async fn test_session_can_be_reestablished_after_close() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;

    establish(&alice, &bob).await;
    alice.send_message("peerB", "first").await.expect("send");
    alice.close_session("peerB").await.expect("close");

    establish(&alice, &bob).await;
    alice.send_message("peerB", "second").await.expect("send");
    let messages = bob.fetch_messages("peerA").await.expect("fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "second");
}

#[tokio::test]
async fn test_receive_rejects_forged_and_corrupt_envelopes() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    establish(&alice, &bob).await;

    let envelope = MessageEnvelope {
        ciphertext: "AAAA".into(),
        iv: "AAAAAAAAAAAAAAAAAAAAAA==".into(),
        sender_address: "peerA".into(),
    };
    let bytes = canonical_json(&envelope).expect("json");

    let mallory = IdentityService::new(TEST_BITS).expect("identity");
    let forged = SignedEnvelope {
        envelope: envelope.clone(),
        signature: mallory.sign(bytes.as_bytes()).expect("sign"),
    };
    assert!(matches!(bob.receive_message(&forged).await, Err(Error::Authentication)));

    let corrupt = SignedEnvelope {
        envelope,
        signature: alice.identity().sign(bytes.as_bytes()).expect("sign"),
    };
    assert!(matches!(bob.receive_message(&corrupt).await, Err(Error::DecryptionFailed)));
    assert!(bob.fetch_messages("peerA").await.expect("fetch").is_empty());
}

#[tokio::test]
async fn test_initiate_to_unreachable_leaves_no_session() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let ghost = IdentityService::new(TEST_BITS).expect("identity");

    let result = alice
        .initiate("peerZ", &ghost.public_key().expect("pk"), "Ghost")
        .await;
    assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    assert!(alice.sessions().is_empty().await);
}

#[tokio::test]
async fn test_outbound_calls_time_out() {
    let alice = protocol(Arc::new(Blackhole), "peerA", "Alice", Duration::from_millis(50));
    let bob = IdentityService::new(TEST_BITS).expect("identity");

    let result = alice.initiate("peerB", &bob.public_key().expect("pk"), "Bob").await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(alice.sessions().is_empty().await);

    // Seed a session directly, then close against the hanging counterpart.
    let channel = SecureChannel::open(&bob.public_key().expect("pk"), "Bob").expect("open");
    alice.sessions().insert_if_absent("peerB", Arc::new(channel)).await;
    let outcome = alice.close_session("peerB").await.expect("close");
    assert!(outcome.is_partial());
    assert!(alice.sessions().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_initiation_does_not_deadlock() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    let alice_pk = public_key(&alice);
    let bob_pk = public_key(&bob);

    let a = {
        let alice = Arc::clone(&alice);
        tokio::spawn(async move { alice.initiate("peerB", &bob_pk, "Bob").await })
    };
    let b = {
        let bob = Arc::clone(&bob);
        tokio::spawn(async move { bob.initiate("peerA", &alice_pk, "Alice").await })
    };

    let (a, b) = tokio::time::timeout(Duration::from_secs(30), async { (a.await, b.await) })
        .await
        .expect("no deadlock");
    for result in [a.expect("task"), b.expect("task")] {
        // The higher address may hear the decline before the winning
        // handshake reaches it.
        assert!(matches!(
            result,
            Ok(_) | Err(Error::UpstreamRejected { status: 409, .. })
        ));
    }
    assert_eq!(alice.sessions().len().await, 1);
    assert_eq!(bob.sessions().len().await, 1);
    exchange_both_ways(&alice, &bob).await;
}

/// Both sides must hold the same session key after a cross-initiation.
async fn exchange_both_ways(alice: &SessionProtocol, bob: &SessionProtocol) {
    alice.send_message("peerB", "from alice").await.expect("alice sends");
    bob.send_message("peerA", "from bob").await.expect("bob sends");

    for peer in [alice, bob] {
        let other = if peer.local().address == "peerA" { "peerB" } else { "peerA" };
        let history = peer.fetch_messages(other).await.expect("fetch");
        let texts: Vec<&str> = history.iter().map(|m| m.plaintext.as_str()).collect();
        assert_eq!(texts, vec!["from alice", "from bob"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_crossed_handshakes_keep_lower_address() {
    let net = Arc::new(Loopback::default());
    let slow = |net: &Arc<Loopback>| -> Arc<dyn PeerTransport> {
        Arc::new(SlowHandshakes {
            net: Arc::clone(net),
            delay: Duration::from_millis(200),
        })
    };
    let alice = join_via(&net, slow(&net), "peerA", "Alice").await;
    let bob = join_via(&net, slow(&net), "peerB", "Bob").await;
    let alice_pk = public_key(&alice);
    let bob_pk = public_key(&bob);

    // Both handshakes are in flight before either arrives.
    let (a, b) = tokio::join!(
        alice.initiate("peerB", &bob_pk, "Bob"),
        bob.initiate("peerA", &alice_pk, "Alice"),
    );

    assert_eq!(a.expect("alice initiate"), EstablishOutcome::Established);
    assert_eq!(b.expect("bob initiate"), EstablishOutcome::AlreadyEstablished);
    assert_eq!(alice.sessions().len().await, 1);
    assert_eq!(bob.sessions().len().await, 1);
    exchange_both_ways(&alice, &bob).await;
}

#[tokio::test]
async fn test_crossing_handshake_declined_only_by_lower_address() {
    let carol = IdentityService::new(TEST_BITS).expect("identity");
    let target = IdentityService::new(TEST_BITS).expect("identity");

    for (local, expected_declined) in [("peerA", true), ("peerZ", false)] {
        let peer = Arc::new(protocol(Arc::new(Blackhole), local, "Local", Duration::from_secs(60)));
        let pending = {
            let peer = Arc::clone(&peer);
            let target_pk = target.public_key().expect("pk");
            tokio::spawn(async move { peer.initiate("peerM", &target_pk, "Mid").await })
        };
        // Let the initiate reach the hanging transport.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let crossing = peer
            .accept_incoming(&handshake(&carol, "peerM", &public_key(&peer)))
            .await;
        if expected_declined {
            assert!(matches!(crossing, Err(Error::Conflict(_))));
            assert_eq!(peer.session_state("peerM").await, SessionState::NoSession);
        } else {
            assert_eq!(crossing.expect("accept"), EstablishOutcome::Established);
        }

        // Unrelated senders are unaffected.
        let other = peer
            .accept_incoming(&handshake(&carol, "peerB", &public_key(&peer)))
            .await
            .expect("accept");
        assert_eq!(other, EstablishOutcome::Established);
        pending.abort();
    }
}

#[tokio::test]
async fn test_reset_identity_drops_sessions() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob = join(&net, "peerB", "Bob").await;
    establish(&alice, &bob).await;

    let old_key = public_key(&alice);
    alice.reset_identity().await.expect("reset");

    assert_ne!(public_key(&alice), old_key);
    assert!(alice.sessions().is_empty().await);
    assert!(matches!(
        alice.send_message("peerB", "hello").await,
        Err(Error::NoSession(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_for_new_key_survives_rotation() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let carol = IdentityService::new(TEST_BITS).expect("identity");
    let old_key = public_key(&alice);
    let stale = handshake(&carol, "peerD", &old_key);

    let reset = {
        let alice = Arc::clone(&alice);
        tokio::spawn(async move { alice.reset_identity().await })
    };

    // Handshake as soon as the new key is published.
    let new_key = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let key = public_key(&alice);
            if key != old_key {
                break key;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("new key published");
    let outcome = alice
        .accept_incoming(&handshake(&carol, "peerC", &new_key))
        .await
        .expect("accept");
    reset.await.expect("task").expect("reset");

    assert_eq!(outcome, EstablishOutcome::Established);
    assert_eq!(alice.session_state("peerC").await, SessionState::Established);
    assert!(matches!(
        alice.accept_incoming(&stale).await,
        Err(Error::UnwrapFailed)
    ));
    assert_eq!(alice.sessions().len().await, 1);
}

#[tokio::test]
async fn test_fetch_file_from_counterpart() {
    let net = Arc::new(Loopback::default());
    let alice = join(&net, "peerA", "Alice").await;
    let bob_files = ContentStore::new();
    net.files.write().await.insert("peerB".into(), bob_files.clone());

    let id = bob_files
        .put(
            b"file body".to_vec(),
            BlobMetadata {
                content_type: Some("text/plain".into()),
                original_name: Some("notes.txt".into()),
            },
            None,
        )
        .await
        .expect("put");

    let file = alice.fetch_file("peerB", &id).await.expect("fetch");
    assert_eq!(file.bytes, b"file body");
    assert_eq!(file.file_name.as_deref(), Some("notes.txt"));

    assert!(matches!(
        alice.fetch_file("peerB", "missing").await,
        Err(Error::UpstreamRejected { status: 404, .. })
    ));
}
