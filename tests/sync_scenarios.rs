//! End-to-end scenarios exercising the sync protocol across real (in-memory)
//! channels rather than unit-testing individual handlers.

use std::sync::Arc;
use std::time::Duration;
use syncrepo::adapters::memory::{InMemoryAdapter, InMemoryBridge};
use syncrepo::rules::{ComposedRules, Operation, RuleContext, Rules};
use syncrepo::{AllowAll, DocId, Identity, IdentityType, PeerId, Repo, Synchronizer};

fn identity(name: &str) -> Identity {
    Identity::new(PeerId::new(name), name, IdentityType::User)
}

async fn paired_repos(name_a: &str, name_b: &str) -> (Repo, Repo) {
    paired_repos_with_rules(name_a, name_b, AllowAll, AllowAll).await
}

async fn paired_repos_with_rules(
    name_a: &str,
    name_b: &str,
    rules_a: impl Rules + 'static,
    rules_b: impl Rules + 'static,
) -> (Repo, Repo) {
    let adapter_a = InMemoryAdapter::new(format!("{name_a}-adapter"));
    let adapter_b = InMemoryAdapter::new(format!("{name_b}-adapter"));

    let sync_a = Synchronizer::builder()
        .identity(identity(name_a))
        .rules(rules_a)
        .adapter(adapter_a.clone())
        .build();
    let sync_b = Synchronizer::builder()
        .identity(identity(name_b))
        .rules(rules_b)
        .adapter(adapter_b.clone())
        .build();

    let repo_a = Repo::new(sync_a);
    let repo_b = Repo::new(sync_b);
    repo_a.start().await.unwrap();
    repo_b.start().await.unwrap();

    InMemoryBridge::connect(&adapter_a, &adapter_b, format!("{name_a}-{name_b}"));

    (repo_a, repo_b)
}

/// Scenario 1 (spec §8): alice sets a document's title locally; bob, who
/// has never seen the document, converges to the same value once synced.
#[tokio::test]
async fn two_peer_text_sync_converges() {
    let (alice, bob) = paired_repos("alice", "bob").await;

    let doc_id = DocId::from("d1");
    let doc = alice.get(doc_id.clone());
    doc.with_map_doc(|d| d.set_text("title", "Hello")).unwrap();

    bob.subscribe(
        &doc_id,
        None,
        |states| states.iter().any(|s| s.status == syncrepo::ReadyStatus::Synced),
        Duration::from_secs(5),
        None,
    )
    .await
    .unwrap();

    let bob_doc = bob.get(doc_id);
    let title = bob_doc.with_map_doc(|d| d.get_text("title").map(str::to_owned));
    assert_eq!(title, Some(Some("Hello".to_string())));
}

/// Scenario 2 (spec §8): alice and bob concurrently increment the same
/// counter from different starting knowledge; both converge to the sum.
#[tokio::test]
async fn concurrent_counter_increments_converge_by_addition() {
    let (alice, bob) = paired_repos("alice", "bob").await;
    let doc_id = DocId::from("counter-doc");

    let alice_doc = alice.get(doc_id.clone());
    alice_doc.with_map_doc(|d| d.increment("c", 10)).unwrap();

    let bob_doc = bob.get(doc_id.clone());
    bob_doc.with_map_doc(|d| d.increment("c", 20)).unwrap();

    alice
        .subscribe(
            &doc_id,
            None,
            |states| states.iter().any(|s| s.status == syncrepo::ReadyStatus::Synced),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap();
    bob.subscribe(
        &doc_id,
        None,
        |states| states.iter().any(|s| s.status == syncrepo::ReadyStatus::Synced),
        Duration::from_secs(5),
        None,
    )
    .await
    .unwrap();

    assert_eq!(alice_doc.with_map_doc(|d| d.get_counter("c")), Some(30));
    assert_eq!(bob_doc.with_map_doc(|d| d.get_counter("c")), Some(30));
}

/// Scenario 3 (spec §8): a star topology — alice writes, the hub relays to
/// every spoke, every spoke converges.
#[tokio::test]
async fn star_topology_fans_out_to_every_peer() {
    let hub_adapter = InMemoryAdapter::new("hub");
    let spoke1_adapter = InMemoryAdapter::new("spoke1");
    let spoke2_adapter = InMemoryAdapter::new("spoke2");

    let hub_sync = Synchronizer::builder()
        .identity(identity("hub"))
        .adapter(hub_adapter.clone())
        .build();
    let spoke1_sync = Synchronizer::builder()
        .identity(identity("spoke1"))
        .adapter(spoke1_adapter.clone())
        .build();
    let spoke2_sync = Synchronizer::builder()
        .identity(identity("spoke2"))
        .adapter(spoke2_adapter.clone())
        .build();

    let hub = Repo::new(hub_sync);
    let spoke1 = Repo::new(spoke1_sync);
    let spoke2 = Repo::new(spoke2_sync);
    hub.start().await.unwrap();
    spoke1.start().await.unwrap();
    spoke2.start().await.unwrap();

    InMemoryBridge::connect(&hub_adapter, &spoke1_adapter, "hub-spoke1");
    InMemoryBridge::connect(&hub_adapter, &spoke2_adapter, "hub-spoke2");

    let doc_id = DocId::from("announcement");
    let hub_doc = hub.get(doc_id.clone());
    hub_doc
        .with_map_doc(|d| d.set_text("body", "all hands at 10am"))
        .unwrap();

    for spoke in [&spoke1, &spoke2] {
        spoke
            .subscribe(
                &doc_id,
                None,
                |states| states.iter().any(|s| s.status == syncrepo::ReadyStatus::Synced),
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap();
    }

    let spoke1_doc = spoke1.get(doc_id.clone());
    let spoke2_doc = spoke2.get(doc_id);
    assert_eq!(
        spoke1_doc.with_map_doc(|d| d.get_text("body").map(str::to_owned)),
        Some(Some("all hands at 10am".to_string()))
    );
    assert_eq!(
        spoke2_doc.with_map_doc(|d| d.get_text("body").map(str::to_owned)),
        Some(Some("all hands at 10am".to_string()))
    );
}

/// Scenario 4 (spec §8, §4.1): a server-style adapter sees the same logical
/// remote reconnect; the stale channel must be superseded, never duplicated.
#[tokio::test]
async fn reconnecting_peer_supersedes_its_stale_channel() {
    let server_adapter = InMemoryAdapter::new("server");
    let client_adapter = InMemoryAdapter::new("client");

    let server_sync = Synchronizer::builder()
        .identity(identity("server"))
        .adapter(server_adapter.clone())
        .build();
    let client_sync = Synchronizer::builder()
        .identity(identity("client"))
        .adapter(client_adapter.clone())
        .build();

    server_sync.start().await.unwrap();
    client_sync.start().await.unwrap();

    InMemoryBridge::connect(&server_adapter, &client_adapter, "client-1");
    let doc_id = DocId::from("shared");
    server_sync.get_or_create_doc(&doc_id);
    server_sync
        .wait_until_ready(&doc_id, None, |states| !states.is_empty(), Duration::from_secs(5), None)
        .await
        .unwrap();
    let before = server_sync.snapshot();

    // Same logical client reconnects on a fresh in-process channel.
    let client_adapter_2 = InMemoryAdapter::new("client-2");
    let client_sync_2 = Synchronizer::builder()
        .identity(identity("client"))
        .adapter(client_adapter_2.clone())
        .build();
    client_sync_2.start().await.unwrap();
    InMemoryBridge::connect(&server_adapter, &client_adapter_2, "client-1");

    server_sync
        .wait_until_ready(
            &doc_id,
            None,
            |states| states.iter().all(|s| s.channels.len() == 1),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap();

    let after = server_sync.snapshot();
    // Exactly one channel replaced the other; the count never grows.
    assert_eq!(before.channel_count, after.channel_count);
}

/// Ephemeral (presence) changes fan out independently of CRDT updates (spec
/// §4.5, §6.2): alice's cursor-position write reaches bob with no document
/// mutation involved at all.
#[tokio::test]
async fn ephemeral_presence_fans_out_without_a_doc_update() {
    let (alice, bob) = paired_repos("alice", "bob").await;
    let doc_id = DocId::from("shared-doc");

    // Touch the document on both sides first so there's an established,
    // subscribed channel for the ephemeral fan-out to ride on.
    let _ = alice.get(doc_id.clone());
    let _ = bob.get(doc_id.clone());
    bob.subscribe(
        &doc_id,
        None,
        |states| !states.is_empty(),
        Duration::from_secs(5),
        None,
    )
    .await
    .unwrap();

    let alice_presence = alice.ephemeral(&doc_id);
    alice_presence.with_map_store(|s| s.set("cursor", serde_json::json!(42))).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let bob_presence = bob.ephemeral(&doc_id);
    let cursor = bob_presence.with_map_store(|s| s.get("cursor").cloned());
    assert_eq!(cursor, Some(Some(serde_json::json!(42))));
}

struct DenyDoc {
    denied: DocId,
}

impl Rules for DenyDoc {
    fn can_reveal(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.doc_id != &self.denied
    }
}

/// Scenario 5 (spec §8): a document gated by `canReveal = false` is never
/// disclosed to a peer — it doesn't even appear as `absent`, it's silent.
#[tokio::test]
async fn undisclosed_document_never_reaches_peer() {
    let secret_id = DocId::from("secret");
    let (alice, bob) = paired_repos_with_rules(
        "alice",
        "bob",
        ComposedRules::new().push(DenyDoc {
            denied: secret_id.clone(),
        }),
        AllowAll,
    )
    .await;

    let alice_doc = alice.get(secret_id.clone());
    alice_doc.with_map_doc(|d| d.set_text("body", "eyes only")).unwrap();

    // Give the bridge a moment to exchange whatever it's going to exchange.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!bob.has(&secret_id));
}

struct DenyAccept;
impl Rules for DenyAccept {
    fn can_accept(&self, _ctx: &RuleContext<'_>) -> bool {
        false
    }
}

/// Scenario 6 (spec §8): a peer that refuses to accept updates never
/// converges, even though the document is revealed to it.
#[tokio::test]
async fn peer_refusing_updates_never_converges() {
    let (alice, bob) = paired_repos_with_rules("alice", "bob", AllowAll, DenyAccept).await;

    let doc_id = DocId::from("readonly-for-bob");
    let alice_doc = alice.get(doc_id.clone());
    alice_doc.with_map_doc(|d| d.set_text("title", "v1")).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let bob_doc = bob.get(doc_id);
    assert_eq!(bob_doc.with_map_doc(|d| d.get_text("title").map(str::to_owned)), Some(None));
}
