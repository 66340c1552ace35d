//! Integration tests for the Torrentium client
//!
//! Several nodes share one in-memory network. Misbehaving providers are
//! scripted around a real `Seeder` so individual replies can be altered,
//! withheld, or the provider taken offline at a chosen moment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use torrentium_client::catalog::Catalog;
use torrentium_client::health::PeerStatus;
use torrentium_client::repository::MemoryRepository;
use torrentium_client::seeder::Seeder;
use torrentium_client::{Config, Node};
use torrentium_core::proto::{Envelope, Payload};
use torrentium_core::transport::memory::{MemoryHost, MemoryNetwork};
use torrentium_core::{ContentId, Error, Host, Location, PeerInfo, PeerStream};
use torrentium_dht::DhtService;

fn test_config(dir: &Path, bootstrap: &[&str]) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_string_lossy().into_owned();
    config.dht.bootstrap_nodes = bootstrap
        .iter()
        .map(|id| MemoryNetwork::address_for(id).as_str().to_string())
        .collect();
    config.dht.query_timeout_secs = 1;
    config.dht.bootstrap_max_attempts = 2;
    config.dht.bootstrap_backoff_ms = 10;
    config.dht.maintenance_interval_secs = 5;
    config.transfer.chunk_size = 16;
    config.transfer.request_timeout_secs = 1;
    config.transfer.chunk_attempts = 2;
    config.health.failure_threshold = 2;
    config.health.probe_timeout_secs = 1;
    config.search.peer_timeout_secs = 1;
    config
}

/// Start a node and join the overlay through `bootstrap`
async fn spawn_node(
    network: &MemoryNetwork,
    root: &TempDir,
    id: &str,
    bootstrap: &[&str],
) -> Arc<Node<MemoryHost>> {
    let config = test_config(&root.path().join(id), bootstrap);
    let node = Arc::new(Node::new(
        Arc::new(network.host(id)),
        Arc::new(MemoryRepository::new()),
        &config,
    ));
    node.start().unwrap();
    node.bootstrap(&CancellationToken::new()).await.unwrap();
    node
}

fn write_file(root: &TempDir, name: &str, body: &[u8]) -> PathBuf {
    let path = root.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// What a scripted provider does with a reply after the hook has seen it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Send,
    /// Send, then drop off the network
    SendThenLeave,
    /// Keep the stream open and never answer
    Withhold,
}

/// A provider whose replies pass through `hook` before being sent
struct ScriptedProvider {
    peer: PeerInfo,
    catalog: Arc<Catalog>,
    dht: Arc<DhtService<MemoryHost>>,
    cancel: CancellationToken,
}

impl ScriptedProvider {
    async fn spawn<F>(
        network: &MemoryNetwork,
        root: &TempDir,
        id: &str,
        bootstrap: &[&str],
        hook: F,
    ) -> Self
    where
        F: Fn(&mut Envelope) -> Script + Send + Sync + 'static,
    {
        let config = test_config(&root.path().join(id), bootstrap);
        let host = Arc::new(network.host(id));
        let peer = host.local_peer().clone();
        let dht = Arc::new(DhtService::new(host.clone(), config.dht_config()));
        let catalog = Arc::new(Catalog::new(
            Arc::new(MemoryRepository::new()),
            config.transfer.chunk_size,
        ));
        let seeder = Seeder::new(dht.clone(), catalog.clone(), Duration::from_secs(1), 50);
        let cancel = CancellationToken::new();

        let network = network.clone();
        let address = peer.address.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut withheld = Vec::new();
            loop {
                let mut stream = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = host.accept() => match accepted {
                        Ok(stream) => stream,
                        Err(_) => break,
                    },
                };
                let Ok(request) = stream.recv().await else {
                    continue;
                };
                let mut reply = seeder.handle_message(&request).await;
                match hook(&mut reply) {
                    Script::Send => {
                        let _ = stream.send(reply.to_bytes()).await;
                    }
                    Script::SendThenLeave => {
                        let _ = stream.send(reply.to_bytes()).await;
                        network.disconnect(&address);
                    }
                    Script::Withhold => withheld.push(stream),
                }
            }
        });

        dht.bootstrap(&CancellationToken::new()).await.unwrap();
        Self {
            peer,
            catalog,
            dht,
            cancel,
        }
    }

    async fn publish(&self, path: &Path) -> ContentId {
        let record = self.catalog.publish(path).await.unwrap();
        self.dht.announce(&record.id).await.unwrap();
        record.id
    }
}

impl Drop for ScriptedProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn is_chunk_response(reply: &Envelope) -> bool {
    matches!(reply.payload, Some(Payload::ChunkResponse(_)))
}

/// Serve everything except chunks, which are never answered
fn withhold_chunks(reply: &mut Envelope) -> Script {
    if is_chunk_response(reply) {
        Script::Withhold
    } else {
        Script::Send
    }
}

fn download_dir_entries(root: &TempDir, node: &str) -> usize {
    std::fs::read_dir(root.path().join(node).join("downloads"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Publish a 3-chunk file on one node, find it by name and identifier on
/// another, download it, then fetch it from the downloader after the
/// original provider leaves.
#[tokio::test]
async fn test_publish_search_download_reprovide() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let alice = spawn_node(&network, &root, "alice", &["seed"]).await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;
    let carol = spawn_node(&network, &root, "carol", &["seed"]).await;

    let body: Vec<u8> = (0..40u8).collect();
    let path = write_file(&root, "Quarterly Report.pdf", &body);
    let cancel = CancellationToken::new();
    let published = alice.publish(&path, &cancel).await.unwrap();
    assert_eq!(published.chunk_count(), 3);
    assert_eq!(published.size, 40);

    // Text search reaches alice and tags her record remote
    let found = bob.search_by_text("quarterly", &cancel).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, published.id);
    assert_eq!(found[0].location, Location::Remote);

    let providers = bob.search_by_identifier(&published.id, &cancel).await.unwrap();
    assert!(providers.iter().any(|p| p.peer.id.as_str() == "alice"));

    let downloaded = bob.download(&published.id, &cancel).await.unwrap();
    assert_eq!(downloaded.id, published.id);
    let bob_path = downloaded.local_path().unwrap().to_path_buf();
    assert_eq!(std::fs::read(&bob_path).unwrap(), body);
    assert!(bob_path.starts_with(root.path().join("bob").join("downloads")));
    assert!(bob.list_local().await.unwrap().iter().any(|r| r.id == published.id));

    // Bob re-provides; carol still gets the file once alice is gone
    network.disconnect(&alice.local_peer().address);
    let providers = carol.search_by_identifier(&published.id, &cancel).await.unwrap();
    assert!(providers.iter().any(|p| p.peer.id.as_str() == "bob"));

    let copy = carol.download(&published.id, &cancel).await.unwrap();
    assert_eq!(std::fs::read(copy.local_path().unwrap()).unwrap(), body);

    // A second download is served from the local copy
    let again = carol.download(&published.id, &cancel).await.unwrap();
    assert_eq!(again.local_path(), copy.local_path());
}

/// The only provider vanishes after serving its first chunk
#[tokio::test]
async fn test_provider_lost_mid_transfer() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let flaky = ScriptedProvider::spawn(&network, &root, "flaky", &["seed"], |reply| {
        if is_chunk_response(reply) {
            Script::SendThenLeave
        } else {
            Script::Send
        }
    })
    .await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;

    let path = write_file(&root, "movie.mkv", &[9u8; 64]);
    let id = flaky.publish(&path).await;

    let result = bob.download(&id, &CancellationToken::new()).await;
    assert!(
        matches!(result, Err(Error::DownloadFailed { .. })),
        "unexpected result: {:?}",
        result
    );

    // Nothing partial left behind and nothing recorded
    assert_eq!(download_dir_entries(&root, "bob"), 0);
    assert!(bob.list_local().await.unwrap().is_empty());

    let state = bob.health_status(&flaky.peer.id).unwrap();
    assert_ne!(state.status, PeerStatus::Connected);
}

/// A provider serving corrupt chunks is routed around
#[tokio::test]
async fn test_corrupt_provider_is_excluded() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let honest = spawn_node(&network, &root, "honest", &["seed"]).await;

    let tampered = Arc::new(AtomicUsize::new(0));
    let counter = tampered.clone();
    let liar = ScriptedProvider::spawn(&network, &root, "liar", &["seed"], move |reply| {
        if let Some(Payload::ChunkResponse(resp)) = reply.payload.as_mut() {
            let mut data = resp.data.to_vec();
            data[0] ^= 0xff;
            resp.data = data.into();
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Script::Send
    })
    .await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;

    let body: Vec<u8> = (0..48u8).rev().collect();
    let path = write_file(&root, "dataset.csv", &body);
    let cancel = CancellationToken::new();
    let record = honest.publish(&path, &cancel).await.unwrap();
    assert_eq!(liar.publish(&path).await, record.id);

    let downloaded = bob.download(&record.id, &cancel).await.unwrap();
    assert_eq!(std::fs::read(downloaded.local_path().unwrap()).unwrap(), body);
    assert!(tampered.load(Ordering::SeqCst) > 0);
}

/// Cancelling while chunks are in flight stops the download cleanly
#[tokio::test]
async fn test_cancel_running_download() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let stalled = ScriptedProvider::spawn(&network, &root, "stalled", &["seed"], withhold_chunks).await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;

    let id = stalled.publish(&write_file(&root, "backup.tar", &[4u8; 50])).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = bob.download(&id, &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)), "unexpected result: {:?}", result);
    assert!(started.elapsed() < Duration::from_millis(1500));

    assert_eq!(download_dir_entries(&root, "bob"), 0);
    assert!(bob.catalog().lookup(&id).await.unwrap().is_none());
    assert!(bob.list_local().await.unwrap().is_empty());
}

/// A provider that stops answering chunk requests is given up on after its
/// attempts run out; its chunks move to the other provider
#[tokio::test]
async fn test_exhausted_provider_is_replaced() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let honest = spawn_node(&network, &root, "honest", &["seed"]).await;
    let quitter = ScriptedProvider::spawn(&network, &root, "quitter", &["seed"], withhold_chunks).await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;

    let body: Vec<u8> = (0..48u8).collect();
    let path = write_file(&root, "photos.zip", &body);
    let cancel = CancellationToken::new();
    let record = honest.publish(&path, &cancel).await.unwrap();
    assert_eq!(quitter.publish(&path).await, record.id);

    let downloaded = bob.download(&record.id, &cancel).await.unwrap();
    assert_eq!(std::fs::read(downloaded.local_path().unwrap()).unwrap(), body);

    let state = bob.health_status(&quitter.peer.id).unwrap();
    assert_eq!(state.status, PeerStatus::Unhealthy);
    assert!(state.last_error.is_some());
    assert_eq!(
        bob.health_status(&honest.local_peer().id).unwrap().status,
        PeerStatus::Connected
    );
}

/// Simultaneous downloads of one identifier share a single copy
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_downloads_of_same_content() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let _seed = spawn_node(&network, &root, "seed", &[]).await;
    let alice = spawn_node(&network, &root, "alice", &["seed"]).await;
    let bob = spawn_node(&network, &root, "bob", &["seed"]).await;

    let body: Vec<u8> = (0..70u8).collect();
    let cancel = CancellationToken::new();
    let record = alice
        .publish(&write_file(&root, "lecture.mp4", &body), &cancel)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let bob = bob.clone();
        let id = record.id;
        handles.push(tokio::spawn(async move {
            bob.download(&id, &CancellationToken::new()).await
        }));
    }
    let mut paths = Vec::new();
    for handle in handles {
        let downloaded = handle.await.unwrap().unwrap();
        paths.push(downloaded.local_path().unwrap().to_path_buf());
    }

    assert!(paths.iter().all(|p| *p == paths[0]));
    assert_eq!(std::fs::read(&paths[0]).unwrap(), body);
    assert_eq!(download_dir_entries(&root, "bob"), 1);
    assert_eq!(bob.list_local().await.unwrap().len(), 1);
}

/// Peers that are gone or silent never fail a text search
#[tokio::test]
async fn test_text_search_degrades_gracefully() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let alice = spawn_node(&network, &root, "alice", &[]).await;
    let bob = spawn_node(&network, &root, "bob", &["alice"]).await;
    let cancel = CancellationToken::new();

    alice
        .publish(&write_file(&root, "notes-alice.txt", b"alice's notes"), &cancel)
        .await
        .unwrap();
    bob.publish(&write_file(&root, "notes-bob.txt", b"bob's notes"), &cancel)
        .await
        .unwrap();

    let results = alice.search_by_text("notes", &cancel).await.unwrap();
    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["notes-alice.txt", "notes-bob.txt"]);
    assert!(results[0].is_local());
    assert!(!results[1].is_local());

    // One peer gone, one that accepts and never answers
    network.disconnect(&bob.local_peer().address);
    let silent = network.host("silent");
    alice.dht().observe(silent.local_peer());

    let started = Instant::now();
    let results = alice.search_by_text("notes", &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "notes-alice.txt");
}

/// Connected -> Disconnected -> Unhealthy -> Connected
#[tokio::test]
async fn test_health_transitions() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let alice = spawn_node(&network, &root, "alice", &[]).await;
    let bob = spawn_node(&network, &root, "bob", &["alice"]).await;
    let bob_peer = bob.local_peer().clone();

    alice.health().probe(&bob_peer).await.unwrap();
    let state = alice.health_status(&bob_peer.id).unwrap();
    assert_eq!(state.status, PeerStatus::Connected);
    assert!(state.last_latency.is_some());
    assert!(alice
        .list_connected_peers()
        .iter()
        .any(|s| s.peer.id == bob_peer.id));

    network.disconnect(&bob_peer.address);
    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.health_status(&bob_peer.id).unwrap().status != PeerStatus::Disconnected {
        assert!(Instant::now() < deadline, "close event not observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for _ in 0..2 {
        assert!(alice.health().probe(&bob_peer).await.is_err());
    }
    let state = alice.health_status(&bob_peer.id).unwrap();
    assert_eq!(state.status, PeerStatus::Unhealthy);
    assert_eq!(state.consecutive_failures, 2);
    assert!(state.last_error.is_some());
    assert_eq!(alice.debug_snapshot().count(PeerStatus::Unhealthy), 1);

    // Maintenance re-probes unhealthy peers; one success restores them
    network.reconnect(&bob_peer.address);
    alice.maintain_now().await;
    assert_eq!(
        alice.health_status(&bob_peer.id).unwrap().status,
        PeerStatus::Connected
    );
}

/// Providers stay discoverable while any bootstrap node is reachable
#[tokio::test]
async fn test_discovery_survives_bootstrap_loss() {
    let root = TempDir::new().unwrap();
    let network = MemoryNetwork::new();

    let seed1 = spawn_node(&network, &root, "seed1", &[]).await;
    let _seed2 = spawn_node(&network, &root, "seed2", &["seed1"]).await;
    let alice = spawn_node(&network, &root, "alice", &["seed1", "seed2"]).await;

    let cancel = CancellationToken::new();
    let record = alice
        .publish(&write_file(&root, "album.flac", &[1u8; 33]), &cancel)
        .await
        .unwrap();

    network.disconnect(&seed1.local_peer().address);
    let bob = spawn_node(&network, &root, "bob", &["seed1", "seed2"]).await;

    let providers = bob.search_by_identifier(&record.id, &cancel).await.unwrap();
    assert!(providers.iter().any(|p| p.peer.id.as_str() == "alice"));

    let report = bob.maintain_now().await.unwrap();
    assert_eq!(report.bootstrap_reachable, 1);
    assert!(!report.rebootstrapped);

    for node in [&alice, &bob] {
        node.shutdown().await.unwrap();
    }
}
