//! The node: wires the catalog, discovery, search, transfers and health
//! tracking together behind the operations an operator uses.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::downloader::{DownloadManager, DownloadSettings};
use crate::health::{HealthMonitor, HealthSnapshot, PeerConnectionState};
use crate::maintenance::{Maintenance, MaintenanceSettings};
use crate::repository::MetadataRepository;
use crate::search::SearchResolver;
use crate::seeder::{run_seeder_loop, Seeder};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use torrentium_core::{
    ContentId, Error, FileRecord, Host, PeerId, PeerInfo, ProviderRecord, Result,
};
use torrentium_dht::{DhtService, DhtState, MaintenanceReport};

pub struct Node<H: Host> {
    host: Arc<H>,
    dht: Arc<DhtService<H>>,
    catalog: Arc<Catalog>,
    health: Arc<HealthMonitor<H>>,
    search: SearchResolver<H>,
    downloads: DownloadManager<H>,
    seeder: Arc<Seeder<H>>,
    maintenance: MaintenanceSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: Host> Node<H> {
    /// Build a node on `host`, storing metadata in `repo`
    pub fn new(host: Arc<H>, repo: Arc<dyn MetadataRepository>, config: &Config) -> Self {
        let dht = Arc::new(DhtService::new(host.clone(), config.dht_config()));
        let catalog = Arc::new(Catalog::new(repo, config.transfer.chunk_size));
        let health = Arc::new(HealthMonitor::new(
            host.clone(),
            config.health.failure_threshold,
            config.probe_timeout(),
        ));

        let search = SearchResolver::new(
            dht.clone(),
            catalog.clone(),
            health.clone(),
            config.search_peer_timeout(),
            config.search.max_results,
        );
        let downloads = DownloadManager::new(
            dht.clone(),
            catalog.clone(),
            health.clone(),
            DownloadSettings {
                max_concurrent_requests: config.transfer.max_concurrent_requests,
                request_timeout: config.request_timeout(),
                chunk_attempts: config.transfer.chunk_attempts,
                download_dir: config.download_dir(),
            },
        );
        let seeder = Arc::new(Seeder::new(
            dht.clone(),
            catalog.clone(),
            config.request_timeout(),
            config.search.max_results,
        ));

        Self {
            host,
            dht,
            catalog,
            health,
            search,
            downloads,
            seeder,
            maintenance: MaintenanceSettings {
                interval: config.maintenance_interval(),
                jitter: config.maintenance_jitter(),
            },
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_peer(&self) -> &PeerInfo {
        self.host.local_peer()
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn dht(&self) -> &Arc<DhtService<H>> {
        &self.dht
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn health(&self) -> &Arc<HealthMonitor<H>> {
        &self.health
    }

    /// A token that is cancelled when the node shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Start serving inbound requests and tracking host events.
    ///
    /// Peers remembered from earlier runs are fed to the routing table.
    pub fn start(&self) -> Result<()> {
        let known = self.catalog.repository().list_peers()?;
        for known in &known {
            self.dht.observe(&known.peer);
        }
        if !known.is_empty() {
            tracing::debug!("Restored {} known peer(s)", known.len());
        }

        let seeder = tokio::spawn(run_seeder_loop(self.seeder.clone(), self.cancel.clone()));
        let events = self.health.watch_events(self.cancel.clone());
        self.tasks().extend([seeder, events]);

        tracing::info!("Node {} started", self.local_peer());
        Ok(())
    }

    /// Join the overlay through the configured bootstrap nodes
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<usize> {
        Ok(self.dht.bootstrap(cancel).await?)
    }

    /// Spawn the periodic maintenance task, bound to the node's lifetime
    pub fn start_maintenance(&self) {
        let task = Maintenance::new(
            self.dht.clone(),
            self.catalog.clone(),
            self.health.clone(),
            self.maintenance,
        )
        .spawn(self.cancel.clone());
        self.tasks().push(task);
    }

    /// Run one maintenance cycle now
    pub async fn maintain_now(&self) -> Option<MaintenanceReport> {
        Maintenance::new(
            self.dht.clone(),
            self.catalog.clone(),
            self.health.clone(),
            self.maintenance,
        )
        .run_cycle(&self.cancel)
        .await
    }

    /// Publish a local file and announce it. The record is kept even when
    /// the announcement fails; the next maintenance cycle retries it.
    pub async fn publish(&self, path: &Path, cancel: &CancellationToken) -> Result<FileRecord> {
        cancellable(cancel, async {
            let record = self.catalog.publish(path).await?;
            match self.dht.announce(&record.id).await {
                Ok(n) => tracing::debug!("Announced {} to {} node(s)", record.id.short(), n),
                Err(e) => tracing::warn!("Failed to announce {}: {}", record.id.short(), e),
            }
            Ok(record)
        })
        .await
    }

    pub async fn list_local(&self) -> Result<Vec<FileRecord>> {
        self.catalog.list_local().await
    }

    pub async fn search_by_identifier(
        &self,
        id: &ContentId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderRecord>> {
        cancellable(cancel, self.search.search_by_identifier(id)).await
    }

    pub async fn search_by_text(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileRecord>> {
        cancellable(cancel, self.search.search_by_text(query)).await
    }

    pub async fn download(&self, id: &ContentId, cancel: &CancellationToken) -> Result<FileRecord> {
        self.downloads.download(id, cancel).await
    }

    pub fn list_connected_peers(&self) -> Vec<PeerConnectionState> {
        self.health.list_connected()
    }

    pub fn health_status(&self, peer_id: &PeerId) -> Option<PeerConnectionState> {
        self.health.status(peer_id)
    }

    pub fn debug_snapshot(&self) -> HealthSnapshot {
        self.health
            .debug_snapshot(self.dht.state(), self.dht.routing_table_size())
    }

    pub fn dht_state(&self) -> DhtState {
        self.dht.state()
    }

    /// Cancel background work, wait for it, and close the host
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down node {}", self.local_peer().id);
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("Background task panicked: {}", e);
                }
            }
        }

        self.host.close().await
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = work => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use tempfile::TempDir;
    use torrentium_core::transport::memory::{MemoryHost, MemoryNetwork};

    fn node(network: &MemoryNetwork, id: &str, dir: &TempDir) -> Node<MemoryHost> {
        let mut config = Config::default();
        config.data_dir = dir.path().join(id).to_string_lossy().into_owned();
        config.transfer.chunk_size = 16;
        Node::new(
            Arc::new(network.host(id)),
            Arc::new(MemoryRepository::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_standalone_publish_and_list() {
        let dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let node = node(&network, "solo", &dir);
        node.start().unwrap();
        assert_eq!(node.bootstrap(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(node.dht_state(), DhtState::Active);

        let path = dir.path().join("song.ogg");
        std::fs::write(&path, vec![3u8; 40]).unwrap();
        let cancel = CancellationToken::new();
        let record = node.publish(&path, &cancel).await.unwrap();
        assert_eq!(record.chunk_count(), 3);

        let listed = node.list_local().await.unwrap();
        assert_eq!(listed.len(), 1);
        let providers = node.search_by_identifier(&record.id, &cancel).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer.id.as_str(), "solo");

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_publish() {
        let dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let node = node(&network, "solo", &dir);
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"bytes").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            node.publish(&path, &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let node = node(&network, "solo", &dir);
        node.start().unwrap();
        node.start_maintenance();
        let token = node.cancellation_token();

        tokio::time::timeout(std::time::Duration::from_secs(5), node.shutdown())
            .await
            .expect("shutdown hung")
            .unwrap();
        assert!(token.is_cancelled());
        assert!(node.tasks().is_empty());
    }
}
