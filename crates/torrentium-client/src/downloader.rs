//! Chunked multi-peer downloads
//!
//! A download resolves providers through the DHT, probes them, obtains a
//! self-consistent manifest, then spreads chunk fetches over the reachable
//! providers. Chunks are verified strictly in index order and the file is
//! only written once every chunk has passed.

use crate::catalog::Catalog;
use crate::health::HealthMonitor;
use bitvec::prelude::*;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use torrentium_core::chunk::{reassemble_file, verify_chunk};
use torrentium_core::proto::{self, Payload};
use torrentium_core::{
    now_unix_secs, rpc, ContentId, Error, FileRecord, Host, Location, PeerId, PeerInfo, Result,
};
use torrentium_dht::DhtService;

/// Progress of one chunk within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Verified,
    Failed,
}

/// Bookkeeping for a single download call
#[derive(Debug)]
pub struct DownloadSession {
    pub id: ContentId,
    pub manifest: FileRecord,
    states: Vec<ChunkState>,
    excluded: Vec<HashSet<PeerId>>,
    verified: BitVec,
    /// Received but waiting for lower indices to verify
    received: BTreeMap<u32, (Bytes, PeerId)>,
    data: Vec<Option<Bytes>>,
    /// Lowest unverified index
    cursor: u32,
}

impl DownloadSession {
    pub fn new(manifest: FileRecord) -> Self {
        let total = manifest.chunks.len();
        Self {
            id: manifest.id,
            states: vec![ChunkState::Pending; total],
            excluded: vec![HashSet::new(); total],
            verified: bitvec![0; total],
            received: BTreeMap::new(),
            data: vec![None; total],
            cursor: 0,
            manifest,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn state(&self, index: u32) -> Option<ChunkState> {
        self.states.get(index as usize).copied()
    }

    /// Lowest chunk waiting for a provider
    pub fn next_pending(&self) -> Option<u32> {
        self.states
            .iter()
            .position(|s| *s == ChunkState::Pending)
            .map(|i| i as u32)
    }

    pub fn assign(&mut self, index: u32) {
        self.states[index as usize] = ChunkState::InFlight;
    }

    /// Put a chunk back in the queue
    pub fn requeue(&mut self, index: u32) {
        self.states[index as usize] = ChunkState::Pending;
    }

    pub fn fail(&mut self, index: u32) {
        self.states[index as usize] = ChunkState::Failed;
    }

    /// Never ask `peer` for this chunk again
    pub fn exclude(&mut self, index: u32, peer: &PeerId) {
        self.excluded[index as usize].insert(peer.clone());
    }

    pub fn is_excluded(&self, index: u32, peer: &PeerId) -> bool {
        self.excluded
            .get(index as usize)
            .map(|set| set.contains(peer))
            .unwrap_or(false)
    }

    /// Accept chunk data and verify everything now contiguous with the
    /// verified prefix. Returns the chunks that failed verification together
    /// with the peer that sent them; those are excluded and requeued.
    pub fn receive(&mut self, index: u32, data: Bytes, from: PeerId) -> Vec<(u32, PeerId, Error)> {
        self.received.insert(index, (data, from));

        let mut failures = Vec::new();
        while let Some((data, from)) = self.received.remove(&self.cursor) {
            let i = self.cursor as usize;
            match verify_chunk(&data, &self.manifest.chunks[i]) {
                Ok(()) => {
                    self.states[i] = ChunkState::Verified;
                    self.verified.set(i, true);
                    self.data[i] = Some(data);
                    self.cursor += 1;
                }
                Err(e) => {
                    self.exclude(self.cursor, &from);
                    self.requeue(self.cursor);
                    failures.push((self.cursor, from, e));
                    break;
                }
            }
        }
        failures
    }

    pub fn is_complete(&self) -> bool {
        self.verified.all()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.count_ones()
    }

    pub fn progress(&self) -> f64 {
        if self.states.is_empty() {
            return 100.0;
        }
        (self.verified_count() as f64 / self.states.len() as f64) * 100.0
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        self.verified.iter_zeros().map(|i| i as u32).collect()
    }

    /// Verified chunk data in index order, once complete
    pub fn into_chunks(self) -> Option<Vec<Bytes>> {
        if !self.is_complete() {
            return None;
        }
        self.data.into_iter().collect()
    }
}

/// Transfer tuning, taken from the `[transfer]` config section
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub chunk_attempts: u32,
    pub download_dir: PathBuf,
}

/// Result of one fetch task
struct FetchOutcome {
    index: u32,
    provider: PeerInfo,
    elapsed: Duration,
    result: Result<Bytes>,
}

/// Downloads content by identifier from the providers the DHT reports
pub struct DownloadManager<H: Host> {
    dht: Arc<DhtService<H>>,
    catalog: Arc<Catalog>,
    health: Arc<HealthMonitor<H>>,
    settings: DownloadSettings,
    /// One running download per identifier
    key_locks: Mutex<HashMap<ContentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<H: Host> DownloadManager<H> {
    pub fn new(
        dht: Arc<DhtService<H>>,
        catalog: Arc<Catalog>,
        health: Arc<HealthMonitor<H>>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            dht,
            catalog,
            health,
            settings,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Download `id` and return the new local record.
    ///
    /// Calls for the same identifier run one after another, so a second
    /// caller gets the copy the first one stored.
    pub async fn download(&self, id: &ContentId, cancel: &CancellationToken) -> Result<FileRecord> {
        let lock = self.key_lock(id);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock.lock() => {
                let result = self.run(id, cancel).await;
                drop(guard);
                result
            }
        };
        self.release_key_lock(id, lock);

        if matches!(result, Err(Error::Cancelled)) {
            tracing::info!("Download of {} cancelled", id.short());
        }
        result
    }

    async fn run(&self, id: &ContentId, cancel: &CancellationToken) -> Result<FileRecord> {
        if let Some(existing) = self.local_copy(id).await? {
            tracing::info!("{} is already held locally", id.short());
            return Ok(existing);
        }

        let (manifest, chunks) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            fetched = self.fetch(id) => fetched?,
        };

        let path = self.write_file(&manifest, chunks, cancel).await?;
        let record = self
            .catalog
            .store(FileRecord {
                location: Location::Local(path),
                created_at: now_unix_secs(),
                ..manifest
            })
            .await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Skipping announce of {}, download cancelled", id.short());
            }
            announced = self.dht.announce(id) => {
                if let Err(e) = announced {
                    tracing::warn!("Failed to announce {} after download: {}", id.short(), e);
                }
            }
        }
        Ok(record)
    }

    /// Our stored record for `id`, if its file is still on disk
    async fn local_copy(&self, id: &ContentId) -> Result<Option<FileRecord>> {
        let Some(record) = self.catalog.lookup(id).await? else {
            return Ok(None);
        };
        let Some(path) = record.local_path().map(Path::to_path_buf) else {
            return Ok(None);
        };
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        Ok(exists.then_some(record))
    }

    /// Resolve providers and a manifest, then fetch every chunk
    async fn fetch(&self, id: &ContentId) -> Result<(FileRecord, Vec<Bytes>)> {
        let local_id = self.dht.local_peer().id.clone();
        let providers: Vec<PeerInfo> = self
            .dht
            .find_providers(id)
            .await?
            .into_iter()
            .map(|p| p.peer)
            .filter(|p| p.id != local_id)
            .collect();
        if providers.is_empty() {
            return Err(Error::NotFound(format!("no providers for {}", id)));
        }
        tracing::info!("Found {} provider(s) for {}", providers.len(), id.short());

        let reachable = self.probe_providers(providers).await;
        if reachable.is_empty() {
            return Err(failed(id, "no reachable provider"));
        }

        let (manifest, reachable) = self.resolve_manifest(id, reachable).await?;
        tracing::info!(
            "Downloading {} ({} bytes, {} chunks) from {} provider(s)",
            manifest.name,
            manifest.size,
            manifest.chunk_count(),
            reachable.len()
        );

        let session = self.fetch_chunks(DownloadSession::new(manifest), reachable).await?;
        let manifest = session.manifest.clone();
        let chunks = session
            .into_chunks()
            .ok_or_else(|| failed(id, "session ended incomplete"))?;
        Ok((manifest, chunks))
    }

    /// Probe providers concurrently, keeping the order they were given in.
    /// Peers already marked unhealthy are skipped.
    async fn probe_providers(&self, providers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let mut set = JoinSet::new();
        for (order, peer) in providers.into_iter().enumerate() {
            if self.health.is_unhealthy(&peer.id) {
                tracing::debug!("Skipping unhealthy provider {}", peer.id);
                continue;
            }
            let health = self.health.clone();
            set.spawn(async move {
                let ok = health.probe(&peer).await.is_ok();
                (order, peer, ok)
            });
        }

        let mut reachable = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((order, peer, true)) = joined {
                reachable.push((order, peer));
            }
        }
        reachable.sort_by_key(|(order, _)| *order);
        reachable.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Our own record if we have one, otherwise the first self-consistent
    /// manifest a provider hands out. Providers serving a bad manifest are
    /// dropped from the returned list.
    async fn resolve_manifest(
        &self,
        id: &ContentId,
        providers: Vec<PeerInfo>,
    ) -> Result<(FileRecord, Vec<PeerInfo>)> {
        if let Some(record) = self.catalog.lookup(id).await? {
            if record.verify_manifest().is_ok() {
                return Ok((record, providers));
            }
        }

        let mut bad: HashSet<PeerId> = HashSet::new();
        let mut manifest = None;
        for peer in &providers {
            match self.request_manifest(id, peer).await {
                Ok(record) => {
                    manifest = Some(record);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Manifest from {} rejected: {}", peer.id, e);
                    if e.is_connection_error() {
                        self.health.record_failure(peer, &e);
                    }
                    bad.insert(peer.id.clone());
                }
            }
        }

        let manifest = manifest.ok_or_else(|| failed(id, "no provider served a valid manifest"))?;
        let providers = providers
            .into_iter()
            .filter(|p| !bad.contains(&p.id))
            .collect();
        Ok((manifest, providers))
    }

    async fn request_manifest(&self, id: &ContentId, peer: &PeerInfo) -> Result<FileRecord> {
        let reply = rpc::request(
            &**self.dht.host(),
            &peer.address,
            proto::manifest_request(id),
            self.settings.request_timeout,
        )
        .await?;

        let msg = match reply {
            Payload::ManifestResponse(resp) => resp
                .record
                .ok_or_else(|| Error::Protocol("empty manifest response".to_string()))?,
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {} to manifest request",
                    other.kind()
                )))
            }
        };

        let record = FileRecord::try_from(&msg)?;
        if record.id != *id {
            return Err(Error::InvalidData(format!(
                "asked for {}, got manifest for {}",
                id.short(),
                record.id.short()
            )));
        }
        record.verify_manifest()?;
        Ok(record)
    }

    /// Fetch and verify every chunk, spreading work over `providers`
    async fn fetch_chunks(
        &self,
        mut session: DownloadSession,
        providers: Vec<PeerInfo>,
    ) -> Result<DownloadSession> {
        let id = session.id;
        let mut load: HashMap<PeerId, usize> = HashMap::new();
        let mut dropped: HashSet<PeerId> = HashSet::new();
        let mut set: JoinSet<FetchOutcome> = JoinSet::new();
        let limit = self.settings.max_concurrent_requests.max(1);

        loop {
            while set.len() < limit {
                let Some(index) = session.next_pending() else {
                    break;
                };
                let candidate = providers
                    .iter()
                    .filter(|p| !dropped.contains(&p.id) && !session.is_excluded(index, &p.id))
                    .min_by_key(|p| load.get(&p.id).copied().unwrap_or(0));
                let Some(provider) = candidate.cloned() else {
                    session.fail(index);
                    return Err(failed(
                        &id,
                        &format!("no provider left for chunk {}", index),
                    ));
                };

                session.assign(index);
                *load.entry(provider.id.clone()).or_default() += 1;
                set.spawn(fetch_chunk(
                    self.dht.host().clone(),
                    id,
                    index,
                    provider,
                    self.settings.chunk_attempts,
                    self.settings.request_timeout,
                ));
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => return Err(failed(&id, &format!("fetch task failed: {}", e))),
            };

            if let Some(n) = load.get_mut(&outcome.provider.id) {
                *n = n.saturating_sub(1);
            }

            match outcome.result {
                Ok(data) => {
                    self.health
                        .record_success(&outcome.provider, Some(outcome.elapsed));
                    let failures = session.receive(outcome.index, data, outcome.provider.id.clone());
                    for (index, from, err) in failures {
                        tracing::warn!("Chunk {} from {} failed verification: {}", index, from, err);
                        if let Some(peer) = providers.iter().find(|p| p.id == from) {
                            self.health.record_failure(peer, &err);
                        }
                    }
                    if session.verified_count() % 64 == 0 || session.is_complete() {
                        tracing::debug!(
                            "{}: {}/{} chunks verified ({:.0}%)",
                            id.short(),
                            session.verified_count(),
                            session.total_chunks(),
                            session.progress()
                        );
                    }
                }
                Err(Error::Remote { code, message }) => {
                    tracing::warn!(
                        "{} refused chunk {}: {} (code {})",
                        outcome.provider.id,
                        outcome.index,
                        message,
                        code
                    );
                    session.exclude(outcome.index, &outcome.provider.id);
                    session.requeue(outcome.index);
                }
                Err(e) => {
                    tracing::warn!(
                        "Giving up on {} for chunk {}: {}",
                        outcome.provider.id,
                        outcome.index,
                        e
                    );
                    self.health
                        .mark_unhealthy(&outcome.provider, &e.to_string());
                    dropped.insert(outcome.provider.id.clone());
                    session.requeue(outcome.index);
                }
            }
        }

        if !session.is_complete() {
            return Err(failed(
                &id,
                &format!("missing chunks {:?}", session.missing_chunks()),
            ));
        }
        Ok(session)
    }

    /// Write the verified chunks into the download directory
    async fn write_file(
        &self,
        manifest: &FileRecord,
        chunks: Vec<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dir = self.settings.download_dir.clone();
        let record = manifest.clone();
        let cancel = cancel.clone();

        let written =
            tokio::task::spawn_blocking(move || commit_file(&dir, &record, &chunks, &cancel))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        tracing::info!("Downloaded {} to {}", manifest.name, written.display());
        Ok(written)
    }

    fn key_lock(&self, id: &ContentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(*id).or_default().clone()
    }

    fn release_key_lock(&self, id: &ContentId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }
}

/// Fetch one chunk from one provider, retrying transient failures
async fn fetch_chunk<H: Host>(
    host: Arc<H>,
    id: ContentId,
    index: u32,
    provider: PeerInfo,
    attempts: u32,
    timeout: Duration,
) -> FetchOutcome {
    let started = Instant::now();
    let mut last_error = Error::Protocol("no attempts made".to_string());

    for attempt in 1..=attempts.max(1) {
        match rpc::request(&*host, &provider.address, proto::chunk_request(&id, index), timeout).await
        {
            Ok(Payload::ChunkResponse(resp))
                if resp.chunk_index == index
                    && resp.content_id.as_slice() == id.as_bytes().as_slice() =>
            {
                return FetchOutcome {
                    index,
                    provider,
                    elapsed: started.elapsed(),
                    result: Ok(resp.data),
                };
            }
            Ok(other) => {
                last_error = Error::Protocol(format!("unexpected {} for chunk {}", other.kind(), index));
            }
            Err(e @ Error::Remote { .. }) => {
                last_error = e;
                break;
            }
            Err(e) => last_error = e,
        }
        tracing::debug!(
            "Chunk {} from {} attempt {}/{} failed: {}",
            index,
            provider.id,
            attempt,
            attempts,
            last_error
        );
    }

    FetchOutcome {
        index,
        provider,
        elapsed: started.elapsed(),
        result: Err(last_error),
    }
}

fn failed(id: &ContentId, reason: &str) -> Error {
    Error::DownloadFailed {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// Final location for a download. Remote names are reduced to their last
/// component; an existing file of the same name gets the id prefixed.
fn target_path(dir: &Path, manifest: &FileRecord) -> PathBuf {
    let name = Path::new(&manifest.name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| manifest.id.to_hex());

    let target = dir.join(&name);
    if target.exists() {
        return dir.join(format!("{}-{}", manifest.id.short(), name));
    }
    target
}

/// Reassemble into `<target>.part`, then rename into place. A cancel seen
/// before the rename removes the partial file instead.
fn commit_file(
    dir: &Path,
    manifest: &FileRecord,
    chunks: &[Bytes],
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = target_path(dir, manifest);
    let part = part_path(&target);

    if let Err(e) = reassemble_file(chunks, manifest, &part) {
        let _ = std::fs::remove_file(&part);
        return Err(e);
    }
    if cancel.is_cancelled() {
        let _ = std::fs::remove_file(&part);
        return Err(Error::Cancelled);
    }
    if let Err(e) = std::fs::rename(&part, &target) {
        let _ = std::fs::remove_file(&part);
        return Err(e.into());
    }
    Ok(target)
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use torrentium_core::chunk::{chunk_digest, combine_digests};
    use torrentium_core::ChunkDescriptor;

    fn manifest(chunks: &[&[u8]]) -> FileRecord {
        let descriptors: Vec<ChunkDescriptor> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| ChunkDescriptor {
                index: i as u32,
                length: c.len() as u32,
                digest: chunk_digest(c),
            })
            .collect();
        FileRecord {
            id: combine_digests(descriptors.iter().map(|d| &d.digest)),
            name: "file.bin".to_string(),
            size: chunks.iter().map(|c| c.len() as u64).sum(),
            chunks: descriptors,
            location: Location::Remote,
            created_at: 0,
        }
    }

    #[test]
    fn test_session_verifies_in_index_order() {
        let parts: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];
        let mut session = DownloadSession::new(manifest(&parts));
        let peer = PeerId::new("p");

        assert_eq!(session.next_pending(), Some(0));
        for i in 0..3 {
            session.assign(i);
        }
        assert_eq!(session.next_pending(), None);

        // Chunk 2 arrives first and waits for 0 and 1
        assert!(session.receive(2, Bytes::from_static(b"cc"), peer.clone()).is_empty());
        assert_eq!(session.state(2), Some(ChunkState::InFlight));
        assert_eq!(session.verified_count(), 0);

        assert!(session.receive(0, Bytes::from_static(b"aaaa"), peer.clone()).is_empty());
        assert_eq!(session.verified_count(), 1);
        assert_eq!(session.missing_chunks(), vec![1, 2]);

        assert!(session.receive(1, Bytes::from_static(b"bbbb"), peer.clone()).is_empty());
        assert!(session.is_complete());
        assert!((session.progress() - 100.0).abs() < 0.01);

        let chunks = session.into_chunks().unwrap();
        assert_eq!(chunks.concat(), b"aaaabbbbcc");
    }

    #[test]
    fn test_session_rejects_corrupt_chunk() {
        let parts: [&[u8]; 2] = [b"good", b"data"];
        let mut session = DownloadSession::new(manifest(&parts));
        let liar = PeerId::new("liar");
        let honest = PeerId::new("honest");

        session.assign(0);
        session.assign(1);
        assert!(session.receive(1, Bytes::from_static(b"data"), honest.clone()).is_empty());

        let failures = session.receive(0, Bytes::from_static(b"evil"), liar.clone());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 0);
        assert!(matches!(failures[0].2, Error::Corruption { index: 0, .. }));
        assert!(session.is_excluded(0, &liar));
        assert_eq!(session.state(0), Some(ChunkState::Pending));
        assert_eq!(session.next_pending(), Some(0));

        // The buffered chunk 1 verifies once chunk 0 is good
        session.assign(0);
        assert!(session.receive(0, Bytes::from_static(b"good"), honest).is_empty());
        assert!(session.is_complete());
    }

    #[test]
    fn test_empty_manifest_is_complete() {
        let session = DownloadSession::new(manifest(&[]));
        assert!(session.is_complete());
        assert_eq!(session.into_chunks().unwrap().len(), 0);
    }

    #[test]
    fn test_commit_file_writes_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let downloads = dir.path().join("downloads");
        let parts: [&[u8]; 2] = [b"abcd", b"ef"];
        let record = manifest(&parts);
        let chunks: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();

        let path = commit_file(&downloads, &record, &chunks, &CancellationToken::new()).unwrap();
        assert_eq!(path, downloads.join("file.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        assert_eq!(std::fs::read_dir(&downloads).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_file_cancelled_leaves_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let parts: [&[u8]; 2] = [b"abcd", b"ef"];
        let record = manifest(&parts);
        let chunks: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = commit_file(dir.path(), &record, &chunks, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_target_path_sanitizes_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut record = manifest(&[b"x"]);

        record.name = "../../etc/passwd".to_string();
        assert_eq!(target_path(dir.path(), &record), dir.path().join("passwd"));

        record.name = "..".to_string();
        assert_eq!(target_path(dir.path(), &record), dir.path().join(record.id.to_hex()));

        record.name = "taken.txt".to_string();
        std::fs::write(dir.path().join("taken.txt"), b"other").unwrap();
        let target = target_path(dir.path(), &record);
        assert_eq!(
            target,
            dir.path().join(format!("{}-taken.txt", record.id.short()))
        );
        assert_eq!(
            part_path(&target).file_name().unwrap().to_str().unwrap(),
            format!("{}-taken.txt.part", record.id.short())
        );
    }
}
