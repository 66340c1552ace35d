//! Search by identifier (DHT providers) and by text (local catalog + peers)

use crate::catalog::Catalog;
use crate::health::HealthMonitor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use torrentium_core::proto::{self, Payload};
use torrentium_core::{
    now_unix_secs, rpc, ContentId, Error, FileRecord, Host, PeerId, PeerInfo, ProviderRecord,
    Result,
};
use torrentium_dht::DhtService;

pub struct SearchResolver<H: Host> {
    dht: Arc<DhtService<H>>,
    catalog: Arc<Catalog>,
    health: Arc<HealthMonitor<H>>,
    peer_timeout: Duration,
    max_results: u32,
}

impl<H: Host> SearchResolver<H> {
    pub fn new(
        dht: Arc<DhtService<H>>,
        catalog: Arc<Catalog>,
        health: Arc<HealthMonitor<H>>,
        peer_timeout: Duration,
        max_results: u32,
    ) -> Self {
        Self {
            dht,
            catalog,
            health,
            peer_timeout,
            max_results,
        }
    }

    /// Peers currently advertising `id`, freshest first
    pub async fn search_by_identifier(&self, id: &ContentId) -> Result<Vec<ProviderRecord>> {
        let providers = self.dht.find_providers(id).await?;

        let local_id = self.dht.local_peer().id.clone();
        let remote: Vec<(PeerInfo, u64)> = providers
            .iter()
            .filter(|p| p.peer.id != local_id)
            .map(|p| (p.peer.clone(), p.last_seen))
            .collect();
        self.remember_peers(remote).await;

        Ok(providers)
    }

    /// Local name matches, followed by whatever reachable peers report.
    ///
    /// Peer failures never fail the search.
    pub async fn search_by_text(&self, query: &str) -> Result<Vec<FileRecord>> {
        let mut results = self.catalog.search_local(query).await?;
        let mut seen: HashSet<ContentId> = results.iter().map(|r| r.id).collect();

        let peers = self.text_search_peers();
        if peers.is_empty() || query.trim().is_empty() {
            return Ok(results);
        }
        tracing::debug!("Asking {} peer(s) for '{}'", peers.len(), query);

        let mut set = JoinSet::new();
        for peer in peers {
            let host = self.dht.host().clone();
            let payload = proto::search_request(query.to_string(), self.max_results);
            let timeout = self.peer_timeout;
            set.spawn(async move {
                let result = rpc::request(&*host, &peer.address, payload, timeout).await;
                (peer, result)
            });
        }

        let mut responders = Vec::new();
        let mut remote = Vec::new();
        while let Some(joined) = set.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result.and_then(parse_search_response) {
                Ok(records) => {
                    tracing::debug!("{} returned {} result(s)", peer.id, records.len());
                    self.health.record_success(&peer, None);
                    responders.push((peer, now_unix_secs()));
                    remote.extend(records);
                }
                Err(e) => {
                    tracing::debug!("Search on {} failed: {}", peer.id, e);
                    if e.is_connection_error() {
                        self.health.record_failure(&peer, &e);
                    }
                }
            }
        }
        self.remember_peers(responders).await;

        // Deterministic merge order regardless of which peer answered first
        remote.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        let budget = (self.max_results as usize).saturating_sub(results.len());
        results.extend(
            remote
                .into_iter()
                .filter(|r| seen.insert(r.id))
                .take(budget),
        );

        Ok(results)
    }

    /// Connected peers plus the routing table, minus ourselves and peers
    /// known to be unhealthy
    fn text_search_peers(&self) -> Vec<PeerInfo> {
        let local_id = &self.dht.local_peer().id;
        let mut seen: HashSet<PeerId> = HashSet::new();
        self.health
            .list_connected()
            .into_iter()
            .map(|s| s.peer)
            .chain(self.dht.known_peers())
            .filter(|p| &p.id != local_id && !self.health.is_unhealthy(&p.id))
            .filter(|p| seen.insert(p.id.clone()))
            .collect()
    }

    async fn remember_peers(&self, peers: Vec<(PeerInfo, u64)>) {
        if peers.is_empty() {
            return;
        }
        let repo = self.catalog.repository().clone();
        let stored = tokio::task::spawn_blocking(move || {
            for (peer, last_seen) in &peers {
                repo.upsert_peer(peer, *last_seen)?;
            }
            Ok::<_, Error>(())
        })
        .await;

        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to record known peers: {}", e),
            Err(e) => tracing::warn!("Known peer update task failed: {}", e),
        }
    }
}

/// Self-consistent records from a search reply, tagged remote
fn parse_search_response(payload: Payload) -> Result<Vec<FileRecord>> {
    let resp = match payload {
        Payload::SearchResponse(resp) => resp,
        other => {
            return Err(Error::Protocol(format!(
                "unexpected {} to search",
                other.kind()
            )))
        }
    };

    Ok(resp
        .records
        .iter()
        .filter_map(|msg| match FileRecord::try_from(msg) {
            Ok(record) if record.verify_manifest().is_ok() => Some(record),
            Ok(record) => {
                tracing::debug!("Dropping inconsistent record for {}", record.name);
                None
            }
            Err(e) => {
                tracing::debug!("Dropping malformed record: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use torrentium_core::proto::FileRecordMsg;
    use torrentium_core::{chunk, ChunkDescriptor, Location};

    fn consistent_msg(name: &str, body: &[u8]) -> FileRecordMsg {
        let digest = chunk::chunk_digest(body);
        let record = FileRecord {
            id: chunk::combine_digests([&digest]),
            name: name.to_string(),
            size: body.len() as u64,
            chunks: vec![ChunkDescriptor {
                index: 0,
                length: body.len() as u32,
                digest,
            }],
            location: Location::Local("/somewhere".into()),
            created_at: 1,
        };
        FileRecordMsg::from(&record)
    }

    #[test]
    fn test_parse_search_response_filters_inconsistent() {
        let good = consistent_msg("good.txt", b"payload");
        let mut forged = consistent_msg("forged.txt", b"payload");
        forged.size += 1;
        let mut short_id = consistent_msg("short.txt", b"x");
        short_id.content_id.truncate(4);

        let records = parse_search_response(Payload::SearchResponse(proto::SearchResponse {
            records: vec![good, forged, short_id],
        }))
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "good.txt");
        assert_eq!(records[0].location, Location::Remote);
    }

    #[test]
    fn test_parse_search_response_rejects_wrong_payload() {
        let result = parse_search_response(Payload::PingResponse(proto::PingResponse { nonce: 1 }));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
