//! DHT discovery service
//!
//! Owns the routing table and provider store, runs iterative lookups over the
//! host, and answers inbound DHT queries.

use crate::routing::{xor_distance, NodeInfo, RoutingTable};
use crate::storage::ProviderStore;
use crate::{DhtConfig, DhtError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use torrentium_core::proto::{self, error_codes, Payload, ProviderMsg};
use torrentium_core::{
    now_unix_secs, rpc, ContentId, Digest, Host, PeerAddress, PeerId, PeerInfo, ProviderRecord,
};

/// Longest wait between bootstrap attempts
const MAX_BOOTSTRAP_BACKOFF: Duration = Duration::from_secs(30);

/// Re-announcements in flight at once during maintenance
const MAX_CONCURRENT_ANNOUNCES: usize = 16;

/// Overlay membership state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    Unbootstrapped,
    Bootstrapping,
    Active,
}

/// Outcome of one maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_providers: usize,
    /// Bootstrap peers that answered this cycle
    pub bootstrap_reachable: usize,
    pub rebootstrapped: bool,
    pub announced: usize,
    pub announce_failures: usize,
    pub routing_table_size: usize,
}

#[derive(Debug, Clone, Copy)]
enum LookupMode {
    Nodes,
    Providers(ContentId),
}

#[derive(Debug, Default)]
struct LookupOutcome {
    /// Closest responsive nodes, nearest first
    closest: Vec<NodeInfo>,
    providers: Vec<ProviderRecord>,
    queried: usize,
    responded: usize,
}

/// Kademlia discovery over a [`Host`]
pub struct DhtService<H: Host> {
    host: Arc<H>,
    config: DhtConfig,
    local_key: Digest,
    routing: RwLock<RoutingTable>,
    providers: RwLock<ProviderStore>,
    state: watch::Sender<DhtState>,
}

impl<H: Host> DhtService<H> {
    pub fn new(host: Arc<H>, config: DhtConfig) -> Self {
        let local_key = host.local_peer().id.dht_key();
        let (state, _) = watch::channel(DhtState::Unbootstrapped);
        Self {
            routing: RwLock::new(RoutingTable::new(local_key, config.k)),
            providers: RwLock::new(ProviderStore::new(config.max_providers_per_key)),
            host,
            config,
            local_key,
            state,
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn local_peer(&self) -> &PeerInfo {
        self.host.local_peer()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn state(&self) -> DhtState {
        *self.state.borrow()
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing().len()
    }

    /// Every peer in the routing table
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.routing().all_nodes().into_iter().map(|n| n.peer).collect()
    }

    /// Record that a peer is alive
    pub fn observe(&self, peer: &PeerInfo) {
        if peer.id == self.local_peer().id {
            return;
        }
        self.routing_mut()
            .upsert(NodeInfo::new(peer.clone(), now_unix_secs()));
    }

    /// Join the overlay through the configured bootstrap peers.
    ///
    /// Returns the routing table size once active.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<usize> {
        if self.config.bootstrap_nodes.is_empty() {
            tracing::info!("No bootstrap nodes configured, running standalone");
            self.set_state(DhtState::Active);
            return Ok(self.routing_table_size());
        }

        self.set_state(DhtState::Bootstrapping);
        let mut delay = self.config.bootstrap_backoff;

        for attempt in 1..=self.config.bootstrap_max_attempts {
            let reachable = tokio::select! {
                _ = cancel.cancelled() => {
                    self.settle_state();
                    return Err(DhtError::Cancelled);
                }
                n = self.contact_bootstrap_nodes() => n,
            };

            if reachable > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.settle_state();
                        return Err(DhtError::Cancelled);
                    }
                    _ = self.lookup(self.local_key, LookupMode::Nodes) => {}
                }

                let size = self.routing_table_size();
                tracing::info!(
                    "Bootstrapped via {} peer(s), routing table has {} nodes",
                    reachable,
                    size
                );
                self.set_state(DhtState::Active);
                return Ok(size);
            }

            tracing::warn!(
                "Bootstrap attempt {}/{} reached no peers",
                attempt,
                self.config.bootstrap_max_attempts
            );

            if attempt < self.config.bootstrap_max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.settle_state();
                        return Err(DhtError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(MAX_BOOTSTRAP_BACKOFF);
            }
        }

        self.settle_state();
        Err(DhtError::BootstrapFailed {
            attempts: self.config.bootstrap_max_attempts,
        })
    }

    /// Advertise this node as a provider of `id`.
    ///
    /// Returns how many remote nodes stored the record.
    pub async fn announce(&self, id: &ContentId) -> Result<usize> {
        let record = ProviderRecord {
            id: *id,
            peer: self.local_peer().clone(),
            last_seen: now_unix_secs(),
        };
        self.providers_mut().store(record.clone());

        if self.routing().is_empty() {
            if self.config.bootstrap_nodes.is_empty() {
                return Ok(0);
            }
            return Err(DhtError::NotBootstrapped);
        }

        let outcome = self.lookup(*id.as_bytes(), LookupMode::Nodes).await;
        if outcome.closest.is_empty() {
            if outcome.queried > 0 {
                return Err(DhtError::AllQueriesFailed {
                    queried: outcome.queried,
                });
            }
            return Ok(0);
        }

        let request = Payload::AddProviderRequest(proto::AddProviderRequest {
            content_id: id.as_bytes().to_vec(),
            provider: Some(ProviderMsg::from_record(&record)),
        });

        let mut set = JoinSet::new();
        for node in &outcome.closest {
            let host = self.host.clone();
            let address = node.peer.address.clone();
            let request = request.clone();
            let timeout = self.config.query_timeout;
            set.spawn(async move { rpc::request(&*host, &address, request, timeout).await });
        }

        let targets = outcome.closest.len();
        let mut accepted = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Payload::AddProviderResponse(resp))) if resp.success => accepted += 1,
                Ok(Ok(other)) => tracing::debug!("Unexpected announce reply: {}", other.kind()),
                Ok(Err(e)) => tracing::debug!("Announce of {} failed: {}", id.short(), e),
                Err(e) => tracing::warn!("Announce task failed: {}", e),
            }
        }

        if accepted == 0 {
            return Err(DhtError::Network(format!(
                "none of {} nodes accepted provider record for {}",
                targets,
                id.short()
            )));
        }

        tracing::debug!("Announced {} to {}/{} nodes", id.short(), accepted, targets);
        Ok(accepted)
    }

    /// Find peers providing `id`, freshest first.
    pub async fn find_providers(&self, id: &ContentId) -> Result<Vec<ProviderRecord>> {
        let min_timestamp = self.min_provider_timestamp();
        let mut found = self.providers().get(id, min_timestamp);

        if !self.routing().is_empty() {
            let outcome = self
                .lookup(*id.as_bytes(), LookupMode::Providers(*id))
                .await;
            if found.is_empty()
                && outcome.providers.is_empty()
                && outcome.queried > 0
                && outcome.responded == 0
            {
                return Err(DhtError::AllQueriesFailed {
                    queried: outcome.queried,
                });
            }
            found.extend(
                outcome
                    .providers
                    .into_iter()
                    .filter(|p| p.last_seen >= min_timestamp),
            );
        }

        let providers = dedupe_providers(found);
        tracing::debug!("Found {} provider(s) for {}", providers.len(), id.short());
        Ok(providers)
    }

    /// One maintenance cycle: expire stale records, check the bootstrap
    /// peers, refresh the routing table, and re-announce `ids`.
    pub async fn maintain(
        self: &Arc<Self>,
        ids: &[ContentId],
        cancel: &CancellationToken,
    ) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            expired_providers: self.providers_mut().cleanup(self.min_provider_timestamp()),
            ..Default::default()
        };

        if !self.config.bootstrap_nodes.is_empty() {
            report.bootstrap_reachable = self.contact_bootstrap_nodes().await;
            if report.bootstrap_reachable == 0 || self.routing().is_empty() {
                tracing::warn!("Lost contact with the overlay, re-bootstrapping");
                report.rebootstrapped = self.bootstrap(cancel).await.is_ok();
            } else if self.state() == DhtState::Unbootstrapped {
                self.set_state(DhtState::Active);
            }
        }

        if !report.rebootstrapped && !self.routing().is_empty() && !cancel.is_cancelled() {
            self.lookup(self.local_key, LookupMode::Nodes).await;
        }

        let mut set = JoinSet::new();
        for id in ids {
            if cancel.is_cancelled() {
                break;
            }
            while set.len() >= MAX_CONCURRENT_ANNOUNCES {
                Self::tally_announce(set.join_next().await, &mut report);
            }
            let dht = Arc::clone(self);
            let id = *id;
            set.spawn(async move { dht.announce(&id).await });
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    break;
                }
                joined = set.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                    Self::tally_announce(joined, &mut report);
                }
            }
        }

        report.routing_table_size = self.routing_table_size();
        report
    }

    fn tally_announce(
        joined: Option<std::result::Result<Result<usize>, tokio::task::JoinError>>,
        report: &mut MaintenanceReport,
    ) {
        match joined {
            Some(Ok(Ok(_))) => report.announced += 1,
            Some(Ok(Err(e))) => {
                tracing::warn!("Re-announce failed: {}", e);
                report.announce_failures += 1;
            }
            Some(Err(e)) => {
                tracing::warn!("Re-announce task failed: {}", e);
                report.announce_failures += 1;
            }
            None => {}
        }
    }

    /// Answer an inbound DHT query. Returns `None` for non-DHT payloads.
    pub fn handle_request(&self, sender: Option<&PeerInfo>, payload: &Payload) -> Option<Payload> {
        if let Some(sender) = sender {
            self.observe(sender);
        }

        let reply = match payload {
            Payload::FindNodeRequest(req) => match digest_from(&req.target) {
                Some(target) => Payload::FindNodeResponse(proto::FindNodeResponse {
                    nodes: self.closest_wire_nodes(&target),
                }),
                None => invalid("target must be 32 bytes"),
            },
            Payload::FindProvidersRequest(req) => match ContentId::from_slice(&req.content_id) {
                Ok(id) => {
                    let providers = self
                        .providers()
                        .get(&id, self.min_provider_timestamp())
                        .iter()
                        .map(ProviderMsg::from_record)
                        .collect();
                    Payload::FindProvidersResponse(proto::FindProvidersResponse {
                        providers,
                        nodes: self.closest_wire_nodes(id.as_bytes()),
                    })
                }
                Err(_) => invalid("content id must be 32 bytes"),
            },
            Payload::AddProviderRequest(req) => {
                let record = ContentId::from_slice(&req.content_id).and_then(|id| {
                    req.provider
                        .as_ref()
                        .ok_or_else(|| {
                            torrentium_core::Error::InvalidData("missing provider".to_string())
                        })?
                        .into_record(id)
                });
                match record {
                    Ok(mut record) => {
                        // Trust our own clock, not the announcer's
                        record.last_seen = now_unix_secs();
                        tracing::debug!(
                            "Storing provider {} for {}",
                            record.peer.id,
                            record.id.short()
                        );
                        self.providers_mut().store(record);
                        Payload::AddProviderResponse(proto::AddProviderResponse { success: true })
                    }
                    Err(e) => invalid(&e.to_string()),
                }
            }
            _ => return None,
        };

        Some(reply)
    }

    /// Dial every bootstrap address with a self query. Returns how many answered.
    async fn contact_bootstrap_nodes(&self) -> usize {
        let mut set = JoinSet::new();
        for address in &self.config.bootstrap_nodes {
            if *address == self.local_peer().address {
                continue;
            }
            let host = self.host.clone();
            let address = address.clone();
            let payload = find_node_request(&self.local_key);
            let timeout = self.config.query_timeout;
            set.spawn(async move {
                let result = rpc::request_with_sender(&*host, &address, payload, timeout).await;
                (address, result)
            });
        }

        let mut reachable = 0;
        while let Some(joined) = set.join_next().await {
            let Ok((address, result)) = joined else {
                continue;
            };
            match result {
                Ok((sender, payload)) => {
                    reachable += 1;
                    if let Some(sender) = sender {
                        self.observe(&sender);
                    }
                    let (_, nodes) = self.absorb_reply(payload);
                    tracing::debug!("Bootstrap peer {} returned {} nodes", address, nodes.len());
                }
                Err(e) => {
                    tracing::debug!("Bootstrap peer {} unreachable: {}", address, e);
                    self.evict_address(&address);
                }
            }
        }
        reachable
    }

    /// Iterative lookup towards `target`, querying `alpha` nodes per round
    async fn lookup(&self, target: Digest, mode: LookupMode) -> LookupOutcome {
        let k = self.config.k;
        let mut outcome = LookupOutcome::default();
        let mut shortlist: BTreeMap<Digest, NodeInfo> = self
            .routing()
            .closest_nodes(&target, k)
            .into_iter()
            .map(|n| (xor_distance(&n.node_id, &target), n))
            .collect();
        let mut queried: HashSet<PeerId> = HashSet::new();

        for round in 0..self.config.max_lookup_rounds {
            let candidates: Vec<NodeInfo> = shortlist
                .values()
                .take(k)
                .filter(|n| !queried.contains(&n.peer.id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let payload = match mode {
                LookupMode::Nodes => find_node_request(&target),
                LookupMode::Providers(id) => {
                    Payload::FindProvidersRequest(proto::FindProvidersRequest {
                        content_id: id.as_bytes().to_vec(),
                    })
                }
            };

            let mut set = JoinSet::new();
            for node in candidates {
                queried.insert(node.peer.id.clone());
                let host = self.host.clone();
                let payload = payload.clone();
                let timeout = self.config.query_timeout;
                set.spawn(async move {
                    let result = rpc::request(&*host, &node.peer.address, payload, timeout).await;
                    (node, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                let Ok((node, result)) = joined else {
                    continue;
                };
                outcome.queried += 1;
                match result {
                    Ok(payload) => {
                        outcome.responded += 1;
                        self.observe(&node.peer);
                        let (providers, nodes) = self.absorb_reply(payload);
                        if let LookupMode::Providers(id) = mode {
                            outcome
                                .providers
                                .extend(providers.iter().filter_map(|p| p.into_record(id).ok()));
                        }
                        for peer in nodes {
                            let info = NodeInfo::new(peer, now_unix_secs());
                            shortlist
                                .entry(xor_distance(&info.node_id, &target))
                                .or_insert(info);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Lookup query to {} failed: {}", node.peer, e);
                        shortlist.remove(&xor_distance(&node.node_id, &target));
                        self.routing_mut().remove(&node.peer.id);
                    }
                }
            }

            tracing::trace!(
                "Lookup round {} done, {} candidates known",
                round,
                shortlist.len()
            );
        }

        outcome.closest = shortlist
            .into_values()
            .filter(|n| queried.contains(&n.peer.id))
            .take(k)
            .collect();
        outcome
    }

    /// Pull providers and peer hints out of a DHT reply, learning the peers
    fn absorb_reply(&self, payload: Payload) -> (Vec<ProviderMsg>, Vec<PeerInfo>) {
        let (providers, wire_nodes) = match payload {
            Payload::FindNodeResponse(resp) => (Vec::new(), resp.nodes),
            Payload::FindProvidersResponse(resp) => (resp.providers, resp.nodes),
            other => {
                tracing::debug!("Ignoring {} in DHT reply", other.kind());
                return (Vec::new(), Vec::new());
            }
        };

        let local_id = &self.local_peer().id;
        let nodes: Vec<PeerInfo> = wire_nodes
            .iter()
            .filter_map(|n| PeerInfo::try_from(n).ok())
            .filter(|p| &p.id != local_id)
            .collect();
        for peer in &nodes {
            self.observe(peer);
        }
        (providers, nodes)
    }

    fn closest_wire_nodes(&self, target: &Digest) -> Vec<proto::NodeInfo> {
        self.routing()
            .closest_nodes(target, self.config.k)
            .iter()
            .map(|n| proto::NodeInfo::from(&n.peer))
            .collect()
    }

    fn evict_address(&self, address: &PeerAddress) {
        let mut routing = self.routing_mut();
        let stale: Vec<PeerId> = routing
            .all_nodes()
            .into_iter()
            .filter(|n| &n.peer.address == address)
            .map(|n| n.peer.id)
            .collect();
        for id in stale {
            routing.remove(&id);
        }
    }

    fn min_provider_timestamp(&self) -> u64 {
        now_unix_secs().saturating_sub(self.config.provider_ttl.as_secs())
    }

    fn set_state(&self, state: DhtState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("DHT state {:?} -> {:?}", previous, state);
        }
    }

    /// After an aborted or failed bootstrap: active if we still know anyone
    fn settle_state(&self) {
        if self.routing().is_empty() {
            self.set_state(DhtState::Unbootstrapped);
        } else {
            self.set_state(DhtState::Active);
        }
    }

    fn routing(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing.read().unwrap_or_else(|e| e.into_inner())
    }

    fn routing_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing.write().unwrap_or_else(|e| e.into_inner())
    }

    fn providers(&self) -> RwLockReadGuard<'_, ProviderStore> {
        self.providers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn providers_mut(&self) -> RwLockWriteGuard<'_, ProviderStore> {
        self.providers.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keep the freshest record per peer, ordered by `last_seen` descending
pub fn dedupe_providers(records: Vec<ProviderRecord>) -> Vec<ProviderRecord> {
    let mut by_peer: HashMap<PeerId, ProviderRecord> = HashMap::new();
    for record in records {
        match by_peer.get(&record.peer.id) {
            Some(existing) if existing.last_seen >= record.last_seen => {}
            _ => {
                by_peer.insert(record.peer.id.clone(), record);
            }
        }
    }

    let mut providers: Vec<ProviderRecord> = by_peer.into_values().collect();
    providers.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.peer.id.as_str().cmp(b.peer.id.as_str()))
    });
    providers
}

fn find_node_request(target: &Digest) -> Payload {
    Payload::FindNodeRequest(proto::FindNodeRequest {
        target: target.to_vec(),
    })
}

fn digest_from(bytes: &[u8]) -> Option<Digest> {
    bytes.try_into().ok()
}

fn invalid(message: &str) -> Payload {
    Payload::ErrorResponse(proto::ErrorResponse {
        code: error_codes::INVALID_MESSAGE,
        message: message.to_string(),
    })
}
