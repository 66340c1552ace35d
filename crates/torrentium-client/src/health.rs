//! Peer connection health tracking
//!
//! Every peer the node talks to gets an entry. Probes are `Ping`/`Pong` round
//! trips; transfer outcomes reported by the download manager feed the same
//! failure counter.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use torrentium_core::proto::{Payload, PingRequest};
use torrentium_core::{now_unix_secs, rpc, Error, Host, HostEvent, PeerId, PeerInfo, Result};
use torrentium_dht::DhtState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Connected,
    Connecting,
    Disconnected,
    Unhealthy,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Connected => "connected",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// What we currently believe about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionState {
    pub peer: PeerInfo,
    pub status: PeerStatus,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Unix time of the last status change
    pub last_change: u64,
}

impl PeerConnectionState {
    fn new(peer: PeerInfo) -> Self {
        Self {
            peer,
            status: PeerStatus::Connecting,
            last_latency: None,
            last_error: None,
            consecutive_failures: 0,
            last_change: now_unix_secs(),
        }
    }

    fn set_status(&mut self, status: PeerStatus) {
        if self.status != status {
            tracing::debug!("Peer {} {} -> {}", self.peer.id, self.status, status);
            self.status = status;
            self.last_change = now_unix_secs();
        }
    }
}

/// Full dump for the `debug` command
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub local: PeerInfo,
    pub dht_state: DhtState,
    pub routing_table_size: usize,
    pub peers: Vec<PeerConnectionState>,
}

impl HealthSnapshot {
    pub fn count(&self, status: PeerStatus) -> usize {
        self.peers.iter().filter(|p| p.status == status).count()
    }
}

struct PeerEntry {
    /// Held for the duration of a probe
    probe: tokio::sync::Mutex<()>,
    state: Mutex<PeerConnectionState>,
}

impl PeerEntry {
    fn state(&self) -> std::sync::MutexGuard<'_, PeerConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Tracks connection health of remote peers
pub struct HealthMonitor<H: Host> {
    host: Arc<H>,
    failure_threshold: u32,
    probe_timeout: Duration,
    peers: RwLock<HashMap<PeerId, Arc<PeerEntry>>>,
}

impl<H: Host> HealthMonitor<H> {
    pub fn new(host: Arc<H>, failure_threshold: u32, probe_timeout: Duration) -> Self {
        Self {
            host,
            failure_threshold: failure_threshold.max(1),
            probe_timeout,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Round-trip a ping to `peer` and record the outcome
    pub async fn probe(&self, peer: &PeerInfo) -> Result<Duration> {
        let entry = self.entry(peer);
        let _probing = entry.probe.lock().await;
        {
            let mut state = entry.state();
            state.peer = peer.clone();
            if state.status == PeerStatus::Disconnected {
                state.set_status(PeerStatus::Connecting);
            }
        }

        let nonce = random_nonce();
        let started = Instant::now();
        let result = rpc::request_with_sender(
            &*self.host,
            &peer.address,
            Payload::PingRequest(PingRequest { nonce }),
            self.probe_timeout,
        )
        .await
        .and_then(|(sender, reply)| match reply {
            Payload::PingResponse(pong) if pong.nonce == nonce => match sender {
                Some(sender) if sender.id != peer.id => Err(Error::Protocol(format!(
                    "{} answered as {}",
                    peer.address, sender.id
                ))),
                _ => Ok(started.elapsed()),
            },
            Payload::PingResponse(_) => Err(Error::Protocol("ping nonce mismatch".to_string())),
            other => Err(Error::Protocol(format!("unexpected {} to ping", other.kind()))),
        });

        match &result {
            Ok(latency) => {
                tracing::debug!("Probe of {} ok in {:?}", peer, latency);
                Self::apply_success(&mut entry.state(), Some(*latency));
            }
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", peer, e);
                self.apply_failure(&mut entry.state(), e.to_string());
            }
        }
        result
    }

    pub fn status(&self, peer_id: &PeerId) -> Option<PeerConnectionState> {
        self.peers()
            .get(peer_id)
            .map(|entry| entry.state().clone())
    }

    pub fn list_connected(&self) -> Vec<PeerConnectionState> {
        self.list_where(|s| s.status == PeerStatus::Connected)
    }

    /// Peers to re-probe during maintenance
    pub fn unhealthy_peers(&self) -> Vec<PeerInfo> {
        self.list_where(|s| s.status == PeerStatus::Unhealthy)
            .into_iter()
            .map(|s| s.peer)
            .collect()
    }

    pub fn is_unhealthy(&self, peer_id: &PeerId) -> bool {
        self.status(peer_id)
            .map(|s| s.status == PeerStatus::Unhealthy)
            .unwrap_or(false)
    }

    pub fn debug_snapshot(&self, dht_state: DhtState, routing_table_size: usize) -> HealthSnapshot {
        HealthSnapshot {
            local: self.host.local_peer().clone(),
            dht_state,
            routing_table_size,
            peers: self.list_where(|_| true),
        }
    }

    /// A transfer with `peer` succeeded
    pub fn record_success(&self, peer: &PeerInfo, latency: Option<Duration>) {
        Self::apply_success(&mut self.entry(peer).state(), latency);
    }

    /// A transfer with `peer` failed at the connection level
    pub fn record_failure(&self, peer: &PeerInfo, error: &Error) {
        self.apply_failure(&mut self.entry(peer).state(), error.to_string());
    }

    /// Stop using `peer` until a probe succeeds
    pub fn mark_unhealthy(&self, peer: &PeerInfo, reason: &str) {
        let entry = self.entry(peer);
        let mut state = entry.state();
        state.consecutive_failures = state.consecutive_failures.max(self.failure_threshold);
        state.last_error = Some(reason.to_string());
        state.set_status(PeerStatus::Unhealthy);
    }

    /// Apply a transport event
    pub fn observe(&self, event: &HostEvent) {
        match event {
            HostEvent::ConnectionClosed(address) => {
                for entry in self.peers().values() {
                    let mut state = entry.state();
                    if &state.peer.address == address {
                        state.set_status(PeerStatus::Disconnected);
                    }
                }
            }
        }
    }

    /// Follow host events until cancelled
    pub fn watch_events(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut events = self.host.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => monitor.observe(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Health monitor missed {} host events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn apply_success(state: &mut PeerConnectionState, latency: Option<Duration>) {
        state.consecutive_failures = 0;
        state.last_error = None;
        if latency.is_some() {
            state.last_latency = latency;
        }
        state.set_status(PeerStatus::Connected);
    }

    fn apply_failure(&self, state: &mut PeerConnectionState, error: String) {
        state.consecutive_failures += 1;
        state.last_error = Some(error);
        if state.consecutive_failures >= self.failure_threshold {
            if state.status != PeerStatus::Unhealthy {
                tracing::warn!(
                    "Peer {} unhealthy after {} consecutive failures",
                    state.peer.id,
                    state.consecutive_failures
                );
            }
            state.set_status(PeerStatus::Unhealthy);
        }
    }

    fn entry(&self, peer: &PeerInfo) -> Arc<PeerEntry> {
        if let Some(entry) = self.peers().get(&peer.id) {
            return entry.clone();
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(peer.id.clone())
            .or_insert_with(|| {
                Arc::new(PeerEntry {
                    probe: tokio::sync::Mutex::new(()),
                    state: Mutex::new(PeerConnectionState::new(peer.clone())),
                })
            })
            .clone()
    }

    fn list_where(&self, keep: impl Fn(&PeerConnectionState) -> bool) -> Vec<PeerConnectionState> {
        let mut states: Vec<PeerConnectionState> = self
            .peers()
            .values()
            .map(|entry| entry.state().clone())
            .filter(|s| keep(s))
            .collect();
        states.sort_by(|a, b| a.peer.id.cmp(&b.peer.id));
        states
    }

    fn peers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PeerId, Arc<PeerEntry>>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn random_nonce() -> u64 {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return rpc::next_request_id();
    }
    u64::from_le_bytes(buf)
}
