//! Periodic upkeep: DHT maintenance, re-announcement and peer re-probing

use crate::catalog::Catalog;
use crate::health::HealthMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use torrentium_core::{ContentId, Host};
use torrentium_dht::{DhtService, MaintenanceReport};

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
}

/// Runs maintenance cycles until cancelled
pub struct Maintenance<H: Host> {
    dht: Arc<DhtService<H>>,
    catalog: Arc<Catalog>,
    health: Arc<HealthMonitor<H>>,
    settings: MaintenanceSettings,
}

impl<H: Host> Maintenance<H> {
    pub fn new(
        dht: Arc<DhtService<H>>,
        catalog: Arc<Catalog>,
        health: Arc<HealthMonitor<H>>,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            dht,
            catalog,
            health,
            settings,
        }
    }

    /// Spawn the periodic loop. The first cycle runs one interval after start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                "Maintenance every {:?} (+ up to {:?} jitter)",
                self.settings.interval,
                self.settings.jitter
            );
            loop {
                let delay = self.settings.interval + jitter(self.settings.jitter);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                self.run_cycle(&cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
            tracing::debug!("Maintenance loop stopped");
        })
    }

    /// One cycle. The DHT part is bounded by the interval so a slow cycle
    /// never overlaps the next one.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Option<MaintenanceReport> {
        let ids: Vec<ContentId> = match self.catalog.list_local().await {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                tracing::warn!("Cannot list local content for re-announce: {}", e);
                Vec::new()
            }
        };

        let report = match tokio::time::timeout(
            self.settings.interval,
            self.dht.maintain(&ids, cancel),
        )
        .await
        {
            Ok(report) => {
                tracing::info!(
                    "Maintenance: {} expired, {} re-announced ({} failed), {} peers in table{}",
                    report.expired_providers,
                    report.announced,
                    report.announce_failures,
                    report.routing_table_size,
                    if report.rebootstrapped { ", re-bootstrapped" } else { "" }
                );
                Some(report)
            }
            Err(_) => {
                tracing::warn!("Maintenance cycle exceeded {:?}", self.settings.interval);
                None
            }
        };

        if !cancel.is_cancelled() {
            self.reprobe_unhealthy(cancel).await;
        }
        report
    }

    /// Give unhealthy peers a chance to recover
    async fn reprobe_unhealthy(&self, cancel: &CancellationToken) {
        let peers = self.health.unhealthy_peers();
        if peers.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for peer in peers {
            let health = self.health.clone();
            set.spawn(async move { (health.probe(&peer).await.is_ok(), peer) });
        }

        let mut recovered = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                joined = set.join_next() => match joined {
                    Some(Ok((true, peer))) => {
                        tracing::info!("{} is reachable again", peer.id);
                        recovered += 1;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        tracing::debug!("Re-probed unhealthy peers, {} recovered", recovered);
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(buf) % (max_ms + 1))
}
