//! DHT storage for content id to provider mappings

use std::collections::HashMap;
use torrentium_core::{ContentId, ProviderRecord};

/// Storage for provider records this node is responsible for
pub struct ProviderStore {
    /// Map from content id to list of providers
    entries: HashMap<ContentId, Vec<ProviderRecord>>,
    /// Maximum providers per content id
    max_providers_per_key: usize,
}

impl ProviderStore {
    pub fn new(max_providers_per_key: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_providers_per_key,
        }
    }

    /// Store a provider for a content id
    pub fn store(&mut self, record: ProviderRecord) {
        let providers = self.entries.entry(record.id).or_default();

        // Check if provider already exists (by peer id)
        if let Some(existing) = providers.iter_mut().find(|p| p.peer.id == record.peer.id) {
            if record.last_seen >= existing.last_seen {
                *existing = record;
            }
            return;
        }

        if providers.len() < self.max_providers_per_key {
            providers.push(record);
        } else {
            // Replace oldest entry
            providers.sort_by_key(|p| p.last_seen);
            if let Some(oldest) = providers.first_mut() {
                if oldest.last_seen < record.last_seen {
                    *oldest = record;
                }
            }
        }
    }

    /// Providers for a content id seen at or after `min_timestamp`
    pub fn get(&self, id: &ContentId, min_timestamp: u64) -> Vec<ProviderRecord> {
        self.entries
            .get(id)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| p.last_seen >= min_timestamp)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove stale entries older than the given timestamp; returns how many
    pub fn cleanup(&mut self, min_timestamp: u64) -> usize {
        let mut removed = 0;
        for providers in self.entries.values_mut() {
            let before = providers.len();
            providers.retain(|p| p.last_seen >= min_timestamp);
            removed += before - providers.len();
        }
        self.entries.retain(|_, v| !v.is_empty());
        removed
    }
}
