//! Durable storage for file records and known peers

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use torrentium_core::{ContentId, Error, FileRecord, PeerId, PeerInfo, Result};

/// A peer we have heard of, with when we last heard of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub peer: PeerInfo,
    pub last_seen: u64,
}

/// Storage backend for the catalog and the known-peer list
pub trait MetadataRepository: Send + Sync + 'static {
    /// Insert or overwrite the record for `record.id`. Overwriting keeps the
    /// identifier's original position in [`list_all`](Self::list_all).
    fn put(&self, record: &FileRecord) -> Result<()>;

    fn get(&self, id: &ContentId) -> Result<Option<FileRecord>>;

    /// Every record, in first-insertion order
    fn list_all(&self) -> Result<Vec<FileRecord>>;

    fn upsert_peer(&self, peer: &PeerInfo, last_seen: u64) -> Result<()>;

    /// Known peers, most recently seen first
    fn list_peers(&self) -> Result<Vec<KnownPeer>>;
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// SQLite-backed repository
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                content_id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                last_seen INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetadataRepository for SqliteRepository {
    fn put(&self, record: &FileRecord) -> Result<()> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| Error::InvalidData(format!("cannot encode record: {}", e)))?;

        // Upsert instead of INSERT OR REPLACE so the rowid, and with it the
        // listing order, survives republishing
        self.conn()
            .execute(
                r#"
                INSERT INTO files (content_id, name, size, chunk_count, created_at, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(content_id) DO UPDATE SET
                    name = excluded.name,
                    size = excluded.size,
                    chunk_count = excluded.chunk_count,
                    created_at = excluded.created_at,
                    record_json = excluded.record_json
                "#,
                params![
                    record.id.as_bytes().as_slice(),
                    record.name,
                    record.size as i64,
                    record.chunk_count() as i64,
                    record.created_at as i64,
                    record_json,
                ],
            )
            .map_err(db_err)?;

        Ok(())
    }

    fn get(&self, id: &ContentId) -> Result<Option<FileRecord>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record_json FROM files WHERE content_id = ?",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        json.map(|json| decode_record(&json)).transpose()
    }

    fn list_all(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record_json FROM files ORDER BY rowid")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.iter().map(|json| decode_record(json)).collect()
    }

    fn upsert_peer(&self, peer: &PeerInfo, last_seen: u64) -> Result<()> {
        self.conn()
            .execute(
                r#"
                INSERT INTO peers (peer_id, address, last_seen) VALUES (?1, ?2, ?3)
                ON CONFLICT(peer_id) DO UPDATE SET
                    address = excluded.address,
                    last_seen = MAX(last_seen, excluded.last_seen)
                "#,
                params![peer.id.as_str(), peer.address.as_str(), last_seen as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn list_peers(&self) -> Result<Vec<KnownPeer>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT peer_id, address, last_seen FROM peers ORDER BY last_seen DESC, peer_id")
            .map_err(db_err)?;

        let peers = stmt
            .query_map([], |row| {
                Ok(KnownPeer {
                    peer: PeerInfo::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    last_seen: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(peers)
    }
}

fn decode_record(json: &str) -> Result<FileRecord> {
    serde_json::from_str(json).map_err(|e| Error::Database(format!("corrupt record: {}", e)))
}

#[derive(Default)]
struct MemoryState {
    order: Vec<ContentId>,
    files: HashMap<ContentId, FileRecord>,
    peers: HashMap<PeerId, KnownPeer>,
}

/// Non-durable repository for tests and throwaway nodes
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetadataRepository for MemoryRepository {
    fn put(&self, record: &FileRecord) -> Result<()> {
        let mut state = self.state();
        if state.files.insert(record.id, record.clone()).is_none() {
            state.order.push(record.id);
        }
        Ok(())
    }

    fn get(&self, id: &ContentId) -> Result<Option<FileRecord>> {
        Ok(self.state().files.get(id).cloned())
    }

    fn list_all(&self) -> Result<Vec<FileRecord>> {
        let state = self.state();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.files.get(id).cloned())
            .collect())
    }

    fn upsert_peer(&self, peer: &PeerInfo, last_seen: u64) -> Result<()> {
        let mut state = self.state();
        let entry = state.peers.entry(peer.id.clone()).or_insert(KnownPeer {
            peer: peer.clone(),
            last_seen,
        });
        entry.peer = peer.clone();
        entry.last_seen = entry.last_seen.max(last_seen);
        Ok(())
    }

    fn list_peers(&self) -> Result<Vec<KnownPeer>> {
        let mut peers: Vec<KnownPeer> = self.state().peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.peer.id.cmp(&b.peer.id))
        });
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use torrentium_core::{ChunkDescriptor, Location};

    fn record(seed: u8, name: &str, created_at: u64) -> FileRecord {
        FileRecord {
            id: ContentId::from_bytes([seed; 32]),
            name: name.to_string(),
            size: 4,
            chunks: vec![ChunkDescriptor {
                index: 0,
                length: 4,
                digest: [seed; 32],
            }],
            location: Location::Local(format!("/data/{}", name).into()),
            created_at,
        }
    }

    fn check_repository(repo: &dyn MetadataRepository) {
        repo.put(&record(1, "first.txt", 10)).unwrap();
        repo.put(&record(2, "second.txt", 20)).unwrap();
        // Republishing overwrites but keeps position
        repo.put(&record(1, "first-renamed.txt", 30)).unwrap();

        let all = repo.list_all().unwrap();
        let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first-renamed.txt", "second.txt"]);

        let fetched = repo.get(&ContentId::from_bytes([2; 32])).unwrap().unwrap();
        assert_eq!(fetched, record(2, "second.txt", 20));
        assert!(repo.get(&ContentId::from_bytes([9; 32])).unwrap().is_none());

        let alice = PeerInfo::new("alice", "10.0.0.1:7040");
        let bob = PeerInfo::new("bob", "10.0.0.2:7040");
        repo.upsert_peer(&alice, 100).unwrap();
        repo.upsert_peer(&bob, 200).unwrap();
        repo.upsert_peer(&alice, 50).unwrap();
        repo.upsert_peer(&PeerInfo::new("alice", "10.0.0.9:7040"), 300).unwrap();

        let peers = repo.list_peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].peer.id.as_str(), "alice");
        assert_eq!(peers[0].peer.address.as_str(), "10.0.0.9:7040");
        assert_eq!(peers[0].last_seen, 300);
        assert_eq!(peers[1].last_seen, 200);
    }

    #[test]
    fn test_memory_repository() {
        check_repository(&MemoryRepository::new());
    }

    #[test]
    fn test_sqlite_repository() {
        check_repository(&SqliteRepository::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("torrentium.db");

        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.put(&record(3, "kept.bin", 1)).unwrap();
        }

        let repo = SqliteRepository::open(&path).unwrap();
        let all = repo.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "kept.bin");
        assert!(all[0].is_local());
    }
}
