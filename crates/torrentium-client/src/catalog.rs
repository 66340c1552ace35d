//! Content catalog: the files this node publishes

use crate::repository::MetadataRepository;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use torrentium_core::chunk::chunk_file;
use torrentium_core::{ContentId, Error, FileRecord, Result};

/// Catalog of locally held files, backed by a [`MetadataRepository`]
pub struct Catalog {
    repo: Arc<dyn MetadataRepository>,
    chunk_size: usize,
    /// Serializes writers per identifier
    key_locks: Mutex<HashMap<ContentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Catalog {
    pub fn new(repo: Arc<dyn MetadataRepository>, chunk_size: usize) -> Self {
        Self {
            repo,
            chunk_size,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn MetadataRepository> {
        &self.repo
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunk a local file and record it under its content identifier.
    ///
    /// Publishing the same bytes again yields the same identifier and
    /// overwrites the earlier record.
    pub async fn publish(&self, path: &Path) -> Result<FileRecord> {
        let path: PathBuf = path.to_path_buf();
        let chunk_size = self.chunk_size;

        tracing::info!("Processing file: {}", path.display());
        let record = tokio::task::spawn_blocking(move || chunk_file(&path, chunk_size))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.store(record).await
    }

    /// Persist an already verified record
    pub async fn store(&self, record: FileRecord) -> Result<FileRecord> {
        let lock = self.key_lock(&record.id);
        let guard = lock.lock().await;

        let stored = record.clone();
        let result = self.blocking(move |repo| repo.put(&stored)).await;

        drop(guard);
        self.release_key_lock(&record.id, lock);
        result?;

        tracing::info!(
            "Published {} as {} ({} bytes, {} chunks)",
            record.name,
            record.id.short(),
            record.size,
            record.chunk_count()
        );
        Ok(record)
    }

    /// Records whose bytes live on this node, in first-publish order
    pub async fn list_local(&self) -> Result<Vec<FileRecord>> {
        self.blocking(local_records).await
    }

    pub async fn lookup(&self, id: &ContentId) -> Result<Option<FileRecord>> {
        let id = *id;
        self.blocking(move |repo| repo.get(&id)).await
    }

    /// Local records whose name contains `query`, ignoring case
    pub async fn search_local(&self, query: &str) -> Result<Vec<FileRecord>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.list_local().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .collect())
    }

    /// Run a repository call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetadataRepository) -> Result<T> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(repo.as_ref()))
            .await
            .map_err(|e| Error::Database(e.to_string()))?
    }

    fn key_lock(&self, id: &ContentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(*id).or_default().clone()
    }

    fn release_key_lock(&self, id: &ContentId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this caller hold it: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }
}

fn local_records(repo: &dyn MetadataRepository) -> Result<Vec<FileRecord>> {
    Ok(repo
        .list_all()?
        .into_iter()
        .filter(|r| r.is_local())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use tempfile::TempDir;

    fn catalog() -> Catalog {
        Catalog::new(Arc::new(MemoryRepository::new()), 4)
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("copy-of-a.txt");
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();

        let catalog = catalog();
        let first = catalog.publish(&a).await.unwrap();
        let second = catalog.publish(&b).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.chunk_count(), 4);

        let listed = catalog.list_local().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "copy-of-a.txt");
    }

    #[tokio::test]
    async fn test_publish_missing_file_is_io_error() {
        let catalog = catalog();
        let result = catalog.publish(Path::new("/nonexistent/file.bin")).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(catalog.list_local().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_from_many_tasks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wanted.bin");
        std::fs::write(&path, b"wanted bytes").unwrap();

        let catalog = Arc::new(catalog());
        let record = catalog.publish(&path).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let catalog = catalog.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move { catalog.lookup(&id).await }));
        }
        for handle in handles {
            let found = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(found.local_path(), Some(path.as_path()));
        }

        let unknown = ContentId::from_bytes([9; 32]);
        assert!(catalog.lookup(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_order_and_search() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog();
        for (name, body) in [("Holiday.JPG", "one"), ("notes.txt", "two"), ("holiday-2.png", "three")] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            catalog.publish(&path).await.unwrap();
        }

        let names: Vec<String> = catalog
            .list_local()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["Holiday.JPG", "notes.txt", "holiday-2.png"]);

        assert_eq!(catalog.search_local("HOLIDAY").await.unwrap().len(), 2);
        assert_eq!(catalog.search_local("notes").await.unwrap().len(), 1);
        assert!(catalog.search_local("  ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_publishes_of_same_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        std::fs::write(&path, vec![7u8; 64]).unwrap();

        let catalog = Arc::new(catalog());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let catalog = catalog.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move { catalog.publish(&path).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(catalog.list_local().await.unwrap().len(), 1);
        assert!(catalog.key_locks.lock().unwrap().is_empty());
    }
}
