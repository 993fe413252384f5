//! Snapshot storage: durable copies of bolt state keyed by
//! (ProcessorId, Clock). The store is append-only; no locking is needed
//! beyond what each backend does internally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::types::{Clock, ProcessorId};
use crate::utils::SquallError;

/// Capability interface over snapshot storage backends.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Durably writes a snapshot blob under (id, clock). Saving the same
    /// key again overwrites the blob (replayed cuts produce identical
    /// state).
    async fn save(
        &self,
        id: &ProcessorId,
        clock: &Clock,
        blob: Vec<u8>,
    ) -> Result<(), SquallError>;

    /// Reads the snapshot blob for (id, clock), if one exists.
    async fn load(
        &self,
        id: &ProcessorId,
        clock: &Clock,
    ) -> Result<Option<Vec<u8>>, SquallError>;

    /// The most recently saved snapshot for a processor.
    async fn latest(
        &self,
        id: &ProcessorId,
    ) -> Result<Option<(Clock, Vec<u8>)>, SquallError>;
}

/// In-memory backend for tests and the local-mode runner.
#[derive(Default)]
pub struct MemSnapshotStore {
    inner: Mutex<HashMap<ProcessorId, Vec<(Clock, Vec<u8>)>>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    async fn save(
        &self,
        id: &ProcessorId,
        clock: &Clock,
        blob: Vec<u8>,
    ) -> Result<(), SquallError> {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.entry(id.clone()).or_default();
        match entries.iter_mut().find(|(c, _)| c == clock) {
            Some((_, existing)) => *existing = blob,
            None => entries.push((clock.clone(), blob)),
        }
        Ok(())
    }

    async fn load(
        &self,
        id: &ProcessorId,
        clock: &Clock,
    ) -> Result<Option<Vec<u8>>, SquallError> {
        Ok(self.inner.lock().unwrap().get(id).and_then(|entries| {
            entries
                .iter()
                .find(|(c, _)| c == clock)
                .map(|(_, blob)| blob.clone())
        }))
    }

    async fn latest(
        &self,
        id: &ProcessorId,
    ) -> Result<Option<(Clock, Vec<u8>)>, SquallError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(id)
            .and_then(|entries| entries.last().cloned()))
    }
}

/// File-backed snapshot storage: one directory per processor holding
/// numbered blob files plus an `index` file appending one clock line per
/// save, in save order.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSnapshotStore { root: root.into() }
    }

    fn dir_of(&self, id: &ProcessorId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Index entries as (sequence, clock), oldest first.
    async fn read_index(
        &self,
        id: &ProcessorId,
    ) -> Result<Vec<(usize, Clock)>, SquallError> {
        let path = self.dir_of(id).join("index");
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (seq, line) in content.lines().enumerate() {
            entries.push((seq, Clock::from_line(line)?));
        }
        Ok(entries)
    }

    fn blob_path(&self, id: &ProcessorId, seq: usize) -> PathBuf {
        self.dir_of(id).join(format!("{}.snap", seq))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(
        &self,
        id: &ProcessorId,
        clock: &Clock,
        blob: Vec<u8>,
    ) -> Result<(), SquallError> {
        fs::create_dir_all(self.dir_of(id)).await?;
        let index = self.read_index(id).await?;

        if let Some((seq, _)) =
            index.iter().find(|(_, c)| c == clock)
        {
            // replayed cut; overwrite the existing blob in place
            fs::write(self.blob_path(id, *seq), blob).await?;
            return Ok(());
        }

        let seq = index.len();
        fs::write(self.blob_path(id, seq), blob).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir_of(id).join("index"))
            .await?;
        file.write_all(format!("{}\n", clock.to_line()).as_bytes())
            .await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(
        &self,
        id: &ProcessorId,
        clock: &Clock,
    ) -> Result<Option<Vec<u8>>, SquallError> {
        let index = self.read_index(id).await?;
        let Some((seq, _)) = index.iter().find(|(_, c)| c == clock)
        else {
            return Ok(None);
        };
        Ok(Some(fs::read(self.blob_path(id, *seq)).await?))
    }

    async fn latest(
        &self,
        id: &ProcessorId,
    ) -> Result<Option<(Clock, Vec<u8>)>, SquallError> {
        let index = self.read_index(id).await?;
        let Some((seq, clock)) = index.last() else {
            return Ok(None);
        };
        let blob = fs::read(self.blob_path(id, *seq)).await?;
        Ok(Some((clock.clone(), blob)))
    }
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;

    async fn exercise(store: &dyn SnapshotStore) -> Result<(), SquallError> {
        let id = ProcessorId::new("agg", 0);
        let c1 = Clock::of([("p0", 73)]);
        let c2 = Clock::of([("p0", 120)]);

        assert_eq!(store.latest(&id).await?, None);
        assert_eq!(store.load(&id, &c1).await?, None);

        store.save(&id, &c1, vec![1, 2, 3]).await?;
        store.save(&id, &c2, vec![4, 5]).await?;
        assert_eq!(store.load(&id, &c1).await?, Some(vec![1, 2, 3]));
        assert_eq!(
            store.latest(&id).await?,
            Some((c2.clone(), vec![4, 5]))
        );

        // replaying the same cut overwrites without growing history
        store.save(&id, &c2, vec![4, 5]).await?;
        assert_eq!(
            store.latest(&id).await?,
            Some((c2.clone(), vec![4, 5]))
        );

        // other processors are independent
        let other = ProcessorId::new("agg", 1);
        assert_eq!(store.latest(&other).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn mem_store_semantics() -> Result<(), SquallError> {
        exercise(&MemSnapshotStore::new()).await
    }

    #[tokio::test]
    async fn file_store_semantics() -> Result<(), SquallError> {
        let root = std::env::temp_dir().join("squall_snapshot_store_test");
        let _ = fs::remove_dir_all(&root).await;
        let store = FileSnapshotStore::new(&root);
        exercise(&store).await?;

        // a fresh handle over the same directory sees the same history
        let reopened = FileSnapshotStore::new(&root);
        let id = ProcessorId::new("agg", 0);
        assert_eq!(
            reopened.latest(&id).await?,
            Some((Clock::of([("p0", 120)]), vec![4, 5]))
        );
        fs::remove_dir_all(&root).await?;
        Ok(())
    }
}
