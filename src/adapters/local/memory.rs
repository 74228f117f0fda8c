use crate::domain::session::SessionSnapshot;
use crate::error::Result;
use crate::ports::repository::SnapshotStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Process-local snapshot store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, SessionSnapshot>>,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionSnapshot>> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.lock()
            .insert(snapshot.book_id.clone(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_latest(&self, book_id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.lock().get(book_id).cloned())
    }

    async fn clear(&self, book_id: &str) -> Result<()> {
        self.lock().remove(book_id);
        Ok(())
    }
}
