use crate::domain::request::safe_name;
use crate::domain::session::SessionSnapshot;
use crate::error::{PipelineError, Result};
use crate::ports::repository::SnapshotStore;
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LATEST: &str = "latest.json";

/// Snapshots stored as `<root>/<safe book id>/latest.json`.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn book_dir(&self, book_id: &str) -> PathBuf {
        self.root.join(safe_name(book_id))
    }

    pub fn path_for(&self, book_id: &str) -> PathBuf {
        self.book_dir(book_id).join(LATEST)
    }
}

// Write next to the target and rename over it, so readers never see a partial file.
fn write_atomically(dir: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".latest")
        .suffix(".json")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let dir = self.book_dir(&snapshot.book_id);
        let target = self.path_for(&snapshot.book_id);

        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &data))
            .await
            .map_err(|e| PipelineError::Io(io::Error::other(e)))??;

        debug!(book_id = %snapshot.book_id, "Snapshot saved");
        Ok(())
    }

    async fn load_latest(&self, book_id: &str) -> Result<Option<SessionSnapshot>> {
        match tokio::fs::read(self.path_for(book_id)).await {
            Ok(data) => {
                let snapshot: SessionSnapshot = serde_json::from_slice(&data)?;
                if snapshot.book_id != book_id {
                    warn!(
                        book_id,
                        stored = %snapshot.book_id,
                        "Snapshot belongs to another book, ignoring"
                    );
                    return Ok(None);
                }
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, book_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.book_dir(book_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
