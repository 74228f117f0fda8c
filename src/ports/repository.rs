use crate::domain::session::SessionSnapshot;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the snapshot as the book's latest, replacing any previous one
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Latest snapshot for a book, if any
    async fn load_latest(&self, book_id: &str) -> Result<Option<SessionSnapshot>>;

    /// Forget the book's session. Clearing an unknown book is not an error.
    async fn clear(&self, book_id: &str) -> Result<()>;
}
