use async_trait::async_trait;
use std::time::Duration;

/// Time source for polling loops.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the clock was created
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}
