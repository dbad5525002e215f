//! Helpers shared by unit tests.

use std::time::Duration;
use tokio::time::Instant;

/// Poll `condition` until it holds; `false` after two seconds.
pub(crate) async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    true
}

/// Let spawned tasks run before asserting that something did not happen.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
