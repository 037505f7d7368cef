//! Async assertion helpers.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Poll `check` every 10ms until it holds or `timeout` elapses; returns the final verdict.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
