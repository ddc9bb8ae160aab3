// rm-test-utils: Shared test utilities for the mirroring suites.
//
// Provides a protocol-level peer (a bare comm stack with its inbound
// receiver) for driving servers from tests, plus polling helpers.

pub mod peer;

pub use peer::TestPeer;

use std::time::Duration;

/// Poll `cond` until it holds or `timeout` passes; returns its final value.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
