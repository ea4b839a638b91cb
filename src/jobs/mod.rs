//! Long-running worker jobs.
//!
//! Each job runs as its own dedicated task, never on a shared bounded pool,
//! so a slow job cannot starve the others. Cancellation is cooperative: the
//! token is checked between discrete units of work and in-flight operations
//! are allowed to finish. Every loop body follows the
//! catch-log-delay-continue pattern so transient infrastructure failures
//! never terminate the process.

pub mod binaries_cleanup;
pub mod event_production;
pub mod lock_cleanup;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `period` unless cancelled first. Returns true when the token
/// fired.
pub(crate) async fn cancelled_within(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}
