use crate::processor::EventProcessor;
use crate::retry::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically re-publishes events that were stored but never made it onto
/// the queue. Runs until `cancel` fires.
pub async fn run_publish_sweeper(
    processor: Arc<EventProcessor>,
    interval: Duration,
    grace_period: Duration,
    cancel: CancellationToken,
) {
    info!(
        "Publish sweeper running every {:?} for events older than {:?}",
        interval, grace_period
    );

    while sleep_or_cancel(interval, &cancel).await.is_ok() {
        match processor.republish_stale(grace_period).await {
            Ok(0) => debug!("Publish sweep found nothing to do"),
            Ok(published) => info!("Publish sweep re-published {} events", published),
            Err(e) => warn!("Publish sweep failed: {}", e),
        }
    }

    debug!("Publish sweeper stopped");
}
