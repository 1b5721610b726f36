use crate::chain::{ChainQueries, ChainWriter};
use crate::error::KeepResult;
use crate::retry::{do_with_retry, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Registers the operator as a member candidate for `application`, then keeps
/// its status up to date, checking every `interval`.
pub async fn monitor_registration(
    cancel: CancellationToken,
    queries: Arc<dyn ChainQueries>,
    writer: Arc<dyn ChainWriter>,
    application: String,
    interval: Duration,
    retry: RetryPolicy,
) -> anyhow::Result<()> {
    let registered = do_with_retry(&cancel, retry, || {
        queries.is_registered_for_application(&application)
    })
    .await?;
    if registered {
        tracing::info!(%application, "already registered as member candidate");
    } else {
        do_with_retry(&cancel, retry, || {
            writer.register_as_member_candidate(&application)
        })
        .await?;
        tracing::info!(%application, "registered as member candidate");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if let Err(err) = refresh_status(queries.as_ref(), writer.as_ref(), &application).await {
            tracing::warn!(%application, %err, "cannot refresh operator status");
        }
    }
}

async fn refresh_status(
    queries: &dyn ChainQueries,
    writer: &dyn ChainWriter,
    application: &str,
) -> KeepResult<()> {
    if queries.is_status_up_to_date(application).await? {
        return Ok(());
    }
    writer.update_status_for_application(application).await?;
    tracing::info!(%application, "updated operator status");
    Ok(())
}
