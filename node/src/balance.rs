use crate::chain::ChainQueries;
use crate::metrics;
use keep_primitives::OperatorId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BALANCE_MONITOR_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BALANCE_ALERT_THRESHOLD: u128 = 500_000_000_000_000_000;

/// Samples the account balance every `interval` and raises an alert while it
/// is below `threshold`.
pub async fn monitor_balance(
    cancel: CancellationToken,
    queries: Arc<dyn ChainQueries>,
    account: OperatorId,
    threshold: u128,
    interval: Duration,
) -> anyhow::Result<()> {
    tracing::info!(%account, threshold, "starting balance monitor");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match queries.balance(&account).await {
            Ok(balance) => {
                metrics::KEEP_OPERATOR_BALANCE.set(balance as f64);
                if balance < threshold {
                    tracing::error!(
                        %account,
                        balance,
                        threshold,
                        "operator balance is below the alert threshold; top up the account"
                    );
                    metrics::KEEP_OPERATOR_BALANCE_BELOW_THRESHOLD.set(1);
                } else {
                    tracing::debug!(%account, balance, "operator balance");
                    metrics::KEEP_OPERATOR_BALANCE_BELOW_THRESHOLD.set(0);
                }
            }
            Err(err) => {
                tracing::warn!(%account, %err, "cannot fetch operator balance");
            }
        }
    }
}
