//! Per-position price monitor.
//!
//! Samples the snapshot feed on a fixed cadence, tracks the high-water mark
//! and signals the controller exactly once when an exit condition is met. The
//! monitor never places orders itself.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SnapshotProvider;
use crate::models::{ExitReason, Position, PositionId, RiskLevels};

use super::config::MonitorConfig;

/// Exit request delivered to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSignal {
    pub reason: ExitReason,

    /// Price that triggered the exit; the SELL is placed here
    pub trigger_price: Decimal,

    pub highest_price_seen: Decimal,
}

/// How a monitor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Exit(ExitSignal),
    /// Cancelled before any exit condition; no order should be placed.
    Cancelled { last_price: Decimal },
}

/// Exit rule for one sample. Take profit wins over any stop.
pub fn check_exit(levels: &RiskLevels, highest_price_seen: Decimal, price: Decimal) -> Option<ExitReason> {
    if price >= levels.take_profit {
        return Some(ExitReason::TakeProfit);
    }

    let (stop, trailing) = levels.effective_stop(highest_price_seen);
    if price <= stop {
        return Some(if trailing {
            ExitReason::TrailingStop
        } else {
            ExitReason::StopLoss
        });
    }
    None
}

/// Monitor for a single open position.
pub struct PositionMonitor {
    position: Arc<RwLock<Position>>,
    provider: Arc<dyn SnapshotProvider>,
    config: MonitorConfig,
    cancel: CancellationToken,
    close_requested: CancellationToken,
}

impl PositionMonitor {
    pub fn new(
        position: Arc<RwLock<Position>>,
        provider: Arc<dyn SnapshotProvider>,
        config: MonitorConfig,
        cancel: CancellationToken,
        close_requested: CancellationToken,
    ) -> Self {
        Self {
            position,
            provider,
            config,
            cancel,
            close_requested,
        }
    }

    /// Run on its own task. The receiver yields the single outcome.
    pub fn spawn(self) -> (oneshot::Receiver<MonitorOutcome>, JoinHandle<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let outcome = self.run().await;
            if tx.send(outcome).is_err() {
                debug!("Monitor outcome dropped, controller gone");
            }
        });
        (rx, handle)
    }

    /// Sample until an exit condition, a close request or cancellation.
    pub async fn run(self) -> MonitorOutcome {
        let (id, pair, levels, mut last_price) = {
            let pos = self.position.read().await;
            (pos.id, pos.pair.clone(), pos.levels, pos.entry_price)
        };

        let Some(levels) = levels else {
            warn!(position_id = %id, "Monitor started without risk levels");
            return self.signal(ExitReason::Error, last_price).await;
        };

        info!(
            position_id = %id,
            pair = %pair,
            stop_loss = %levels.stop_loss,
            take_profit = %levels.take_profit,
            "Monitoring position"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return MonitorOutcome::Cancelled { last_price };
                }
                _ = self.close_requested.cancelled() => {
                    return self.signal(ExitReason::Manual, last_price).await;
                }
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return MonitorOutcome::Cancelled { last_price };
                }
                _ = self.close_requested.cancelled() => {
                    return self.signal(ExitReason::Manual, last_price).await;
                }
                res = self.provider.fetch_snapshot(&pair) => res,
            };

            let price = match fetched {
                Ok(snapshot) if snapshot.price > Decimal::ZERO => snapshot.price,
                Ok(snapshot) => {
                    failures += 1;
                    warn!(position_id = %id, price = %snapshot.price, failures, "Feed returned non-positive price");
                    if self.feed_exhausted(id, failures) {
                        return self.signal(ExitReason::Error, last_price).await;
                    }
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    warn!(position_id = %id, error = %e, failures, "Snapshot fetch failed");
                    if self.feed_exhausted(id, failures) {
                        return self.signal(ExitReason::Error, last_price).await;
                    }
                    continue;
                }
            };

            failures = 0;
            last_price = price;
            let highest = self.position.write().await.observe_price(Utc::now(), price);

            debug!(
                position_id = %id,
                price = %price,
                highest = %highest,
                "Price sample"
            );

            if let Some(reason) = check_exit(&levels, highest, price) {
                info!(
                    position_id = %id,
                    reason = reason.as_str(),
                    price = %price,
                    highest = %highest,
                    "Exit condition met"
                );
                return MonitorOutcome::Exit(ExitSignal {
                    reason,
                    trigger_price: price,
                    highest_price_seen: highest,
                });
            }
        }
    }

    fn feed_exhausted(&self, id: PositionId, failures: u32) -> bool {
        if failures >= self.config.max_feed_failures {
            warn!(position_id = %id, failures, "Feed failure limit reached, exiting");
            return true;
        }
        false
    }

    async fn signal(&self, reason: ExitReason, trigger_price: Decimal) -> MonitorOutcome {
        let highest_price_seen = self.position.read().await.highest_price_seen;
        MonitorOutcome::Exit(ExitSignal {
            reason,
            trigger_price,
            highest_price_seen,
        })
    }
}
