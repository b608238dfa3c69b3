//! Position lifecycle controller.
//!
//! Drives one position through `pending -> open -> closing -> closed`, or to
//! `aborted` on rejection, entry failure, cancellation or exit failure. The
//! controller is the only writer of status; the monitor only updates price
//! tracking.

use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry_notify;
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    OrderFill, OrderGateway, OrderRequest, PricePredictor, SnapshotProvider, TransactionRecorder,
};
use crate::error::{EngineError, GatewayError};
use crate::models::{
    AbortReason, ExitReason, Position, PositionStatus, Prediction, RejectionReason, TradeSide,
    TransactionEvent,
};

use super::config::{EngineConfig, ExitConfig, MonitorConfig, RecorderConfig, RiskConfig};
use super::gate::EntryRule;
use super::monitor::{ExitSignal, MonitorOutcome, PositionMonitor};
use super::risk::position_quantity;

/// External services a controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn SnapshotProvider>,
    pub predictor: Arc<dyn PricePredictor>,
    pub gateway: Arc<dyn OrderGateway>,
    pub recorder: Arc<dyn TransactionRecorder>,
}

/// A position shared between its controller, monitor and readers, with its
/// status mirrored on a watch channel for waiters.
#[derive(Clone)]
pub struct TrackedPosition {
    inner: Arc<RwLock<Position>>,
    status: Arc<watch::Sender<PositionStatus>>,
}

impl TrackedPosition {
    pub fn new(position: Position) -> Self {
        let (status, _) = watch::channel(position.status);
        Self {
            inner: Arc::new(RwLock::new(position)),
            status: Arc::new(status),
        }
    }

    pub fn shared(&self) -> Arc<RwLock<Position>> {
        self.inner.clone()
    }

    /// Point-in-time copy.
    pub async fn snapshot(&self) -> Position {
        self.inner.read().await.clone()
    }

    pub fn status(&self) -> PositionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PositionStatus> {
        self.status.subscribe()
    }

    /// Mutate under the write lock and publish the resulting status.
    pub async fn apply<T>(
        &self,
        f: impl FnOnce(&mut Position) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut pos = self.inner.write().await;
        let out = f(&mut pos)?;
        self.status.send_replace(pos.status);
        Ok(out)
    }
}

/// Submit `order`, retrying transient failures with exponential backoff.
///
/// Every attempt reuses the order's client id, so an attempt that reached the
/// exchange before failing cannot produce a second fill. A `Duplicate`
/// response is that earlier attempt being reported back and counts as filled
/// at the requested price and quantity.
pub async fn submit_with_retry(
    gateway: &dyn OrderGateway,
    order: &OrderRequest,
    policy: &ExitConfig,
) -> Result<OrderFill, GatewayError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    retry_notify(
        policy.backoff(),
        move || {
            attempt += 1;
            let current = attempt;
            async move {
                let err = match gateway.place_order(order).await {
                    Ok(fill) if fill.filled => return Ok(fill),
                    Ok(_) => GatewayError::Transient(format!(
                        "order {} accepted but not filled",
                        order.client_order_id
                    )),
                    Err(GatewayError::Duplicate(id)) => {
                        info!(client_order_id = %id, "Order already accepted, treating as filled");
                        return Ok(OrderFill {
                            filled: true,
                            filled_qty: order.quantity,
                            filled_price: order.price,
                            exchange_order_id: None,
                        });
                    }
                    Err(e) => e,
                };

                if !err.is_retryable() || current >= max_attempts {
                    warn!(
                        client_order_id = %order.client_order_id,
                        attempt = current,
                        error = %err,
                        "Giving up on order"
                    );
                    return Err(backoff::Error::permanent(err));
                }
                Err(backoff::Error::transient(err))
            }
        },
        |err: GatewayError, wait: Duration| {
            warn!(
                client_order_id = %order.client_order_id,
                side = order.side.as_str(),
                error = %err,
                retry_in_ms = wait.as_millis() as u64,
                "Order attempt failed, retrying"
            );
        },
    )
    .await
}

/// Drives positions through their lifecycle.
pub struct LifecycleController {
    services: Collaborators,
    rule: Box<dyn EntryRule>,
    monitor: MonitorConfig,
    exit: ExitConfig,
    recorder: RecorderConfig,
}

impl LifecycleController {
    pub fn new(services: Collaborators, config: &EngineConfig) -> Self {
        Self {
            services,
            rule: config.gate.rule(),
            monitor: config.monitor,
            exit: config.exit,
            recorder: config.recorder,
        }
    }

    /// Decide and execute the entry for a pending position.
    ///
    /// On success the position is `open`, the BUY is filled and recorded.
    /// On any error the position has been moved to `aborted` first.
    pub async fn enter(
        &self,
        position: &TrackedPosition,
        risk: &RiskConfig,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (id, pair, capital, entry_order_id) = {
            let pos = position.shared();
            let pos = pos.read().await;
            (pos.id, pos.pair.clone(), pos.capital, pos.entry_order_id.clone())
        };

        let snapshot = match self.services.provider.fetch_snapshot(&pair).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(position_id = %id, pair = %pair, error = %e, "Entry snapshot unavailable");
                return self.reject(position, RejectionReason::SnapshotUnavailable).await;
            }
        };

        let prediction = match self.services.predictor.predict(&pair, &snapshot).await {
            Ok(prediction) => prediction,
            Err(e) => {
                warn!(position_id = %id, pair = %pair, error = %e, "Prediction failed");
                Prediction::Unavailable
            }
        };

        let entry_price = snapshot.price;
        let decision = self.rule.evaluate(entry_price, &snapshot, prediction);
        if let Some(reason) = decision.rejection() {
            return self.reject(position, reason).await;
        }

        let quantity = match position_quantity(capital, entry_price) {
            Ok(quantity) => quantity,
            Err(e) => {
                self.abort(position, AbortReason::InvalidEntryPrice).await;
                return Err(e);
            }
        };

        let levels = match risk.levels(entry_price, &snapshot) {
            Ok(levels) => levels,
            Err(e) => {
                warn!(position_id = %id, error = %e, "Risk levels rejected");
                self.abort(position, AbortReason::InvalidRiskLevels).await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            self.abort(position, AbortReason::ManualCancel).await;
            return Err(EngineError::Cancelled(id));
        }

        let order = OrderRequest {
            pair: pair.clone(),
            side: TradeSide::Buy,
            price: entry_price,
            quantity,
            client_order_id: entry_order_id,
        };
        let fill = match submit_with_retry(self.services.gateway.as_ref(), &order, &self.exit).await {
            Ok(fill) => fill,
            Err(e) => {
                error!(position_id = %id, pair = %pair, error = %e, "Entry order failed");
                self.abort(position, AbortReason::EntryFailed).await;
                return Err(EngineError::EntryFailed {
                    position_id: id,
                    reason: e.to_string(),
                });
            }
        };

        let opened = position
            .apply(|p| {
                p.open(entry_price, fill.filled_qty, levels)?;
                Ok(p.clone())
            })
            .await?;

        info!(
            position_id = %id,
            pair = %pair,
            entry_price = %entry_price,
            quantity = %fill.filled_qty,
            stop_loss = %levels.stop_loss,
            take_profit = %levels.take_profit,
            "Position opened"
        );

        self.record(&TransactionEvent::buy(&opened, fill.filled_price, fill.filled_qty))
            .await;
        Ok(())
    }

    /// Monitor an open position and carry out its exit. Returns once the
    /// position is terminal.
    pub async fn supervise(
        &self,
        position: &TrackedPosition,
        cancel: CancellationToken,
        close_requested: CancellationToken,
    ) {
        let monitor = PositionMonitor::new(
            position.shared(),
            self.services.provider.clone(),
            self.monitor,
            cancel,
            close_requested,
        );
        let (rx, handle) = monitor.spawn();

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let pos = position.snapshot().await;
                let last = pos
                    .price_history
                    .last()
                    .map(|s| s.price)
                    .unwrap_or(pos.entry_price);
                error!(position_id = %pos.id, "Monitor stopped without a signal, exiting");
                MonitorOutcome::Exit(ExitSignal {
                    reason: ExitReason::Error,
                    trigger_price: last,
                    highest_price_seen: pos.highest_price_seen,
                })
            }
        };
        if let Err(e) = handle.await {
            error!(error = %e, "Monitor task failed");
        }

        match outcome {
            MonitorOutcome::Cancelled { last_price } => {
                let id = position.snapshot().await.id;
                info!(position_id = %id, last_price = %last_price, "Position cancelled, no exit order placed");
                self.abort(position, AbortReason::ManualCancel).await;
            }
            MonitorOutcome::Exit(signal) => self.exit(position, signal).await,
        }
    }

    async fn exit(&self, position: &TrackedPosition, signal: ExitSignal) {
        let closing = match position
            .apply(|p| {
                p.begin_closing(signal.reason)?;
                Ok(p.clone())
            })
            .await
        {
            Ok(pos) => pos,
            Err(e) => {
                error!(error = %e, "Cannot begin exit");
                return;
            }
        };

        info!(
            position_id = %closing.id,
            reason = signal.reason.as_str(),
            price = %signal.trigger_price,
            highest = %signal.highest_price_seen,
            "Closing position"
        );

        let order = OrderRequest {
            pair: closing.pair.clone(),
            side: TradeSide::Sell,
            price: signal.trigger_price,
            quantity: closing.quantity,
            client_order_id: closing.exit_order_id.clone(),
        };

        match submit_with_retry(self.services.gateway.as_ref(), &order, &self.exit).await {
            Ok(fill) => {
                let closed = match position
                    .apply(|p| {
                        p.close(fill.filled_price, fill.filled_qty)?;
                        Ok(p.clone())
                    })
                    .await
                {
                    Ok(pos) => pos,
                    Err(e) => {
                        error!(position_id = %closing.id, error = %e, "Cannot close position");
                        return;
                    }
                };

                info!(
                    position_id = %closed.id,
                    pair = %closed.pair,
                    reason = signal.reason.as_str(),
                    exit_price = %fill.filled_price,
                    pnl = %closed.realized_pnl.unwrap_or(Decimal::ZERO),
                    "Position closed"
                );
                self.record(&TransactionEvent::sell(&closed)).await;
            }
            Err(e) => {
                self.abort(position, AbortReason::ExitFailed).await;
                error!(
                    position_id = %closing.id,
                    pair = %closing.pair,
                    quantity = %closing.quantity,
                    price = %signal.trigger_price,
                    error = %e,
                    "EXIT FAILED: position still held, manual intervention required"
                );
                let failed = position.snapshot().await;
                self.record(&TransactionEvent::exit_failed(&failed, signal.trigger_price))
                    .await;
            }
        }
    }

    async fn reject(
        &self,
        position: &TrackedPosition,
        reason: RejectionReason,
    ) -> Result<(), EngineError> {
        self.abort(position, AbortReason::Rejected(reason)).await;
        let id = position.snapshot().await.id;
        info!(position_id = %id, reason = reason.as_str(), "Entry rejected");
        Err(EngineError::rejected(Some(id), reason))
    }

    async fn abort(&self, position: &TrackedPosition, reason: AbortReason) {
        match position.apply(|p| p.abort(reason).map(|_| p.id)).await {
            Ok(id) => debug!(position_id = %id, reason = %reason, "Position aborted"),
            Err(e) => warn!(reason = %reason, error = %e, "Abort not applied"),
        }
    }

    /// Append to the transaction log with bounded retries. A log that stays
    /// unavailable is reported and skipped; it never blocks the lifecycle.
    async fn record(&self, event: &TransactionEvent) {
        let attempts = self.recorder.max_attempts.max(1);
        let limit = Duration::from_millis(self.recorder.timeout_ms);

        for attempt in 1..=attempts {
            match timeout(limit, self.services.recorder.record(event)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => warn!(
                    position_id = %event.position_id,
                    action = event.action.as_str(),
                    attempt,
                    error = %e,
                    "Failed to record transaction"
                ),
                Err(_) => warn!(
                    position_id = %event.position_id,
                    action = event.action.as_str(),
                    attempt,
                    "Recording transaction timed out"
                ),
            }
            if attempt < attempts {
                sleep(Duration::from_millis(self.recorder.backoff_ms)).await;
            }
        }

        error!(
            position_id = %event.position_id,
            action = event.action.as_str(),
            price = %event.price,
            quantity = %event.quantity,
            "Transaction not recorded"
        );
    }
}
