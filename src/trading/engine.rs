//! Engine facade: opens, tracks and cancels positions.
//!
//! At most one active position per pair. The pair is reserved under the
//! registry lock before the entry gate runs and released when the position
//! reaches a terminal status.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::models::{Position, PositionId, PositionStatus, RejectionReason};

use super::config::{EngineConfig, RiskConfig};
use super::lifecycle::{Collaborators, LifecycleController, TrackedPosition};

struct Slot {
    position: TrackedPosition,
    cancel: CancellationToken,
    close_requested: CancellationToken,
}

struct Inner {
    controller: LifecycleController,
    registry: Mutex<HashMap<String, PositionId>>,
    positions: RwLock<HashMap<PositionId, Arc<Slot>>>,
    tasks: Mutex<HashMap<PositionId, JoinHandle<()>>>,
}

/// Position engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(services: Collaborators, config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                controller: LifecycleController::new(services, config),
                registry: Mutex::new(HashMap::new()),
                positions: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Decide and, if approved, open a position on `pair`.
    ///
    /// Returns once the position is `open` and its monitor is running. A
    /// refused entry returns [`EngineError::Rejected`]; the aborted position
    /// stays queryable through its id.
    pub async fn open_position(
        &self,
        pair: &str,
        capital: Decimal,
        risk: RiskConfig,
    ) -> Result<PositionId, EngineError> {
        if capital <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!(
                "capital must be positive, got {}",
                capital
            )));
        }
        risk.validate()?;

        let slot = {
            let mut registry = self.inner.registry.lock().await;
            if let Some(active) = registry.get(pair) {
                info!(pair = %pair, active = %active, "Position already active on pair");
                return Err(EngineError::rejected(
                    None,
                    RejectionReason::PositionAlreadyActive,
                ));
            }

            let position = Position::pending(pair, capital);
            let id = position.id;
            let slot = Arc::new(Slot {
                position: TrackedPosition::new(position),
                cancel: CancellationToken::new(),
                close_requested: CancellationToken::new(),
            });
            registry.insert(pair.to_string(), id);
            self.inner.positions.write().await.insert(id, slot.clone());
            slot
        };

        let id = slot.position.snapshot().await.id;
        info!(position_id = %id, pair = %pair, capital = %capital, "Evaluating entry");

        if let Err(e) = self
            .inner
            .controller
            .enter(&slot.position, &risk, &slot.cancel)
            .await
        {
            self.inner.release(pair, id).await;
            return Err(e);
        }

        // held across the spawn so the task cannot remove its entry first
        let mut tasks = self.inner.tasks.lock().await;
        let inner = self.inner.clone();
        let task_slot = slot.clone();
        let task_pair = pair.to_string();
        let handle = tokio::spawn(async move {
            inner
                .controller
                .supervise(
                    &task_slot.position,
                    task_slot.cancel.clone(),
                    task_slot.close_requested.clone(),
                )
                .await;
            inner.release(&task_pair, id).await;
            inner.tasks.lock().await.remove(&id);
        });
        tasks.insert(id, handle);

        Ok(id)
    }

    /// Current state of a position.
    pub async fn get_status(&self, id: PositionId) -> Result<Position, EngineError> {
        Ok(self.inner.slot(id).await?.position.snapshot().await)
    }

    /// Stop monitoring and abort without selling. An exit already in
    /// progress is not interrupted.
    pub async fn cancel_position(&self, id: PositionId) -> Result<(), EngineError> {
        let slot = self.inner.slot(id).await?;
        let status = slot.position.status();

        match status {
            PositionStatus::Pending | PositionStatus::Open => {
                info!(position_id = %id, status = %status, "Cancelling position");
                slot.cancel.cancel();
                Ok(())
            }
            PositionStatus::Closing => {
                warn!(position_id = %id, "Exit already in progress, cancel ignored");
                Ok(())
            }
            PositionStatus::Closed | PositionStatus::Aborted => {
                Err(EngineError::NotActive { id, status })
            }
        }
    }

    /// Exit an open position now at the last observed price.
    pub async fn close_position(&self, id: PositionId) -> Result<(), EngineError> {
        let slot = self.inner.slot(id).await?;
        let status = slot.position.status();

        if status != PositionStatus::Open {
            return Err(EngineError::NotActive { id, status });
        }
        info!(position_id = %id, "Manual close requested");
        slot.close_requested.cancel();
        Ok(())
    }

    /// Wait until the position is `closed` or `aborted`.
    pub async fn wait_for_completion(&self, id: PositionId) -> Result<Position, EngineError> {
        let slot = self.inner.slot(id).await?;
        let mut rx = slot.position.subscribe();
        let completed = rx.wait_for(|status| status.is_terminal()).await.is_ok();
        if !completed {
            error!(position_id = %id, "Status channel closed before completion");
        }
        Ok(slot.position.snapshot().await)
    }

    /// Positions not yet terminal.
    pub async fn active_positions(&self) -> Vec<Position> {
        let slots: Vec<Arc<Slot>> = self.inner.positions.read().await.values().cloned().collect();

        let mut active = Vec::new();
        for slot in slots {
            if !slot.position.status().is_terminal() {
                active.push(slot.position.snapshot().await);
            }
        }
        active.sort_by_key(|p| p.created_at);
        active
    }

    /// Cancel every active position and wait for their tasks.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.inner.positions.read().await.values().cloned().collect();
        for slot in &slots {
            if matches!(
                slot.position.status(),
                PositionStatus::Pending | PositionStatus::Open
            ) {
                slot.cancel.cancel();
            }
        }

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain().map(|(_, h)| h).collect();
        info!(tasks = handles.len(), "Shutting down engine");

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Position task failed");
            }
        }
    }
}

impl Inner {
    async fn slot(&self, id: PositionId) -> Result<Arc<Slot>, EngineError> {
        self.positions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    async fn release(&self, pair: &str, id: PositionId) {
        let mut registry = self.registry.lock().await;
        if registry.get(pair) == Some(&id) {
            registry.remove(pair);
            info!(position_id = %id, pair = %pair, "Pair released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{AbortReason, ExitReason, Prediction, TradeSide};
    use crate::trading::test_support::{test_config, Doubles, FlakyGateway, ScriptedProvider};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn engine(doubles: &Doubles, predicted: Prediction) -> Engine {
        Engine::new(doubles.collaborators(predicted), &test_config()).unwrap()
    }

    fn risk() -> RiskConfig {
        test_config().risk
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_runs_to_take_profit() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000), dec!(400300), dec!(400500)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));

        let id = engine.open_position("btcidr", dec!(20000), risk()).await.unwrap();
        let pos = engine.wait_for_completion(id).await.unwrap();

        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(pos.realized_pnl, Some(dec!(25)));
        assert!(engine.active_positions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_opens_on_one_pair() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000), dec!(400100)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));

        let (a, b) = tokio::join!(
            engine.open_position("btcidr", dec!(20000), risk()),
            engine.open_position("btcidr", dec!(20000), risk()),
        );

        let (won, lost) = match (a, b) {
            (Ok(id), Err(e)) | (Err(e), Ok(id)) => (id, e),
            other => panic!("expected exactly one winner, got {:?}", other),
        };
        assert_eq!(
            lost.rejection_reason(),
            Some(RejectionReason::PositionAlreadyActive)
        );
        assert_eq!(engine.active_positions().await.len(), 1);
        assert_eq!(doubles.gateway.submissions(TradeSide::Buy).len(), 1);

        assert_ok!(engine.cancel_position(won).await);
        let pos = engine.wait_for_completion(won).await.unwrap();
        assert_eq!(pos.abort_reason, Some(AbortReason::ManualCancel));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_entry_frees_pair() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Unavailable);

        let err = engine
            .open_position("btcidr", dec!(20000), risk())
            .await
            .unwrap_err();
        let (id, reason) = match err {
            EngineError::Rejected {
                position_id: Some(id),
                reason,
            } => (id, reason),
            other => panic!("expected rejection, got {:?}", other),
        };
        assert_eq!(reason, RejectionReason::PredictionUnavailable);

        let pos = engine.get_status(id).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Aborted);

        // the pair is free again, and this entry is refused on its merits
        let again = engine
            .open_position("btcidr", dec!(20000), risk())
            .await
            .unwrap_err();
        assert_eq!(
            again.rejection_reason(),
            Some(RejectionReason::PredictionUnavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_quantity_frees_pair() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(0.000000001)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(1)));
        let capital = dec!(100000000000000000000);

        let err = engine.open_position("btcidr", capital, risk()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidEntryPrice(_)));
        assert!(engine.active_positions().await.is_empty());

        // not blocked by a stale reservation
        let again = engine.open_position("btcidr", capital, risk()).await.unwrap_err();
        assert!(matches!(again, EngineError::InvalidEntryPrice(_)));
        assert!(doubles.gateway.submissions(TradeSide::Buy).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_task_is_dropped() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000), dec!(400500)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));

        let id = engine.open_position("btcidr", dec!(20000), risk()).await.unwrap();
        assert!(engine.inner.tasks.lock().await.contains_key(&id));

        engine.wait_for_completion(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(engine.inner.tasks.lock().await.is_empty());
        assert!(engine.inner.registry.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_close() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000), dec!(400200)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));

        let id = engine.open_position("btcidr", dec!(20000), risk()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        engine.close_position(id).await.unwrap();

        let pos = engine.wait_for_completion(id).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_reason, Some(ExitReason::Manual));
        assert_eq!(pos.exit_price, Some(dec!(400200)));

        assert!(matches!(
            engine.close_position(id).await,
            Err(EngineError::NotActive { .. })
        ));
        assert!(matches!(
            engine.cancel_position(id).await,
            Err(EngineError::NotActive { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_pairs_are_independent() {
        let doubles = Doubles::new(
            ScriptedProvider::prices([dec!(400000)]),
            FlakyGateway::new(),
        );
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));

        engine.open_position("btcidr", dec!(20000), risk()).await.unwrap();
        engine.open_position("ethidr", dec!(20000), risk()).await.unwrap();
        assert_eq!(engine.active_positions().await.len(), 2);

        engine.shutdown().await;
        assert!(engine.active_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_position() {
        let doubles = Doubles::new(ScriptedProvider::prices([]), FlakyGateway::new());
        let engine = engine(&doubles, Prediction::Unavailable);
        let id = PositionId::new();

        assert!(matches!(
            assert_err!(engine.get_status(id).await),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            assert_err!(engine.cancel_position(id).await),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_risk_config_has_no_side_effects() {
        let doubles = Doubles::new(ScriptedProvider::prices([dec!(400000)]), FlakyGateway::new());
        let engine = engine(&doubles, Prediction::Price(dec!(410000)));
        let bad = RiskConfig::Fixed {
            stop_loss_pct: dec!(-0.1),
            take_profit_pct: dec!(0.01),
            trailing_stop_pct: None,
        };

        let err = engine.open_position("btcidr", dec!(20000), bad).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert_eq!(doubles.provider.fetches(), 0);
    }
}
