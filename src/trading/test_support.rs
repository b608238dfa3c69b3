//! Scripted collaborators for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::{
    OrderFill, OrderGateway, OrderRequest, PricePredictor, SnapshotProvider, TransactionRecorder,
};
use crate::error::GatewayError;
use crate::models::{
    IndicatorSnapshot, Prediction, RiskLevels, TradeSide, TransactionAction, TransactionEvent,
};

use super::config::{EngineConfig, ExitConfig, MonitorConfig, RecorderConfig, RiskConfig};
use super::lifecycle::Collaborators;

/// One scripted feed response.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Price(Decimal),
    Fail,
}

/// Snapshot feed that replays a script. Once the script runs out it keeps
/// returning the last price it served.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Decimal>>,
    rsi: Decimal,
    fetches: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            rsi: dec!(55),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn prices(prices: impl IntoIterator<Item = Decimal>) -> Self {
        Self::new(prices.into_iter().map(Step::Price))
    }

    pub fn with_rsi(mut self, rsi: Decimal) -> Self {
        self.rsi = rsi;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for ScriptedProvider {
    async fn fetch_snapshot(&self, pair: &str) -> Result<IndicatorSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();

        let price = match step {
            Some(Step::Price(price)) => price,
            Some(Step::Fail) => return Err(anyhow!("feed unavailable")),
            None => last.ok_or_else(|| anyhow!("script exhausted"))?,
        };
        *last = Some(price);

        Ok(IndicatorSnapshot {
            rsi: self.rsi,
            ..IndicatorSnapshot::price_only(pair, price)
        })
    }
}

/// Predictor that always returns the same forecast.
pub struct FixedPredictor(pub Prediction);

#[async_trait]
impl PricePredictor for FixedPredictor {
    async fn train(&self, _pair: &str) -> Result<()> {
        Ok(())
    }

    async fn predict(&self, _pair: &str, _snapshot: &IndicatorSnapshot) -> Result<Prediction> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Plan {
    transient_failures: u32,
    lost_acks: u32,
    always_fail: bool,
    reject: bool,
}

/// Gateway that fails on command and remembers every submission.
#[derive(Default)]
pub struct FlakyGateway {
    plans: Mutex<HashMap<TradeSide, Plan>>,
    submissions: Mutex<Vec<OrderRequest>>,
    accepted: Mutex<HashMap<String, OrderFill>>,
}

impl FlakyGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` orders on `side` with a transient error.
    pub fn failing(self, side: TradeSide, n: u32) -> Self {
        self.plan(side, |p| p.transient_failures = n)
    }

    /// Accept the next `n` orders on `side` but report a timeout, as when
    /// the response is lost after the exchange took the order.
    pub fn losing_acks(self, side: TradeSide, n: u32) -> Self {
        self.plan(side, |p| p.lost_acks = n)
    }

    pub fn always_failing(self, side: TradeSide) -> Self {
        self.plan(side, |p| p.always_fail = true)
    }

    pub fn rejecting(self, side: TradeSide) -> Self {
        self.plan(side, |p| p.reject = true)
    }

    fn plan(self, side: TradeSide, f: impl FnOnce(&mut Plan)) -> Self {
        f(self.plans.lock().unwrap().entry(side).or_default());
        self
    }

    pub fn submissions(&self, side: TradeSide) -> Vec<OrderRequest> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.side == side)
            .cloned()
            .collect()
    }

    /// Fills the exchange actually executed, one per client order id.
    pub fn fills(&self) -> Vec<OrderFill> {
        self.accepted.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl OrderGateway for FlakyGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        self.submissions.lock().unwrap().push(order.clone());

        let lose_ack = {
            let mut plans = self.plans.lock().unwrap();
            let plan = plans.entry(order.side).or_default();
            if plan.reject {
                return Err(GatewayError::Rejected("insufficient balance".to_string()));
            }
            if plan.always_fail {
                return Err(GatewayError::Transient("gateway timeout".to_string()));
            }
            if plan.transient_failures > 0 {
                plan.transient_failures -= 1;
                return Err(GatewayError::Transient("gateway timeout".to_string()));
            }
            if plan.lost_acks > 0 {
                plan.lost_acks -= 1;
                true
            } else {
                false
            }
        };

        let mut accepted = self.accepted.lock().unwrap();
        let fill = accepted
            .entry(order.client_order_id.clone())
            .or_insert_with(|| OrderFill {
                filled: true,
                filled_qty: order.quantity,
                filled_price: order.price,
                exchange_order_id: Some(format!("ex-{}", order.client_order_id)),
            });
        if lose_ack {
            return Err(GatewayError::Transient("response lost".to_string()));
        }
        Ok(fill.clone())
    }
}

/// Recorder that keeps events in memory. It can fail its first writes or
/// never answer at all.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<TransactionEvent>>,
    failures: AtomicUsize,
    hung: bool,
    attempts: AtomicUsize,
}

impl MemoryRecorder {
    pub fn failing(n: usize) -> Self {
        Self {
            failures: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn hung() -> Self {
        Self {
            hung: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, action: TransactionAction) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl TransactionRecorder for MemoryRecorder {
    async fn record(&self, event: &TransactionEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hung {
            std::future::pending::<()>().await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("database is locked"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Concrete handles to the doubles behind a [`Collaborators`] set.
pub struct Doubles {
    pub provider: Arc<ScriptedProvider>,
    pub gateway: Arc<FlakyGateway>,
    pub recorder: Arc<MemoryRecorder>,
}

impl Doubles {
    pub fn new(provider: ScriptedProvider, gateway: FlakyGateway) -> Self {
        Self {
            provider: Arc::new(provider),
            gateway: Arc::new(gateway),
            recorder: Arc::new(MemoryRecorder::default()),
        }
    }

    pub fn with_recorder(mut self, recorder: MemoryRecorder) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Collaborators with a predictor forecasting `predicted`.
    pub fn collaborators(&self, predicted: Prediction) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            predictor: Arc::new(FixedPredictor(predicted)),
            gateway: self.gateway.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

/// Fast-cadence configuration: sl 0.007 / tp 0.001, 1s polling, three
/// exit attempts.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        risk: RiskConfig::Fixed {
            stop_loss_pct: dec!(0.007),
            take_profit_pct: dec!(0.001),
            trailing_stop_pct: None,
        },
        monitor: MonitorConfig {
            poll_interval_ms: 1_000,
            max_feed_failures: 3,
        },
        exit: ExitConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        },
        recorder: RecorderConfig {
            max_attempts: 2,
            timeout_ms: 500,
            backoff_ms: 10,
        },
        ..EngineConfig::default()
    }
}

/// Levels produced by [`test_config`] for an entry at 400000.
pub fn test_levels() -> RiskLevels {
    RiskLevels {
        stop_loss: dec!(397200),
        take_profit: dec!(400400),
        trailing_stop_pct: None,
    }
}
