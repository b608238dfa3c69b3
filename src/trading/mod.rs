//! Trading core: risk levels, entry gate, price monitor, lifecycle controller
//! and the engine facade tying them together.

mod config;
mod engine;
mod gate;
mod lifecycle;
mod monitor;
mod risk;

#[cfg(test)]
mod test_support;

pub use config::{
    EngineConfig, ExitConfig, GateConfig, GateMode, MonitorConfig, RecorderConfig, RiskConfig,
};
pub use engine::Engine;
pub use gate::{EntryDecision, EntryRule, GateReason, PredictionOnlyGate, PredictionRsiGate};
pub use lifecycle::{submit_with_retry, Collaborators, LifecycleController, TrackedPosition};
pub use monitor::{check_exit, ExitSignal, MonitorOutcome, PositionMonitor};
pub use risk::{position_quantity, FixedRisk, RiskModel, VolatilityRisk};
