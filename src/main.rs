//! Position Pilot
//!
//! Opens one forecast-gated position on a pair and supervises it to its
//! exit, live through an order gateway or simulated against a paper gateway.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use position_pilot::api::{
    GatewayClient, MarketClient, OrderGateway, PaperGateway, PricePredictor, SnapshotProvider,
};
use position_pilot::db::Database;
use position_pilot::metrics::TradeStats;
use position_pilot::models::{Position, PositionStatus};
use position_pilot::trading::{Collaborators, Engine, EngineConfig, GateMode, RiskConfig};
use position_pilot::EngineError;

/// Risk-managed position engine CLI.
#[derive(Parser)]
#[command(name = "position-pilot")]
#[command(about = "Forecast-gated entries with stop-loss / take-profit supervision", long_about = None)]
struct Cli {
    /// Database URL for the transaction log
    #[arg(
        short,
        long,
        env = "PILOT_DATABASE_URL",
        default_value = "sqlite:./position_pilot.db?mode=rwc"
    )]
    database: String,

    /// Log level (trace, debug, info, warn, error). RUST_LOG wins when set.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Per-position overrides on top of the environment configuration.
#[derive(Args, Debug, Clone)]
struct PositionArgs {
    /// Asset pair, e.g. btcidr
    #[arg(short, long)]
    pair: Option<String>,

    /// Quote-currency capital for the position
    #[arg(short, long)]
    capital: Option<Decimal>,

    /// Stop loss as a fraction of entry (0.005 = 0.5%)
    #[arg(long)]
    stop_loss: Option<Decimal>,

    /// Take profit as a fraction of entry
    #[arg(long)]
    take_profit: Option<Decimal>,

    /// Trailing stop as a fraction of the highest price seen
    #[arg(long)]
    trailing_stop: Option<Decimal>,

    /// Entry rule set (prediction_rsi, prediction_only)
    #[arg(long)]
    gate: Option<GateMode>,

    /// Price polling interval in milliseconds
    #[arg(short, long)]
    interval_ms: Option<u64>,
}

impl PositionArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(pair) = &self.pair {
            config.pair = pair.clone();
        }
        if let Some(capital) = self.capital {
            config.capital = capital;
        }
        if let Some(mode) = self.gate {
            config.gate.mode = mode;
        }
        if let Some(ms) = self.interval_ms {
            config.monitor.poll_interval_ms = ms;
        }

        match &mut config.risk {
            RiskConfig::Fixed {
                stop_loss_pct,
                take_profit_pct,
                trailing_stop_pct,
            } => {
                if let Some(sl) = self.stop_loss {
                    *stop_loss_pct = sl;
                }
                if let Some(tp) = self.take_profit {
                    *take_profit_pct = tp;
                }
                if self.trailing_stop.is_some() {
                    *trailing_stop_pct = self.trailing_stop;
                }
            }
            RiskConfig::Volatility {
                trailing_stop_pct, ..
            } => {
                if self.stop_loss.is_some() || self.take_profit.is_some() {
                    warn!("--stop-loss/--take-profit ignored in volatility risk mode");
                }
                if self.trailing_stop.is_some() {
                    *trailing_stop_pct = self.trailing_stop;
                }
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open a position and supervise it through the live order gateway
    Run {
        #[command(flatten)]
        position: PositionArgs,
    },

    /// Same flow against a simulated gateway (no real orders)
    Simulate {
        #[command(flatten)]
        position: PositionArgs,

        /// Simulated slippage as a fraction of price
        #[arg(long, default_value = "0")]
        slippage: Decimal,
    },

    /// Show recorded transactions and realised-trade statistics
    History {
        /// Only this pair
        #[arg(short, long)]
        pair: Option<String>,

        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Run { position } => {
            position.apply(&mut config);
            let gateway = GatewayClient::from_env()?;
            let db = Database::new(&cli.database).await?;

            println!("\n=== Position Pilot (LIVE) ===");
            run_position(config, Arc::new(gateway), Arc::new(db)).await?;
        }

        Commands::Simulate { position, slippage } => {
            position.apply(&mut config);
            let db = Database::new(&cli.database).await?;

            println!("\n=== Position Pilot (SIMULATION) ===");
            println!("Slippage: {}%", slippage * dec!(100));
            let paper = Arc::new(PaperGateway::new(slippage));
            run_position(config, paper.clone(), Arc::new(db)).await?;
            println!("Simulated fills: {}", paper.order_count().await);
        }

        Commands::History { pair, limit } => {
            let db = Database::new(&cli.database).await?;
            let events = db.transactions(pair.as_deref(), limit).await?;

            if events.is_empty() {
                println!("No transactions recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<8} {:<12} {:>14} {:>12} {:<14} {:>12}",
                "TIME", "PAIR", "ACTION", "PRICE", "QUANTITY", "REASON", "P&L"
            );
            println!("{}", "-".repeat(98));
            for e in &events {
                println!(
                    "{:<20} {:<8} {:<12} {:>14} {:>12} {:<14} {:>12}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&e.pair, 8),
                    e.action.as_str(),
                    e.price.round_dp(2),
                    e.quantity.round_dp(8),
                    e.exit_reason.map(|r| r.as_str()).unwrap_or("-"),
                    e.profit_loss
                        .map(|p| p.round_dp(2).to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }

            // stats run oldest first
            let mut chronological = events.clone();
            chronological.reverse();
            let stats = TradeStats::from_events(&chronological);

            println!("\n--- Realised Trades ---");
            println!("Total Trades:   {}", stats.total_trades);
            println!("Win Rate:       {:.1}%", stats.win_rate * 100.0);
            println!("Total P&L:      {}", stats.total_pnl.round_dp(2));
            println!("Avg Win:        {}", stats.avg_win.round_dp(2));
            println!("Avg Loss:       {}", stats.avg_loss.round_dp(2));
            match stats.profit_factor {
                Some(pf) => println!("Profit Factor:  {:.2}", pf),
                None => println!("Profit Factor:  -"),
            }
            println!("Max Drawdown:   {}", stats.max_drawdown.round_dp(2));
            println!("Mean Return:    {:.3}%", stats.mean_return * 100.0);
            println!("Return StdDev:  {:.3}%", stats.return_std_dev * 100.0);

            let unresolved = db.unresolved_exit_failures().await?;
            if !unresolved.is_empty() {
                println!("\n--- NEEDS INTERVENTION ({}) ---", unresolved.len());
                for e in &unresolved {
                    println!(
                        "  {} {} qty {} @ {} ({})",
                        e.position_id, e.pair, e.quantity, e.price, e.client_order_id
                    );
                }
            }
        }

        Commands::Config => {
            println!("\n=== Engine Configuration ===\n");
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?
            );
        }
    }

    Ok(())
}

/// Open one position on the configured pair and wait for it to finish.
/// Ctrl+C cancels the position (no exit order is placed), including while
/// the entry is still being decided.
async fn run_position(
    config: EngineConfig,
    gateway: Arc<dyn OrderGateway>,
    db: Arc<Database>,
) -> Result<()> {
    let market = Arc::new(MarketClient::from_env()?);
    let provider: Arc<dyn SnapshotProvider> = market.clone();
    let predictor: Arc<dyn PricePredictor> = market;

    let engine = Engine::new(
        Collaborators {
            provider,
            predictor,
            gateway,
            recorder: db,
        },
        &config,
    )?;

    println!("Pair:             {}", config.pair);
    println!("Capital:          {}", config.capital);
    println!("Polling interval: {}ms", config.monitor.poll_interval_ms);
    println!("\nPress Ctrl+C to cancel.\n");

    let open = engine.open_position(&config.pair, config.capital, config.risk);
    tokio::pin!(open);
    let opened = tokio::select! {
        result = &mut open => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received during entry");
            for pos in engine.active_positions().await {
                if let Err(e) = engine.cancel_position(pos.id).await {
                    warn!(position_id = %pos.id, error = %e, "Cancel failed");
                }
            }
            open.await
        }
    };

    let id = match opened {
        Ok(id) => id,
        Err(EngineError::Rejected { reason, .. }) => {
            println!("Entry rejected: {}", reason);
            return Ok(());
        }
        Err(EngineError::Cancelled(id)) => {
            println!("Entry cancelled, no order placed ({})", id);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let position = tokio::select! {
        pos = engine.wait_for_completion(id) => pos?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            engine.cancel_position(id).await?;
            engine.wait_for_completion(id).await?
        }
    };

    engine.shutdown().await;
    print_summary(&position);
    Ok(())
}

fn print_summary(pos: &Position) {
    println!("\n=== Position {} ===", pos.id);
    println!("Status:      {}", pos.status);
    println!("Entry:       {} x {}", pos.entry_price, pos.quantity);
    if let Some(levels) = pos.levels {
        println!("Stop/Target: {} / {}", levels.stop_loss.round_dp(2), levels.take_profit.round_dp(2));
    }
    println!("Highest:     {}", pos.highest_price_seen);
    if let Some(reason) = pos.exit_reason {
        println!("Exit reason: {}", reason);
    }
    if let (Some(price), Some(pnl)) = (pos.exit_price, pos.realized_pnl) {
        let pct = pos.realized_pnl_pct.unwrap_or(Decimal::ZERO) * dec!(100);
        println!("Exit:        {} (P&L {} / {}%)", price, pnl.round_dp(2), pct.round_dp(3));
    }
    if let Some(reason) = pos.abort_reason {
        println!("Aborted:     {}", reason);
    }
    if pos.status == PositionStatus::Aborted && pos.needs_intervention {
        println!("\n!!! EXIT FAILED: {} {} still held, close it manually !!!", pos.quantity, pos.pair);
        if let Some(last) = pos.price_history.last() {
            println!(
                "Unrealized P&L at {}: {}",
                last.price,
                pos.unrealized_pnl(last.price).round_dp(2)
            );
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
