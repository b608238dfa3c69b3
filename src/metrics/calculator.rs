//! Realised-trade statistics: win rate, profit factor, drawdown, return spread.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::{TransactionAction, TransactionEvent};

/// Summary of closed trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Exits that never filled and still need an operator
    pub failed_exits: u32,

    /// Fraction of trades with positive P&L (0-1)
    pub win_rate: f64,

    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,

    /// Gross profit / gross loss; `None` without losses
    pub profit_factor: Option<f64>,

    /// Largest peak-to-trough fall of cumulative P&L, quote currency
    pub max_drawdown: Decimal,

    /// Mean and sample standard deviation of per-trade returns
    pub mean_return: f64,
    pub return_std_dev: f64,
}

impl TradeStats {
    /// Compute statistics from a transaction log in chronological order.
    /// Only SELL rows carry realised P&L; EXIT_FAILED rows are counted.
    pub fn from_events(events: &[TransactionEvent]) -> Self {
        let mut stats = Self::default();

        let sells: Vec<&TransactionEvent> = events
            .iter()
            .filter(|e| e.action == TransactionAction::Sell)
            .collect();
        stats.failed_exits = events
            .iter()
            .filter(|e| e.action == TransactionAction::ExitFailed)
            .count() as u32;

        let pnls: Vec<Decimal> = sells.iter().filter_map(|e| e.profit_loss).collect();
        let returns: Vec<f64> = sells
            .iter()
            .filter_map(|e| e.profit_loss_pct)
            .filter_map(|r| r.to_f64())
            .collect();

        stats.total_trades = pnls.len() as u32;
        if pnls.is_empty() {
            return stats;
        }

        Self::pnl_metrics(&mut stats, &pnls);
        stats.max_drawdown = Self::max_drawdown(&pnls);

        if !returns.is_empty() {
            stats.mean_return = returns.iter().mean();
        }
        if returns.len() >= 2 {
            stats.return_std_dev = returns.iter().std_dev();
        }

        stats
    }

    fn pnl_metrics(stats: &mut Self, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        stats.winning_trades = wins.len() as u32;
        stats.losing_trades = losses.iter().filter(|l| **l < Decimal::ZERO).count() as u32;
        stats.total_pnl = pnls.iter().copied().sum();
        stats.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            stats.avg_win = gross_profit / Decimal::from(wins.len() as u32);
        }
        if stats.losing_trades > 0 {
            stats.avg_loss = gross_loss / Decimal::from(stats.losing_trades);
        }
        if gross_loss > Decimal::ZERO {
            stats.profit_factor =
                Some(gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0));
        }
    }

    fn max_drawdown(pnls: &[Decimal]) -> Decimal {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max(peak - equity);
        }
        max_dd
    }
}
