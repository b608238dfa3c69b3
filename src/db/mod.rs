//! SQLite persistence for the transaction log.
//!
//! Every BUY, SELL and EXIT_FAILED event is appended here. Rows are keyed by
//! `(client_order_id, action)`, so re-recording the same event after an
//! ambiguous write is a no-op rather than a duplicate trade.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::api::TransactionRecorder;
use crate::models::{ExitReason, PositionId, TransactionAction, TransactionEvent};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored transaction row. Decimals are kept as text to stay exact.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTransaction {
    pub id: i64,
    pub timestamp: String,
    pub position_id: String,
    pub pair: String,
    pub action: String,
    pub price: String,
    pub quantity: String,
    pub client_order_id: String,
    pub exit_reason: Option<String>,
    pub profit_loss: Option<String>,
    pub profit_loss_pct: Option<String>,
}

impl StoredTransaction {
    fn into_event(self) -> Result<TransactionEvent> {
        let parse_opt = |v: Option<String>| -> Result<Option<Decimal>> {
            v.map(|s| Decimal::from_str(&s).context("Invalid decimal in transaction row"))
                .transpose()
        };

        Ok(TransactionEvent {
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .context("Invalid transaction timestamp")?
                .with_timezone(&Utc),
            position_id: PositionId::from_str(&self.position_id)
                .context("Invalid position id")?,
            pair: self.pair,
            action: TransactionAction::parse(&self.action)
                .with_context(|| format!("Unknown transaction action {}", self.action))?,
            price: Decimal::from_str(&self.price).context("Invalid price")?,
            quantity: Decimal::from_str(&self.quantity).context("Invalid quantity")?,
            client_order_id: self.client_order_id,
            exit_reason: self.exit_reason.as_deref().and_then(ExitReason::parse),
            profit_loss: parse_opt(self.profit_loss)?,
            profit_loss_pct: parse_opt(self.profit_loss_pct)?,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                position_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                action TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                exit_reason TEXT,
                profit_loss TEXT,
                profit_loss_pct TEXT,
                UNIQUE(client_order_id, action)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_pair ON transactions(pair)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_position ON transactions(position_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Transactions ====================

    /// Append a transaction. Returns false if it was already recorded.
    pub async fn insert_transaction(&self, event: &TransactionEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO transactions (
                timestamp, position_id, pair, action, price, quantity,
                client_order_id, exit_reason, profit_loss, profit_loss_pct
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(event.position_id.to_string())
        .bind(&event.pair)
        .bind(event.action.as_str())
        .bind(event.price.to_string())
        .bind(event.quantity.to_string())
        .bind(&event.client_order_id)
        .bind(event.exit_reason.map(|r| r.as_str()))
        .bind(event.profit_loss.map(|d| d.to_string()))
        .bind(event.profit_loss_pct.map(|d| d.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to insert transaction")?;

        Ok(result.rows_affected() > 0)
    }

    /// Most recent transactions first, optionally for one pair.
    pub async fn transactions(&self, pair: Option<&str>, limit: i64) -> Result<Vec<TransactionEvent>> {
        let rows = match pair {
            Some(pair) => {
                sqlx::query_as::<_, StoredTransaction>(
                    "SELECT * FROM transactions WHERE pair = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(pair)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredTransaction>(
                    "SELECT * FROM transactions ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to fetch transactions")?;

        rows.into_iter().map(StoredTransaction::into_event).collect()
    }

    /// Transactions for a single position, oldest first.
    pub async fn position_transactions(&self, id: PositionId) -> Result<Vec<TransactionEvent>> {
        let rows = sqlx::query_as::<_, StoredTransaction>(
            "SELECT * FROM transactions WHERE position_id = ? ORDER BY id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch position transactions")?;

        rows.into_iter().map(StoredTransaction::into_event).collect()
    }

    /// Positions whose exit failed and have no later SELL.
    pub async fn unresolved_exit_failures(&self) -> Result<Vec<TransactionEvent>> {
        let rows = sqlx::query_as::<_, StoredTransaction>(
            r#"
            SELECT * FROM transactions f
            WHERE f.action = 'EXIT_FAILED'
              AND NOT EXISTS (
                  SELECT 1 FROM transactions s
                  WHERE s.position_id = f.position_id AND s.action = 'SELL'
              )
            ORDER BY f.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch exit failures")?;

        rows.into_iter().map(StoredTransaction::into_event).collect()
    }
}

#[async_trait]
impl TransactionRecorder for Database {
    async fn record(&self, event: &TransactionEvent) -> Result<()> {
        self.insert_transaction(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, RiskLevels};
    use rust_decimal_macros::dec;

    fn closed_position() -> Position {
        let mut pos = Position::pending("btcidr", dec!(20000));
        pos.open(
            dec!(400000),
            dec!(0.05),
            RiskLevels {
                stop_loss: dec!(397200),
                take_profit: dec!(400400),
                trailing_stop_pct: None,
            },
        )
        .unwrap();
        pos.begin_closing(ExitReason::TakeProfit).unwrap();
        pos.close(dec!(400500), dec!(0.05)).unwrap();
        pos
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let db = Database::in_memory().await.unwrap();
        let pos = closed_position();

        db.record(&TransactionEvent::buy(&pos, dec!(400000), dec!(0.05)))
            .await
            .unwrap();
        db.record(&TransactionEvent::sell(&pos)).await.unwrap();

        let events = db.position_transactions(pos.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, TransactionAction::Buy);
        assert_eq!(events[1].action, TransactionAction::Sell);
        assert_eq!(events[1].profit_loss, Some(dec!(25)));
        assert_eq!(events[1].exit_reason, Some(ExitReason::TakeProfit));

        let recent = db.transactions(Some("btcidr"), 10).await.unwrap();
        assert_eq!(recent[0].action, TransactionAction::Sell);
        assert!(db.transactions(Some("ethidr"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerecording_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let sell = TransactionEvent::sell(&closed_position());

        assert!(db.insert_transaction(&sell).await.unwrap());
        assert!(!db.insert_transaction(&sell).await.unwrap());
        assert_eq!(db.transactions(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_exit_failures() {
        let db = Database::in_memory().await.unwrap();

        let mut stuck = Position::pending("btcidr", dec!(20000));
        stuck
            .open(
                dec!(400000),
                dec!(0.05),
                RiskLevels {
                    stop_loss: dec!(397200),
                    take_profit: dec!(400400),
                    trailing_stop_pct: None,
                },
            )
            .unwrap();
        stuck.begin_closing(ExitReason::StopLoss).unwrap();
        db.record(&TransactionEvent::exit_failed(&stuck, dec!(397000)))
            .await
            .unwrap();
        db.record(&TransactionEvent::sell(&closed_position()))
            .await
            .unwrap();

        let failures = db.unresolved_exit_failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].position_id, stuck.id);
    }
}
