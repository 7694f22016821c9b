use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::utils::{decimal_from_db, decimal_to_db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Direction::Credit),
            "debit" => Some(Direction::Debit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub direction: Direction,
    pub transaction_type: String,
    pub description: Option<String>,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub status: String,
    pub ride_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Stored balance next to the one recomputed from the transaction log.
/// A drift beyond one cent is reported for diagnostics, never auto-repaired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReport {
    pub balance: Decimal,
    pub verified_balance: Decimal,
    pub discrepancy: Decimal,
    pub discrepancy_flagged: bool,
}

/// Parameters for one ledger entry. The net amount is what actually moves the
/// balance; `fee_amount` records a platform cut taken out of `amount`.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: String,
    pub description: Option<String>,
    pub fee_amount: Decimal,
    pub ride_id: Option<Uuid>,
}

impl LedgerEntry {
    pub fn new(user_id: Uuid, amount: Decimal, transaction_type: &str) -> Self {
        Self {
            user_id,
            amount,
            transaction_type: transaction_type.to_string(),
            description: None,
            fee_amount: Decimal::ZERO,
            ride_id: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn fee(mut self, fee: Decimal) -> Self {
        self.fee_amount = fee;
        self
    }

    pub fn ride(mut self, ride_id: Uuid) -> Self {
        self.ride_id = Some(ride_id);
        self
    }
}

fn transaction_from_row(row: &SqliteRow) -> Result<WalletTransaction, sqlx::Error> {
    let direction_raw: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "direction".to_string(),
        source: format!("unknown direction: {direction_raw}").into(),
    })?;
    let ride_id: Option<String> = row.try_get("ride_id")?;
    Ok(WalletTransaction {
        id: super::utils::uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        user_id: super::utils::uuid_from_db("user_id", &row.try_get::<String, _>("user_id")?)?,
        amount: decimal_from_db("amount", &row.try_get::<String, _>("amount")?)?,
        direction,
        transaction_type: row.try_get("transaction_type")?,
        description: row.try_get("description")?,
        fee_amount: decimal_from_db("fee_amount", &row.try_get::<String, _>("fee_amount")?)?,
        net_amount: decimal_from_db("net_amount", &row.try_get::<String, _>("net_amount")?)?,
        status: row.try_get("status")?,
        ride_id: ride_id
            .map(|raw| super::utils::uuid_from_db("ride_id", &raw))
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

// Wallet ledger. Mutations take the caller's transaction connection so a ride
// is never moved to a terminal partition without its paired ledger entry.
#[derive(Clone)]
pub struct WalletStore {
    pool: SqlitePool,
}

impl WalletStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends a completed credit transaction and raises the stored balance
    /// by the net amount. Returns the new transaction id.
    pub async fn credit(
        &self,
        conn: &mut SqliteConnection,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<Uuid, sqlx::Error> {
        self.apply(conn, entry, Direction::Credit, now).await
    }

    /// Appends a completed debit transaction and lowers the stored balance by
    /// the net amount. Balances are allowed to go negative: penalties apply
    /// even without sufficient funds.
    pub async fn debit(
        &self,
        conn: &mut SqliteConnection,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<Uuid, sqlx::Error> {
        self.apply(conn, entry, Direction::Debit, now).await
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        entry: LedgerEntry,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Result<Uuid, sqlx::Error> {
        let net_amount = entry.amount - entry.fee_amount;
        let signed = match direction {
            Direction::Credit => net_amount,
            Direction::Debit => -net_amount,
        };

        sqlx::query(
            r#"
            INSERT INTO wallet_accounts (user_id, balance, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(entry.user_id.to_string())
        .bind(decimal_to_db(Decimal::ZERO))
        .bind(now)
        .execute(&mut *conn)
        .await?;

        // stored balance is TEXT, so the adjustment happens in Rust under the
        // same transaction rather than in SQL arithmetic
        let row = sqlx::query("SELECT balance FROM wallet_accounts WHERE user_id = ?")
            .bind(entry.user_id.to_string())
            .fetch_one(&mut *conn)
            .await?;
        let balance = decimal_from_db("balance", &row.try_get::<String, _>("balance")?)?;
        let new_balance = balance + signed;

        sqlx::query("UPDATE wallet_accounts SET balance = ?, updated_at = ? WHERE user_id = ?")
            .bind(decimal_to_db(new_balance))
            .bind(now)
            .bind(entry.user_id.to_string())
            .execute(&mut *conn)
            .await?;

        let transaction_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (id, user_id, amount, direction, transaction_type, description,
                 fee_amount, net_amount, status, ride_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?, ?)
            "#,
        )
        .bind(transaction_id.to_string())
        .bind(entry.user_id.to_string())
        .bind(decimal_to_db(entry.amount))
        .bind(direction.as_str())
        .bind(&entry.transaction_type)
        .bind(&entry.description)
        .bind(decimal_to_db(entry.fee_amount))
        .bind(decimal_to_db(net_amount))
        .bind(entry.ride_id.map(|id| id.to_string()))
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(transaction_id)
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<Decimal, sqlx::Error> {
        let row = sqlx::query("SELECT balance FROM wallet_accounts WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decimal_from_db("balance", &row.try_get::<String, _>("balance")?),
            None => Ok(Decimal::ZERO),
        }
    }

    /// Recomputes the balance from completed transactions and reports any
    /// drift from the stored scalar. Display only, nothing is corrected.
    pub async fn balance_report(&self, user_id: Uuid) -> Result<BalanceReport, sqlx::Error> {
        let stored = self.balance(user_id).await?;

        let rows = sqlx::query(
            "SELECT direction, net_amount FROM wallet_transactions WHERE user_id = ? AND status = 'completed'",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut verified = Decimal::ZERO;
        for row in &rows {
            let net = decimal_from_db("net_amount", &row.try_get::<String, _>("net_amount")?)?;
            match row.try_get::<String, _>("direction")?.as_str() {
                "credit" => verified += net,
                _ => verified -= net,
            }
        }

        let discrepancy = stored - verified;
        let tolerance = Decimal::new(1, 2); // one cent
        Ok(BalanceReport {
            balance: stored,
            verified_balance: verified,
            discrepancy,
            discrepancy_flagged: discrepancy.abs() > tolerance,
        })
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM wallet_transactions WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }
}
