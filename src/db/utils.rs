use std::str::FromStr;

use rust_decimal::Decimal;
use uuid::Uuid;

// SQLite has no native decimal or uuid column types, so money and ids are
// stored as TEXT and bridged here.

pub fn decimal_to_db(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn decimal_from_db(column: &str, raw: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(raw).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

pub fn uuid_from_db(column: &str, raw: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(raw).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

/// Round a money amount to 2 decimal places (fares, fees, fines).
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp(2)
}
