pub mod calendar;
pub mod memory;
pub mod sqlite;

use chrono::NaiveDate;

use crate::error::{EngineError, Result};
use crate::model::{Indicator, Param, Strategy};

/// Columns the cache schema fixes per table. Dotted `data_id`s are checked
/// against this contract before any fetch; user code cannot widen it.
pub const DAILY_COLUMNS: &[&str] = &[
    "open", "high", "low", "close", "pre_close", "vol", "amount", "pct_chg", "change",
];
pub const DAILY_BASIC_COLUMNS: &[&str] = &[
    "pe",
    "pb",
    "ps",
    "total_mv",
    "circ_mv",
    "turnover_rate",
    "volume_ratio",
    "dv_ratio",
];
pub const INDEX_DAILY_COLUMNS: &[&str] = &["open", "high", "low", "close", "pre_close", "vol"];

/// Split a `"<table>.<column>"` data id, validating against the cache schema.
pub fn split_data_id(data_id: &str) -> Result<(&str, &str)> {
    let Some((table, column)) = data_id.split_once('.') else {
        return Err(EngineError::DataSourceUnavailable(format!(
            "malformed data id `{data_id}` (expected `<table>.<column>`)"
        )));
    };
    let known = match table {
        "daily" => DAILY_COLUMNS,
        "daily_basic" => DAILY_BASIC_COLUMNS,
        "index_daily" => INDEX_DAILY_COLUMNS,
        _ => {
            return Err(EngineError::DataSourceUnavailable(format!(
                "unknown cache table `{table}`"
            )))
        }
    };
    if !known.contains(&column) {
        return Err(EngineError::DataSourceUnavailable(format!(
            "unknown column `{column}` in cache table `{table}`"
        )));
    }
    Ok((table, column))
}

/// Read-only access to the pre-populated market-data cache. Shared across
/// jobs; every method is a point read or a bounded range scan. I/O faults
/// map to `DataSourceUnavailable` and fail the backtest immediately.
pub trait MarketData: Send + Sync {
    /// Scalar cell for one `(symbol, day)` row. `Ok(None)` when the row is
    /// absent (suspension, not yet listed) or the column is null.
    fn cell(&self, symbol: &str, day: NaiveDate, table: &str, column: &str)
        -> Result<Option<f64>>;

    /// One value per day of `days`, in order. Default implementation loops
    /// `cell`; backends override with a range query.
    fn column(
        &self,
        symbol: &str,
        days: &[NaiveDate],
        table: &str,
        column: &str,
    ) -> Result<Vec<Option<f64>>> {
        days.iter()
            .map(|d| self.cell(symbol, *d, table, column))
            .collect()
    }

    /// Open trading days in `[start, end]`, ascending.
    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>>;

    /// The `count` open trading days strictly before `before`, ascending.
    fn prev_trading_days(&self, before: NaiveDate, count: usize) -> Result<Vec<NaiveDate>>;

    /// The `count` open trading days strictly after `after`, ascending.
    fn next_trading_days(&self, after: NaiveDate, count: usize) -> Result<Vec<NaiveDate>>;

    /// Symbols listed and not suspended on `day`: listing window covers the
    /// day and a `daily` row exists for it.
    fn listed_symbols(&self, day: NaiveDate) -> Result<Vec<String>>;

    /// Index membership as of `day` (most recent snapshot `<= day`;
    /// membership snapshots are monthly).
    fn index_members(&self, index_code: &str, day: NaiveDate) -> Result<Vec<String>>;

    /// Benchmark close for an index on `day`.
    fn index_close(&self, index_code: &str, day: NaiveDate) -> Result<Option<f64>>;
}

/// Read-only access to the user-editable entity tables. The coordinator
/// reads through this once at job start; the resolver then works from the
/// captured snapshot only.
pub trait EntityStore: Send + Sync {
    fn param(&self, fqname: &str) -> Result<Option<Param>>;
    fn indicator(&self, fqname: &str) -> Result<Option<Indicator>>;
    fn strategy(&self, creator: &str, name: &str) -> Result<Option<Strategy>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_known_columns() {
        assert_eq!(split_data_id("daily.close").unwrap(), ("daily", "close"));
        assert_eq!(
            split_data_id("daily_basic.total_mv").unwrap(),
            ("daily_basic", "total_mv")
        );
    }

    #[test]
    fn split_rejects_unknown() {
        assert!(split_data_id("daily.volume").is_err());
        assert!(split_data_id("minute.close").is_err());
        assert!(split_data_id("close").is_err());
    }
}
