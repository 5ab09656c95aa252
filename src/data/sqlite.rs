use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{EntityStore, MarketData, DAILY_BASIC_COLUMNS, DAILY_COLUMNS, INDEX_DAILY_COLUMNS};
use crate::error::{EngineError, Result};
use crate::model::{AggFunc, Indicator, Param, ParamKind, Scope, Strategy};

/// Cache dates are 8-char `YYYYMMDD` strings.
pub fn fmt_day(day: NaiveDate) -> String {
    day.format("%Y%m%d").to_string()
}

pub fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .map_err(|e| EngineError::DataSourceUnavailable(format!("bad cache date `{s}`: {e}")))
}

/// SQLite-backed market-data cache and entity reader. The cache is
/// populated upstream; this side only ever reads.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open read-only. The file must already exist and carry the cache
    /// schema (`trade_cal`, `stock_basic`, `daily`, `daily_basic`,
    /// `index_basic`, `index_daily`, `index_weight` plus the entity tables).
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(io_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open read-write (used by embedders and tests that seed the cache).
    pub fn open_rw(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(io_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn check_column(table: &str, column: &str) -> Result<()> {
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
        if known.contains(&column) {
            Ok(())
        } else {
            Err(EngineError::DataSourceUnavailable(format!(
                "unknown column `{column}` in cache table `{table}`"
            )))
        }
    }
}

fn io_err(e: rusqlite::Error) -> EngineError {
    EngineError::DataSourceUnavailable(e.to_string())
}

impl MarketData for SqliteStore {
    fn cell(
        &self,
        symbol: &str,
        day: NaiveDate,
        table: &str,
        column: &str,
    ) -> Result<Option<f64>> {
        Self::check_column(table, column)?;
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        // Column and table names come from the fixed schema contract above.
        let sql = format!("SELECT {column} FROM {table} WHERE ts_code = ?1 AND trade_date = ?2");
        let value: Option<Option<f64>> = conn
            .query_row(&sql, (symbol, fmt_day(day)), |row| row.get(0))
            .optional()
            .map_err(io_err)?;
        Ok(value.flatten())
    }

    fn column(
        &self,
        symbol: &str,
        days: &[NaiveDate],
        table: &str,
        column: &str,
    ) -> Result<Vec<Option<f64>>> {
        Self::check_column(table, column)?;
        let (Some(first), Some(last)) = (days.first(), days.last()) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let sql = format!(
            "SELECT trade_date, {column} FROM {table} \
             WHERE ts_code = ?1 AND trade_date BETWEEN ?2 AND ?3"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(io_err)?;
        let mut by_day = rustc_hash::FxHashMap::default();
        let rows = stmt
            .query_map((symbol, fmt_day(*first), fmt_day(*last)), |row| {
                let day: String = row.get(0)?;
                let value: Option<f64> = row.get(1)?;
                Ok((day, value))
            })
            .map_err(io_err)?;
        for row in rows {
            let (day, value) = row.map_err(io_err)?;
            by_day.insert(parse_day(&day)?, value);
        }
        Ok(days
            .iter()
            .map(|d| by_day.get(d).copied().flatten())
            .collect())
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT cal_date FROM trade_cal \
                 WHERE is_open = 1 AND cal_date BETWEEN ?1 AND ?2 ORDER BY cal_date",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((fmt_day(start), fmt_day(end)), |row| {
                row.get::<_, String>(0)
            })
            .map_err(io_err)?;
        rows.map(|r| parse_day(&r.map_err(io_err)?)).collect()
    }

    fn prev_trading_days(&self, before: NaiveDate, count: usize) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT cal_date FROM trade_cal \
                 WHERE is_open = 1 AND cal_date < ?1 ORDER BY cal_date DESC LIMIT ?2",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((fmt_day(before), count), |row| row.get::<_, String>(0))
            .map_err(io_err)?;
        let mut days: Vec<NaiveDate> = rows
            .map(|r| parse_day(&r.map_err(io_err)?))
            .collect::<Result<_>>()?;
        days.reverse();
        Ok(days)
    }

    fn next_trading_days(&self, after: NaiveDate, count: usize) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT cal_date FROM trade_cal \
                 WHERE is_open = 1 AND cal_date > ?1 ORDER BY cal_date LIMIT ?2",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((fmt_day(after), count), |row| row.get::<_, String>(0))
            .map_err(io_err)?;
        rows.map(|r| parse_day(&r.map_err(io_err)?)).collect()
    }

    fn listed_symbols(&self, day: NaiveDate) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        // Listed on the day, not delisted, and trading (a daily row exists).
        let mut stmt = conn
            .prepare_cached(
                "SELECT b.ts_code FROM stock_basic b \
                 JOIN daily d ON d.ts_code = b.ts_code AND d.trade_date = ?1 \
                 WHERE b.list_date <= ?1 \
                   AND (b.delist_date IS NULL OR b.delist_date = '' OR b.delist_date > ?1) \
                 ORDER BY b.ts_code",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((fmt_day(day),), |row| row.get::<_, String>(0))
            .map_err(io_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(io_err)
    }

    fn index_members(&self, index_code: &str, day: NaiveDate) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT MAX(trade_date) FROM index_weight \
                 WHERE index_code = ?1 AND trade_date <= ?2",
                (index_code, fmt_day(day)),
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?
            .flatten();
        let Some(snapshot) = snapshot else {
            return Ok(Vec::new());
        };
        let mut stmt = conn
            .prepare_cached(
                "SELECT con_code FROM index_weight \
                 WHERE index_code = ?1 AND trade_date = ?2 ORDER BY con_code",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((index_code, snapshot), |row| row.get::<_, String>(0))
            .map_err(io_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(io_err)
    }

    fn index_close(&self, index_code: &str, day: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let value: Option<Option<f64>> = conn
            .query_row(
                "SELECT close FROM index_daily WHERE ts_code = ?1 AND trade_date = ?2",
                (index_code, fmt_day(day)),
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        Ok(value.flatten())
    }
}

fn agg_from_str(s: &str) -> Result<AggFunc> {
    match s {
        "NONE" => Ok(AggFunc::None),
        "SMA" => Ok(AggFunc::Sma),
        "EMA" => Ok(AggFunc::Ema),
        "MAX" => Ok(AggFunc::Max),
        "MIN" => Ok(AggFunc::Min),
        "SUM" => Ok(AggFunc::Sum),
        "AVG" => Ok(AggFunc::Avg),
        other => Err(EngineError::DataSourceUnavailable(format!(
            "unknown agg_func `{other}` in param table"
        ))),
    }
}

fn scope_from_row(scope_type: &str, scope_id: Option<String>) -> Result<Scope> {
    match scope_type {
        "all" => Ok(Scope::All),
        "single_stock" => Ok(Scope::SingleStock {
            symbol: scope_id.unwrap_or_default(),
        }),
        "index" => Ok(Scope::Index {
            code: scope_id.unwrap_or_default(),
        }),
        other => Err(EngineError::DataSourceUnavailable(format!(
            "unknown scope type `{other}` in strategy table"
        ))),
    }
}

impl EntityStore for SqliteStore {
    fn param(&self, fq: &str) -> Result<Option<Param>> {
        let Some((creator, name)) = fq.split_once('.') else {
            return Ok(None);
        };
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.query_row(
            "SELECT data_id, param_type, pre_period, post_period, agg_func \
             FROM param WHERE creator_name = ?1 AND param_name = ?2",
            (creator, name),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(io_err)?
        .map(|(data_id, kind, pre, post, agg)| {
            Ok(Param {
                creator: creator.to_string(),
                name: name.to_string(),
                kind: match kind.as_str() {
                    "indicator" => ParamKind::Indicator,
                    _ => ParamKind::Table,
                },
                data_id,
                pre_period: pre.max(0) as usize,
                post_period: post.max(0) as usize,
                agg: agg_from_str(&agg)?,
            })
        })
        .transpose()
    }

    fn indicator(&self, fq: &str) -> Result<Option<Indicator>> {
        let Some((creator, name)) = fq.split_once('.') else {
            return Ok(None);
        };
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let body: Option<String> = conn
            .query_row(
                "SELECT calculation_method FROM indicator \
                 WHERE creator_name = ?1 AND indicator_name = ?2",
                (creator, name),
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        let Some(body) = body else {
            return Ok(None);
        };
        let mut stmt = conn
            .prepare_cached(
                "SELECT param_creator || '.' || param_name FROM indicator_param_rel \
                 WHERE indicator_creator = ?1 AND indicator_name = ?2 ORDER BY 1",
            )
            .map_err(io_err)?;
        let params = stmt
            .query_map((creator, name), |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(io_err)?;
        Ok(Some(Indicator {
            creator: creator.to_string(),
            name: name.to_string(),
            calculation_method: body,
            params,
        }))
    }

    fn strategy(&self, creator: &str, name: &str) -> Result<Option<Strategy>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let head = conn
            .query_row(
                "SELECT select_func, risk_control_func, scope_type, scope_id, \
                        position_count, rebalance_interval, buy_fee_rate, sell_fee_rate \
                 FROM strategy WHERE creator_name = ?1 AND strategy_name = ?2",
                (creator, name),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, f64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(io_err)?;
        let Some((select_func, risk_func, scope_type, scope_id, count, interval, buy, sell)) = head
        else {
            return Ok(None);
        };
        let mut stmt = conn
            .prepare_cached(
                "SELECT param_creator || '.' || param_name FROM strategy_param_rel \
                 WHERE strategy_creator = ?1 AND strategy_name = ?2 ORDER BY 1",
            )
            .map_err(io_err)?;
        let params = stmt
            .query_map((creator, name), |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(io_err)?;
        Ok(Some(Strategy {
            creator: creator.to_string(),
            name: name.to_string(),
            select_func,
            risk_control_func: risk_func,
            scope: scope_from_row(&scope_type, scope_id)?,
            position_count: count.max(0) as usize,
            rebalance_interval: interval.max(0) as usize,
            buy_fee_rate: buy,
            sell_fee_rate: sell,
            params,
        }))
    }
}
