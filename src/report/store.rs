use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::metrics::Metrics;
use super::{BacktestType, ReportRow, ReportStatus};
use crate::error::{EngineError, Result};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Report persistence. Rows open as `generating` and move monotonically
/// forward to `completed` or `failed`; a cancelled job deletes its row.
pub struct ReportStore {
    conn: Mutex<Connection>,
}

fn io_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::DataSourceUnavailable(e.to_string())
}

impl ReportStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path).map_err(io_err)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(io_err)?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(io_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, row: &ReportRow) -> Result<()> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        conn.execute(
            "INSERT INTO backtest_report (
                report_id, creator_name, strategy_name, user_name, backtest_type,
                stock_code, component_count, start_date, end_date, initial_fund,
                report_generate_time, report_status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            (
                &row.report_id,
                &row.creator_name,
                &row.strategy_name,
                &row.user_name,
                match row.backtest_type {
                    BacktestType::Stock => "STOCK",
                    BacktestType::Index => "INDEX",
                },
                &row.stock_code,
                row.component_count.map(|c| c as i64),
                &row.start_date,
                &row.end_date,
                row.initial_fund,
                &row.report_generate_time,
                row.report_status.as_str(),
            ),
        )
        .map_err(io_err)?;
        Ok(())
    }

    pub fn complete(
        &self,
        report_id: &str,
        final_fund: f64,
        metrics: &Metrics,
        chart_json: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        conn.execute(
            "UPDATE backtest_report SET
                report_status = 'completed', final_fund = ?2, total_return = ?3,
                annual_return = ?4, max_drawdown = ?5, sharpe_ratio = ?6,
                win_rate = ?7, profit_loss_ratio = ?8, trade_count = ?9,
                chart_json = ?10
             WHERE report_id = ?1",
            (
                report_id,
                final_fund,
                metrics.total_return,
                metrics.annual_return,
                metrics.max_drawdown,
                metrics.sharpe_ratio,
                metrics.win_rate,
                metrics.profit_loss_ratio,
                metrics.trade_count as i64,
                chart_json.to_string(),
            ),
        )
        .map_err(io_err)?;
        Ok(())
    }

    pub fn fail(&self, report_id: &str, kind: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        conn.execute(
            "UPDATE backtest_report SET
                report_status = 'failed', error_kind = ?2, error_message = ?3
             WHERE report_id = ?1",
            (report_id, kind, message),
        )
        .map_err(io_err)?;
        Ok(())
    }

    /// Cancellation persists nothing.
    pub fn discard(&self, report_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        conn.execute(
            "DELETE FROM backtest_report WHERE report_id = ?1",
            (report_id,),
        )
        .map_err(io_err)?;
        Ok(())
    }

    pub fn fetch(&self, report_id: &str) -> Result<Option<ReportRow>> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        conn.query_row(
            "SELECT report_id, creator_name, strategy_name, user_name, backtest_type,
                    stock_code, component_count, start_date, end_date, initial_fund,
                    final_fund, total_return, annual_return, max_drawdown, sharpe_ratio,
                    win_rate, profit_loss_ratio, trade_count, report_generate_time,
                    report_status, error_kind, error_message
             FROM backtest_report WHERE report_id = ?1",
            (report_id,),
            |row| {
                Ok(ReportRow {
                    report_id: row.get(0)?,
                    creator_name: row.get(1)?,
                    strategy_name: row.get(2)?,
                    user_name: row.get(3)?,
                    backtest_type: match row.get::<_, String>(4)?.as_str() {
                        "STOCK" => BacktestType::Stock,
                        _ => BacktestType::Index,
                    },
                    stock_code: row.get(5)?,
                    component_count: row.get::<_, Option<i64>>(6)?.map(|c| c.max(0) as usize),
                    start_date: row.get(7)?,
                    end_date: row.get(8)?,
                    initial_fund: row.get(9)?,
                    final_fund: row.get(10)?,
                    total_return: row.get(11)?,
                    annual_return: row.get(12)?,
                    max_drawdown: row.get(13)?,
                    sharpe_ratio: row.get(14)?,
                    win_rate: row.get(15)?,
                    profit_loss_ratio: row.get(16)?,
                    trade_count: row.get::<_, Option<i64>>(17)?.map(|c| c.max(0) as usize),
                    report_generate_time: row.get(18)?,
                    report_status: match row.get::<_, String>(19)?.as_str() {
                        "completed" => ReportStatus::Completed,
                        "failed" => ReportStatus::Failed,
                        _ => ReportStatus::Generating,
                    },
                    error_kind: row.get(20)?,
                    error_message: row.get(21)?,
                })
            },
        )
        .optional()
        .map_err(io_err)
    }

    /// Ids of every persisted row, newest first.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT report_id FROM backtest_report ORDER BY report_generate_time DESC",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map((), |row| row.get::<_, String>(0))
            .map_err(io_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(io_err)
    }

    pub fn chart_json(&self, report_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("report store lock poisoned");
        let text: Option<Option<String>> = conn
            .query_row(
                "SELECT chart_json FROM backtest_report WHERE report_id = ?1",
                (report_id,),
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        match text.flatten() {
            Some(text) => serde_json::from_str(&text).map(Some).map_err(io_err),
            None => Ok(None),
        }
    }
}
