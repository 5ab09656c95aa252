pub mod charts;
pub mod metrics;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::model::{Scope, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BacktestType {
    #[serde(rename = "STOCK")]
    Stock,
    #[serde(rename = "INDEX")]
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Generating,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Generating => "generating",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }
}

/// The persisted report row. Metric columns stay `None` until the pass
/// completes; a failed job carries the error kind/message instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub report_id: String,
    pub creator_name: String,
    pub strategy_name: String,
    pub user_name: String,
    pub backtest_type: BacktestType,
    pub stock_code: String,
    pub component_count: Option<usize>,
    pub start_date: String,
    pub end_date: String,
    pub initial_fund: f64,
    pub final_fund: Option<f64>,
    pub total_return: Option<f64>,
    pub annual_return: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub win_rate: Option<f64>,
    pub profit_loss_ratio: Option<f64>,
    pub trade_count: Option<usize>,
    pub report_generate_time: String,
    pub report_status: ReportStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl ReportRow {
    /// A fresh `generating` row for a validated request.
    pub fn open(
        report_id: String,
        strategy: &Strategy,
        user_name: &str,
        start_date: &str,
        end_date: &str,
        initial_fund: f64,
        benchmark: &str,
        generated_at: String,
    ) -> Self {
        let (backtest_type, stock_code, component_count) = match &strategy.scope {
            Scope::SingleStock { symbol } => (BacktestType::Stock, symbol.clone(), None),
            Scope::Index { code } => (
                BacktestType::Index,
                code.clone(),
                Some(strategy.position_count),
            ),
            Scope::All => (
                BacktestType::Index,
                benchmark.to_string(),
                Some(strategy.position_count),
            ),
        };
        Self {
            report_id,
            creator_name: strategy.creator.clone(),
            strategy_name: strategy.name.clone(),
            user_name: user_name.to_string(),
            backtest_type,
            stock_code,
            component_count,
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            initial_fund,
            final_fund: None,
            total_return: None,
            annual_return: None,
            max_drawdown: None,
            sharpe_ratio: None,
            win_rate: None,
            profit_loss_ratio: None,
            trade_count: None,
            report_generate_time: generated_at,
            report_status: ReportStatus::Generating,
            error_kind: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(scope: Scope) -> Strategy {
        Strategy {
            creator: "system".to_string(),
            name: "demo".to_string(),
            select_func: String::new(),
            risk_control_func: String::new(),
            scope,
            position_count: 3,
            rebalance_interval: 5,
            buy_fee_rate: 0.0003,
            sell_fee_rate: 0.0013,
            params: vec![],
        }
    }

    #[test]
    fn single_stock_row_shape() {
        let row = ReportRow::open(
            "r1".to_string(),
            &strategy(Scope::SingleStock {
                symbol: "000001.SZ".to_string(),
            }),
            "system",
            "2023-01-04",
            "2023-01-10",
            100_000.0,
            "000300.SH",
            "2023-02-01 00:00:00".to_string(),
        );
        assert_eq!(row.backtest_type, BacktestType::Stock);
        assert_eq!(row.stock_code, "000001.SZ");
        assert!(row.component_count.is_none());
        assert_eq!(row.report_status, ReportStatus::Generating);
    }

    #[test]
    fn all_scope_reports_against_benchmark() {
        let row = ReportRow::open(
            "r2".to_string(),
            &strategy(Scope::All),
            "system",
            "2023-01-04",
            "2023-01-10",
            100_000.0,
            "000300.SH",
            "2023-02-01 00:00:00".to_string(),
        );
        assert_eq!(row.backtest_type, BacktestType::Index);
        assert_eq!(row.stock_code, "000300.SH");
        assert_eq!(row.component_count, Some(3));
    }
}
