use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// How a multi-day window collapses to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggFunc {
    None,
    Sma,
    Ema,
    Max,
    Min,
    Sum,
    /// Synonym for SMA.
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Backed by a cache column, `data_id` is `"<table>.<column>"`.
    Table,
    /// Backed by another indicator, `data_id` is `"<creator>.<indicator_name>"`.
    Indicator,
}

/// Fully-qualified name `"<creator>.<entity_name>"`. Two users may each own
/// an `ema_5`; user code always addresses values by fqname.
pub fn fqname(creator: &str, name: &str) -> String {
    format!("{creator}.{name}")
}

/// A typed requirement against the data cache or another indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub creator: String,
    pub name: String,
    pub kind: ParamKind,
    pub data_id: String,
    pub pre_period: usize,
    pub post_period: usize,
    pub agg: AggFunc,
}

impl Param {
    pub fn fqname(&self) -> String {
        fqname(&self.creator, &self.name)
    }

    /// `NONE` is only valid for a zero-length window.
    pub fn validate(&self) -> Result<()> {
        if self.agg == AggFunc::None && (self.pre_period > 0 || self.post_period > 0) {
            return Err(EngineError::invalid(
                "agg_func",
                format!(
                    "NONE requires a zero-length window on param `{}`",
                    self.fqname()
                ),
            ));
        }
        Ok(())
    }
}

/// A user-authored pure function over a declared param set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator {
    pub creator: String,
    pub name: String,
    /// Script source defining `fn calculate(params)`.
    pub calculation_method: String,
    /// Fqnames of the params this indicator declares.
    pub params: Vec<String>,
}

impl Indicator {
    pub fn fqname(&self) -> String {
        fqname(&self.creator, &self.name)
    }
}

/// Universe descriptor attached to a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    All,
    SingleStock { symbol: String },
    Index { code: String },
}

impl Scope {
    pub fn is_single_stock(&self) -> bool {
        matches!(self, Scope::SingleStock { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub creator: String,
    pub name: String,
    /// Script source defining `fn select(candidates, params, position_count, holdings, day, context)`.
    pub select_func: String,
    /// Script source defining `fn risk_control(holdings, params, day, context)`.
    pub risk_control_func: String,
    pub scope: Scope,
    pub position_count: usize,
    /// Measured in trading days. Ignored (treated as 1) for single-stock scope.
    pub rebalance_interval: usize,
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    /// Fqnames of the params this strategy declares.
    pub params: Vec<String>,
}

impl Strategy {
    pub fn fqname(&self) -> String {
        fqname(&self.creator, &self.name)
    }
}

/// Read-only snapshot of every entity a backtest (transitively) names,
/// captured at job start. CRUD mutations after capture are not observed.
#[derive(Debug, Clone, Default)]
pub struct EntitySnapshot {
    pub params: HashMap<String, Param>,
    pub indicators: HashMap<String, Indicator>,
}

impl EntitySnapshot {
    pub fn param(&self, fqname: &str) -> Option<&Param> {
        self.params.get(fqname)
    }

    pub fn indicator(&self, fqname: &str) -> Option<&Indicator> {
        self.indicators.get(fqname)
    }
}
