use chrono::NaiveDate;
use thiserror::Error;

/// Which user-authored strategy hook was executing when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPhase {
    Select,
    RiskControl,
}

impl std::fmt::Display for StrategyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyPhase::Select => write!(f, "select"),
            StrategyPhase::RiskControl => write!(f, "risk_control"),
        }
    }
}

/// Every way a backtest job can fail. The engine is fail-fast: the first
/// error aborts the job and is surfaced verbatim in the report row.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cyclic dependency among: {}", nodes.join(", "))]
    CyclicDependency { nodes: Vec<String> },

    #[error("param `{0}` is not defined")]
    MissingParam(String),

    #[error("indicator `{0}` is not defined")]
    MissingIndicator(String),

    #[error("market data source unavailable: {0}")]
    DataSourceUnavailable(String),

    #[error("no open trading day in [{start}, {end}]")]
    CalendarUnavailable { start: NaiveDate, end: NaiveDate },

    #[error("universe is empty on every trading day of the range")]
    UniverseEmpty,

    #[error("indicator `{fqname}` failed for {symbol} on {day}: {message}")]
    UserIndicatorError {
        fqname: String,
        symbol: String,
        day: NaiveDate,
        message: String,
    },

    #[error("strategy {phase} hook failed on {day}: {message}")]
    UserStrategyError {
        day: NaiveDate,
        phase: StrategyPhase,
        message: String,
    },

    #[error("user code exceeded its time budget in `{0}`")]
    UserCodeTimeout(String),

    #[error("job exceeded its overall time budget")]
    JobTimeout,

    #[error("invalid request: `{field}`: {reason}")]
    InvalidRequest { field: String, reason: String },
}

impl EngineError {
    /// Stable error kind, surfaced verbatim in report rows and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::CyclicDependency { .. } => "CyclicDependency",
            EngineError::MissingParam(_) => "MissingParam",
            EngineError::MissingIndicator(_) => "MissingIndicator",
            EngineError::DataSourceUnavailable(_) => "DataSourceUnavailable",
            EngineError::CalendarUnavailable { .. } => "CalendarUnavailable",
            EngineError::UniverseEmpty => "UniverseEmpty",
            EngineError::UserIndicatorError { .. } => "UserIndicatorError",
            EngineError::UserStrategyError { .. } => "UserStrategyError",
            EngineError::UserCodeTimeout(_) => "UserCodeTimeout",
            EngineError::JobTimeout => "JobTimeout",
            EngineError::InvalidRequest { .. } => "InvalidRequest",
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidRequest {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let e = EngineError::CyclicDependency {
            nodes: vec!["a.x".into(), "a.y".into()],
        };
        assert_eq!(e.kind(), "CyclicDependency");
        assert_eq!(e.to_string(), "cyclic dependency among: a.x, a.y");

        let e = EngineError::invalid("rebalance_interval", ">0 required");
        assert_eq!(e.kind(), "InvalidRequest");
        assert_eq!(
            e.to_string(),
            "invalid request: `rebalance_interval`: >0 required"
        );
    }

    #[test]
    fn phase_display() {
        assert_eq!(StrategyPhase::Select.to_string(), "select");
        assert_eq!(StrategyPhase::RiskControl.to_string(), "risk_control");
    }
}
