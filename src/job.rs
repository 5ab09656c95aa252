use chrono::NaiveDate;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::data::calendar::{maximal_universe, DayAxis};
use crate::data::{EntityStore, MarketData};
use crate::error::{EngineError, Result};
use crate::model::{Scope, Strategy};
use crate::panel::builder::PanelBuilder;
use crate::panel::Panel;
use crate::report::store::ReportStore;
use crate::report::{charts, metrics, ReportRow};
use crate::script::Harness;
use crate::sim::engine::{SimParams, Simulator};

/// A backtest submission. Field constraints are checked before a report
/// row is opened; violations surface as `InvalidRequest`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct JobRequest {
    #[garde(length(min = 1))]
    pub creator: String,
    #[garde(length(min = 1))]
    pub strategy_name: String,
    /// `YYYY-MM-DD`.
    #[garde(length(min = 1))]
    pub start_date: String,
    /// `YYYY-MM-DD`.
    #[garde(length(min = 1))]
    pub end_date: String,
    #[garde(range(min = 0.01))]
    pub initial_fund: f64,
    #[serde(default)]
    #[garde(range(min = 0.0, max = 0.1))]
    pub slippage_rate: f64,
    #[serde(default)]
    #[garde(skip)]
    pub benchmark_ts_code: Option<String>,
    /// The submitting analyst; defaults to the strategy creator.
    #[serde(default)]
    #[garde(skip)]
    pub user_name: Option<String>,
}

impl JobRequest {
    pub fn strategy_fqname(&self) -> String {
        crate::model::fqname(&self.creator, &self.strategy_name)
    }
}

/// The terminal record pushed to the external notification store on every
/// final status. Delivery is out of scope; embedders install their own
/// `Notifier`.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub strategy_fqname: String,
    pub report_id: Option<String>,
    pub message: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, note: &Notification);
}

/// Default notifier: a structured tracing event.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, note: &Notification) {
        tracing::info!(
            kind = %note.kind,
            strategy = %note.strategy_fqname,
            report_id = note.report_id.as_deref().unwrap_or("-"),
            message = %note.message,
            "backtest status"
        );
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed { report_id: String },
    /// The row was discarded; nothing persisted.
    Cancelled,
}

struct ValidatedRequest {
    strategy: Strategy,
    start: NaiveDate,
    end: NaiveDate,
    benchmark: String,
    user_name: String,
}

/// Everything phase one prepares; phase two consumes it without touching
/// the data source again.
struct Prepared {
    axis: DayAxis,
    panel: Panel,
    benchmark_closes: Vec<Option<f64>>,
}

/// Drives one backtest: validate, open the report row, prepare data,
/// simulate, assemble the report. Fail-fast throughout; cancellation is
/// honoured between the phases and between simulation days.
pub struct Coordinator {
    config: Config,
    market: Arc<dyn MarketData>,
    entities: Arc<dyn EntityStore>,
    reports: Arc<ReportStore>,
    notifier: Arc<dyn Notifier>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        market: Arc<dyn MarketData>,
        entities: Arc<dyn EntityStore>,
        reports: Arc<ReportStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            market,
            entities,
            reports,
            notifier,
        }
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    pub async fn run(&self, request: JobRequest, cancel: CancellationToken) -> Result<JobOutcome> {
        // Validation and dependency resolution both happen before a report
        // row exists: a rejected request or a broken entity graph leaves no
        // trace beyond the notification.
        let preflight = self.validate(&request).and_then(|validated| {
            let resolution = crate::resolve::resolve(self.entities.as_ref(), &validated.strategy)?;
            Ok((validated, resolution))
        });
        let (validated, resolution) = match preflight {
            Ok(v) => v,
            Err(e) => {
                self.notify(e.kind(), &request.strategy_fqname(), None, &e.to_string());
                return Err(e);
            }
        };
        let fqname = validated.strategy.fqname();

        let report_id = uuid::Uuid::new_v4().to_string();
        let row = ReportRow::open(
            report_id.clone(),
            &validated.strategy,
            &validated.user_name,
            &request.start_date,
            &request.end_date,
            request.initial_fund,
            &validated.benchmark,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        self.reports.insert(&row)?;
        tracing::info!(report_id = %report_id, strategy = %fqname, "backtest started");

        let outcome = tokio::time::timeout(
            self.config.job_timeout,
            self.execute(&report_id, &request, &validated, resolution, cancel),
        )
        .await
        .unwrap_or(Err(EngineError::JobTimeout));

        match outcome {
            Ok(Some(final_fund)) => {
                self.notify(
                    "completed",
                    &fqname,
                    Some(&report_id),
                    &format!("completed with final fund {final_fund:.2}"),
                );
                Ok(JobOutcome::Completed { report_id })
            }
            Ok(None) => {
                self.reports.discard(&report_id)?;
                tracing::info!(report_id = %report_id, "backtest cancelled, row discarded");
                Ok(JobOutcome::Cancelled)
            }
            Err(e) => {
                self.reports.fail(&report_id, e.kind(), &e.to_string())?;
                self.notify(e.kind(), &fqname, Some(&report_id), &e.to_string());
                Err(e)
            }
        }
    }

    /// The two compute phases plus report assembly. Returns the final
    /// fund, or `None` when cancelled.
    async fn execute(
        &self,
        report_id: &str,
        request: &JobRequest,
        validated: &ValidatedRequest,
        resolution: crate::resolve::Resolution,
        cancel: CancellationToken,
    ) -> Result<Option<f64>> {
        let harness = Arc::new(Harness::new(self.config.usercode_timeout));

        // Phase one: panel preparation over the resolved closure.
        let prepared = {
            let market = Arc::clone(&self.market);
            let harness = Arc::clone(&harness);
            let strategy = validated.strategy.clone();
            let benchmark = validated.benchmark.clone();
            let (start, end) = (validated.start, validated.end);
            let workers = self.config.panel_workers;
            spawn_phase(move || {
                prepare(
                    market.as_ref(),
                    &resolution,
                    &harness,
                    &strategy,
                    &benchmark,
                    start,
                    end,
                    workers,
                )
            })
            .await??
        };

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let Prepared {
            axis,
            panel,
            benchmark_closes,
        } = prepared;

        // Phase two: the strictly sequential day loop.
        let portfolio = {
            let market = Arc::clone(&self.market);
            let harness = Arc::clone(&harness);
            let strategy = validated.strategy.clone();
            let params = SimParams {
                initial_fund: request.initial_fund,
                slippage_rate: request.slippage_rate,
                lot_size: self.config.lot_size,
            };
            let cancel = cancel.clone();
            spawn_phase(move || {
                let sim =
                    Simulator::new(market.as_ref(), &strategy, &panel, &axis, &harness, params)?;
                sim.run(|| cancel.is_cancelled())
            })
            .await??
        };

        let Some(portfolio) = portfolio else {
            return Ok(None);
        };

        // Report assembly and persistence.
        let m = metrics::compute(
            &portfolio.equity,
            &portfolio.fills,
            self.config.trading_days_per_year,
        );
        let bundle = charts::build(&portfolio.equity, &benchmark_closes, &portfolio.fills);
        let final_fund = portfolio
            .equity
            .last()
            .map_or(request.initial_fund, |p| p.value);
        self.reports
            .complete(report_id, final_fund, &m, &bundle.to_json())?;
        Ok(Some(final_fund))
    }

    fn validate(&self, request: &JobRequest) -> Result<ValidatedRequest> {
        if let Err(report) = request.validate() {
            if let Some((path, error)) = report.iter().next() {
                return Err(EngineError::invalid(&path.to_string(), error.to_string()));
            }
        }
        let start = parse_iso("start_date", &request.start_date)?;
        let end = parse_iso("end_date", &request.end_date)?;
        if end < start {
            return Err(EngineError::invalid(
                "end_date",
                "must not precede start_date",
            ));
        }
        let strategy = self
            .entities
            .strategy(&request.creator, &request.strategy_name)?
            .ok_or_else(|| {
                EngineError::invalid(
                    "strategy",
                    format!("`{}` not found", request.strategy_fqname()),
                )
            })?;
        if strategy.position_count == 0 {
            return Err(EngineError::invalid("position_count", ">0 required"));
        }
        if strategy.rebalance_interval == 0 && !strategy.scope.is_single_stock() {
            return Err(EngineError::invalid("rebalance_interval", ">0 required"));
        }
        let benchmark = request
            .benchmark_ts_code
            .clone()
            .unwrap_or_else(|| self.config.default_benchmark.clone());
        let user_name = request
            .user_name
            .clone()
            .unwrap_or_else(|| request.creator.clone());
        Ok(ValidatedRequest {
            strategy,
            start,
            end,
            benchmark,
            user_name,
        })
    }

    fn notify(&self, kind: &str, strategy_fqname: &str, report_id: Option<&str>, message: &str) {
        self.notifier.notify(&Notification {
            kind: kind.to_string(),
            strategy_fqname: strategy_fqname.to_string(),
            report_id: report_id.map(ToString::to_string),
            message: message.to_string(),
        });
    }
}

async fn spawn_phase<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::DataSourceUnavailable(format!("job worker failed: {e}")))
}

fn parse_iso(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(field, format!("`{value}` is not a YYYY-MM-DD date")))
}

#[allow(clippy::too_many_arguments)]
fn prepare(
    market: &dyn MarketData,
    resolution: &crate::resolve::Resolution,
    harness: &Harness,
    strategy: &Strategy,
    benchmark: &str,
    start: NaiveDate,
    end: NaiveDate,
    workers: usize,
) -> Result<Prepared> {
    let axis = DayAxis::build(market, start, end, resolution.max_pre, resolution.max_post)?;
    let symbols = maximal_universe(market, &strategy.scope, axis.report_days())?;
    tracing::info!(
        symbols = symbols.len(),
        days = axis.report_days().len(),
        indicators = resolution.indicator_order.len(),
        "panel preparation started"
    );
    let panel = PanelBuilder::new(market, resolution, harness, &axis, workers).build(symbols)?;

    let benchmark_closes: Vec<Option<f64>> = match &strategy.scope {
        Scope::SingleStock { symbol } => {
            market.column(symbol, axis.report_days(), "daily", "close")?
        }
        _ => axis
            .report_days()
            .iter()
            .map(|&day| market.index_close(benchmark, day))
            .collect::<Result<_>>()?,
    };
    if benchmark_closes.iter().all(Option::is_none) {
        tracing::warn!(%benchmark, "no benchmark closes over the range, chart degrades to zero");
    }

    Ok(Prepared {
        axis,
        panel,
        benchmark_closes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::{MemEntities, MemStore};

    fn coordinator_with(store: MemStore, entities: MemEntities) -> Coordinator {
        Coordinator::new(
            Config::default(),
            Arc::new(store),
            Arc::new(entities),
            Arc::new(ReportStore::open_in_memory().unwrap()),
            Arc::new(LogNotifier),
        )
    }

    fn request(creator: &str, name: &str) -> JobRequest {
        JobRequest {
            creator: creator.to_string(),
            strategy_name: name.to_string(),
            start_date: "2023-01-04".to_string(),
            end_date: "2023-01-10".to_string(),
            initial_fund: 100_000.0,
            slippage_rate: 0.0,
            benchmark_ts_code: None,
            user_name: None,
        }
    }

    #[tokio::test]
    async fn unknown_strategy_is_invalid_request() {
        let c = coordinator_with(MemStore::new(), MemEntities::new());
        let err = c
            .run(request("ghost", "nope"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn negative_fund_rejected_without_row() {
        let c = coordinator_with(MemStore::new(), MemEntities::new());
        let mut req = request("ghost", "nope");
        req.initial_fund = -5.0;
        let err = c.run(req, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
        assert!(err.to_string().contains("initial_fund"));
    }

    #[tokio::test]
    async fn bad_date_rejected() {
        let c = coordinator_with(MemStore::new(), MemEntities::new());
        let mut req = request("ghost", "nope");
        req.start_date = "2023/01/04".to_string();
        let err = c.run(req, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("start_date"));
    }

    #[tokio::test]
    async fn excessive_slippage_rejected() {
        let c = coordinator_with(MemStore::new(), MemEntities::new());
        let mut req = request("ghost", "nope");
        req.slippage_rate = 0.5;
        let err = c.run(req, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn zero_rebalance_interval_rejected_for_all_scope() {
        use crate::model::{AggFunc, Param, ParamKind};
        let entities = MemEntities::new();
        entities.add_param(Param {
            creator: "u".to_string(),
            name: "close_0".to_string(),
            kind: ParamKind::Table,
            data_id: "daily.close".to_string(),
            pre_period: 0,
            post_period: 0,
            agg: AggFunc::None,
        });
        entities.add_strategy(Strategy {
            creator: "u".to_string(),
            name: "broken".to_string(),
            select_func: String::new(),
            risk_control_func: String::new(),
            scope: Scope::All,
            position_count: 3,
            rebalance_interval: 0,
            buy_fee_rate: 0.0,
            sell_fee_rate: 0.0,
            params: vec!["u.close_0".to_string()],
        });
        let c = coordinator_with(MemStore::new(), entities);
        let err = c
            .run(request("u", "broken"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
        assert!(err.to_string().contains("rebalance_interval"));
    }
}
