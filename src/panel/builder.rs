use rayon::prelude::*;
use rhai::AST;
use rustc_hash::FxHashMap;

use super::{window, Panel};
use crate::data::calendar::DayAxis;
use crate::data::{split_data_id, MarketData};
use crate::error::{EngineError, Result};
use crate::model::{Param, ParamKind};
use crate::resolve::Resolution;
use crate::script::{param_view, Harness, ScriptError};

/// Materialises every value the simulation will read: table params through
/// their windows, then indicators layer by layer in the resolver's order.
/// All I/O and user code runs here, before the day loop starts.
pub struct PanelBuilder<'a> {
    store: &'a dyn MarketData,
    resolution: &'a Resolution,
    harness: &'a Harness,
    axis: &'a DayAxis,
    workers: usize,
}

impl<'a> PanelBuilder<'a> {
    pub fn new(
        store: &'a dyn MarketData,
        resolution: &'a Resolution,
        harness: &'a Harness,
        axis: &'a DayAxis,
        workers: usize,
    ) -> Self {
        Self {
            store,
            resolution,
            harness,
            axis,
            workers,
        }
    }

    pub fn build(&self, symbols: Vec<String>) -> Result<Panel> {
        let mut panel = Panel::new(symbols, self.axis.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.max(1))
            .build()
            .map_err(|e| EngineError::DataSourceUnavailable(e.to_string()))?;

        pool.install(|| -> Result<()> {
            // Step 1+2: raw fetch and windowed aggregation per table param.
            for fq in &self.resolution.table_params {
                let param = self
                    .resolution
                    .snapshot
                    .param(fq)
                    .ok_or_else(|| EngineError::MissingParam(fq.clone()))?;
                self.materialize_table_param(&mut panel, param)?;
            }

            // Step 3: indicators, deepest first. Ordering across layers is
            // a barrier; symbols within one indicator run in parallel.
            for ind_fq in &self.resolution.indicator_order {
                let indicator = self
                    .resolution
                    .snapshot
                    .indicator(ind_fq)
                    .ok_or_else(|| EngineError::MissingIndicator(ind_fq.clone()))?;
                for param_fq in &indicator.params {
                    self.materialize_param(&mut panel, param_fq)?;
                }
                let ast = self
                    .harness
                    .compile(&indicator.calculation_method)
                    .map_err(|e| match e {
                        ScriptError::Timeout => EngineError::UserCodeTimeout(ind_fq.clone()),
                        ScriptError::Failed(msg) => EngineError::UserIndicatorError {
                            fqname: ind_fq.clone(),
                            symbol: String::new(),
                            day: self.axis.day(0),
                            message: format!("compile error: {msg}"),
                        },
                    })?;
                self.evaluate_indicator(&mut panel, ind_fq, &indicator.params, &ast)?;
            }

            // Step 4: anything the strategy declares that the indicator walk
            // did not already materialise (indicator-backed windows).
            let strategy_params: Vec<String> =
                self.resolution.snapshot.params.keys().cloned().collect();
            for fq in strategy_params {
                self.materialize_param(&mut panel, &fq)?;
            }
            Ok(())
        })?;

        Ok(panel)
    }

    fn materialize_param(&self, panel: &mut Panel, fq: &str) -> Result<()> {
        if panel.has_series(fq) {
            return Ok(());
        }
        let param = self
            .resolution
            .snapshot
            .param(fq)
            .ok_or_else(|| EngineError::MissingParam(fq.to_string()))?;
        match param.kind {
            ParamKind::Table => self.materialize_table_param(panel, param),
            ParamKind::Indicator => self.materialize_indicator_param(panel, param),
        }
    }

    /// The sub-range of the axis this param is loaded over: the report
    /// range extended by the param's own windows, not the global maxima.
    fn param_bounds(&self, param: &Param) -> (usize, usize) {
        let report = self.axis.report_range();
        let lo = report.start().saturating_sub(param.pre_period.max(1) - 1);
        let hi = (report.end() + param.post_period).min(self.axis.len() - 1);
        (lo, hi)
    }

    fn materialize_table_param(&self, panel: &mut Panel, param: &Param) -> Result<()> {
        let fq = param.fqname();
        if panel.has_series(&fq) {
            return Ok(());
        }
        let (table, column) = split_data_id(&param.data_id)?;
        let (lo, hi) = self.param_bounds(param);
        let sub_days = &self.axis.days()[lo..=hi];
        let n_days = self.axis.len();

        let rows: Vec<Vec<Option<f64>>> = panel
            .symbols()
            .par_iter()
            .map(|symbol| -> Result<Vec<Option<f64>>> {
                let fetched = self.store.column(symbol, sub_days, table, column)?;
                let mut raw = vec![None; n_days];
                raw[lo..=hi].copy_from_slice(&fetched);
                let mut out =
                    window::aggregate(&raw, param.agg, param.pre_period, param.post_period);
                mask_outside(&mut out, lo, hi);
                Ok(out)
            })
            .collect::<Result<_>>()?;

        tracing::debug!(param = %fq, days = sub_days.len(), "table param materialised");
        let lane = panel.lane_from_rows(rows);
        panel.insert_series(&fq, lane);
        Ok(())
    }

    /// A param that windows over another indicator's output series.
    fn materialize_indicator_param(&self, panel: &mut Panel, param: &Param) -> Result<()> {
        let fq = param.fqname();
        if panel.has_series(&fq) {
            return Ok(());
        }
        let source = &param.data_id;
        if !panel.has_series(source) {
            return Err(EngineError::MissingIndicator(source.clone()));
        }
        let rows: Vec<Vec<Option<f64>>> = (0..panel.symbols().len())
            .map(|sym_idx| {
                let raw = panel
                    .symbol_lane(source, sym_idx)
                    .expect("source series checked above");
                window::aggregate(raw, param.agg, param.pre_period, param.post_period)
            })
            .collect();
        let lane = panel.lane_from_rows(rows);
        panel.insert_series(&fq, lane);
        Ok(())
    }

    fn evaluate_indicator(
        &self,
        panel: &mut Panel,
        ind_fq: &str,
        declared: &[String],
        ast: &AST,
    ) -> Result<()> {
        let n_days = self.axis.len();
        // Snapshot the input lanes once; the panel cannot be borrowed
        // inside the parallel walk while it is being extended.
        let mut inputs: FxHashMap<&str, &[Option<f64>]> = FxHashMap::default();
        for p in declared {
            let lane = panel
                .series(p)
                .ok_or_else(|| EngineError::MissingParam(p.clone()))?;
            inputs.insert(p.as_str(), lane);
        }
        let symbols = panel.symbols().to_vec();

        let rows: Vec<Vec<Option<f64>>> = symbols
            .par_iter()
            .enumerate()
            .map(|(sym_idx, symbol)| -> Result<Vec<Option<f64>>> {
                let mut row = Vec::with_capacity(n_days);
                for day_idx in 0..n_days {
                    let view = param_view(declared.iter().map(|p| {
                        let lane = inputs[p.as_str()];
                        (p.clone(), lane[sym_idx * n_days + day_idx])
                    }));
                    let value =
                        self.harness
                            .eval_indicator(ast, view)
                            .map_err(|e| match e {
                                ScriptError::Timeout => {
                                    EngineError::UserCodeTimeout(ind_fq.to_string())
                                }
                                ScriptError::Failed(message) => EngineError::UserIndicatorError {
                                    fqname: ind_fq.to_string(),
                                    symbol: symbol.clone(),
                                    day: self.axis.day(day_idx),
                                    message,
                                },
                            })?;
                    row.push(value);
                }
                Ok(row)
            })
            .collect::<Result<_>>()?;

        tracing::debug!(indicator = %ind_fq, symbols = symbols.len(), "indicator evaluated");
        let lane = panel.lane_from_rows(rows);
        panel.insert_series(ind_fq, lane);
        Ok(())
    }
}

fn mask_outside(series: &mut [Option<f64>], lo: usize, hi: usize) {
    for (i, cell) in series.iter_mut().enumerate() {
        if i < lo || i > hi {
            *cell = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::{MemEntities, MemStore};
    use crate::model::{AggFunc, Indicator, Scope, Strategy};
    use crate::resolve::resolve;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    const WEEK: [&str; 7] = [
        "2023-01-03",
        "2023-01-04",
        "2023-01-05",
        "2023-01-06",
        "2023-01-09",
        "2023-01-10",
        "2023-01-11",
    ];

    fn seeded_store() -> MemStore {
        let mut store = MemStore::new();
        for (i, day) in WEEK.iter().enumerate() {
            store.add_open_day(d(day));
            store.put_daily("000001.SZ", d(day), 10.0 + i as f64, 10.0 + i as f64);
        }
        store
    }

    fn table_param(name: &str, pre: usize, agg: AggFunc) -> crate::model::Param {
        crate::model::Param {
            creator: "u".to_string(),
            name: name.to_string(),
            kind: ParamKind::Table,
            data_id: "daily.close".to_string(),
            pre_period: pre,
            post_period: 0,
            agg,
        }
    }

    fn strategy(params: &[&str]) -> Strategy {
        Strategy {
            creator: "u".to_string(),
            name: "s".to_string(),
            select_func: String::new(),
            risk_control_func: String::new(),
            scope: Scope::SingleStock {
                symbol: "000001.SZ".to_string(),
            },
            position_count: 1,
            rebalance_interval: 1,
            buy_fee_rate: 0.0,
            sell_fee_rate: 0.0,
            params: params.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn build_with(
        store: &MemStore,
        entities: &MemEntities,
        strat: &Strategy,
        pre: usize,
    ) -> Panel {
        let resolution = resolve(entities, strat).unwrap();
        let axis = DayAxis::build(store, d("2023-01-05"), d("2023-01-11"), pre, 0).unwrap();
        let harness = Harness::new(Duration::from_millis(1000));
        PanelBuilder::new(store, &resolution, &harness, &axis, 2)
            .build(vec!["000001.SZ".to_string()])
            .unwrap()
    }

    #[test]
    fn zero_window_param_equals_raw_value() {
        let store = seeded_store();
        let entities = MemEntities::new();
        entities.add_param(table_param("close_0", 0, AggFunc::None));
        let strat = strategy(&["u.close_0"]);
        let panel = build_with(&store, &entities, &strat, 0);
        // Raw close on 2023-01-06 is 13.0 (index 3 of the seeded week).
        let day_idx = 1; // axis starts at 2023-01-05
        assert_eq!(panel.value("u.close_0", 0, day_idx), Some(13.0));
    }

    #[test]
    fn indicator_composition_is_pointwise() {
        let store = seeded_store();
        let entities = MemEntities::new();
        entities.add_param(table_param("close_0", 0, AggFunc::None));
        entities.add_indicator(Indicator {
            creator: "u".to_string(),
            name: "double".to_string(),
            calculation_method:
                "fn calculate(params) { if params[\"u.close_0\"] == () { return (); } \
                 params[\"u.close_0\"] * 2.0 }"
                    .to_string(),
            params: vec!["u.close_0".to_string()],
        });
        entities.add_param(crate::model::Param {
            creator: "u".to_string(),
            name: "double_0".to_string(),
            kind: ParamKind::Indicator,
            data_id: "u.double".to_string(),
            pre_period: 0,
            post_period: 0,
            agg: AggFunc::None,
        });
        entities.add_indicator(Indicator {
            creator: "u".to_string(),
            name: "quad".to_string(),
            calculation_method:
                "fn calculate(params) { if params[\"u.double_0\"] == () { return (); } \
                 params[\"u.double_0\"] * 2.0 }"
                    .to_string(),
            params: vec!["u.double_0".to_string()],
        });
        entities.add_param(crate::model::Param {
            creator: "u".to_string(),
            name: "quad_0".to_string(),
            kind: ParamKind::Indicator,
            data_id: "u.quad".to_string(),
            pre_period: 0,
            post_period: 0,
            agg: AggFunc::None,
        });

        let strat = strategy(&["u.quad_0"]);
        let panel = build_with(&store, &entities, &strat, 0);
        // close on 2023-01-05 (axis index 0) is 12.0 -> double 24 -> quad 48.
        assert_eq!(panel.value("u.double", 0, 0), Some(24.0));
        assert_eq!(panel.value("u.quad", 0, 0), Some(48.0));
        assert_eq!(panel.value("u.quad_0", 0, 0), Some(48.0));
    }

    #[test]
    fn indicator_error_carries_symbol_and_day() {
        let store = seeded_store();
        let entities = MemEntities::new();
        entities.add_param(table_param("close_0", 0, AggFunc::None));
        entities.add_indicator(Indicator {
            creator: "u".to_string(),
            name: "bad".to_string(),
            calculation_method: "fn calculate(params) { throw \"nope\"; }".to_string(),
            params: vec!["u.close_0".to_string()],
        });
        entities.add_param(crate::model::Param {
            creator: "u".to_string(),
            name: "bad_0".to_string(),
            kind: ParamKind::Indicator,
            data_id: "u.bad".to_string(),
            pre_period: 0,
            post_period: 0,
            agg: AggFunc::None,
        });
        let strat = strategy(&["u.bad_0"]);
        let resolution = resolve(&entities, &strat).unwrap();
        let axis = DayAxis::build(&store, d("2023-01-05"), d("2023-01-11"), 0, 0).unwrap();
        let harness = Harness::new(Duration::from_millis(1000));
        let err = PanelBuilder::new(&store, &resolution, &harness, &axis, 1)
            .build(vec!["000001.SZ".to_string()])
            .unwrap_err();
        let EngineError::UserIndicatorError { fqname, symbol, .. } = err else {
            panic!("expected UserIndicatorError");
        };
        assert_eq!(fqname, "u.bad");
        assert_eq!(symbol, "000001.SZ");
    }

    #[test]
    fn windowed_param_warms_up_in_extension() {
        let store = seeded_store();
        let entities = MemEntities::new();
        entities.add_param(table_param("close_sma3", 3, AggFunc::Sma));
        let strat = strategy(&["u.close_sma3"]);
        let panel = build_with(&store, &entities, &strat, 3);
        // Axis: [Jan 3, Jan 4] extension + [Jan 5 .. Jan 11] report days.
        // First report day (axis idx 2) already has a full 3-day window:
        // closes 10, 11, 12 -> 11.0.
        assert_eq!(panel.value("u.close_sma3", 0, 2), Some(11.0));
        // Extension day idx 1 has only a 2-day history -> missing.
        assert_eq!(panel.value("u.close_sma3", 0, 1), None);
    }
}
