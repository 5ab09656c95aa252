use chrono::NaiveDate;
use rhai::{Dynamic, Map, AST};
use rustc_hash::FxHashMap;

use super::portfolio::{PendingOrder, Portfolio, Side, MAX_ORDER_MISSES};
use crate::data::calendar::{universe, DayAxis};
use crate::data::MarketData;
use crate::error::{EngineError, Result, StrategyPhase};
use crate::model::{Scope, Strategy};
use crate::panel::Panel;
use crate::script::{param_view, Harness, ScriptError};

#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    pub initial_fund: f64,
    pub slippage_rate: f64,
    pub lot_size: u32,
}

/// The strictly sequential daily event loop. Per day, in fixed order:
/// settle pending orders at the open, mark to market at the close, run the
/// risk-control hook, then the selector if a rebalance is due. Orders
/// queued today execute at tomorrow's open; orders still pending past the
/// range end are dropped.
pub struct Simulator<'a> {
    strategy: &'a Strategy,
    panel: &'a Panel,
    axis: &'a DayAxis,
    harness: &'a Harness,
    params: SimParams,
    select_ast: AST,
    risk_ast: AST,
    /// Per symbol: (opens, closes) aligned to the report days.
    prices: FxHashMap<String, (Vec<Option<f64>>, Vec<Option<f64>>)>,
    /// Candidate set per report day, prefetched so the loop never touches
    /// the data source.
    universes: Vec<Vec<String>>,
}

impl<'a> Simulator<'a> {
    pub fn new(
        store: &dyn MarketData,
        strategy: &'a Strategy,
        panel: &'a Panel,
        axis: &'a DayAxis,
        harness: &'a Harness,
        params: SimParams,
    ) -> Result<Self> {
        let select_ast = harness
            .compile(&strategy.select_func)
            .map_err(|e| compile_error(StrategyPhase::Select, axis, &e))?;
        let risk_ast = harness
            .compile(&strategy.risk_control_func)
            .map_err(|e| compile_error(StrategyPhase::RiskControl, axis, &e))?;

        let report_days = axis.report_days();
        let mut prices = FxHashMap::default();
        for symbol in panel.symbols() {
            let opens = store.column(symbol, report_days, "daily", "open")?;
            let closes = store.column(symbol, report_days, "daily", "close")?;
            prices.insert(symbol.clone(), (opens, closes));
        }

        let universes = report_days
            .iter()
            .map(|&day| universe(store, &strategy.scope, day))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            strategy,
            panel,
            axis,
            harness,
            params,
            select_ast,
            risk_ast,
            prices,
            universes,
        })
    }

    /// Run the loop. `cancelled` is polled at each day boundary; a true
    /// return abandons the pass and yields `Ok(None)` — cancellation is
    /// not an error.
    pub fn run(&self, cancelled: impl Fn() -> bool) -> Result<Option<Portfolio>> {
        let mut portfolio = Portfolio::new(self.params.initial_fund);
        let mut pending: Vec<PendingOrder> = Vec::new();
        let mut last_price: FxHashMap<String, f64> = FxHashMap::default();
        let mut last_rebalance: Option<usize> = None;
        let context = Harness::new_context();

        let report_days: Vec<NaiveDate> = self.axis.report_days().to_vec();
        for (i, &day) in report_days.iter().enumerate() {
            if cancelled() {
                tracing::info!(%day, "backtest cancelled at day boundary");
                return Ok(None);
            }

            self.settle(&mut portfolio, &mut pending, &mut last_price, i, day);
            self.mark_to_market(&mut portfolio, &mut last_price, i, day);
            self.risk_control(&portfolio, &mut pending, i, day, &context)?;

            let due = match (&self.strategy.scope, last_rebalance) {
                (Scope::SingleStock { .. }, _) | (_, None) => true,
                (_, Some(last)) => i - last >= self.strategy.rebalance_interval,
            };
            if due {
                self.rebalance(&portfolio, &mut pending, i, day, &context)?;
                last_rebalance = Some(i);
            }
        }

        Ok(Some(portfolio))
    }

    fn open_price(&self, symbol: &str, i: usize) -> Option<f64> {
        self.prices.get(symbol).and_then(|(opens, _)| opens[i])
    }

    fn close_price(&self, symbol: &str, i: usize) -> Option<f64> {
        self.prices.get(symbol).and_then(|(_, closes)| closes[i])
    }

    /// Execute pending orders at today's open: sells first, then buys with
    /// equal-cash allocation of the post-sell balance. Orders whose open
    /// is absent (suspension) defer, and cancel after five misses.
    fn settle(
        &self,
        portfolio: &mut Portfolio,
        pending: &mut Vec<PendingOrder>,
        last_price: &mut FxHashMap<String, f64>,
        i: usize,
        day: NaiveDate,
    ) {
        let mut deferred: Vec<PendingOrder> = Vec::new();
        let mut sells: Vec<(String, f64)> = Vec::new();
        let mut buys: Vec<(String, f64)> = Vec::new();

        for mut order in pending.drain(..) {
            match self.open_price(&order.symbol, i) {
                Some(open) => match order.side {
                    Side::Sell => sells.push((order.symbol, open)),
                    Side::Buy => buys.push((order.symbol, open)),
                },
                None => {
                    order.misses += 1;
                    if order.misses >= MAX_ORDER_MISSES {
                        tracing::warn!(
                            symbol = %order.symbol, side = ?order.side, %day,
                            "order cancelled after {MAX_ORDER_MISSES} suspended days"
                        );
                    } else {
                        deferred.push(order);
                    }
                }
            }
        }

        for (symbol, open) in sells {
            let price = open * (1.0 - self.params.slippage_rate);
            let proceeds =
                portfolio.sell_all(&symbol, day, price, self.strategy.sell_fee_rate);
            if proceeds > 0.0 {
                last_price.insert(symbol, price);
            }
        }

        if !buys.is_empty() {
            let budget = portfolio.cash / buys.len() as f64;
            let lot = f64::from(self.params.lot_size);
            for (symbol, open) in buys {
                let price = open * (1.0 + self.params.slippage_rate);
                let per_share = price * (1.0 + self.strategy.buy_fee_rate);
                let shares = (budget / per_share / lot).floor() * lot;
                if shares < lot {
                    tracing::warn!(%symbol, %day, "buy dropped: budget below one lot");
                    continue;
                }
                let cost = shares * per_share;
                if cost > portfolio.cash + 1e-9 {
                    tracing::warn!(%symbol, %day, "buy dropped: would overdraw cash");
                    continue;
                }
                portfolio.buy(&symbol, day, shares, price, self.strategy.buy_fee_rate);
                last_price.insert(symbol, price);
            }
        }

        *pending = deferred;
    }

    /// Equity = cash + Σ shares × close. A suspended close falls back to
    /// the last traded price so held positions never value at zero.
    fn mark_to_market(
        &self,
        portfolio: &mut Portfolio,
        last_price: &mut FxHashMap<String, f64>,
        i: usize,
        day: NaiveDate,
    ) {
        for symbol in portfolio.held_symbols() {
            if let Some(close) = self.close_price(&symbol, i) {
                last_price.insert(symbol, close);
            }
        }
        portfolio.mark(day, |symbol| {
            self.close_price(symbol, i)
                .or_else(|| last_price.get(symbol).copied())
                .unwrap_or(0.0)
        });
    }

    fn risk_control(
        &self,
        portfolio: &Portfolio,
        pending: &mut Vec<PendingOrder>,
        i: usize,
        day: NaiveDate,
        context: &Dynamic,
    ) -> Result<()> {
        let holdings = portfolio.held_symbols();
        let views = self.views_for(&holdings, i);
        let retained = self
            .harness
            .eval_risk_control(&self.risk_ast, &holdings, views, &iso(day), context)
            .map_err(|e| strategy_error(StrategyPhase::RiskControl, day, &e))?;

        // The hook may only reduce holdings: anything held but not
        // retained is queued for sale at the next open.
        for symbol in holdings {
            if !retained.contains(&symbol) && !has_pending(pending, &symbol, Side::Sell) {
                pending.push(PendingOrder {
                    symbol,
                    side: Side::Sell,
                    misses: 0,
                });
            }
        }
        Ok(())
    }

    fn rebalance(
        &self,
        portfolio: &Portfolio,
        pending: &mut Vec<PendingOrder>,
        i: usize,
        day: NaiveDate,
        context: &Dynamic,
    ) -> Result<()> {
        let candidates = &self.universes[i];
        if candidates.is_empty() {
            tracing::debug!(%day, "empty candidate set, selector skipped");
            return Ok(());
        }

        // Holdings net of sells already queued by risk control today.
        let holdings: Vec<String> = portfolio
            .held_symbols()
            .into_iter()
            .filter(|s| !has_pending(pending, s, Side::Sell))
            .collect();

        let views = self.views_for(candidates, i);
        let mut target = self
            .harness
            .eval_select(
                &self.select_ast,
                candidates,
                views,
                self.strategy.position_count,
                &holdings,
                &iso(day),
                context,
            )
            .map_err(|e| strategy_error(StrategyPhase::Select, day, &e))?;
        target.truncate(self.strategy.position_count);

        for symbol in &holdings {
            if !target.contains(symbol) && !has_pending(pending, symbol, Side::Sell) {
                pending.push(PendingOrder {
                    symbol: symbol.clone(),
                    side: Side::Sell,
                    misses: 0,
                });
            }
        }
        for symbol in target {
            if !holdings.contains(&symbol)
                && !has_pending(pending, &symbol, Side::Buy)
                && !has_pending(pending, &symbol, Side::Sell)
            {
                pending.push(PendingOrder {
                    symbol,
                    side: Side::Buy,
                    misses: 0,
                });
            }
        }
        Ok(())
    }

    /// Per-symbol view of the strategy's declared params, keyed symbol ->
    /// fqname -> value. Symbols outside the panel grid read as missing.
    fn views_for(&self, symbols: &[String], i: usize) -> Map {
        let day_idx = self.axis.report_range().start() + i;
        let mut views = Map::new();
        for symbol in symbols {
            let sym_idx = self.panel.sym_idx(symbol);
            let view = param_view(self.strategy.params.iter().map(|fq| {
                let value = sym_idx.and_then(|s| self.panel.value(fq, s, day_idx));
                (fq.clone(), value)
            }));
            views.insert(symbol.as_str().into(), Dynamic::from_map(view));
        }
        views
    }
}

fn iso(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn has_pending(pending: &[PendingOrder], symbol: &str, side: Side) -> bool {
    pending.iter().any(|o| o.symbol == symbol && o.side == side)
}

fn strategy_error(phase: StrategyPhase, day: NaiveDate, e: &ScriptError) -> EngineError {
    match e {
        ScriptError::Timeout => EngineError::UserCodeTimeout(phase.to_string()),
        ScriptError::Failed(message) => EngineError::UserStrategyError {
            day,
            phase,
            message: message.clone(),
        },
    }
}

fn compile_error(phase: StrategyPhase, axis: &DayAxis, e: &ScriptError) -> EngineError {
    let day = axis.report_days().first().copied().unwrap_or(axis.day(0));
    match e {
        ScriptError::Timeout => EngineError::UserCodeTimeout(phase.to_string()),
        ScriptError::Failed(message) => EngineError::UserStrategyError {
            day,
            phase,
            message: format!("compile error: {message}"),
        },
    }
}
