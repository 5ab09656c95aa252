use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::cell::Cell;
use std::time::{Duration, Instant};

/// User callables are opaque scripts. Each defines one well-known entry
/// point:
///
/// - indicators:      `fn calculate(params)`
/// - strategy select: `fn select(candidates, params, position_count, holdings, day, context)`
/// - risk control:    `fn risk_control(holdings, params, day, context)`
///
/// The missing sentinel is the unit value `()`; user code tests for it
/// explicitly (`params["a.close"] == ()`). The harness never substitutes
/// zero for absent data.
pub struct Harness {
    engine: Engine,
    budget: Duration,
}

/// Why a user-code invocation failed. Callers attach entity/day context
/// when mapping into the engine error taxonomy.
#[derive(Debug)]
pub enum ScriptError {
    /// The per-call wall-clock budget was exceeded.
    Timeout,
    /// The script raised, or its return value had the wrong shape.
    Failed(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

impl Harness {
    pub fn new(budget: Duration) -> Self {
        let mut engine = Engine::new();
        // Scripts are trust-scoped to authenticated analysts; rhai exposes
        // no filesystem or network surface, so the remaining risks are
        // runaway loops and pathological nesting.
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.on_progress(|_| {
            DEADLINE.with(|d| match d.get() {
                Some(deadline) if Instant::now() > deadline => Some("time budget exceeded".into()),
                _ => None,
            })
        });
        Self { engine, budget }
    }

    /// Compile a script once per job; the AST is reused for every
    /// per-(symbol, day) invocation.
    pub fn compile(&self, source: &str) -> ScriptResult<AST> {
        self.engine
            .compile(source)
            .map_err(|e| ScriptError::Failed(e.to_string()))
    }

    /// Fresh shared `context` map for one backtest. Clones alias the same
    /// storage, so mutations made by one call are visible to the next.
    pub fn new_context() -> Dynamic {
        Dynamic::from_map(Map::new()).into_shared()
    }

    fn call(&self, ast: &AST, entry: &str, args: Vec<Dynamic>) -> ScriptResult<Dynamic> {
        let mut scope = Scope::new();
        DEADLINE.with(|d| d.set(Some(Instant::now() + self.budget)));
        let result = self
            .engine
            .call_fn::<Dynamic>(&mut scope, ast, entry, args)
            .map_err(|e| match *e {
                rhai::EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout,
                ref other => ScriptError::Failed(other.to_string()),
            });
        DEADLINE.with(|d| d.set(None));
        result
    }

    /// Invoke an indicator. `Ok(None)` when the script returns the missing
    /// sentinel; any other non-numeric return is an error.
    pub fn eval_indicator(&self, ast: &AST, view: Map) -> ScriptResult<Option<f64>> {
        let out = self.call(ast, "calculate", vec![Dynamic::from_map(view)])?;
        to_number(&out).map_err(ScriptError::Failed)
    }

    /// Invoke a strategy selector. Returns the target holdings list.
    #[allow(clippy::too_many_arguments)]
    pub fn eval_select(
        &self,
        ast: &AST,
        candidates: &[String],
        views: Map,
        position_count: usize,
        holdings: &[String],
        day: &str,
        context: &Dynamic,
    ) -> ScriptResult<Vec<String>> {
        let out = self.call(
            ast,
            "select",
            vec![
                string_array(candidates),
                Dynamic::from_map(views),
                Dynamic::from_int(position_count as i64),
                string_array(holdings),
                day.into(),
                context.clone(),
            ],
        )?;
        to_symbol_list(out).map_err(ScriptError::Failed)
    }

    /// Invoke a risk-control hook. Returns the retained holdings list.
    pub fn eval_risk_control(
        &self,
        ast: &AST,
        holdings: &[String],
        views: Map,
        day: &str,
        context: &Dynamic,
    ) -> ScriptResult<Vec<String>> {
        let out = self.call(
            ast,
            "risk_control",
            vec![
                string_array(holdings),
                Dynamic::from_map(views),
                day.into(),
                context.clone(),
            ],
        )?;
        to_symbol_list(out).map_err(ScriptError::Failed)
    }
}

/// Build one per-symbol parameter view: fqname -> value or `()`.
pub fn param_view(entries: impl IntoIterator<Item = (String, Option<f64>)>) -> Map {
    let mut map = Map::new();
    for (fqname, value) in entries {
        let cell = match value {
            Some(v) => Dynamic::from_float(v),
            None => Dynamic::UNIT,
        };
        map.insert(fqname.into(), cell);
    }
    map
}

fn string_array(items: &[String]) -> Dynamic {
    Dynamic::from_array(items.iter().map(|s| s.clone().into()).collect())
}

fn to_number(value: &Dynamic) -> Result<Option<f64>, String> {
    if value.is_unit() {
        return Ok(None);
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return Ok(Some(f));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Ok(Some(i as f64));
    }
    Err(format!(
        "expected a number or the missing sentinel, got {}",
        value.type_name()
    ))
}

fn to_symbol_list(value: Dynamic) -> Result<Vec<String>, String> {
    let type_name = value.type_name();
    let Some(array) = value.try_cast::<rhai::Array>() else {
        return Err(format!("expected an array of symbols, got {type_name}"));
    };
    array
        .into_iter()
        .map(|item| {
            item.into_string()
                .map_err(|t| format!("expected a symbol string in the result, got {t}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> Harness {
        Harness::new(Duration::from_millis(1000))
    }

    #[test]
    fn indicator_returns_number() {
        let h = harness();
        let ast = h
            .compile("fn calculate(params) { params[\"u.a\"] * 2.0 }")
            .unwrap();
        let view = param_view([("u.a".to_string(), Some(3.5))]);
        assert_eq!(h.eval_indicator(&ast, view).unwrap(), Some(7.0));
    }

    #[test]
    fn indicator_integer_return_coerced() {
        let h = harness();
        let ast = h.compile("fn calculate(params) { 42 }").unwrap();
        assert_eq!(h.eval_indicator(&ast, Map::new()).unwrap(), Some(42.0));
    }

    #[test]
    fn missing_sentinel_observable_and_returnable() {
        let h = harness();
        let ast = h
            .compile(
                "fn calculate(params) {
                    if params[\"u.a\"] == () { return (); }
                    params[\"u.a\"] + 1.0
                }",
            )
            .unwrap();
        let absent = param_view([("u.a".to_string(), None)]);
        assert_eq!(h.eval_indicator(&ast, absent).unwrap(), None);
        let present = param_view([("u.a".to_string(), Some(1.0))]);
        assert_eq!(h.eval_indicator(&ast, present).unwrap(), Some(2.0));
    }

    #[test]
    fn non_numeric_return_is_error() {
        let h = harness();
        let ast = h.compile("fn calculate(params) { \"oops\" }").unwrap();
        let err = h.eval_indicator(&ast, Map::new()).unwrap_err();
        assert!(matches!(err, ScriptError::Failed(_)));
    }

    #[test]
    fn script_exception_is_error() {
        let h = harness();
        let ast = h
            .compile("fn calculate(params) { throw \"bad data\"; }")
            .unwrap();
        let err = h.eval_indicator(&ast, Map::new()).unwrap_err();
        let ScriptError::Failed(msg) = err else {
            panic!("expected Failed");
        };
        assert!(msg.contains("bad data"));
    }

    #[test]
    fn runaway_loop_hits_time_budget() {
        let h = Harness::new(Duration::from_millis(50));
        let ast = h
            .compile("fn calculate(params) { let x = 0.0; loop { x += 1.0; } }")
            .unwrap();
        let err = h.eval_indicator(&ast, Map::new()).unwrap_err();
        assert!(matches!(err, ScriptError::Timeout));
    }

    #[test]
    fn select_returns_symbol_list() {
        let h = harness();
        let ast = h
            .compile(
                "fn select(candidates, params, position_count, holdings, day, context) {
                    let picked = [];
                    for stock in candidates {
                        if params[stock][\"u.close_0\"] != () { picked.push(stock); }
                    }
                    picked
                }",
            )
            .unwrap();
        let mut views = Map::new();
        views.insert(
            "000001.SZ".into(),
            Dynamic::from_map(param_view([("u.close_0".to_string(), Some(10.0))])),
        );
        views.insert(
            "000002.SZ".into(),
            Dynamic::from_map(param_view([("u.close_0".to_string(), None)])),
        );
        let ctx = Harness::new_context();
        let picked = h
            .eval_select(
                &ast,
                &["000001.SZ".to_string(), "000002.SZ".to_string()],
                views,
                3,
                &[],
                "2023-01-04",
                &ctx,
            )
            .unwrap();
        assert_eq!(picked, vec!["000001.SZ".to_string()]);
    }

    #[test]
    fn context_mutations_survive_across_calls() {
        let h = harness();
        let ast = h
            .compile(
                "fn risk_control(holdings, params, day, context) {
                    let n = if \"days_seen\" in context { context[\"days_seen\"] } else { 0 };
                    context[\"days_seen\"] = n + 1;
                    holdings
                }",
            )
            .unwrap();
        let ctx = Harness::new_context();
        for _ in 0..3 {
            h.eval_risk_control(&ast, &[], Map::new(), "2023-01-04", &ctx)
                .unwrap();
        }
        let map = ctx.read_lock::<Map>().unwrap();
        let seen = map.get("days_seen").unwrap().as_int().unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn bad_select_shape_is_error() {
        let h = harness();
        let ast = h
            .compile("fn select(c, p, n, h, d, ctx) { 1.0 }")
            .unwrap();
        let ctx = Harness::new_context();
        let err = h
            .eval_select(&ast, &[], Map::new(), 1, &[], "2023-01-04", &ctx)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Failed(_)));
    }
}
