use serde_json::{json, Value};

use crate::sim::portfolio::{EquityPoint, Fill, Side};

const GREEN: &str = "#26a69a";
const RED: &str = "#ef5350";

/// Chart payloads are pre-serialised in the chart engine's trace schema
/// (`x`/`y`/`type`/`name`/`marker`) so the UI renders without further
/// computation.
#[derive(Debug, Clone)]
pub struct ChartBundle {
    pub returns_chart: Value,
    pub daily_pnl_chart: Value,
    pub daily_trades_chart: Value,
}

impl ChartBundle {
    pub fn to_json(&self) -> Value {
        json!({
            "returns_chart": self.returns_chart,
            "daily_pnl_chart": self.daily_pnl_chart,
            "daily_trades_chart": self.daily_trades_chart,
        })
    }
}

pub fn build(equity: &[EquityPoint], benchmark: &[Option<f64>], fills: &[Fill]) -> ChartBundle {
    ChartBundle {
        returns_chart: returns_chart(equity, benchmark),
        daily_pnl_chart: daily_pnl_chart(equity),
        daily_trades_chart: daily_trades_chart(equity, fills),
    }
}

fn day_labels(equity: &[EquityPoint]) -> Vec<String> {
    equity
        .iter()
        .map(|p| p.day.format("%Y-%m-%d").to_string())
        .collect()
}

/// Cumulative strategy vs. benchmark vs. excess, all in percent. A missing
/// benchmark close carries the last seen value so every trace has the full
/// range length.
fn returns_chart(equity: &[EquityPoint], benchmark: &[Option<f64>]) -> Value {
    let days = day_labels(equity);
    let base = equity.first().map_or(1.0, |p| p.value);
    let strategy: Vec<f64> = equity
        .iter()
        .map(|p| if base > 0.0 { (p.value / base - 1.0) * 100.0 } else { 0.0 })
        .collect();

    let mut bench = Vec::with_capacity(equity.len());
    let mut bench_base: Option<f64> = None;
    let mut last = 0.0;
    for i in 0..equity.len() {
        let close = benchmark.get(i).copied().flatten();
        if bench_base.is_none() {
            bench_base = close;
        }
        if let (Some(b0), Some(c)) = (bench_base, close) {
            if b0 > 0.0 {
                last = (c / b0 - 1.0) * 100.0;
            }
        }
        bench.push(last);
    }

    let excess: Vec<f64> = strategy
        .iter()
        .zip(&bench)
        .map(|(s, b)| s - b)
        .collect();

    json!({
        "data": [
            { "x": days, "y": strategy, "type": "scatter", "name": "strategy" },
            { "x": days, "y": bench, "type": "scatter", "name": "benchmark" },
            { "x": days, "y": excess, "type": "scatter", "name": "excess" },
        ],
        "layout": {
            "title": "Cumulative return",
            "yaxis": { "ticksuffix": "%" },
        },
    })
}

/// Daily equity changes as bars, positive green / negative red.
fn daily_pnl_chart(equity: &[EquityPoint]) -> Value {
    let days = day_labels(equity);
    let pnl: Vec<f64> = std::iter::once(0.0)
        .chain(equity.windows(2).map(|w| w[1].value - w[0].value))
        .collect();
    let colors: Vec<&str> = pnl
        .iter()
        .map(|p| if *p < 0.0 { RED } else { GREEN })
        .collect();

    json!({
        "data": [
            { "x": days, "y": pnl, "type": "bar", "name": "daily P&L",
              "marker": { "color": colors } },
        ],
        "layout": { "title": "Daily P&L" },
    })
}

/// Daily position opens vs. closes, counted from the fill log.
fn daily_trades_chart(equity: &[EquityPoint], fills: &[Fill]) -> Value {
    let days = day_labels(equity);
    let mut opens = vec![0u32; equity.len()];
    let mut closes = vec![0u32; equity.len()];
    for fill in fills {
        if let Some(i) = equity.iter().position(|p| p.day == fill.day) {
            match fill.side {
                Side::Buy => opens[i] += 1,
                Side::Sell => closes[i] += 1,
            }
        }
    }

    json!({
        "data": [
            { "x": days, "y": opens, "type": "bar", "name": "opens",
              "marker": { "color": GREEN } },
            { "x": days, "y": closes, "type": "bar", "name": "closes",
              "marker": { "color": RED } },
        ],
        "layout": { "title": "Daily trades", "barmode": "group" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                day: NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
                    + chrono::Duration::days(i as i64),
                value,
            })
            .collect()
    }

    #[test]
    fn returns_chart_has_three_full_traces() {
        let equity = curve(&[100.0, 104.0, 108.0]);
        let bench = vec![Some(4000.0), Some(4080.0), Some(4200.0)];
        let chart = returns_chart(&equity, &bench);
        let traces = chart["data"].as_array().unwrap();
        assert_eq!(traces.len(), 3);
        let names: Vec<&str> = traces.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["strategy", "benchmark", "excess"]);
        for trace in traces {
            assert_eq!(trace["y"].as_array().unwrap().len(), 3);
        }
        // Final values: strategy +8%, benchmark +5%, excess +3%.
        let last = |idx: usize| traces[idx]["y"].as_array().unwrap()[2].as_f64().unwrap();
        assert!((last(0) - 8.0).abs() < 1e-9);
        assert!((last(1) - 5.0).abs() < 1e-9);
        assert!((last(2) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn benchmark_gap_carries_forward() {
        let equity = curve(&[100.0, 100.0, 100.0]);
        let bench = vec![Some(100.0), None, Some(110.0)];
        let chart = returns_chart(&equity, &bench);
        let y = chart["data"][1]["y"].as_array().unwrap();
        assert!((y[0].as_f64().unwrap() - 0.0).abs() < 1e-9);
        assert!((y[1].as_f64().unwrap() - 0.0).abs() < 1e-9);
        assert!((y[2].as_f64().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_bars_colored_by_sign() {
        let equity = curve(&[100.0, 110.0, 105.0]);
        let chart = daily_pnl_chart(&equity);
        let colors = chart["data"][0]["marker"]["color"].as_array().unwrap();
        assert_eq!(colors[1].as_str().unwrap(), GREEN);
        assert_eq!(colors[2].as_str().unwrap(), RED);
    }

    #[test]
    fn trade_counts_split_by_side() {
        let equity = curve(&[100.0, 100.0]);
        let day2 = equity[1].day;
        let fills = vec![
            Fill {
                day: day2,
                symbol: "a".to_string(),
                side: Side::Buy,
                shares: 100.0,
                price: 1.0,
                amount: 100.0,
                fee: 0.0,
            },
            Fill {
                day: day2,
                symbol: "b".to_string(),
                side: Side::Sell,
                shares: 100.0,
                price: 1.0,
                amount: 100.0,
                fee: 0.0,
            },
        ];
        let chart = daily_trades_chart(&equity, &fills);
        assert_eq!(chart["data"][0]["y"][1].as_u64().unwrap(), 1);
        assert_eq!(chart["data"][1]["y"][1].as_u64().unwrap(), 1);
    }
}
