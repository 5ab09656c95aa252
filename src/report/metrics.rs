use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sim::portfolio::{EquityPoint, Fill, Side};

/// Performance summary of one backtest pass. Ratios that are undefined for
/// the realised path (zero volatility, no round trips, no losers) are
/// `None` and serialise as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return: f64,
    pub annual_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: Option<f64>,
    pub win_rate: Option<f64>,
    pub profit_loss_ratio: Option<f64>,
    pub trade_count: usize,
}

/// A FIFO-matched buy/sell pair on one symbol. Fees are folded into the
/// per-share cost and proceeds.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub symbol: String,
    pub shares: f64,
    pub pnl: f64,
}

pub fn compute(equity: &[EquityPoint], fills: &[Fill], trading_days_per_year: u32) -> Metrics {
    let trade_count = fills.len();
    if equity.is_empty() {
        return Metrics {
            total_return: 0.0,
            annual_return: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: None,
            win_rate: None,
            profit_loss_ratio: None,
            trade_count,
        };
    }

    let first = equity[0].value;
    let last = equity[equity.len() - 1].value;
    let total_return = if first > 0.0 { last / first - 1.0 } else { 0.0 };

    let n = equity.len() - 1;
    let annual_return = if n > 0 {
        (1.0 + total_return).powf(f64::from(trading_days_per_year) / n as f64) - 1.0
    } else {
        0.0
    };

    let returns = daily_returns(equity);
    let sharpe_ratio = sharpe(&returns, trading_days_per_year);
    let max_drawdown = drawdown(equity);

    let trips = round_trips(fills);
    let (win_rate, profit_loss_ratio) = trip_stats(&trips);

    Metrics {
        total_return,
        annual_return,
        max_drawdown,
        sharpe_ratio,
        win_rate,
        profit_loss_ratio,
        trade_count,
    }
}

fn daily_returns(equity: &[EquityPoint]) -> Vec<f64> {
    equity
        .windows(2)
        .filter(|w| w[0].value > 0.0)
        .map(|w| w[1].value / w[0].value - 1.0)
        .collect()
}

/// `mean / stddev * sqrt(annualisation)`; undefined for a flat path.
fn sharpe(returns: &[f64], trading_days_per_year: u32) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (returns.len() - 1) as f64;
    let std = variance.sqrt();
    if std > 0.0 {
        Some(mean / std * f64::from(trading_days_per_year).sqrt())
    } else {
        None
    }
}

/// Largest peak-to-trough decline, expressed positive.
fn drawdown(equity: &[EquityPoint]) -> f64 {
    let mut peak = equity[0].value;
    let mut max_dd = 0.0;
    for point in equity {
        if point.value > peak {
            peak = point.value;
        }
        if peak > 0.0 {
            let dd = (peak - point.value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Match fills into round trips, FIFO per symbol. A sell consumes the
/// oldest open buy lots first; partially consumed lots stay queued.
pub fn round_trips(fills: &[Fill]) -> Vec<RoundTrip> {
    // Open buy lots per symbol: (remaining shares, cost per share incl. fee).
    let mut open: HashMap<&str, Vec<(f64, f64)>> = HashMap::new();
    let mut trips = Vec::new();

    for fill in fills {
        match fill.side {
            Side::Buy => {
                let cost_per_share = (fill.amount + fill.fee) / fill.shares;
                open.entry(&fill.symbol)
                    .or_default()
                    .push((fill.shares, cost_per_share));
            }
            Side::Sell => {
                let net_per_share = (fill.amount - fill.fee) / fill.shares;
                let mut remaining = fill.shares;
                let lots = open.entry(&fill.symbol).or_default();
                while remaining > 0.0 {
                    let Some((lot_shares, cost)) = lots.first_mut() else {
                        break;
                    };
                    let matched = remaining.min(*lot_shares);
                    trips.push(RoundTrip {
                        symbol: fill.symbol.clone(),
                        shares: matched,
                        pnl: matched * (net_per_share - *cost),
                    });
                    *lot_shares -= matched;
                    remaining -= matched;
                    if *lot_shares <= 0.0 {
                        lots.remove(0);
                    }
                }
            }
        }
    }
    trips
}

fn trip_stats(trips: &[RoundTrip]) -> (Option<f64>, Option<f64>) {
    if trips.is_empty() {
        return (None, None);
    }
    let wins: Vec<f64> = trips.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = trips.iter().map(|t| t.pnl).filter(|p| *p < 0.0).collect();

    let win_rate = Some(wins.len() as f64 / trips.len() as f64);
    let profit_loss_ratio = if losses.is_empty() {
        None
    } else if wins.is_empty() {
        Some(0.0)
    } else {
        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Some(avg_win / avg_loss.abs())
    };
    (win_rate, profit_loss_ratio)
}
