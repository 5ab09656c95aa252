use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// One executed order. Fees are reported separately from the notional:
/// buys pay `amount + fee` out of cash, sells credit `amount - fee`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub day: NaiveDate,
    pub symbol: String,
    pub side: Side,
    pub shares: f64,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub day: NaiveDate,
    pub value: f64,
}

/// An order queued for next-open settlement. `misses` counts consecutive
/// days the open price was absent (suspension); five misses cancel it.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: Side,
    pub misses: u32,
}

pub const MAX_ORDER_MISSES: u32 = 5;

/// Cash, holdings and the audit trail of one simulation pass.
#[derive(Debug)]
pub struct Portfolio {
    pub cash: f64,
    /// `symbol -> shares`; entries are always > 0 shares.
    pub holdings: BTreeMap<String, f64>,
    pub fills: Vec<Fill>,
    pub equity: Vec<EquityPoint>,
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            holdings: BTreeMap::new(),
            fills: Vec::new(),
            equity: Vec::new(),
        }
    }

    pub fn held_symbols(&self) -> Vec<String> {
        self.holdings.keys().cloned().collect()
    }

    pub fn shares(&self, symbol: &str) -> f64 {
        self.holdings.get(symbol).copied().unwrap_or(0.0)
    }

    /// Sell the full position at `price`, charging `fee_rate` on the
    /// notional. Returns the net proceeds credited to cash.
    pub fn sell_all(&mut self, symbol: &str, day: NaiveDate, price: f64, fee_rate: f64) -> f64 {
        let Some(shares) = self.holdings.remove(symbol) else {
            return 0.0;
        };
        let amount = shares * price;
        let fee = amount * fee_rate;
        self.cash += amount - fee;
        self.fills.push(Fill {
            day,
            symbol: symbol.to_string(),
            side: Side::Sell,
            shares,
            price,
            amount,
            fee,
        });
        amount - fee
    }

    /// Buy `shares` at `price`, charging `fee_rate` on the notional.
    pub fn buy(&mut self, symbol: &str, day: NaiveDate, shares: f64, price: f64, fee_rate: f64) {
        let amount = shares * price;
        let fee = amount * fee_rate;
        self.cash -= amount + fee;
        *self.holdings.entry(symbol.to_string()).or_insert(0.0) += shares;
        self.fills.push(Fill {
            day,
            symbol: symbol.to_string(),
            side: Side::Buy,
            shares,
            price,
            amount,
            fee,
        });
    }

    /// Mark to market: cash plus every position at its closing price.
    pub fn mark(&mut self, day: NaiveDate, price_of: impl Fn(&str) -> f64) {
        let positions: f64 = self
            .holdings
            .iter()
            .map(|(symbol, shares)| shares * price_of(symbol))
            .sum();
        self.equity.push(EquityPoint {
            day,
            value: self.cash + positions,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, day).unwrap()
    }

    #[test]
    fn buy_then_sell_roundtrip_cash_identity() {
        let mut p = Portfolio::new(100_000.0);
        p.buy("000001.SZ", d(5), 9000.0, 10.0, 0.0003);
        let buy_cost = 90_000.0 + 90_000.0 * 0.0003;
        assert!((p.cash - (100_000.0 - buy_cost)).abs() < 1e-9);
        assert_eq!(p.shares("000001.SZ"), 9000.0);

        let proceeds = p.sell_all("000001.SZ", d(6), 10.5, 0.0013);
        let gross = 9000.0 * 10.5;
        assert!((proceeds - (gross - gross * 0.0013)).abs() < 1e-9);
        assert!(p.holdings.is_empty());

        // final cash = initial - (buy cost + fee) + (sell amount - fee)
        let expected = 100_000.0 - buy_cost + proceeds;
        assert!((p.cash - expected).abs() < 1e-9);
        assert_eq!(p.fills.len(), 2);
    }

    #[test]
    fn sell_unknown_symbol_is_noop() {
        let mut p = Portfolio::new(1000.0);
        assert_eq!(p.sell_all("600000.SH", d(5), 10.0, 0.001), 0.0);
        assert!(p.fills.is_empty());
        assert!((p.cash - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mark_includes_positions_at_close() {
        let mut p = Portfolio::new(10_000.0);
        p.buy("000001.SZ", d(5), 100.0, 10.0, 0.0);
        p.mark(d(5), |_| 11.0);
        let point = p.equity.last().unwrap();
        assert_eq!(point.day, d(5));
        assert!((point.value - (9000.0 + 1100.0)).abs() < 1e-9);
    }

    #[test]
    fn held_symbols_sorted() {
        let mut p = Portfolio::new(100_000.0);
        p.buy("600000.SH", d(5), 100.0, 10.0, 0.0);
        p.buy("000001.SZ", d(5), 100.0, 10.0, 0.0);
        assert_eq!(
            p.held_symbols(),
            vec!["000001.SZ".to_string(), "600000.SH".to_string()]
        );
    }
}
