use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use super::{EntityStore, MarketData};
use crate::error::Result;
use crate::model::{fqname, Indicator, Param, Strategy};

type RowKey = (String, String, NaiveDate);

/// In-memory market-data cache. The primary store for tests; also usable
/// by embedders that populate rows programmatically.
#[derive(Debug, Default)]
pub struct MemStore {
    /// `(table, symbol, day) -> column -> value`
    rows: HashMap<RowKey, HashMap<String, f64>>,
    open_days: BTreeSet<NaiveDate>,
    /// `symbol -> (list_date, delist_date)`
    listings: HashMap<String, (NaiveDate, Option<NaiveDate>)>,
    /// `(index_code, snapshot_day) -> members`
    index_members: BTreeMap<(String, NaiveDate), Vec<String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_open_day(&mut self, day: NaiveDate) {
        self.open_days.insert(day);
    }

    pub fn list_symbol(&mut self, symbol: &str, list_date: NaiveDate, delist: Option<NaiveDate>) {
        self.listings
            .insert(symbol.to_string(), (list_date, delist));
    }

    pub fn put(&mut self, table: &str, symbol: &str, day: NaiveDate, column: &str, value: f64) {
        self.rows
            .entry((table.to_string(), symbol.to_string(), day))
            .or_default()
            .insert(column.to_string(), value);
    }

    /// Insert a full `daily` row in one call.
    pub fn put_daily(&mut self, symbol: &str, day: NaiveDate, open: f64, close: f64) {
        self.put("daily", symbol, day, "open", open);
        self.put("daily", symbol, day, "close", close);
    }

    pub fn set_index_members(&mut self, index_code: &str, snapshot: NaiveDate, members: &[&str]) {
        self.index_members.insert(
            (index_code.to_string(), snapshot),
            members.iter().map(|s| (*s).to_string()).collect(),
        );
    }
}

impl MarketData for MemStore {
    fn cell(
        &self,
        symbol: &str,
        day: NaiveDate,
        table: &str,
        column: &str,
    ) -> Result<Option<f64>> {
        Ok(self
            .rows
            .get(&(table.to_string(), symbol.to_string(), day))
            .and_then(|cols| cols.get(column))
            .copied())
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        Ok(self.open_days.range(start..=end).copied().collect())
    }

    fn prev_trading_days(&self, before: NaiveDate, count: usize) -> Result<Vec<NaiveDate>> {
        let mut days: Vec<NaiveDate> = self
            .open_days
            .range(..before)
            .rev()
            .take(count)
            .copied()
            .collect();
        days.reverse();
        Ok(days)
    }

    fn next_trading_days(&self, after: NaiveDate, count: usize) -> Result<Vec<NaiveDate>> {
        use std::ops::Bound;
        Ok(self
            .open_days
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(count)
            .copied()
            .collect())
    }

    fn listed_symbols(&self, day: NaiveDate) -> Result<Vec<String>> {
        let mut out: Vec<String> = self
            .listings
            .iter()
            .filter(|(sym, (list, delist))| {
                *list <= day
                    && delist.is_none_or(|dl| day < dl)
                    && self
                        .rows
                        .contains_key(&("daily".to_string(), (*sym).clone(), day))
            })
            .map(|(sym, _)| sym.clone())
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    fn index_members(&self, index_code: &str, day: NaiveDate) -> Result<Vec<String>> {
        let found = self
            .index_members
            .range(
                (index_code.to_string(), NaiveDate::MIN)..=(index_code.to_string(), day),
            )
            .next_back()
            .map(|(_, members)| members.clone());
        Ok(found.unwrap_or_default())
    }

    fn index_close(&self, index_code: &str, day: NaiveDate) -> Result<Option<f64>> {
        self.cell(index_code, day, "index_daily", "close")
    }
}

/// In-memory entity tables. Interior mutability so a shared store can keep
/// accepting definitions while jobs hold `&dyn EntityStore` — a running job
/// is unaffected because it snapshots at start.
#[derive(Debug, Default)]
pub struct MemEntities {
    params: RwLock<HashMap<String, Param>>,
    indicators: RwLock<HashMap<String, Indicator>>,
    strategies: RwLock<HashMap<String, Strategy>>,
}

impl MemEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(&self, param: Param) {
        self.params
            .write()
            .expect("entity lock poisoned")
            .insert(param.fqname(), param);
    }

    pub fn add_indicator(&self, indicator: Indicator) {
        self.indicators
            .write()
            .expect("entity lock poisoned")
            .insert(indicator.fqname(), indicator);
    }

    pub fn add_strategy(&self, strategy: Strategy) {
        self.strategies
            .write()
            .expect("entity lock poisoned")
            .insert(strategy.fqname(), strategy);
    }
}

impl EntityStore for MemEntities {
    fn param(&self, name: &str) -> Result<Option<Param>> {
        Ok(self
            .params
            .read()
            .expect("entity lock poisoned")
            .get(name)
            .cloned())
    }

    fn indicator(&self, name: &str) -> Result<Option<Indicator>> {
        Ok(self
            .indicators
            .read()
            .expect("entity lock poisoned")
            .get(name)
            .cloned())
    }

    fn strategy(&self, creator: &str, name: &str) -> Result<Option<Strategy>> {
        Ok(self
            .strategies
            .read()
            .expect("entity lock poisoned")
            .get(&fqname(creator, name))
            .cloned())
    }
}
