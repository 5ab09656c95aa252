use chrono::NaiveDate;
use rustc_hash::FxHashMap;

use super::MarketData;
use crate::error::{EngineError, Result};
use crate::model::Scope;

/// The job's day axis: the report-range trading days extended backwards by
/// the largest trailing window and forwards by the largest forward window
/// reached in the dependency closure. Every panel series is aligned to it.
#[derive(Debug, Clone)]
pub struct DayAxis {
    days: Vec<NaiveDate>,
    index: FxHashMap<NaiveDate, usize>,
    /// Index of the first report-range day within `days`.
    report_start: usize,
    /// Index of the last report-range day within `days`.
    report_end: usize,
}

impl DayAxis {
    /// Build the axis for `[start, end]` with `pre` extra trading days
    /// before and `post` after. Fails with `CalendarUnavailable` when the
    /// report range contains no open day.
    pub fn build(
        store: &dyn MarketData,
        start: NaiveDate,
        end: NaiveDate,
        pre: usize,
        post: usize,
    ) -> Result<Self> {
        let report = store.trading_days(start, end)?;
        if report.is_empty() {
            return Err(EngineError::CalendarUnavailable { start, end });
        }
        let before = store.prev_trading_days(report[0], pre)?;
        let after = store.next_trading_days(*report.last().unwrap_or(&end), post)?;

        let mut days = before;
        let report_start = days.len();
        days.extend_from_slice(&report);
        let report_end = days.len() - 1;
        days.extend(after);

        let index = days.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        Ok(Self {
            days,
            index,
            report_start,
            report_end,
        })
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn day(&self, idx: usize) -> NaiveDate {
        self.days[idx]
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn idx(&self, day: NaiveDate) -> Option<usize> {
        self.index.get(&day).copied()
    }

    pub fn report_range(&self) -> std::ops::RangeInclusive<usize> {
        self.report_start..=self.report_end
    }

    /// The trading days of the report range itself.
    pub fn report_days(&self) -> &[NaiveDate] {
        &self.days[self.report_start..=self.report_end]
    }
}

/// Expand a strategy scope to the candidate set for one day.
pub fn universe(store: &dyn MarketData, scope: &Scope, day: NaiveDate) -> Result<Vec<String>> {
    match scope {
        Scope::All => store.listed_symbols(day),
        Scope::SingleStock { symbol } => Ok(vec![symbol.clone()]),
        Scope::Index { code } => store.index_members(code, day),
    }
}

/// The union of every day's candidate set over the report range, sorted.
/// This is the symbol grid the panel is built over. Fails with
/// `UniverseEmpty` when no day yields a candidate.
pub fn maximal_universe(
    store: &dyn MarketData,
    scope: &Scope,
    report_days: &[NaiveDate],
) -> Result<Vec<String>> {
    let mut all: Vec<String> = Vec::new();
    for &day in report_days {
        for sym in universe(store, scope, day)? {
            if !all.contains(&sym) {
                all.push(sym);
            }
        }
    }
    if all.is_empty() {
        return Err(EngineError::UniverseEmpty);
    }
    all.sort_unstable();
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemStore;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn store_with_week() -> MemStore {
        let mut store = MemStore::new();
        for day in [
            "2023-01-03",
            "2023-01-04",
            "2023-01-05",
            "2023-01-06",
            "2023-01-09",
            "2023-01-10",
            "2023-01-11",
        ] {
            store.add_open_day(d(day));
        }
        store
    }

    #[test]
    fn axis_extends_both_ways() {
        let store = store_with_week();
        let axis = DayAxis::build(&store, d("2023-01-05"), d("2023-01-10"), 2, 1).unwrap();
        assert_eq!(axis.days().first().copied(), Some(d("2023-01-03")));
        assert_eq!(axis.days().last().copied(), Some(d("2023-01-11")));
        assert_eq!(axis.report_days().first().copied(), Some(d("2023-01-05")));
        assert_eq!(axis.report_days().last().copied(), Some(d("2023-01-10")));
        assert_eq!(axis.idx(d("2023-01-05")), Some(2));
    }

    #[test]
    fn axis_clamps_extension_to_available_calendar() {
        let store = store_with_week();
        // Only one open day exists before Jan 4.
        let axis = DayAxis::build(&store, d("2023-01-04"), d("2023-01-06"), 5, 0).unwrap();
        assert_eq!(axis.days().first().copied(), Some(d("2023-01-03")));
        assert_eq!(axis.report_days().len(), 3);
    }

    #[test]
    fn empty_range_is_calendar_unavailable() {
        let store = store_with_week();
        let err = DayAxis::build(&store, d("2023-01-07"), d("2023-01-08"), 0, 0).unwrap_err();
        assert_eq!(err.kind(), "CalendarUnavailable");
    }

    #[test]
    fn non_open_start_snaps_forward() {
        let store = store_with_week();
        // Jan 7/8 is a weekend; first sample must be Jan 9.
        let axis = DayAxis::build(&store, d("2023-01-07"), d("2023-01-10"), 0, 0).unwrap();
        assert_eq!(axis.report_days().first().copied(), Some(d("2023-01-09")));
    }

    #[test]
    fn single_stock_universe_ignores_listings() {
        let store = store_with_week();
        let scope = Scope::SingleStock {
            symbol: "000001.SZ".to_string(),
        };
        let u = universe(&store, &scope, d("2023-01-04")).unwrap();
        assert_eq!(u, vec!["000001.SZ".to_string()]);
    }

    #[test]
    fn maximal_universe_empty_fails() {
        let store = store_with_week();
        let err =
            maximal_universe(&store, &Scope::All, &[d("2023-01-04"), d("2023-01-05")]).unwrap_err();
        assert_eq!(err.kind(), "UniverseEmpty");
    }

    #[test]
    fn index_universe_takes_latest_snapshot() {
        let mut store = store_with_week();
        store.set_index_members(
            "000300.SH",
            d("2023-01-03"),
            &["000001.SZ", "000002.SZ"],
        );
        store.set_index_members("000300.SH", d("2023-01-09"), &["000001.SZ", "600000.SH"]);
        let scope = Scope::Index {
            code: "000300.SH".to_string(),
        };
        let before = universe(&store, &scope, d("2023-01-06")).unwrap();
        assert_eq!(before, vec!["000001.SZ", "000002.SZ"]);
        let after = universe(&store, &scope, d("2023-01-10")).unwrap();
        assert_eq!(after, vec!["000001.SZ", "600000.SH"]);
    }
}
