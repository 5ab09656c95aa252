#![allow(dead_code)]

use chrono::{Datelike, NaiveDate};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use quantback::config::Config;
use quantback::data::memory::{MemEntities, MemStore};
use quantback::job::{Coordinator, JobOutcome, JobRequest, LogNotifier};
use quantback::report::store::ReportStore;

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// The first `count` weekdays starting at `from`, registered as open
/// trading days on the store.
pub fn open_weekdays(store: &mut MemStore, from: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(count);
    let mut day = from;
    while days.len() < count {
        if day.weekday().number_from_monday() <= 5 {
            store.add_open_day(day);
            days.push(day);
        }
        day = day.succ_opt().unwrap();
    }
    days
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub reports: Arc<ReportStore>,
}

/// Coordinator over in-memory stores, the standard fixture for the
/// end-to-end scenarios.
pub fn harness(store: MemStore, entities: MemEntities, config: Config) -> Harness {
    let reports = Arc::new(ReportStore::open_in_memory().unwrap());
    let coordinator = Coordinator::new(
        config,
        Arc::new(store),
        Arc::new(entities),
        Arc::clone(&reports),
        Arc::new(LogNotifier),
    );
    Harness {
        coordinator,
        reports,
    }
}

pub fn request(creator: &str, strategy: &str, start: &str, end: &str, fund: f64) -> JobRequest {
    JobRequest {
        creator: creator.to_string(),
        strategy_name: strategy.to_string(),
        start_date: start.to_string(),
        end_date: end.to_string(),
        initial_fund: fund,
        slippage_rate: 0.0,
        benchmark_ts_code: None,
        user_name: None,
    }
}

pub async fn run_to_report(h: &Harness, req: JobRequest) -> quantback::report::ReportRow {
    let outcome = h
        .coordinator
        .run(req, CancellationToken::new())
        .await
        .expect("backtest completed");
    let JobOutcome::Completed { report_id } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    h.reports.fetch(&report_id).unwrap().expect("row persisted")
}
