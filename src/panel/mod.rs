pub mod builder;
pub mod window;

use rustc_hash::FxHashMap;

/// Dense `(symbol x day x fqname)` view of scalar values, aligned to the
/// job's extended day axis. One flat lane per fqname; `None` is the
/// missing sentinel user code observes.
#[derive(Debug, Default)]
pub struct Panel {
    symbols: Vec<String>,
    sym_index: FxHashMap<String, usize>,
    n_days: usize,
    series: FxHashMap<String, Vec<Option<f64>>>,
}

impl Panel {
    pub fn new(symbols: Vec<String>, n_days: usize) -> Self {
        let sym_index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            symbols,
            sym_index,
            n_days,
            series: FxHashMap::default(),
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn n_days(&self) -> usize {
        self.n_days
    }

    pub fn sym_idx(&self, symbol: &str) -> Option<usize> {
        self.sym_index.get(symbol).copied()
    }

    pub fn has_series(&self, fqname: &str) -> bool {
        self.series.contains_key(fqname)
    }

    /// Install a full lane for `fqname`. The lane must hold
    /// `symbols.len() * n_days` cells, symbol-major.
    pub fn insert_series(&mut self, fqname: &str, lane: Vec<Option<f64>>) {
        debug_assert_eq!(lane.len(), self.symbols.len() * self.n_days);
        self.series.insert(fqname.to_string(), lane);
    }

    /// A full lane, symbol-major, `symbols.len() * n_days` long.
    pub fn series(&self, fqname: &str) -> Option<&[Option<f64>]> {
        self.series.get(fqname).map(Vec::as_slice)
    }

    /// The per-symbol slice of a lane, `n_days` long.
    pub fn symbol_lane(&self, fqname: &str, sym_idx: usize) -> Option<&[Option<f64>]> {
        self.series
            .get(fqname)
            .map(|lane| &lane[sym_idx * self.n_days..(sym_idx + 1) * self.n_days])
    }

    pub fn value(&self, fqname: &str, sym_idx: usize, day_idx: usize) -> Option<f64> {
        self.series
            .get(fqname)
            .and_then(|lane| lane[sym_idx * self.n_days + day_idx])
    }

    /// Flatten a per-symbol collection of day series into one lane.
    pub fn lane_from_rows(&self, rows: Vec<Vec<Option<f64>>>) -> Vec<Option<f64>> {
        let mut lane = Vec::with_capacity(self.symbols.len() * self.n_days);
        for row in rows {
            debug_assert_eq!(row.len(), self.n_days);
            lane.extend(row);
        }
        lane
    }
}
