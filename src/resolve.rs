use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

use crate::data::EntityStore;
use crate::error::{EngineError, Result};
use crate::model::{EntitySnapshot, ParamKind, Strategy};

/// Everything the data-preparation phase needs to know about a strategy's
/// dependency closure.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Immutable snapshot of every param/indicator reached.
    pub snapshot: EntitySnapshot,
    /// Indicators in evaluation order: an indicator's dependencies always
    /// precede it.
    pub indicator_order: Vec<String>,
    /// Table-backed params reached (fqnames, sorted).
    pub table_params: Vec<String>,
    /// Largest trailing window across the closure; extends the load window
    /// backwards from `start`.
    pub max_pre: usize,
    /// Largest forward window across the closure; extends forwards from `end`.
    pub max_post: usize,
}

/// Walk the strategy's declared params to a fixpoint, capturing the
/// snapshot, then topologically order the reached indicators. A cycle in
/// the param/indicator graph is a user error, rejected before any data
/// fetch.
pub fn resolve(entities: &dyn EntityStore, strategy: &Strategy) -> Result<Resolution> {
    let mut snapshot = EntitySnapshot::default();
    let mut queue: VecDeque<String> = strategy.params.iter().cloned().collect();
    let mut seen_params: FxHashSet<String> = FxHashSet::default();

    // Fixpoint closure: params pull in indicators, indicators pull in params.
    while let Some(param_fq) = queue.pop_front() {
        if !seen_params.insert(param_fq.clone()) {
            continue;
        }
        let param = entities
            .param(&param_fq)?
            .ok_or_else(|| EngineError::MissingParam(param_fq.clone()))?;
        param.validate()?;
        if param.kind == ParamKind::Indicator {
            let ind_fq = param.data_id.clone();
            if !snapshot.indicators.contains_key(&ind_fq) {
                let indicator = entities
                    .indicator(&ind_fq)?
                    .ok_or_else(|| EngineError::MissingIndicator(ind_fq.clone()))?;
                queue.extend(indicator.params.iter().cloned());
                snapshot.indicators.insert(ind_fq, indicator);
            }
        }
        snapshot.params.insert(param_fq, param);
    }

    let indicator_order = topo_order(&snapshot)?;

    let mut table_params: Vec<String> = snapshot
        .params
        .values()
        .filter(|p| p.kind == ParamKind::Table)
        .map(crate::model::Param::fqname)
        .collect();
    table_params.sort_unstable();

    let max_pre = snapshot.params.values().map(|p| p.pre_period).max().unwrap_or(0);
    let max_post = snapshot
        .params
        .values()
        .map(|p| p.post_period)
        .max()
        .unwrap_or(0);

    Ok(Resolution {
        snapshot,
        indicator_order,
        table_params,
        max_pre,
        max_post,
    })
}

/// Kahn's algorithm over the param+indicator node set. Nodes left with a
/// positive in-degree are exactly the members of some cycle.
fn topo_order(snapshot: &EntitySnapshot) -> Result<Vec<String>> {
    // Node id space: "p:<fqname>" and "i:<fqname>". Edges point from a
    // dependency to its dependent, so processing order is deepest first.
    let mut edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut in_degree: FxHashMap<String, usize> = FxHashMap::default();

    for fq in snapshot.params.keys() {
        in_degree.entry(format!("p:{fq}")).or_insert(0);
    }
    for fq in snapshot.indicators.keys() {
        in_degree.entry(format!("i:{fq}")).or_insert(0);
    }

    for (fq, param) in &snapshot.params {
        if param.kind == ParamKind::Indicator {
            // The param depends on the indicator it references.
            edges
                .entry(format!("i:{}", param.data_id))
                .or_default()
                .push(format!("p:{fq}"));
            *in_degree.entry(format!("p:{fq}")).or_insert(0) += 1;
        }
    }
    for (fq, indicator) in &snapshot.indicators {
        for param_fq in &indicator.params {
            edges
                .entry(format!("p:{param_fq}"))
                .or_default()
                .push(format!("i:{fq}"));
            *in_degree.entry(format!("i:{fq}")).or_insert(0) += 1;
        }
    }

    // Deterministic pop order: keep the frontier sorted.
    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(node, _)| node.clone())
        .collect();
    ready.sort_unstable();

    let mut order = Vec::new();
    let mut done = 0usize;
    while let Some(node) = ready.pop() {
        done += 1;
        if let Some(rest) = node.strip_prefix("i:") {
            order.push(rest.to_string());
        }
        if let Some(next) = edges.get(&node) {
            for dependent in next {
                let deg = in_degree
                    .get_mut(dependent)
                    .expect("dependent node missing from in-degree map");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dependent.clone());
                    ready.sort_unstable();
                }
            }
        }
    }

    if done != in_degree.len() {
        let mut nodes: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(node, _)| node[2..].to_string())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        return Err(EngineError::CyclicDependency { nodes });
    }
    Ok(order)
}
