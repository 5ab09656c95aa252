//! The `system` creator's stock entities: the params, indicators and
//! reference strategies every deployment ships with. Users clone these as
//! starting points; the engine treats them like any other entity.

use crate::data::memory::MemEntities;
use crate::model::{AggFunc, Indicator, Param, ParamKind, Scope, Strategy};

pub const SYSTEM: &str = "system";

fn table_param(name: &str, data_id: &str, pre: usize, agg: AggFunc) -> Param {
    Param {
        creator: SYSTEM.to_string(),
        name: name.to_string(),
        kind: ParamKind::Table,
        data_id: data_id.to_string(),
        pre_period: pre,
        post_period: 0,
        agg,
    }
}

fn indicator_param(name: &str, indicator_fq: &str) -> Param {
    Param {
        creator: SYSTEM.to_string(),
        name: name.to_string(),
        kind: ParamKind::Indicator,
        data_id: indicator_fq.to_string(),
        pre_period: 0,
        post_period: 0,
        agg: AggFunc::None,
    }
}

/// Dual moving-average crossover: buy above a 1% premium to the EMA, exit
/// below it, otherwise keep the book as is.
const DUAL_MA_SELECT: &str = r#"
fn select(candidates, params, position_count, holdings, day, context) {
    let target = [];
    for stock in candidates {
        let view = params[stock];
        let close = view["system.close_0"];
        let ema = view["system.ema_5"];
        if close == () || ema == () {
            if stock in holdings { target.push(stock); }
            continue;
        }
        if close > ema * 1.01 {
            target.push(stock);
        } else if close >= ema && stock in holdings {
            target.push(stock);
        }
    }
    target
}
"#;

/// MACD difference line: long while DIF is positive.
const MACD_SELECT: &str = r#"
fn select(candidates, params, position_count, holdings, day, context) {
    let target = [];
    for stock in candidates {
        let dif = params[stock]["system.macd_dif_0"];
        if dif == () {
            if stock in holdings { target.push(stock); }
            continue;
        }
        if dif > 0.0 { target.push(stock); }
    }
    target
}
"#;

const KEEP_ALL_RISK: &str = r#"
fn risk_control(holdings, params, day, context) {
    holdings
}
"#;

const MACD_DIF_CALC: &str = r#"
fn calculate(params) {
    let fast = params["system.ema_12"];
    let slow = params["system.ema_26"];
    if fast == () || slow == () { return (); }
    fast - slow
}
"#;

/// Seed the system entities into a registry.
pub fn install(entities: &MemEntities) {
    entities.add_param(table_param("close_0", "daily.close", 0, AggFunc::None));
    entities.add_param(table_param("open_0", "daily.open", 0, AggFunc::None));
    entities.add_param(table_param("total_mv_0", "daily_basic.total_mv", 0, AggFunc::None));
    entities.add_param(table_param("ema_5", "daily.close", 5, AggFunc::Ema));
    entities.add_param(table_param("ema_12", "daily.close", 12, AggFunc::Ema));
    entities.add_param(table_param("ema_26", "daily.close", 26, AggFunc::Ema));

    entities.add_indicator(Indicator {
        creator: SYSTEM.to_string(),
        name: "macd_dif".to_string(),
        calculation_method: MACD_DIF_CALC.to_string(),
        params: vec!["system.ema_12".to_string(), "system.ema_26".to_string()],
    });
    entities.add_param(indicator_param("macd_dif_0", "system.macd_dif"));

    entities.add_strategy(Strategy {
        creator: SYSTEM.to_string(),
        name: "双均线策略".to_string(),
        select_func: DUAL_MA_SELECT.to_string(),
        risk_control_func: KEEP_ALL_RISK.to_string(),
        scope: Scope::SingleStock {
            symbol: "000001.SZ".to_string(),
        },
        position_count: 1,
        rebalance_interval: 1,
        buy_fee_rate: 0.0003,
        sell_fee_rate: 0.0013,
        params: vec!["system.close_0".to_string(), "system.ema_5".to_string()],
    });

    entities.add_strategy(Strategy {
        creator: SYSTEM.to_string(),
        name: "MACD策略".to_string(),
        select_func: MACD_SELECT.to_string(),
        risk_control_func: KEEP_ALL_RISK.to_string(),
        scope: Scope::SingleStock {
            symbol: "000001.SZ".to_string(),
        },
        position_count: 1,
        rebalance_interval: 1,
        buy_fee_rate: 0.0003,
        sell_fee_rate: 0.0013,
        params: vec!["system.macd_dif_0".to_string()],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityStore;
    use crate::resolve::resolve;

    #[test]
    fn system_entities_resolve() {
        let entities = MemEntities::new();
        install(&entities);

        let dual = entities.strategy(SYSTEM, "双均线策略").unwrap().unwrap();
        let r = resolve(&entities, &dual).unwrap();
        assert!(r.indicator_order.is_empty());
        assert_eq!(r.max_pre, 5);

        let macd = entities.strategy(SYSTEM, "MACD策略").unwrap().unwrap();
        let r = resolve(&entities, &macd).unwrap();
        assert_eq!(r.indicator_order, vec!["system.macd_dif".to_string()]);
        assert_eq!(r.max_pre, 26);
    }

    #[test]
    fn scripts_compile() {
        use crate::script::Harness;
        use std::time::Duration;
        let h = Harness::new(Duration::from_millis(1000));
        for src in [DUAL_MA_SELECT, MACD_SELECT, KEEP_ALL_RISK, MACD_DIF_CALC] {
            h.compile(src).unwrap();
        }
    }
}
