use crate::model::AggFunc;

/// Collapse a raw day-aligned series into a windowed series of the same
/// length. The window for day `d` is the `pre` trailing trading days ending
/// at `d` (inclusive) plus `post` forward days: `[d - max(pre,1) + 1,
/// d + post]`. Day `d` is always a member.
///
/// A window that leaves the series bounds, or that contains a missing raw
/// value, yields missing. EMA is the exception: it is a recursion, not a
/// finite window (see `ema_series`).
pub fn aggregate(raw: &[Option<f64>], agg: AggFunc, pre: usize, post: usize) -> Vec<Option<f64>> {
    match agg {
        AggFunc::None => raw.to_vec(),
        AggFunc::Ema => ema_series(raw, pre, post),
        AggFunc::Sma | AggFunc::Avg => finite_window(raw, pre, post, |w| {
            w.iter().sum::<f64>() / w.len() as f64
        }),
        AggFunc::Sum => finite_window(raw, pre, post, |w| w.iter().sum()),
        AggFunc::Max => finite_window(raw, pre, post, |w| w.iter().copied().fold(f64::MIN, f64::max)),
        AggFunc::Min => finite_window(raw, pre, post, |w| w.iter().copied().fold(f64::MAX, f64::min)),
    }
}

fn finite_window(
    raw: &[Option<f64>],
    pre: usize,
    post: usize,
    collapse: impl Fn(&[f64]) -> f64,
) -> Vec<Option<f64>> {
    let n = raw.len();
    let span = pre.max(1) - 1;
    let mut out = vec![None; n];
    let mut buf = Vec::with_capacity(span + post + 1);
    for d in 0..n {
        if d < span || d + post >= n {
            continue;
        }
        buf.clear();
        let mut complete = true;
        for value in &raw[d - span..=d + post] {
            match value {
                Some(v) => buf.push(*v),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            out[d] = Some(collapse(&buf));
        }
    }
    out
}

/// Exponentially weighted mean, smoothing `alpha = 2 / (pre + 1)`, seeded
/// at the first non-missing raw value. Values emit from the seed day on —
/// there is no warm-up hole, which is what keeps the first report day
/// usable when the range starts where the data starts. The recursion
/// carries through later gaps. A non-zero `post` reads the recursion
/// `post` days ahead.
fn ema_series(raw: &[Option<f64>], pre: usize, post: usize) -> Vec<Option<f64>> {
    let n = raw.len();
    let mut out = vec![None; n];
    let Some(seed_idx) = raw.iter().position(Option::is_some) else {
        return out;
    };
    let alpha = 2.0 / (pre as f64 + 1.0);
    let warm = seed_idx;

    // ema[i] for i >= seed_idx; gaps carry the previous value.
    let mut ema = vec![0.0; n];
    let mut current = raw[seed_idx].unwrap_or(0.0);
    for i in seed_idx..n {
        if let Some(v) = raw[i] {
            if i > seed_idx {
                current = alpha * v + (1.0 - alpha) * current;
            }
        }
        ema[i] = current;
    }

    for d in 0..n {
        let read = d + post;
        if read < n && read >= warm {
            out[d] = Some(ema[read]);
        }
    }
    out
}
