//! Sampled-time handlers. Each block carries its own sample period `ts`
//! and resamples only when simulated time crosses its next sample instant;
//! between samples the output phase republishes the held value.

use crate::blocks::continuous::normalize_poly;
use crate::diagram::Block;
use crate::sim::{BlockState, SimContext};

/// Normalized z-domain transfer function, denominator leading coefficient
/// scaled to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteTf {
    pub num: Vec<f64>,
    pub den: Vec<f64>,
}

/// Build a [`DiscreteTf`] from raw coefficient arrays. An all-zero
/// denominator degrades to `[1]` rather than failing the run.
pub fn build_discrete_tf(num: &[f64], den: &[f64]) -> DiscreteTf {
    let (num_arr, _) = normalize_poly(num);
    let (den_arr, den_all_zero) = normalize_poly(den);
    let safe_den = if den_all_zero { vec![1.0] } else { den_arr };
    let a0 = if safe_den[0] == 0.0 { 1.0 } else { safe_den[0] };
    DiscreteTf {
        num: num_arr.iter().map(|v| v / a0).collect(),
        den: safe_den.iter().map(|v| v / a0).collect(),
    }
}

/// Direct-form difference equation against the input and output histories
/// (newest first).
pub fn eval_discrete_tf(model: &DiscreteTf, x_hist: &[f64], y_hist: &[f64]) -> f64 {
    let mut y = 0.0;
    for (i, coeff) in model.num.iter().enumerate() {
        y += coeff * x_hist.get(i).copied().unwrap_or(0.0);
    }
    for (i, coeff) in model.den.iter().enumerate().skip(1) {
        y -= coeff * y_hist.get(i - 1).copied().unwrap_or(0.0);
    }
    y
}

/// Per-block sample period: `ts` when it resolves to a nonzero value,
/// otherwise the fallback, floored at 1 ms.
fn sample_time(ctx: &SimContext, id: &str, fallback: f64) -> f64 {
    let raw = ctx.params(id).number_or("ts", 0.0);
    let ts = if raw == 0.0 || raw.is_nan() { fallback } else { raw };
    ts.max(0.001)
}

pub fn zoh_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::Zoh {
            sample: 0.0,
            next_time: 0.0,
            output: 0.0,
        },
    );
}

pub fn zoh_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Zoh { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn zoh_update(block: &Block, ctx: &mut SimContext) {
    let ts = sample_time(ctx, &block.id, ctx.dt);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let t = ctx.t;
    if let Some(BlockState::Zoh {
        sample,
        next_time,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        if t + 1e-6 >= *next_time {
            *sample = input;
            *next_time = t + ts;
        }
        *output = *sample;
    }
}

pub fn foh_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::Foh {
            prev_sample: 0.0,
            sample: 0.0,
            sample_time: 0.0,
            next_time: 0.0,
            output: 0.0,
        },
    );
}

pub fn foh_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Foh { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

/// First-order hold: extrapolate along the slope of the last two samples.
pub fn foh_update(block: &Block, ctx: &mut SimContext) {
    let ts = sample_time(ctx, &block.id, ctx.dt);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let t = ctx.t;
    if let Some(BlockState::Foh {
        prev_sample,
        sample,
        sample_time,
        next_time,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        if t + 1e-6 >= *next_time {
            *prev_sample = *sample;
            *sample = input;
            *sample_time = t;
            *next_time = t + ts;
        }
        let slope = (*sample - *prev_sample) / ts;
        *output = *sample + slope * (t - *sample_time);
    }
}

pub fn dtf_init(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let model = build_discrete_tf(&params.array("num"), &params.array("den"));
    let x_len = model.num.len();
    let y_len = model.den.len().saturating_sub(1);
    ctx.states.insert(
        block.id.clone(),
        BlockState::Dtf {
            model,
            x_hist: vec![0.0; x_len],
            y_hist: vec![0.0; y_len],
            next_time: 0.0,
            output: 0.0,
        },
    );
}

pub fn dtf_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Dtf { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn dtf_update(block: &Block, ctx: &mut SimContext) {
    let ts = sample_time(ctx, &block.id, ctx.dt);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let t = ctx.t;
    if let Some(BlockState::Dtf {
        model,
        x_hist,
        y_hist,
        next_time,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        if t + 1e-6 >= *next_time {
            x_hist.pop();
            x_hist.insert(0, input);
            let y = eval_discrete_tf(model, x_hist, y_hist);
            y_hist.pop();
            y_hist.insert(0, y);
            *next_time = t + ts;
            *output = y;
        }
    }
}

pub fn ddelay_init(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let raw_steps = params.number_or("steps", 0.0);
    let steps = if raw_steps == 0.0 || raw_steps.is_nan() {
        1
    } else {
        (raw_steps.round() as i64).max(1) as usize
    };
    let ts = sample_time(ctx, &block.id, 0.1);
    ctx.states.insert(
        block.id.clone(),
        BlockState::Ddelay {
            queue: vec![0.0; steps],
            next_time: 0.0,
            last: 0.0,
            ts,
            output: 0.0,
        },
    );
}

pub fn ddelay_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Ddelay { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn ddelay_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let raw_steps = params.number_or("steps", 0.0);
    let steps = if raw_steps == 0.0 || raw_steps.is_nan() {
        1
    } else {
        (raw_steps.round() as i64).max(1) as usize
    };
    let raw_ts = params.number_or("ts", 0.0);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let t = ctx.t;
    if let Some(BlockState::Ddelay {
        queue,
        next_time,
        last,
        ts,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        let effective = if raw_ts == 0.0 || raw_ts.is_nan() {
            if *ts == 0.0 { 0.1 } else { *ts }
        } else {
            raw_ts
        }
        .max(0.001);
        *ts = effective;
        if t + 1e-6 >= *next_time {
            queue.push(input);
            while queue.len() > steps {
                queue.remove(0);
            }
            *last = queue.first().copied().unwrap_or(0.0);
            *next_time = t + effective;
        }
        *output = *last;
    }
}

pub fn dstate_space_init(block: &Block, ctx: &mut SimContext) {
    let ts = sample_time(ctx, &block.id, 0.1);
    ctx.states.insert(
        block.id.clone(),
        BlockState::DstateSpace {
            x: 0.0,
            next_time: 0.0,
            last: 0.0,
            ts,
            output: 0.0,
        },
    );
}

pub fn dstate_space_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::DstateSpace { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

/// Scalar difference state update `x[k+1] = A x[k] + B u`, sampled on a
/// tighter 1 ns guard than the other discrete blocks.
pub fn dstate_space_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let a = params.number_or("A", 0.0);
    let b = params.number_or("B", 0.0);
    let c = params.number_or("C", 0.0);
    let d = params.number_or("D", 0.0);
    let raw_ts = params.number_or("ts", 0.0);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let t = ctx.t;
    if let Some(BlockState::DstateSpace {
        x,
        next_time,
        last,
        ts,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        let effective = if raw_ts == 0.0 || raw_ts.is_nan() {
            if *ts == 0.0 { 0.1 } else { *ts }
        } else {
            raw_ts
        }
        .max(0.001);
        *ts = effective;
        if t + 1e-9 >= *next_time {
            let x_next = a * *x + b * input;
            *x = x_next;
            let y = c * x_next + d * input;
            *last = y;
            *next_time = t + effective;
            *output = y;
        } else {
            *output = *last;
        }
    }
}
