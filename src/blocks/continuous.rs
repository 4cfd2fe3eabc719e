//! Continuous-dynamics handlers: integrator, transfer function, delay,
//! scalar state space, one-pole filters, derivative, and PID.

use crate::diagram::Block;
use crate::sim::{BlockState, SimContext};

/// Companion-form state-space realization of a transfer function.
///
/// Built from `(num, den)` after leading-zero trimming and normalizing the
/// denominator to a leading coefficient of 1. `n = 0` collapses to the
/// pure gain `d` and holds no state.
#[derive(Debug, Clone, PartialEq)]
pub struct TfModel {
    pub n: usize,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    pub c: Vec<f64>,
    pub d: f64,
}

/// Trim leading near-zero coefficients, mapping non-finite entries to 0.
/// Returns the trimmed polynomial and whether it is identically zero.
pub fn normalize_poly(values: &[f64]) -> (Vec<f64>, bool) {
    let arr: Vec<f64> = values
        .iter()
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect();
    let mut idx = 0;
    while idx + 1 < arr.len() && arr[idx].abs() < 1e-12 {
        idx += 1;
    }
    let trimmed = if arr.is_empty() {
        vec![0.0]
    } else {
        arr[idx..].to_vec()
    };
    let all_zero = trimmed.iter().all(|v| v.abs() < 1e-12);
    if all_zero {
        (vec![0.0], true)
    } else {
        (trimmed, false)
    }
}

/// Build the companion realization. An all-zero denominator or an improper
/// transfer function (numerator degree above denominator degree) yields no
/// model; the block then emits 0.
pub fn build_tf_model(num: &[f64], den: &[f64]) -> Option<TfModel> {
    let (num_arr, _) = normalize_poly(num);
    let (den_arr, den_all_zero) = normalize_poly(den);
    if den_all_zero {
        return None;
    }
    let a0 = den_arr[0];
    let den_norm: Vec<f64> = den_arr.iter().map(|v| v / a0).collect();
    let n = den_norm.len() - 1;
    if n == 0 {
        return Some(TfModel {
            n: 0,
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
            d: num_arr[0] / a0,
        });
    }
    if num_arr.len() > n + 1 {
        return None;
    }

    let mut num_padded = vec![0.0; n + 1 - num_arr.len()];
    num_padded.extend_from_slice(&num_arr);
    let a: Vec<f64> = den_norm[1..].to_vec();
    let b: Vec<f64> = num_padded.iter().map(|v| v / a0).collect();

    // Superdiagonal identity with the negated denominator along the last row.
    let mut mat = vec![vec![0.0; n]; n];
    for (i, row) in mat.iter_mut().enumerate() {
        if i < n - 1 {
            row[i + 1] = 1.0;
        } else {
            for (j, entry) in row.iter_mut().enumerate() {
                *entry = -a[n - 1 - j];
            }
        }
    }

    let mut b_vec = vec![0.0; n];
    b_vec[n - 1] = 1.0;

    let b0 = b[0];
    let mut c = vec![0.0; n];
    for i in 0..n {
        c[n - 1 - i] = b[i + 1] - a[i] * b0;
    }

    Some(TfModel {
        n,
        a: mat,
        b: b_vec,
        c,
        d: b0,
    })
}

/// `y = C·x + D·u` (or `D·u` for the degenerate pure-gain model).
pub fn output_from_state(model: &TfModel, state: &[f64], input: f64) -> f64 {
    if model.n == 0 {
        return model.d * input;
    }
    let cx: f64 = model
        .c
        .iter()
        .zip(state)
        .map(|(ci, xi)| ci * xi)
        .sum();
    cx + model.d * input
}

fn state_derivative(model: &TfModel, state: &[f64], input: f64) -> Vec<f64> {
    model
        .a
        .iter()
        .zip(&model.b)
        .map(|(row, bi)| {
            let ax: f64 = row.iter().zip(state).map(|(aij, xj)| aij * xj).sum();
            ax + bi * input
        })
        .collect()
}

fn add_scaled(state: &[f64], delta: &[f64], scale: f64) -> Vec<f64> {
    state
        .iter()
        .zip(delta)
        .map(|(x, d)| x + d * scale)
        .collect()
}

/// Four-stage RK4 of `dx/dt = Ax + Bu` with `u` held constant across the
/// sub-steps.
pub fn integrate_tf_rk4(model: &TfModel, state: &[f64], input: f64, dt: f64) -> Vec<f64> {
    if model.n == 0 {
        return state.to_vec();
    }
    let k1 = state_derivative(model, state, input);
    let k2 = state_derivative(model, &add_scaled(state, &k1, dt / 2.0), input);
    let k3 = state_derivative(model, &add_scaled(state, &k2, dt / 2.0), input);
    let k4 = state_derivative(model, &add_scaled(state, &k3, dt), input);
    state
        .iter()
        .enumerate()
        .map(|(i, x)| x + (dt / 6.0) * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]))
        .collect()
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

// ---------------------------------------------------------------- integrator

pub fn integrator_init(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let min = params.limit("min", f64::NEG_INFINITY);
    let max = params.limit("max", f64::INFINITY);
    let initial = params.number_or("initial", 0.0);
    ctx.states.insert(
        block.id.clone(),
        BlockState::Integrator {
            x: clamp(initial, min, max),
        },
    );
}

pub fn integrator_output(block: &Block, ctx: &mut SimContext) {
    let prev = match ctx.states.get(&block.id) {
        Some(BlockState::Integrator { x }) => *x,
        _ => 0.0,
    };
    ctx.publish(&block.id, prev);
}

pub fn integrator_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let min = params.limit("min", f64::NEG_INFINITY);
    let max = params.limit("max", f64::INFINITY);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Integrator { x }) = ctx.states.get_mut(&block.id) {
        // All four RK4 stages coincide for dx/dt = u, so the step is exact.
        *x = clamp(*x + dt * input, min, max);
    }
}

// ------------------------------------------------------------------------ tf

pub fn tf_init(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let model = build_tf_model(&params.array("num"), &params.array("den"));
    let x = model.as_ref().map_or(Vec::new(), |m| vec![0.0; m.n]);
    ctx.states
        .insert(block.id.clone(), BlockState::Tf { model, x });
}

pub fn tf_output(block: &Block, ctx: &mut SimContext) {
    let input = ctx.input_value(&block.id, 0, 0.0);
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Tf {
            model: Some(model),
            x,
        }) => output_from_state(model, x, input),
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

/// Only the degenerate `n = 0` pure-gain model resolves algebraically;
/// stateful models already published their pre-update output.
pub fn tf_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let d = match ctx.states.get(&block.id) {
        Some(BlockState::Tf {
            model: Some(model), ..
        }) if model.n == 0 => model.d,
        _ => return None,
    };
    let input = ctx.input_value(&block.id, 0, 0.0);
    Some(ctx.publish(&block.id, d * input))
}

pub fn tf_update(block: &Block, ctx: &mut SimContext) {
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Tf {
        model: Some(model),
        x,
    }) = ctx.states.get_mut(&block.id)
    {
        *x = integrate_tf_rk4(model, x, input, dt);
    }
}

// --------------------------------------------------------------------- delay

pub fn delay_init(block: &Block, ctx: &mut SimContext) {
    let delay = ctx.params(&block.id).number_or("delay", 0.0);
    let samples = (delay / ctx.dt).max(0.0);
    let steps = (samples.ceil() as usize + 1).max(1);
    let len = (steps + 1).max(2);
    ctx.states.insert(
        block.id.clone(),
        BlockState::Delay {
            buffer: vec![0.0; len],
            index: 0,
            samples,
        },
    );
}

pub fn delay_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Delay {
            buffer,
            index,
            samples,
        }) if buffer.len() >= 2 => {
            let len = buffer.len();
            let samples = samples.max(0.0);
            let mut d0 = samples.floor() as usize;
            let mut frac = samples - samples.floor();
            if d0 > len - 2 {
                d0 = len - 2;
                frac = 1.0;
            }
            // Fractional offsets interpolate between the two bracketing entries.
            let i0 = (*index + len - (d0 % len)) % len;
            let i1 = (i0 + len - 1) % len;
            buffer[i0] * (1.0 - frac) + buffer[i1] * frac
        }
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn delay_update(block: &Block, ctx: &mut SimContext) {
    let input = ctx.input_value(&block.id, 0, 0.0);
    if let Some(BlockState::Delay { buffer, index, .. }) = ctx.states.get_mut(&block.id) {
        if buffer.is_empty() {
            return;
        }
        buffer[*index] = input;
        *index = (*index + 1) % buffer.len();
    }
}

// --------------------------------------------------------------- stateSpace

pub fn state_space_init(block: &Block, ctx: &mut SimContext) {
    ctx.states
        .insert(block.id.clone(), BlockState::StateSpace { x: 0.0, output: 0.0 });
}

pub fn state_space_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::StateSpace { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn state_space_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let a = params.number_or("A", 0.0);
    let b = params.number_or("B", 0.0);
    let c = params.number_or("C", 0.0);
    let d = params.number_or("D", 0.0);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::StateSpace { x, output }) = ctx.states.get_mut(&block.id) {
        // Forward Euler; the output uses the freshly advanced state.
        let x_next = *x + dt * (a * *x + b * input);
        *x = x_next;
        *output = c * x_next + d * input;
    }
}

// ------------------------------------------------------------------ lpf/hpf

pub fn lpf_init(block: &Block, ctx: &mut SimContext) {
    ctx.states
        .insert(block.id.clone(), BlockState::Lowpass { x: 0.0, output: 0.0 });
}

pub fn lpf_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Lowpass { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn lpf_update(block: &Block, ctx: &mut SimContext) {
    let fc = ctx.params(&block.id).number_or("cutoff", 0.0).max(0.0);
    let wc = 2.0 * std::f64::consts::PI * fc;
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Lowpass { x, output }) = ctx.states.get_mut(&block.id) {
        *x += dt * wc * (input - *x);
        *output = *x;
    }
}

pub fn hpf_init(block: &Block, ctx: &mut SimContext) {
    ctx.states
        .insert(block.id.clone(), BlockState::Highpass { x: 0.0, output: 0.0 });
}

pub fn hpf_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Highpass { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn hpf_update(block: &Block, ctx: &mut SimContext) {
    let fc = ctx.params(&block.id).number_or("cutoff", 0.0).max(0.0);
    let wc = 2.0 * std::f64::consts::PI * fc;
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Highpass { x, output }) = ctx.states.get_mut(&block.id) {
        *x += dt * wc * (input - *x);
        *output = input - *x;
    }
}

// --------------------------------------------------------------- derivative

pub fn derivative_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::Derivative { prev: 0.0, output: 0.0 },
    );
}

pub fn derivative_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Derivative { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn derivative_update(block: &Block, ctx: &mut SimContext) {
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt.max(1e-6);
    if let Some(BlockState::Derivative { prev, output }) = ctx.states.get_mut(&block.id) {
        *output = (input - *prev) / dt;
        *prev = input;
    }
}

// ---------------------------------------------------------------------- pid

pub fn pid_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::Pid {
            integral: 0.0,
            prev: 0.0,
            output: 0.0,
        },
    );
}

pub fn pid_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Pid { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn pid_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let kp = params.number_or("kp", 0.0);
    let ki = params.number_or("ki", 0.0);
    let kd = params.number_or("kd", 0.0);
    let min = params.limit("min", f64::NEG_INFINITY);
    let max = params.limit("max", f64::INFINITY);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Pid {
        integral,
        prev,
        output,
    }) = ctx.states.get_mut(&block.id)
    {
        let next_integral = clamp(*integral + input * dt, min, max);
        let derivative = (input - *prev) / dt.max(1e-6);
        *output = kp * input + ki * next_integral + kd * derivative;
        *integral = next_integral;
        *prev = input;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn normalize_poly_trims_leading_zeros() {
        assert_eq!(normalize_poly(&[0.0, 0.0, 1.0, 2.0]).0, vec![1.0, 2.0]);
        assert_eq!(normalize_poly(&[0.0, 0.0]), (vec![0.0], true));
        assert_eq!(normalize_poly(&[]), (vec![0.0], true));
        assert_eq!(normalize_poly(&[f64::NAN, 1.0]).0, vec![1.0]);
    }

    #[test]
    fn companion_realization_of_first_order_lag() {
        // 1/(s+1): A = [-1], B = [1], C = [1], D = 0.
        let model = build_tf_model(&[1.0], &[1.0, 1.0]).expect("model");
        assert_eq!(model.n, 1);
        assert_relative_eq!(model.a[0][0], -1.0);
        assert_relative_eq!(model.b[0], 1.0);
        assert_relative_eq!(model.c[0], 1.0);
        assert_relative_eq!(model.d, 0.0);
    }

    #[test]
    fn degenerate_model_is_pure_gain() {
        let model = build_tf_model(&[3.0], &[2.0]).expect("model");
        assert_eq!(model.n, 0);
        assert_relative_eq!(model.d, 1.5);
        assert_relative_eq!(output_from_state(&model, &[], 2.0), 3.0);
    }

    #[test]
    fn zero_denominator_builds_no_model() {
        assert!(build_tf_model(&[1.0], &[0.0, 0.0]).is_none());
    }

    #[test]
    fn improper_transfer_function_builds_no_model() {
        assert!(build_tf_model(&[1.0, 0.0, 0.0], &[1.0, 1.0]).is_none());
    }

    #[test]
    fn rk4_step_matches_first_order_decay() {
        // dx/dt = -x + u with u = 1: x(t) = 1 - exp(-t).
        let model = build_tf_model(&[1.0], &[1.0, 1.0]).unwrap();
        let mut x = vec![0.0];
        let dt = 0.01;
        for _ in 0..100 {
            x = integrate_tf_rk4(&model, &x, 1.0, dt);
        }
        assert_abs_diff_eq!(x[0], 1.0 - (-1.0f64).exp(), epsilon = 1e-8);
    }
}
