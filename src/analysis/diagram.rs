//! Linear extraction: evaluate a diagram's loop as a complex-gain network
//! and solve for the labelled input-to-output response on a frequency grid.

use std::collections::{HashMap, HashSet};

use num_complex::Complex64;

use crate::diagram::{resolve_block_params, Block, BlockParams, BlockType, Diagram};
use crate::error::{Result, SimflowError};

use super::lti::{eval_transfer, logspace, with_zero, Frd};

/// Input-port count of a block type the extractor can express as a complex
/// gain, or `None` for types it cannot.
pub fn linear_input_count(kind: BlockType) -> Option<usize> {
    match kind {
        BlockType::Gain
        | BlockType::Integrator
        | BlockType::Derivative
        | BlockType::Tf
        | BlockType::Delay
        | BlockType::Pid
        | BlockType::Lpf
        | BlockType::Hpf
        | BlockType::LabelSink => Some(1),
        BlockType::Sum => Some(3),
        BlockType::LabelSource => Some(0),
        _ => None,
    }
}

fn is_linear(kind: BlockType) -> bool {
    linear_input_count(kind).is_some()
}

/// The complex gain of one block at `s = jω`. `None` for types whose rows
/// are assembled structurally (sources, sums, sinks).
fn block_gain(kind: BlockType, params: &BlockParams, s: Complex64) -> Option<Complex64> {
    match kind {
        BlockType::Gain => Some(Complex64::new(params.number_or("gain", 1.0), 0.0)),
        BlockType::Integrator => Some(Complex64::new(1.0, 0.0) / s),
        BlockType::Derivative => Some(s),
        BlockType::Tf => Some(eval_transfer(
            &params.array("num"),
            &params.array("den"),
            s,
        )),
        BlockType::Delay => {
            let delay = params.number_or("delay", 0.0);
            Some(Complex64::cis(-delay * s.im))
        }
        BlockType::Pid => {
            let kp = params.number_or("kp", 0.0);
            let ki = params.number_or("ki", 0.0);
            let kd = params.number_or("kd", 0.0);
            let ki_term = if ki == 0.0 {
                Complex64::new(0.0, 0.0)
            } else {
                Complex64::new(ki, 0.0) / s
            };
            Some(Complex64::new(kp, 0.0) + ki_term + Complex64::new(kd, 0.0) * s)
        }
        BlockType::Lpf => {
            let wc = 2.0 * std::f64::consts::PI * params.number_or("cutoff", 0.0).max(0.0);
            Some(Complex64::new(wc, 0.0) / (s + Complex64::new(wc, 0.0)))
        }
        BlockType::Hpf => {
            let wc = 2.0 * std::f64::consts::PI * params.number_or("cutoff", 0.0).max(0.0);
            Some(s / (s + Complex64::new(wc, 0.0)))
        }
        _ => None,
    }
}

/// Input map restricted to the extractor's fixed port counts. Only the
/// source block id matters here; secondary output ports collapse onto it.
fn build_linear_input_map(
    blocks: &[&Block],
    connections: &[crate::diagram::Connection],
) -> HashMap<String, Vec<Option<String>>> {
    let mut map: HashMap<String, Vec<Option<String>>> = blocks
        .iter()
        .map(|block| {
            let count = linear_input_count(block.kind).unwrap_or(0);
            (block.id.clone(), vec![None; count])
        })
        .collect();
    for conn in connections {
        if let Some(inputs) = map.get_mut(&conn.to) {
            if conn.to_index < inputs.len() {
                inputs[conn.to_index] = Some(conn.from.clone());
            }
        }
    }
    map
}

/// Gauss-Jordan with partial pivoting on the max-modulus column entry.
/// Returns `None` when a pivot column is exactly zero.
fn solve_linear_system(a: &[Vec<Complex64>], b: &[Complex64]) -> Option<Vec<Complex64>> {
    let n = a.len();
    let mut m: Vec<Vec<Complex64>> = a
        .iter()
        .zip(b)
        .map(|(row, rhs)| {
            let mut out = row.clone();
            out.push(*rhs);
            out
        })
        .collect();

    for k in 0..n {
        let mut pivot = k;
        let mut max_mag = m[k][k].norm();
        for (i, row) in m.iter().enumerate().skip(k + 1) {
            let mag = row[k].norm();
            if mag > max_mag {
                max_mag = mag;
                pivot = i;
            }
        }
        if max_mag == 0.0 {
            return None;
        }
        if pivot != k {
            m.swap(k, pivot);
        }
        let pivot_val = m[k][k];
        for j in k..=n {
            m[k][j] /= pivot_val;
        }
        for i in 0..n {
            if i == k {
                continue;
            }
            let factor = m[i][k];
            if factor.re == 0.0 && factor.im == 0.0 {
                continue;
            }
            for j in k..=n {
                let scaled = factor * m[k][j];
                m[i][j] -= scaled;
            }
        }
    }
    Some(m.into_iter().map(|row| row[n]).collect())
}

/// Follow edges from `start`, expanding only through linear-capable blocks;
/// the first non-linear neighbour is still recorded as visited.
fn traverse<'a>(
    start: &'a str,
    adjacency: &'a HashMap<String, Vec<String>>,
    by_id: &HashMap<&str, &Block>,
) -> HashSet<&'a str> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let allow_through = by_id.get(id).is_some_and(|block| is_linear(block.kind));
        if !allow_through {
            continue;
        }
        if let Some(neighbours) = adjacency.get(id) {
            for next in neighbours {
                stack.push(next);
            }
        }
    }
    visited
}

/// Extract the frequency response from the named label-source injection
/// point to the named label-sink (or block id) over `omega`, defaulting to
/// `with_zero(logspace(-3, 3, 300))`.
///
/// Every block reachable both forward from the input and backward from the
/// output must be expressible as a complex gain; anything else aborts the
/// extraction.
pub fn diagram_to_frd(
    diagram: &Diagram,
    input: &str,
    output: &str,
    omega: Option<&[f64]>,
) -> Result<Frd> {
    let input_name = input.trim();
    let output_name = output.trim();
    let by_id: HashMap<&str, &Block> = diagram
        .blocks
        .iter()
        .map(|block| (block.id.as_str(), block))
        .collect();

    let input_block = diagram
        .blocks
        .iter()
        .find(|block| block.kind == BlockType::LabelSource && block.label_name() == input_name)
        .ok_or_else(|| SimflowError::input_label_not_found(input_name))?;
    let output_block = diagram
        .blocks
        .iter()
        .find(|block| block.kind == BlockType::LabelSink && block.label_name() == output_name)
        .or_else(|| diagram.blocks.iter().find(|block| block.id == output_name))
        .ok_or_else(|| SimflowError::output_label_not_found(output_name))?;

    let mut forward: HashMap<String, Vec<String>> = HashMap::new();
    let mut backward: HashMap<String, Vec<String>> = HashMap::new();
    for block in &diagram.blocks {
        forward.insert(block.id.clone(), Vec::new());
        backward.insert(block.id.clone(), Vec::new());
    }
    for conn in &diagram.connections {
        if !forward.contains_key(&conn.from) || !forward.contains_key(&conn.to) {
            continue;
        }
        if let Some(out) = forward.get_mut(&conn.from) {
            out.push(conn.to.clone());
        }
        if let Some(back) = backward.get_mut(&conn.to) {
            back.push(conn.from.clone());
        }
    }

    let forward_reach = traverse(&input_block.id, &forward, &by_id);
    let backward_reach = traverse(&output_block.id, &backward, &by_id);
    let mut active: HashSet<&str> = forward_reach
        .intersection(&backward_reach)
        .copied()
        .collect();
    active.insert(&input_block.id);
    active.insert(&output_block.id);

    let unsupported: Vec<&str> = diagram
        .blocks
        .iter()
        .filter(|block| active.contains(block.id.as_str()) && !is_linear(block.kind))
        .map(|block| block.kind.tag())
        .collect();
    if !unsupported.is_empty() {
        return Err(SimflowError::unsupported_linear_blocks(unsupported));
    }

    let blocks: Vec<&Block> = diagram
        .blocks
        .iter()
        .filter(|block| active.contains(block.id.as_str()) && is_linear(block.kind))
        .collect();
    let params: Vec<BlockParams> = blocks
        .iter()
        .map(|block| resolve_block_params(block, &diagram.variables))
        .collect();

    let input_map = build_linear_input_map(&blocks, &diagram.connections);
    let id_index: HashMap<&str, usize> = blocks
        .iter()
        .enumerate()
        .map(|(idx, block)| (block.id.as_str(), idx))
        .collect();
    let out_idx = id_index[output_block.id.as_str()];

    let freq = with_zero(match omega {
        Some(grid) if !grid.is_empty() => grid.to_vec(),
        _ => logspace(-3.0, 3.0, 300),
    });
    log::debug!(
        "linear extraction {input_name} -> {output_name}: {} active blocks, {} frequencies",
        blocks.len(),
        freq.len()
    );

    let n = blocks.len();
    let mut response = Vec::with_capacity(freq.len());
    for &w in &freq {
        let s = Complex64::new(0.0, w);
        let mut a = vec![vec![Complex64::new(0.0, 0.0); n]; n];
        let mut b = vec![Complex64::new(0.0, 0.0); n];

        for (block, block_params) in blocks.iter().zip(&params) {
            let row = id_index[block.id.as_str()];
            a[row][row] = Complex64::new(1.0, 0.0);
            let inputs = &input_map[&block.id];

            match block.kind {
                BlockType::LabelSource => {
                    let driven = block.label_name() == input_name;
                    b[row] = Complex64::new(if driven { 1.0 } else { 0.0 }, 0.0);
                }
                BlockType::Sum => {
                    for (idx, from_id) in inputs.iter().enumerate() {
                        let Some(from_id) = from_id else { continue };
                        let Some(&col) = id_index.get(from_id.as_str()) else {
                            continue;
                        };
                        let mut sign = block_params.sign_at(idx);
                        if !sign.is_finite() {
                            sign = 0.0;
                        }
                        a[row][col] -= Complex64::new(sign, 0.0);
                    }
                }
                BlockType::LabelSink => {
                    if let Some(from_id) = inputs.first().and_then(Option::as_ref) {
                        if let Some(&col) = id_index.get(from_id.as_str()) {
                            a[row][col] -= Complex64::new(1.0, 0.0);
                        }
                    }
                }
                _ => {
                    let Some(gain) = block_gain(block.kind, block_params, s) else {
                        continue;
                    };
                    let Some(from_id) = inputs.first().and_then(Option::as_ref) else {
                        continue;
                    };
                    if let Some(&col) = id_index.get(from_id.as_str()) {
                        a[row][col] -= gain;
                    }
                }
            }
        }

        match solve_linear_system(&a, &b) {
            Some(solution) => response.push(solution[out_idx]),
            None => response.push(Complex64::new(f64::NAN, f64::NAN)),
        }
    }

    Ok(Frd {
        omega: freq,
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Connection, ParamValue};
    use approx::assert_abs_diff_eq;

    fn label(id: &str, kind: BlockType, name: &str) -> Block {
        let mut block = Block::new(id, kind);
        block
            .params
            .insert("name".into(), ParamValue::Text(name.into()));
        block
    }

    fn gain(id: &str, value: f64) -> Block {
        let mut block = Block::new(id, BlockType::Gain);
        block
            .params
            .insert("gain".into(), ParamValue::Number(value));
        block
    }

    #[test]
    fn gain_chain_is_flat_across_frequency() {
        let diagram = Diagram {
            blocks: vec![
                label("in", BlockType::LabelSource, "u"),
                gain("g", 2.0),
                label("out", BlockType::LabelSink, "y"),
            ],
            connections: vec![Connection::new("in", "g"), Connection::new("g", "out")],
            variables: HashMap::new(),
        };
        let frd = diagram_to_frd(&diagram, "u", "y", Some(&[1.0, 10.0])).unwrap();
        assert_eq!(frd.omega, vec![0.0, 1.0, 10.0]);
        for sample in &frd.response {
            assert_abs_diff_eq!(sample.re, 2.0, epsilon = 1e-12);
            assert_abs_diff_eq!(sample.im, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn integrator_gives_minus_j_at_unit_frequency() {
        let diagram = Diagram {
            blocks: vec![
                label("in", BlockType::LabelSource, "u"),
                Block::new("i", BlockType::Integrator),
                label("out", BlockType::LabelSink, "y"),
            ],
            connections: vec![Connection::new("in", "i"), Connection::new("i", "out")],
            variables: HashMap::new(),
        };
        let frd = diagram_to_frd(&diagram, "u", "y", Some(&[1.0])).unwrap();
        // omega = [0, 1]; the integrator is singular at zero frequency
        assert!(frd.response[0].re.is_nan());
        assert_abs_diff_eq!(frd.response[1].re, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(frd.response[1].im, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn negative_feedback_solves_the_loop() {
        // y = 2(u - y) => y/u = 2/3
        let mut sum = Block::new("s", BlockType::Sum);
        sum.params.insert(
            "signs".into(),
            ParamValue::List(vec![ParamValue::Number(1.0), ParamValue::Number(-1.0)]),
        );
        let diagram = Diagram {
            blocks: vec![
                label("in", BlockType::LabelSource, "u"),
                sum,
                gain("g", 2.0),
                label("out", BlockType::LabelSink, "y"),
            ],
            connections: vec![
                Connection::new("in", "s"),
                Connection::new("s", "g"),
                Connection::new("g", "out"),
                Connection::ports("g", 0, "s", 1),
            ],
            variables: HashMap::new(),
        };
        let frd = diagram_to_frd(&diagram, "u", "y", Some(&[1.0])).unwrap();
        for sample in &frd.response {
            assert_abs_diff_eq!(sample.re, 2.0 / 3.0, epsilon = 1e-12);
            assert_abs_diff_eq!(sample.im, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn unsupported_block_in_the_loop_is_rejected() {
        let diagram = Diagram {
            blocks: vec![
                label("in", BlockType::LabelSource, "u"),
                Block::new("m", BlockType::Mult),
                label("out", BlockType::LabelSink, "y"),
            ],
            connections: vec![Connection::new("in", "m"), Connection::new("m", "out")],
            variables: HashMap::new(),
        };
        let err = diagram_to_frd(&diagram, "u", "y", None).unwrap_err();
        match err {
            SimflowError::UnsupportedLinearBlocks { types } => assert_eq!(types, "mult"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_labels_are_reported() {
        let diagram = Diagram {
            blocks: vec![label("in", BlockType::LabelSource, "u")],
            connections: vec![],
            variables: HashMap::new(),
        };
        assert!(matches!(
            diagram_to_frd(&diagram, "nope", "y", None),
            Err(SimflowError::InputLabelNotFound { .. })
        ));
        assert!(matches!(
            diagram_to_frd(&diagram, "u", "nope", None),
            Err(SimflowError::OutputLabelNotFound { .. })
        ));
    }

    #[test]
    fn blocks_outside_the_loop_are_ignored() {
        // a scope hanging off the gain must not trip the linearity check
        let diagram = Diagram {
            blocks: vec![
                label("in", BlockType::LabelSource, "u"),
                gain("g", 3.0),
                Block::new("watch", BlockType::Scope),
                label("out", BlockType::LabelSink, "y"),
            ],
            connections: vec![
                Connection::new("in", "g"),
                Connection::new("g", "watch"),
                Connection::new("g", "out"),
            ],
            variables: HashMap::new(),
        };
        let frd = diagram_to_frd(&diagram, "u", "y", Some(&[1.0])).unwrap();
        assert_abs_diff_eq!(frd.response[1].re, 3.0, epsilon = 1e-12);
    }
}
