//! Utility handlers: the signal switch and the nested subsystem composer.
//!
//! A subsystem block owns a complete inner simulation context built from
//! its spec at init time. Each outer algebraic pass re-solves the inner
//! diagram against the current external inputs, so algebraic loops that
//! cross the subsystem boundary still settle; inner dynamic state advances
//! once per outer step.

use std::collections::{HashMap, HashSet};

use crate::blocks;
use crate::blocks::sources::resolve_label_sources_once;
use crate::diagram::{
    build_input_map, infer_input_counts, resolve_block_params, source_key, Block, BlockType,
    ParamValue, SubsystemSpec,
};
use crate::sim::{
    build_algebraic_plan, value_changed, AlgebraicPlan, BlockState, SimContext,
};

fn condition_true(condition: &str, input: f64, threshold: f64) -> bool {
    match condition {
        "gt" => input > threshold,
        "ne" => input != threshold,
        _ => input >= threshold,
    }
}

pub fn switch_init(block: &Block, ctx: &mut SimContext) {
    ctx.states
        .insert(block.id.clone(), BlockState::Switch { output: 0.0 });
}

/// Route the top or bottom input depending on the condition input. A
/// routed-from port that has not resolved this pass falls back to its
/// block's held output, so switches inside algebraic loops stay stable.
pub fn switch_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let read = |idx: usize| -> f64 {
        match ctx.input_key(&block.id, idx) {
            None => 0.0,
            Some(key) => match ctx.outputs.get(key) {
                Some(value) => *value,
                None => ctx.held_output(key).unwrap_or(0.0),
            },
        }
    };
    let top = read(0);
    let cond = read(1);
    let bottom = read(2);

    let params = ctx.params(&block.id);
    let condition = params
        .text("condition")
        .filter(|text| !text.is_empty())
        .unwrap_or("ge")
        .to_string();
    let raw_threshold = params.number_or("threshold", f64::NAN);
    let threshold = if raw_threshold.is_finite() {
        raw_threshold
    } else {
        0.0
    };

    let out = if condition_true(&condition, cond, threshold) {
        top
    } else {
        bottom
    };
    let changed = ctx.publish(&block.id, out);
    match ctx.states.get_mut(&block.id) {
        Some(BlockState::Switch { output }) => *output = out,
        _ => {
            ctx.states
                .insert(block.id.clone(), BlockState::Switch { output: out });
        }
    }
    Some(changed)
}

/// The composed inner simulation behind one subsystem block.
#[derive(Debug)]
pub struct SubsystemState {
    blocks: Vec<Block>,
    ctx: SimContext,
    /// External input injections: inner block id and its boundary index.
    input_ports: Vec<(String, usize)>,
    /// Inner block id per declared external output index.
    output_by_index: Vec<Option<String>>,
    plan: AlgebraicPlan,
    has_labels: bool,
    output_idx: Vec<usize>,
    after_idx: Vec<usize>,
    update_idx: Vec<usize>,
    pub last_iterations: usize,
    pub hit_max_iterations: bool,
    pub last_primary: f64,
    pub last_values: Vec<f64>,
}

impl SubsystemState {
    /// Build the inner context from a spec: floored port counts, resolved
    /// parameters against the outer variable environment, and the phase
    /// rosters. Runs the inner init phase.
    pub fn build(spec: &SubsystemSpec, outer: &SimContext) -> Self {
        let blocks: Vec<Block> = spec.blocks.clone();

        // every inner block gets at least one port on each side
        let mut counts = infer_input_counts(&blocks, &spec.connections);
        for count in counts.values_mut() {
            *count = (*count).max(1);
        }
        let input_map = build_input_map(&blocks, &spec.connections, &counts);

        let mut ctx = SimContext::new(outer.dt, outer.max_iterations, outer.variables.clone());
        ctx.input_map = input_map;
        for block in &blocks {
            ctx.resolved
                .insert(block.id.clone(), resolve_block_params(block, &ctx.variables));
        }

        let known: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        let input_ports: Vec<(String, usize)> = spec
            .external_inputs
            .iter()
            .enumerate()
            .filter(|(_, port)| known.contains(port.id.as_str()))
            .map(|(idx, port)| (port.id.clone(), idx))
            .collect();
        let externals: HashSet<&str> = input_ports.iter().map(|(id, _)| id.as_str()).collect();
        let mut output_by_index = vec![None; spec.external_outputs.len()];
        for (idx, port) in spec.external_outputs.iter().enumerate() {
            if known.contains(port.id.as_str()) {
                output_by_index[idx] = Some(port.id.clone());
            }
        }

        let has_labels = blocks
            .iter()
            .any(|b| matches!(b.kind, BlockType::LabelSource | BlockType::LabelSink));

        let mut output_idx = Vec::new();
        let mut algebraic_idx = Vec::new();
        let mut after_idx = Vec::new();
        let mut update_idx = Vec::new();
        for (idx, block) in blocks.iter().enumerate() {
            if blocks::has_after_step(block.kind) {
                after_idx.push(idx);
            }
            if blocks::has_update(block.kind) {
                update_idx.push(idx);
            }
            if externals.contains(block.id.as_str()) {
                continue;
            }
            if blocks::has_output(block.kind) {
                output_idx.push(idx);
            }
            if blocks::has_algebraic(block.kind) {
                algebraic_idx.push(idx);
            }
        }
        let plan = build_algebraic_plan(&blocks, &algebraic_idx, &ctx.input_map);

        for block in &blocks {
            if blocks::has_init(block.kind) {
                blocks::init(block, &mut ctx);
            }
        }

        Self {
            blocks,
            ctx,
            input_ports,
            output_by_index,
            plan,
            has_labels,
            output_idx,
            after_idx,
            update_idx,
            last_iterations: 0,
            hit_max_iterations: false,
            last_primary: 0.0,
            last_values: Vec::new(),
        }
    }

    /// Solve the inner diagram against the given external inputs and
    /// return the primary output plus all declared boundary values.
    pub fn run_outputs(&mut self, in_values: &[f64], dt: f64, t: f64) -> (f64, Vec<f64>) {
        let Self {
            blocks,
            ctx,
            input_ports,
            output_by_index,
            plan,
            has_labels,
            output_idx,
            last_iterations,
            hit_max_iterations,
            ..
        } = self;
        ctx.dt = dt;
        ctx.t = t;
        ctx.outputs.clear();

        apply_external_inputs(input_ports, &mut ctx.outputs, in_values);
        for &idx in output_idx.iter() {
            blocks::output(&blocks[idx], ctx);
        }

        if *has_labels || !plan.ordered.is_empty() {
            if !*has_labels && !plan.has_cycle {
                // loop-free: one pass in dependency order settles exactly
                for &idx in &plan.ordered {
                    blocks::algebraic(&blocks[idx], ctx);
                }
            } else {
                let max_iter = ctx.max_iterations;
                let mut progress = true;
                let mut iter = 0;
                while progress && iter < max_iter {
                    iter += 1;
                    progress = false;
                    if *has_labels
                        && resolve_label_sources_once(
                            blocks,
                            &mut ctx.outputs,
                            &ctx.input_map,
                            &ctx.label_sinks,
                        )
                    {
                        progress = true;
                    }
                    apply_external_inputs(input_ports, &mut ctx.outputs, in_values);
                    for &idx in &plan.ordered {
                        if blocks::algebraic(&blocks[idx], ctx) == Some(true) {
                            progress = true;
                        }
                    }
                    if *has_labels
                        && resolve_label_sources_once(
                            blocks,
                            &mut ctx.outputs,
                            &ctx.input_map,
                            &ctx.label_sinks,
                        )
                    {
                        progress = true;
                    }
                    apply_external_inputs(input_ports, &mut ctx.outputs, in_values);
                }
                *last_iterations = iter;
                *hit_max_iterations = progress && iter >= max_iter;
            }
        }

        let mut values = vec![0.0; output_by_index.len()];
        for (idx, entry) in output_by_index.iter().enumerate() {
            if let Some(id) = entry {
                values[idx] = external_output_value(ctx, id);
            }
        }
        let primary = values.first().copied().unwrap_or(0.0);
        (primary, values)
    }

    /// Advance the inner dynamic state one outer step.
    pub fn advance(&mut self, dt: f64, t: f64) {
        let Self {
            blocks,
            ctx,
            after_idx,
            update_idx,
            ..
        } = self;
        ctx.dt = dt;
        ctx.t = t;
        for &idx in after_idx.iter() {
            blocks::after_step(&blocks[idx], ctx);
        }
        for &idx in update_idx.iter() {
            blocks::update(&blocks[idx], ctx);
        }
    }
}

fn apply_external_inputs(
    input_ports: &[(String, usize)],
    outputs: &mut HashMap<String, f64>,
    in_values: &[f64],
) {
    for (id, idx) in input_ports {
        let value = in_values.get(*idx).copied().unwrap_or(0.0);
        outputs.insert(id.clone(), value);
    }
}

/// The value behind a declared external output: the block's own output
/// when it resolved, otherwise (for sink-style blocks that never publish)
/// the value feeding its first input port.
fn external_output_value(ctx: &SimContext, id: &str) -> f64 {
    if let Some(value) = ctx.outputs.get(id) {
        return *value;
    }
    match ctx.input_key(id, 0) {
        Some(key) => ctx.outputs.get(key).copied().unwrap_or(0.0),
        None => 0.0,
    }
}

pub fn subsystem_init(block: &Block, ctx: &mut SimContext) {
    let spec = match ctx.params(&block.id).raw("subsystem") {
        Some(ParamValue::Subsystem(spec)) => spec.clone(),
        _ => return,
    };
    let state = SubsystemState::build(&spec, ctx);
    ctx.states
        .insert(block.id.clone(), BlockState::Subsystem(Box::new(state)));
}

/// Start-of-step output: republish the previous solve's boundary values
/// so downstream blocks have something to read before the loop runs.
pub fn subsystem_output(block: &Block, ctx: &mut SimContext) {
    let (primary, values) = match ctx.states.get(&block.id) {
        Some(BlockState::Subsystem(sub)) => (sub.last_primary, sub.last_values.clone()),
        _ => {
            ctx.publish(&block.id, 0.0);
            return;
        }
    };
    ctx.publish(&block.id, primary);
    for (idx, value) in values.iter().enumerate().skip(1) {
        ctx.outputs.insert(source_key(&block.id, idx), *value);
    }
}

pub fn subsystem_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let count = ctx.input_count(&block.id);
    let in_values: Vec<f64> = (0..count)
        .map(|idx| ctx.input_value(&block.id, idx, 0.0))
        .collect();

    // take the state out so the inner solve can borrow it mutably
    let mut sub = match ctx.states.remove(&block.id) {
        Some(BlockState::Subsystem(sub)) => sub,
        Some(other) => {
            ctx.states.insert(block.id.clone(), other);
            return None;
        }
        None => return None,
    };
    let (primary, values) = sub.run_outputs(&in_values, ctx.dt, ctx.t);

    let mut changed = match ctx.outputs.insert(block.id.clone(), primary) {
        None => true,
        Some(prev) => value_changed(prev, primary),
    };
    for (idx, value) in values.iter().enumerate().skip(1) {
        let prev = ctx.outputs.insert(source_key(&block.id, idx), *value);
        if !changed {
            changed = match prev {
                None => true,
                Some(prev) => value_changed(prev, *value),
            };
        }
    }

    sub.last_primary = primary;
    sub.last_values = values;
    ctx.states
        .insert(block.id.clone(), BlockState::Subsystem(sub));
    Some(changed)
}

pub fn subsystem_update(block: &Block, ctx: &mut SimContext) {
    let (dt, t) = (ctx.dt, ctx.t);
    match ctx.states.remove(&block.id) {
        Some(BlockState::Subsystem(mut sub)) => {
            sub.advance(dt, t);
            ctx.states
                .insert(block.id.clone(), BlockState::Subsystem(sub));
        }
        Some(other) => {
            ctx.states.insert(block.id.clone(), other);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Connection, PortRef};
    use approx::assert_relative_eq;

    fn port(id: &str) -> PortRef {
        PortRef { id: id.into() }
    }

    fn gain_block(id: &str, gain: f64) -> Block {
        let mut block = Block::new(id, BlockType::Gain);
        block.params.insert("gain".into(), ParamValue::Number(gain));
        block
    }

    #[test]
    fn subsystem_doubles_its_external_input() {
        let mut input = Block::new("in", BlockType::LabelSource);
        input
            .params
            .insert("isExternalPort".into(), ParamValue::Bool(true));
        let spec = SubsystemSpec {
            blocks: vec![input, gain_block("g", 2.0)],
            connections: vec![Connection::new("in", "g")],
            external_inputs: vec![port("in")],
            external_outputs: vec![port("g")],
        };
        let outer = SimContext::new(0.01, 50, HashMap::new());
        let mut sub = SubsystemState::build(&spec, &outer);

        let (primary, values) = sub.run_outputs(&[3.0], 0.01, 0.0);
        assert_relative_eq!(primary, 6.0);
        assert_eq!(values.len(), 1);
        assert!(!sub.hit_max_iterations);
    }

    #[test]
    fn external_output_falls_back_to_sink_upstream() {
        let mut input = Block::new("in", BlockType::LabelSource);
        input
            .params
            .insert("isExternalPort".into(), ParamValue::Bool(true));
        let mut sink = Block::new("out", BlockType::LabelSink);
        sink.params
            .insert("name".into(), ParamValue::Text("y".into()));
        let spec = SubsystemSpec {
            blocks: vec![input, gain_block("g", 3.0), sink],
            connections: vec![Connection::new("in", "g"), Connection::new("g", "out")],
            external_inputs: vec![port("in")],
            external_outputs: vec![port("out")],
        };
        let outer = SimContext::new(0.01, 50, HashMap::new());
        let mut sub = SubsystemState::build(&spec, &outer);

        // the label sink never publishes; the boundary reads its feed
        let (primary, _) = sub.run_outputs(&[2.0], 0.01, 0.0);
        assert_relative_eq!(primary, 6.0);
    }

    #[test]
    fn inner_integrator_state_advances_only_on_update() {
        let mut input = Block::new("in", BlockType::LabelSource);
        input
            .params
            .insert("isExternalPort".into(), ParamValue::Bool(true));
        let integ = Block::new("i", BlockType::Integrator);
        let spec = SubsystemSpec {
            blocks: vec![input, integ],
            connections: vec![Connection::new("in", "i")],
            external_inputs: vec![port("in")],
            external_outputs: vec![port("i")],
        };
        let outer = SimContext::new(0.1, 50, HashMap::new());
        let mut sub = SubsystemState::build(&spec, &outer);

        // repeated solves at the same instant do not integrate
        let (first, _) = sub.run_outputs(&[1.0], 0.1, 0.0);
        let (second, _) = sub.run_outputs(&[1.0], 0.1, 0.0);
        assert_relative_eq!(first, 0.0);
        assert_relative_eq!(second, 0.0);

        sub.advance(0.1, 0.0);
        let (third, _) = sub.run_outputs(&[1.0], 0.1, 0.1);
        assert_relative_eq!(third, 0.1);
    }

    #[test]
    fn switch_routes_on_condition_and_holds_on_pending() {
        let mut block = Block::new("sw", BlockType::Switch);
        block
            .params
            .insert("condition".into(), ParamValue::Text("gt".into()));
        block
            .params
            .insert("threshold".into(), ParamValue::Number(0.5));
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.resolved.insert(
            "sw".into(),
            resolve_block_params(&block, &ctx.variables),
        );
        ctx.input_map.insert(
            "sw".into(),
            vec![Some("top".into()), Some("cond".into()), Some("bot".into())],
        );
        switch_init(&block, &mut ctx);

        ctx.outputs.insert("top".into(), 10.0);
        ctx.outputs.insert("bot".into(), -10.0);
        ctx.outputs.insert("cond".into(), 1.0);
        assert_eq!(switch_algebraic(&block, &mut ctx), Some(true));
        assert_relative_eq!(ctx.outputs["sw"], 10.0);

        ctx.outputs.insert("cond".into(), 0.5);
        switch_algebraic(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["sw"], -10.0);

        // pending top falls back to that block's held output
        ctx.outputs.insert("cond".into(), 1.0);
        ctx.outputs.remove("top");
        ctx.states
            .insert("top".into(), BlockState::Switch { output: 4.0 });
        switch_algebraic(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["sw"], 4.0);
    }
}
