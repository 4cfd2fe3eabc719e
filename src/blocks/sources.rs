//! Source handlers: pure signal generators resolved at the start of each
//! step, before the algebraic loop runs.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::diagram::{Block, BlockType};
use crate::sim::{value_changed, BlockState, SimContext};

/// One pass of label-source rebinding: copy each named sink's upstream
/// value onto its matching sources. A source whose sink upstream has not
/// resolved yet is left untouched for a later pass; every other case
/// (missing name, missing sink, unconnected sink) binds to 0. Sources
/// acting as subsystem boundary ports are skipped, their values come from
/// external injection.
///
/// Returns true when any source value changed, so the algebraic loop can
/// count it as progress.
pub fn resolve_label_sources_once(
    blocks: &[Block],
    outputs: &mut HashMap<String, f64>,
    input_map: &HashMap<String, Vec<Option<String>>>,
    label_sinks: &HashMap<String, String>,
) -> bool {
    let mut changed = false;
    for block in blocks {
        if block.kind != BlockType::LabelSource || block.is_external_port() {
            continue;
        }
        let name = block.label_name();
        let mut next = 0.0;
        if !name.is_empty() {
            if let Some(sink_id) = label_sinks.get(name) {
                let upstream = input_map
                    .get(sink_id)
                    .and_then(|inputs| inputs.first())
                    .and_then(|key| key.as_deref());
                match upstream {
                    None => {}
                    Some(key) => match outputs.get(key) {
                        // upstream pending, try again next pass
                        None => continue,
                        Some(value) => next = *value,
                    },
                }
            }
        }
        match outputs.insert(block.id.clone(), next) {
            None => changed = true,
            Some(prev) => changed |= value_changed(prev, next),
        }
    }
    changed
}

pub fn constant_output(block: &Block, ctx: &mut SimContext) {
    let value = ctx.params(&block.id).number_or("value", 0.0);
    ctx.publish(&block.id, value);
}

pub fn step_output(block: &Block, ctx: &mut SimContext) {
    let step_time = ctx.params(&block.id).number_or("stepTime", 0.0);
    let out = if ctx.t >= step_time { 1.0 } else { 0.0 };
    ctx.publish(&block.id, out);
}

pub fn ramp_output(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let slope = params.number_or("slope", 0.0);
    let start = params.number_or("start", 0.0);
    let out = if ctx.t >= start {
        slope * (ctx.t - start)
    } else {
        0.0
    };
    ctx.publish(&block.id, out);
}

pub fn impulse_output(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let time_point = params.number_or("time", 0.0);
    let amp = params.number_or("amp", 0.0);
    let out = if (ctx.t - time_point).abs() <= ctx.dt / 2.0 {
        amp / ctx.dt.max(1e-6)
    } else {
        0.0
    };
    ctx.publish(&block.id, out);
}

pub fn sine_output(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let amp = params.number_or("amp", 0.0);
    let freq = params.number_or("freq", 0.0);
    let phase = params.number_or("phase", 0.0);
    let out = amp * (2.0 * std::f64::consts::PI * freq * ctx.t + phase).sin();
    ctx.publish(&block.id, out);
}

pub fn chirp_output(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let amp = params.number_or("amp", 0.0);
    let f0 = params.number_or("f0", 0.0);
    let f1 = params.number_or("f1", 0.0);
    let t1 = params.number_or("t1", 1.0).max(0.001);
    let k = (f1 - f0) / t1;
    let phase = 2.0 * std::f64::consts::PI * (f0 * ctx.t + 0.5 * k * ctx.t * ctx.t);
    ctx.publish(&block.id, amp * phase.sin());
}

pub fn noise_init(block: &Block, ctx: &mut SimContext) {
    let seed = ctx.params(&block.id).number("seed");
    let rng = match seed {
        Some(seed) if seed.is_finite() => StdRng::seed_from_u64(seed as u64),
        _ => StdRng::from_entropy(),
    };
    ctx.states.insert(block.id.clone(), BlockState::Noise { rng });
}

pub fn noise_output(block: &Block, ctx: &mut SimContext) {
    let amp = ctx.params(&block.id).number_or("amp", 0.0);
    let sample = match ctx.states.get_mut(&block.id) {
        Some(BlockState::Noise { rng }) => rng.gen::<f64>() * 2.0 - 1.0,
        _ => 0.0,
    };
    ctx.publish(&block.id, amp * sample);
}

pub fn file_source_init(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let variables = &ctx.variables;
    let times = crate::diagram::resolve_param_array(params.raw("times"), variables);
    let values = crate::diagram::resolve_param_array(params.raw("values"), variables);
    ctx.states.insert(
        block.id.clone(),
        BlockState::FileSource {
            times,
            values,
            cursor: 0,
        },
    );
}

/// Step-wise lookup: advance the cursor while the next sample time has
/// passed, then hold that sample.
pub fn file_source_output(block: &Block, ctx: &mut SimContext) {
    let t = ctx.t;
    let out = match ctx.states.get_mut(&block.id) {
        Some(BlockState::FileSource {
            times,
            values,
            cursor,
        }) if !times.is_empty() => {
            while *cursor + 1 < times.len() && times[*cursor + 1] <= t {
                *cursor += 1;
            }
            values.get(*cursor).copied().unwrap_or(0.0)
        }
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

/// At the start of a step, a label source simply republishes whatever
/// flows into its (usually absent) input; the per-iteration rebinding in
/// the algebraic loop supplies the actual label value.
pub fn label_source_output(block: &Block, ctx: &mut SimContext) {
    let value = ctx.input_value(&block.id, 0, 0.0);
    ctx.publish(&block.id, value);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::diagram::{resolve_block_params, BlockType, ParamValue};
    use approx::assert_relative_eq;

    fn ctx_at(t: f64) -> SimContext {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.t = t;
        ctx
    }

    fn with_params(kind: BlockType, pairs: &[(&str, f64)]) -> (Block, SimContext) {
        let mut block = Block::new("b", kind);
        for (key, value) in pairs {
            block
                .params
                .insert((*key).into(), ParamValue::Number(*value));
        }
        let mut ctx = ctx_at(0.0);
        ctx.resolved
            .insert("b".into(), resolve_block_params(&block, &ctx.variables));
        (block, ctx)
    }

    #[test]
    fn step_switches_at_step_time() {
        let (block, mut ctx) = with_params(BlockType::Step, &[("stepTime", 0.5)]);
        step_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.0);
        ctx.t = 0.5;
        step_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 1.0);
    }

    #[test]
    fn ramp_starts_at_start_time() {
        let (block, mut ctx) =
            with_params(BlockType::Ramp, &[("slope", 2.0), ("start", 1.0)]);
        ctx.t = 0.5;
        ramp_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.0);
        ctx.t = 2.0;
        ramp_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 2.0);
    }

    #[test]
    fn impulse_fires_within_half_step() {
        let (block, mut ctx) =
            with_params(BlockType::Impulse, &[("time", 0.1), ("amp", 1.0)]);
        ctx.t = 0.1;
        impulse_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 100.0);
        ctx.t = 0.2;
        impulse_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.0);
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let (block, mut ctx) =
            with_params(BlockType::Noise, &[("amp", 1.0), ("seed", 7.0)]);
        noise_init(&block, &mut ctx);
        noise_output(&block, &mut ctx);
        let first = ctx.outputs["b"];
        assert!((-1.0..=1.0).contains(&first));

        let (block2, mut ctx2) =
            with_params(BlockType::Noise, &[("amp", 1.0), ("seed", 7.0)]);
        noise_init(&block2, &mut ctx2);
        noise_output(&block2, &mut ctx2);
        assert_relative_eq!(ctx2.outputs["b"], first);
    }

    #[test]
    fn file_source_holds_between_samples() {
        let mut block = Block::new("b", BlockType::FileSource);
        block.params.insert(
            "times".into(),
            ParamValue::List(vec![
                ParamValue::Number(0.0),
                ParamValue::Number(1.0),
                ParamValue::Number(2.0),
            ]),
        );
        block.params.insert(
            "values".into(),
            ParamValue::List(vec![
                ParamValue::Number(5.0),
                ParamValue::Number(7.0),
                ParamValue::Number(9.0),
            ]),
        );
        let mut ctx = ctx_at(0.0);
        ctx.resolved
            .insert("b".into(), resolve_block_params(&block, &ctx.variables));
        file_source_init(&block, &mut ctx);

        file_source_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 5.0);
        ctx.t = 1.5;
        file_source_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 7.0);
        ctx.t = 10.0;
        file_source_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 9.0);
    }

    #[test]
    fn label_rebinding_waits_for_pending_upstreams() {
        let mut source = Block::new("src", BlockType::LabelSource);
        source
            .params
            .insert("name".into(), ParamValue::Text("loop".into()));
        let blocks = vec![source];

        let mut outputs: HashMap<String, f64> = HashMap::new();
        let mut input_map: HashMap<String, Vec<Option<String>>> = HashMap::new();
        input_map.insert("sink".into(), vec![Some("plant".into())]);
        let mut label_sinks = HashMap::new();
        label_sinks.insert("loop".to_string(), "sink".to_string());

        // upstream of the sink has not resolved: the source stays untouched
        assert!(!resolve_label_sources_once(
            &blocks,
            &mut outputs,
            &input_map,
            &label_sinks
        ));
        assert!(!outputs.contains_key("src"));

        outputs.insert("plant".into(), 2.5);
        assert!(resolve_label_sources_once(
            &blocks,
            &mut outputs,
            &input_map,
            &label_sinks
        ));
        assert_relative_eq!(outputs["src"], 2.5);

        // a second pass with the same value reports no change
        assert!(!resolve_label_sources_once(
            &blocks,
            &mut outputs,
            &input_map,
            &label_sinks
        ));
    }

    #[test]
    fn external_port_label_source_keeps_its_injected_value() {
        let mut source = Block::new("src", BlockType::LabelSource);
        source
            .params
            .insert("name".into(), ParamValue::Text("loop".into()));
        source
            .params
            .insert("isExternalPort".into(), ParamValue::Bool(true));
        let blocks = vec![source];

        let mut outputs: HashMap<String, f64> = HashMap::new();
        outputs.insert("src".into(), 4.0);
        outputs.insert("plant".into(), 2.5);
        let mut input_map: HashMap<String, Vec<Option<String>>> = HashMap::new();
        input_map.insert("sink".into(), vec![Some("plant".into())]);
        let mut label_sinks = HashMap::new();
        label_sinks.insert("loop".to_string(), "sink".to_string());

        assert!(!resolve_label_sources_once(
            &blocks,
            &mut outputs,
            &input_map,
            &label_sinks
        ));
        assert_relative_eq!(outputs["src"], 4.0);
    }

    #[test]
    fn unnamed_label_source_binds_to_zero() {
        let source = Block::new("src", BlockType::LabelSource);
        let blocks = vec![source];
        let mut outputs = HashMap::new();
        assert!(resolve_label_sources_once(
            &blocks,
            &mut outputs,
            &HashMap::new(),
            &HashMap::new()
        ));
        assert_relative_eq!(outputs["src"], 0.0);
    }
}
