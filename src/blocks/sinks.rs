//! Sink handlers: recorders sampled after each step settles, plus the
//! label sink registration that backs virtual wiring.

use crate::diagram::Block;
use crate::sim::{BlockState, SimContext};

pub fn scope_init(block: &Block, ctx: &mut SimContext) {
    let count = ctx.input_count(&block.id);
    ctx.states.insert(
        block.id.clone(),
        BlockState::Scope {
            series: vec![Vec::new(); count],
        },
    );
}

/// Record one sample per input port; unconnected or unresolved ports
/// record a gap rather than a zero.
pub fn scope_after_step(block: &Block, ctx: &mut SimContext) {
    let samples: Vec<Option<f64>> = (0..ctx.input_count(&block.id))
        .map(|idx| {
            ctx.input_key(&block.id, idx)
                .and_then(|key| ctx.outputs.get(key).copied())
        })
        .collect();
    if let Some(BlockState::Scope { series }) = ctx.states.get_mut(&block.id) {
        for (idx, sample) in samples.into_iter().enumerate() {
            if let Some(channel) = series.get_mut(idx) {
                channel.push(sample);
            }
        }
    }
}

pub fn xy_scope_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::XyScope {
            x: Vec::new(),
            y: Vec::new(),
        },
    );
}

pub fn xy_scope_after_step(block: &Block, ctx: &mut SimContext) {
    let x_val = ctx
        .input_key(&block.id, 0)
        .and_then(|key| ctx.outputs.get(key).copied());
    let y_val = ctx
        .input_key(&block.id, 1)
        .and_then(|key| ctx.outputs.get(key).copied());
    if let Some(BlockState::XyScope { x, y }) = ctx.states.get_mut(&block.id) {
        x.push(x_val);
        y.push(y_val);
    }
}

pub fn file_sink_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::FileSink {
            time: Vec::new(),
            values: Vec::new(),
            csv: None,
        },
    );
}

pub fn file_sink_after_step(block: &Block, ctx: &mut SimContext) {
    let value = ctx
        .input_key(&block.id, 0)
        .and_then(|key| ctx.outputs.get(key).copied())
        .unwrap_or(0.0);
    let t = ctx.t;
    if let Some(BlockState::FileSink { time, values, .. }) = ctx.states.get_mut(&block.id) {
        time.push(t);
        values.push(value);
    }
}

/// Render the recorded series as `t,value` CSV, available through the
/// state record once the run finishes.
pub fn file_sink_finalize(block: &Block, ctx: &mut SimContext) {
    if let Some(BlockState::FileSink { time, values, csv }) = ctx.states.get_mut(&block.id) {
        let mut rows = String::from("t,value");
        for (t, value) in time.iter().zip(values.iter()) {
            rows.push('\n');
            rows.push_str(&format!("{t},{value}"));
        }
        *csv = Some(rows);
    }
}

/// A label sink has no runtime behavior of its own; it registers its name
/// so label sources can bind to its input during the algebraic loop.
pub fn label_sink_init(block: &Block, ctx: &mut SimContext) {
    if let Some(name) = ctx.params(&block.id).text("name") {
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            ctx.label_sinks
                .insert(trimmed.to_string(), block.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::diagram::{resolve_block_params, BlockType, ParamValue};

    fn ctx_for(block: &Block, inputs: Vec<Option<String>>) -> SimContext {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.resolved.insert(
            block.id.clone(),
            resolve_block_params(block, &ctx.variables),
        );
        ctx.input_map.insert(block.id.clone(), inputs);
        ctx
    }

    #[test]
    fn scope_records_gaps_for_missing_values() {
        let block = Block::new("scope", BlockType::Scope);
        let mut ctx = ctx_for(&block, vec![Some("a".into()), None]);
        scope_init(&block, &mut ctx);

        ctx.outputs.insert("a".into(), 1.5);
        scope_after_step(&block, &mut ctx);
        ctx.outputs.remove("a");
        scope_after_step(&block, &mut ctx);

        match &ctx.states["scope"] {
            BlockState::Scope { series } => {
                assert_eq!(series[0], vec![Some(1.5), None]);
                assert_eq!(series[1], vec![None, None]);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn file_sink_renders_csv() {
        let block = Block::new("sink", BlockType::FileSink);
        let mut ctx = ctx_for(&block, vec![Some("a".into())]);
        file_sink_init(&block, &mut ctx);

        ctx.outputs.insert("a".into(), 2.0);
        file_sink_after_step(&block, &mut ctx);
        ctx.t = 0.01;
        ctx.outputs.insert("a".into(), 3.0);
        file_sink_after_step(&block, &mut ctx);
        file_sink_finalize(&block, &mut ctx);

        match &ctx.states["sink"] {
            BlockState::FileSink { csv, .. } => {
                assert_eq!(csv.as_deref(), Some("t,value\n0,2\n0.01,3"));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn label_sink_registers_trimmed_name() {
        let mut block = Block::new("sink", BlockType::LabelSink);
        block
            .params
            .insert("name".into(), ParamValue::Text("  loop  ".into()));
        let mut ctx = ctx_for(&block, vec![Some("a".into())]);
        label_sink_init(&block, &mut ctx);
        assert_eq!(ctx.label_sinks.get("loop").map(String::as_str), Some("sink"));

        let unnamed = Block::new("other", BlockType::LabelSink);
        let mut ctx2 = ctx_for(&unnamed, vec![]);
        label_sink_init(&unnamed, &mut ctx2);
        assert!(ctx2.label_sinks.is_empty());
    }
}
