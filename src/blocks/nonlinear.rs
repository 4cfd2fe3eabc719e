//! Nonlinear handlers: saturation, slew-rate limit, and backlash.

use crate::diagram::Block;
use crate::sim::{BlockState, PortReading, SimContext};

pub fn saturation_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let input = match ctx.read_port(&block.id, 0) {
        PortReading::Value(value) => value,
        _ => return None,
    };
    let params = ctx.params(&block.id);
    let min = params.number_or("min", f64::NAN);
    let max = params.number_or("max", f64::NAN);
    let out = min.max(max.min(input));
    Some(ctx.publish(&block.id, out))
}

pub fn rate_init(block: &Block, ctx: &mut SimContext) {
    ctx.states
        .insert(block.id.clone(), BlockState::Rate { held: 0.0 });
}

pub fn rate_output(block: &Block, ctx: &mut SimContext) {
    let held = match ctx.states.get(&block.id) {
        Some(BlockState::Rate { held }) => *held,
        _ => 0.0,
    };
    ctx.publish(&block.id, held);
}

pub fn rate_update(block: &Block, ctx: &mut SimContext) {
    let params = ctx.params(&block.id);
    let rise = params.number_or("rise", f64::NAN).max(0.0);
    let fall = params.number_or("fall", f64::NAN).max(0.0);
    let input = ctx.input_value(&block.id, 0, 0.0);
    let dt = ctx.dt;
    if let Some(BlockState::Rate { held }) = ctx.states.get_mut(&block.id) {
        let max_rise = *held + rise * dt;
        let max_fall = *held - fall * dt;
        *held = max_rise.min(max_fall.max(input));
    }
}

pub fn backlash_init(block: &Block, ctx: &mut SimContext) {
    ctx.states.insert(
        block.id.clone(),
        BlockState::Backlash { edge: 0.0, output: 0.0 },
    );
}

pub fn backlash_output(block: &Block, ctx: &mut SimContext) {
    let out = match ctx.states.get(&block.id) {
        Some(BlockState::Backlash { output, .. }) => *output,
        _ => 0.0,
    };
    ctx.publish(&block.id, out);
}

pub fn backlash_update(block: &Block, ctx: &mut SimContext) {
    let width = ctx.params(&block.id).number_or("width", 0.0).max(0.0);
    let input = ctx.input_value(&block.id, 0, 0.0);
    if let Some(BlockState::Backlash { edge, output }) = ctx.states.get_mut(&block.id) {
        // Dead band of `width` centered on the held edge.
        let mut out = *edge;
        if input > *edge + width / 2.0 {
            out = input - width / 2.0;
        }
        if input < *edge - width / 2.0 {
            out = input + width / 2.0;
        }
        *edge = out;
        *output = out;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::diagram::{resolve_block_params, BlockType, ParamValue};
    use approx::assert_relative_eq;

    fn prepared(kind: BlockType, pairs: &[(&str, f64)]) -> (Block, SimContext) {
        let mut block = Block::new("b", kind);
        for (key, value) in pairs {
            block
                .params
                .insert((*key).into(), ParamValue::Number(*value));
        }
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.resolved
            .insert("b".into(), resolve_block_params(&block, &ctx.variables));
        ctx.input_map.insert("b".into(), vec![Some("u".into())]);
        (block, ctx)
    }

    #[test]
    fn saturation_clamps_to_limits() {
        let (block, mut ctx) =
            prepared(BlockType::Saturation, &[("min", -1.0), ("max", 1.0)]);
        ctx.outputs.insert("u".into(), 3.0);
        saturation_algebraic(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 1.0);
        ctx.outputs.insert("u".into(), -0.5);
        saturation_algebraic(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], -0.5);
    }

    #[test]
    fn rate_limits_slew_per_second() {
        let (block, mut ctx) =
            prepared(BlockType::Rate, &[("rise", 10.0), ("fall", 10.0)]);
        rate_init(&block, &mut ctx);
        ctx.outputs.insert("u".into(), 1.0);
        // each step may rise at most rise * dt = 0.1
        rate_update(&block, &mut ctx);
        rate_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.1);
        rate_update(&block, &mut ctx);
        rate_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.2);
    }

    #[test]
    fn backlash_tracks_edges_through_dead_band() {
        let (block, mut ctx) = prepared(BlockType::Backlash, &[("width", 1.0)]);
        backlash_init(&block, &mut ctx);
        ctx.outputs.insert("u".into(), 2.0);
        backlash_update(&block, &mut ctx);
        backlash_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 1.5);
        // small reversal inside the band holds the output
        ctx.outputs.insert("u".into(), 1.8);
        backlash_update(&block, &mut ctx);
        backlash_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 1.5);
        // a large reversal re-engages on the other edge
        ctx.outputs.insert("u".into(), 0.0);
        backlash_update(&block, &mut ctx);
        backlash_output(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["b"], 0.5);
    }
}
