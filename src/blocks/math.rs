//! Arithmetic handlers: gain, signed sum, and product.
//!
//! All three are algebraic: they defer (return `None`) until their
//! connected inputs have resolved, so the fixed-point loop can order
//! itself around combinational chains.

use crate::diagram::Block;
use crate::sim::{PortReading, SimContext};

pub fn gain_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let input = match ctx.read_port(&block.id, 0) {
        PortReading::Value(value) => value,
        // An unconnected gain never resolves; the output stays missing.
        _ => return None,
    };
    let raw = ctx.params(&block.id).number_or("gain", f64::NAN);
    // A gain of 0 (or an unresolvable one) falls back to unity here; the
    // linear analysis engine keeps 0 as 0.
    let k = if raw == 0.0 || raw.is_nan() { 1.0 } else { raw };
    Some(ctx.publish(&block.id, input * k))
}

pub fn sum_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let count = ctx.input_count(&block.id);
    let mut total = 0.0;
    for idx in 0..count {
        let value = match ctx.read_port(&block.id, idx) {
            PortReading::Unconnected => 0.0,
            // Any connected-but-unresolved port defers the whole sum.
            PortReading::Pending => return None,
            PortReading::Value(value) => value,
        };
        total += value * ctx.params(&block.id).sign_at(idx);
    }
    Some(ctx.publish(&block.id, total))
}

pub fn mult_algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    let count = ctx.input_count(&block.id);
    let mut factors = [1.0; 3];
    for (idx, factor) in factors.iter_mut().enumerate() {
        if idx >= count {
            break;
        }
        match ctx.read_port(&block.id, idx) {
            PortReading::Unconnected | PortReading::Pending => return None,
            PortReading::Value(value) => *factor = value,
        }
    }
    Some(ctx.publish(&block.id, factors[0] * factors[1] * factors[2]))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::diagram::{resolve_block_params, BlockType, ParamValue};
    use crate::sim::SimContext;
    use approx::assert_relative_eq;

    fn ctx_with(block: &Block, inputs: Vec<Option<String>>) -> SimContext {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.resolved.insert(
            block.id.clone(),
            resolve_block_params(block, &ctx.variables),
        );
        ctx.input_map.insert(block.id.clone(), inputs);
        ctx
    }

    #[test]
    fn gain_defers_until_input_resolves() {
        let mut block = Block::new("g", BlockType::Gain);
        block.params.insert("gain".into(), ParamValue::Number(2.5));
        let mut ctx = ctx_with(&block, vec![Some("src".into())]);

        assert_eq!(gain_algebraic(&block, &mut ctx), None);
        ctx.outputs.insert("src".into(), 4.0);
        assert_eq!(gain_algebraic(&block, &mut ctx), Some(true));
        assert_relative_eq!(ctx.outputs["g"], 10.0);
        // a second pass with the same input reports no change
        assert_eq!(gain_algebraic(&block, &mut ctx), Some(false));
    }

    #[test]
    fn zero_gain_falls_back_to_unity() {
        let mut block = Block::new("g", BlockType::Gain);
        block.params.insert("gain".into(), ParamValue::Number(0.0));
        let mut ctx = ctx_with(&block, vec![Some("src".into())]);
        ctx.outputs.insert("src".into(), 3.0);
        gain_algebraic(&block, &mut ctx);
        assert_relative_eq!(ctx.outputs["g"], 3.0);
    }

    #[test]
    fn sum_applies_signs_and_treats_unconnected_as_zero() {
        let mut block = Block::new("s", BlockType::Sum);
        block.params.insert(
            "signs".into(),
            ParamValue::List(vec![
                ParamValue::Number(1.0),
                ParamValue::Number(-1.0),
                ParamValue::Number(1.0),
            ]),
        );
        let mut ctx = ctx_with(
            &block,
            vec![Some("a".into()), Some("b".into()), None],
        );
        ctx.outputs.insert("a".into(), 5.0);
        assert_eq!(sum_algebraic(&block, &mut ctx), None);
        ctx.outputs.insert("b".into(), 2.0);
        assert_eq!(sum_algebraic(&block, &mut ctx), Some(true));
        assert_relative_eq!(ctx.outputs["s"], 3.0);
    }

    #[test]
    fn mult_requires_every_connected_port() {
        let block = Block::new("m", BlockType::Mult);
        let mut ctx = ctx_with(&block, vec![Some("a".into()), Some("b".into())]);
        ctx.outputs.insert("a".into(), 3.0);
        assert_eq!(mult_algebraic(&block, &mut ctx), None);
        ctx.outputs.insert("b".into(), 4.0);
        assert_eq!(mult_algebraic(&block, &mut ctx), Some(true));
        assert_relative_eq!(ctx.outputs["m"], 12.0);
    }
}
