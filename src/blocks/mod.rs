//! Block handler palette.
//!
//! Each block type implements a subset of the five evaluation phases:
//! `init` (once per run), `output` (start of step), `algebraic` (inside
//! the fixed-point loop, returning whether the published value changed),
//! `after_step` (recording, once the step settles) and `update` (advance
//! dynamic state). `finalize` runs once after the last step. The engine
//! asks the `has_*` predicates up front to build its per-phase rosters.

pub mod continuous;
pub mod discrete;
pub mod math;
pub mod nonlinear;
pub mod sinks;
pub mod sources;
pub mod subsystem;

use crate::diagram::{Block, BlockType};
use crate::sim::SimContext;

use BlockType::*;

pub fn has_init(kind: BlockType) -> bool {
    matches!(
        kind,
        Noise
            | FileSource
            | Integrator
            | Tf
            | Delay
            | StateSpace
            | Lpf
            | Hpf
            | Derivative
            | Pid
            | Rate
            | Backlash
            | Zoh
            | Foh
            | Dtf
            | Ddelay
            | DstateSpace
            | Switch
            | Subsystem
            | Scope
            | XyScope
            | FileSink
            | LabelSink
    )
}

pub fn has_output(kind: BlockType) -> bool {
    matches!(
        kind,
        Constant
            | Step
            | Ramp
            | Impulse
            | Sine
            | Chirp
            | Noise
            | FileSource
            | LabelSource
            | Integrator
            | Tf
            | Delay
            | StateSpace
            | Lpf
            | Hpf
            | Derivative
            | Pid
            | Rate
            | Backlash
            | Zoh
            | Foh
            | Dtf
            | Ddelay
            | DstateSpace
            | Subsystem
    )
}

pub fn has_algebraic(kind: BlockType) -> bool {
    matches!(kind, Gain | Sum | Mult | Saturation | Tf | Switch | Subsystem)
}

pub fn has_update(kind: BlockType) -> bool {
    matches!(
        kind,
        Integrator
            | Tf
            | Delay
            | StateSpace
            | Lpf
            | Hpf
            | Derivative
            | Pid
            | Rate
            | Backlash
            | Zoh
            | Foh
            | Dtf
            | Ddelay
            | DstateSpace
            | Subsystem
    )
}

pub fn has_after_step(kind: BlockType) -> bool {
    matches!(kind, Scope | XyScope | FileSink)
}

pub fn has_finalize(kind: BlockType) -> bool {
    matches!(kind, FileSink)
}

pub fn init(block: &Block, ctx: &mut SimContext) {
    match block.kind {
        Noise => sources::noise_init(block, ctx),
        FileSource => sources::file_source_init(block, ctx),
        Integrator => continuous::integrator_init(block, ctx),
        Tf => continuous::tf_init(block, ctx),
        Delay => continuous::delay_init(block, ctx),
        StateSpace => continuous::state_space_init(block, ctx),
        Lpf => continuous::lpf_init(block, ctx),
        Hpf => continuous::hpf_init(block, ctx),
        Derivative => continuous::derivative_init(block, ctx),
        Pid => continuous::pid_init(block, ctx),
        Rate => nonlinear::rate_init(block, ctx),
        Backlash => nonlinear::backlash_init(block, ctx),
        Zoh => discrete::zoh_init(block, ctx),
        Foh => discrete::foh_init(block, ctx),
        Dtf => discrete::dtf_init(block, ctx),
        Ddelay => discrete::ddelay_init(block, ctx),
        DstateSpace => discrete::dstate_space_init(block, ctx),
        Switch => subsystem::switch_init(block, ctx),
        Subsystem => subsystem::subsystem_init(block, ctx),
        Scope => sinks::scope_init(block, ctx),
        XyScope => sinks::xy_scope_init(block, ctx),
        FileSink => sinks::file_sink_init(block, ctx),
        LabelSink => sinks::label_sink_init(block, ctx),
        _ => {}
    }
}

pub fn output(block: &Block, ctx: &mut SimContext) {
    match block.kind {
        Constant => sources::constant_output(block, ctx),
        Step => sources::step_output(block, ctx),
        Ramp => sources::ramp_output(block, ctx),
        Impulse => sources::impulse_output(block, ctx),
        Sine => sources::sine_output(block, ctx),
        Chirp => sources::chirp_output(block, ctx),
        Noise => sources::noise_output(block, ctx),
        FileSource => sources::file_source_output(block, ctx),
        LabelSource => sources::label_source_output(block, ctx),
        Integrator => continuous::integrator_output(block, ctx),
        Tf => continuous::tf_output(block, ctx),
        Delay => continuous::delay_output(block, ctx),
        StateSpace => continuous::state_space_output(block, ctx),
        Lpf => continuous::lpf_output(block, ctx),
        Hpf => continuous::hpf_output(block, ctx),
        Derivative => continuous::derivative_output(block, ctx),
        Pid => continuous::pid_output(block, ctx),
        Rate => nonlinear::rate_output(block, ctx),
        Backlash => nonlinear::backlash_output(block, ctx),
        Zoh => discrete::zoh_output(block, ctx),
        Foh => discrete::foh_output(block, ctx),
        Dtf => discrete::dtf_output(block, ctx),
        Ddelay => discrete::ddelay_output(block, ctx),
        DstateSpace => discrete::dstate_space_output(block, ctx),
        Subsystem => subsystem::subsystem_output(block, ctx),
        _ => {}
    }
}

pub fn algebraic(block: &Block, ctx: &mut SimContext) -> Option<bool> {
    match block.kind {
        Gain => math::gain_algebraic(block, ctx),
        Sum => math::sum_algebraic(block, ctx),
        Mult => math::mult_algebraic(block, ctx),
        Saturation => nonlinear::saturation_algebraic(block, ctx),
        Tf => continuous::tf_algebraic(block, ctx),
        Switch => subsystem::switch_algebraic(block, ctx),
        Subsystem => subsystem::subsystem_algebraic(block, ctx),
        _ => None,
    }
}

pub fn update(block: &Block, ctx: &mut SimContext) {
    match block.kind {
        Integrator => continuous::integrator_update(block, ctx),
        Tf => continuous::tf_update(block, ctx),
        Delay => continuous::delay_update(block, ctx),
        StateSpace => continuous::state_space_update(block, ctx),
        Lpf => continuous::lpf_update(block, ctx),
        Hpf => continuous::hpf_update(block, ctx),
        Derivative => continuous::derivative_update(block, ctx),
        Pid => continuous::pid_update(block, ctx),
        Rate => nonlinear::rate_update(block, ctx),
        Backlash => nonlinear::backlash_update(block, ctx),
        Zoh => discrete::zoh_update(block, ctx),
        Foh => discrete::foh_update(block, ctx),
        Dtf => discrete::dtf_update(block, ctx),
        Ddelay => discrete::ddelay_update(block, ctx),
        DstateSpace => discrete::dstate_space_update(block, ctx),
        Subsystem => subsystem::subsystem_update(block, ctx),
        _ => {}
    }
}

pub fn after_step(block: &Block, ctx: &mut SimContext) {
    match block.kind {
        Scope => sinks::scope_after_step(block, ctx),
        XyScope => sinks::xy_scope_after_step(block, ctx),
        FileSink => sinks::file_sink_after_step(block, ctx),
        _ => {}
    }
}

pub fn finalize(block: &Block, ctx: &mut SimContext) {
    if block.kind == FileSink {
        sinks::file_sink_finalize(block, ctx);
    }
}
