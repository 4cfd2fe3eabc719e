//! The step-by-step evaluation engine.
//!
//! A [`Simulation`] owns the diagram's blocks and a [`SimContext`] for one
//! run. Each step runs the phases in order: `output`, the algebraic
//! resolution loop, `afterStep`, `update`. On label-free acyclic diagrams
//! the algebraic loop collapses to a single pass in topological order; the
//! two strategies produce identical series on such diagrams.

use std::collections::HashMap;

use crate::blocks;
use crate::blocks::sources::resolve_label_sources_once;
use crate::diagram::{build_input_map, infer_input_counts, resolve_block_params, BlockType, Diagram};
use crate::sim::context::{AlgebraicStatus, BlockState, SimContext};
use crate::sim::plan::{build_algebraic_plan, AlgebraicPlan};

/// How the engine resolves the algebraic sub-graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlgebraicMode {
    /// Use the topological plan when the sub-graph is label-free and
    /// acyclic, fall back to fixed-point iteration otherwise.
    #[default]
    Auto,
    /// Always iterate to a fixed point.
    Iterative,
}

/// Run configuration.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Step size in seconds.
    pub dt: f64,
    /// Bound on fixed-point passes per step.
    pub max_iterations: usize,
    pub mode: AlgebraicMode,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt: crate::DEFAULT_STEP_SIZE,
            max_iterations: crate::DEFAULT_MAX_ITERATIONS,
            mode: AlgebraicMode::Auto,
        }
    }
}

impl SimConfig {
    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_mode(mut self, mode: AlgebraicMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One evaluation run over a diagram.
#[derive(Debug)]
pub struct Simulation {
    blocks: Vec<crate::diagram::Block>,
    ctx: SimContext,
    config: SimConfig,
    plan: AlgebraicPlan,
    /// Algebraic candidates in declaration order, for the iterative path.
    candidates: Vec<usize>,
    has_labels: bool,
    output_idx: Vec<usize>,
    after_idx: Vec<usize>,
    update_idx: Vec<usize>,
    finalize_idx: Vec<usize>,
    status: AlgebraicStatus,
    steps: usize,
}

impl Simulation {
    /// Prepare a run: infer ports, resolve parameters, build the phase
    /// rosters and the algebraic plan, and run every `init` handler.
    pub fn new(diagram: &Diagram, config: SimConfig) -> Self {
        let blocks = diagram.blocks.clone();
        let counts = infer_input_counts(&blocks, &diagram.connections);
        let input_map = build_input_map(&blocks, &diagram.connections, &counts);

        let mut ctx = SimContext::new(config.dt, config.max_iterations, diagram.variables.clone());
        ctx.input_map = input_map;
        for block in &blocks {
            ctx.resolved
                .insert(block.id.clone(), resolve_block_params(block, &ctx.variables));
        }

        let mut output_idx = Vec::new();
        let mut candidates = Vec::new();
        let mut after_idx = Vec::new();
        let mut update_idx = Vec::new();
        let mut finalize_idx = Vec::new();
        for (idx, block) in blocks.iter().enumerate() {
            if blocks::has_output(block.kind) {
                output_idx.push(idx);
            }
            if blocks::has_algebraic(block.kind) {
                candidates.push(idx);
            }
            if blocks::has_after_step(block.kind) {
                after_idx.push(idx);
            }
            if blocks::has_update(block.kind) {
                update_idx.push(idx);
            }
            if blocks::has_finalize(block.kind) {
                finalize_idx.push(idx);
            }
        }
        let has_labels = blocks
            .iter()
            .any(|b| matches!(b.kind, BlockType::LabelSource | BlockType::LabelSink));
        let plan = build_algebraic_plan(&blocks, &candidates, &ctx.input_map);

        for block in &blocks {
            if blocks::has_init(block.kind) {
                blocks::init(block, &mut ctx);
            }
        }
        log::debug!(
            "simulation prepared: {} blocks, {} algebraic, labels={}, cycle={}",
            blocks.len(),
            candidates.len(),
            has_labels,
            plan.has_cycle
        );

        Self {
            blocks,
            ctx,
            config,
            plan,
            candidates,
            has_labels,
            output_idx,
            after_idx,
            update_idx,
            finalize_idx,
            status: AlgebraicStatus::default(),
            steps: 0,
        }
    }

    /// Evaluate one step at `t = steps · dt`.
    pub fn step(&mut self) {
        let Self {
            blocks,
            ctx,
            config,
            plan,
            candidates,
            has_labels,
            output_idx,
            after_idx,
            update_idx,
            status,
            steps,
            ..
        } = self;
        ctx.t = *steps as f64 * config.dt;
        ctx.outputs.clear();

        for &idx in output_idx.iter() {
            blocks::output(&blocks[idx], ctx);
        }

        let fast_path =
            config.mode == AlgebraicMode::Auto && !*has_labels && !plan.has_cycle;
        if fast_path {
            for &idx in &plan.ordered {
                blocks::algebraic(&blocks[idx], ctx);
            }
            *status = AlgebraicStatus {
                iterations: usize::from(!plan.ordered.is_empty()),
                hit_max_iterations: false,
            };
        } else {
            let max_iter = config.max_iterations;
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
                for &idx in candidates.iter() {
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
            }
            *status = AlgebraicStatus {
                iterations: iter,
                hit_max_iterations: progress && iter >= max_iter,
            };
            if status.hit_max_iterations {
                log::warn!(
                    "algebraic loop still changing after {max_iter} passes at t={}",
                    ctx.t
                );
            }
        }

        for &idx in after_idx.iter() {
            blocks::after_step(&blocks[idx], ctx);
        }
        for &idx in update_idx.iter() {
            blocks::update(&blocks[idx], ctx);
        }
        *steps += 1;
    }

    /// Step from t = 0 through `duration` inclusive.
    pub fn run_for(&mut self, duration: f64) {
        let samples = (duration / self.config.dt).floor() as usize;
        for _ in 0..=samples {
            self.step();
        }
    }

    /// Run every `finalize` handler (CSV materialization and the like).
    pub fn finalize(&mut self) {
        let Self {
            blocks,
            ctx,
            finalize_idx,
            ..
        } = self;
        for &idx in finalize_idx.iter() {
            blocks::finalize(&blocks[idx], ctx);
        }
    }

    /// Simulated time of the last executed step.
    pub fn time(&self) -> f64 {
        self.ctx.t
    }

    /// Steps executed so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// The outputs map of the last executed step.
    pub fn outputs(&self) -> &HashMap<String, f64> {
        &self.ctx.outputs
    }

    /// One output by source key.
    pub fn output(&self, key: &str) -> Option<f64> {
        self.ctx.outputs.get(key).copied()
    }

    /// Algebraic-loop outcome of the last executed step.
    pub fn status(&self) -> AlgebraicStatus {
        self.status
    }

    /// Recorded scope channels, one series per input port.
    pub fn scope_series(&self, id: &str) -> Option<&[Vec<Option<f64>>]> {
        match self.ctx.states.get(id) {
            Some(BlockState::Scope { series }) => Some(series),
            _ => None,
        }
    }

    /// Recorded XY pair series.
    pub fn xy_series(&self, id: &str) -> Option<(&[Option<f64>], &[Option<f64>])> {
        match self.ctx.states.get(id) {
            Some(BlockState::XyScope { x, y }) => Some((x, y)),
            _ => None,
        }
    }

    /// CSV text rendered by a file sink after [`Simulation::finalize`].
    pub fn sink_csv(&self, id: &str) -> Option<&str> {
        match self.ctx.states.get(id) {
            Some(BlockState::FileSink { csv, .. }) => csv.as_deref(),
            _ => None,
        }
    }

    /// Inner-loop outcome of a subsystem block's latest solve.
    pub fn subsystem_status(&self, id: &str) -> Option<AlgebraicStatus> {
        match self.ctx.states.get(id) {
            Some(BlockState::Subsystem(sub)) => Some(AlgebraicStatus {
                iterations: sub.last_iterations,
                hit_max_iterations: sub.hit_max_iterations,
            }),
            _ => None,
        }
    }
}
