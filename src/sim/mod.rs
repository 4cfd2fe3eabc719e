//! Step-wise diagram evaluation: context, algebraic planning, engine.

mod context;
mod engine;
mod plan;

pub use context::{value_changed, AlgebraicStatus, BlockState, PortReading, SimContext};
pub use engine::{AlgebraicMode, SimConfig, Simulation};
pub use plan::{build_algebraic_plan, AlgebraicPlan};
