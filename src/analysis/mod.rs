//! Linear stability analysis: frequency responses extracted from diagrams
//! or transfer-function coefficients, and the margins derived from them.

mod diagram;
mod lti;
mod margins;

pub use diagram::{diagram_to_frd, linear_input_count};
pub use lti::{eval_poly, eval_transfer, logspace, with_zero, Frd};
pub use margins::{
    margin, phase_crossover_frequencies, stability_margins, stability_margins_all,
    MarginCandidates, StabilityMargins, SystemData,
};
