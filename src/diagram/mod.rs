//! Diagram data model and run-preparation helpers.
//!
//! A [`Diagram`] is the in-memory shape shared with the editor and any host
//! driver: typed blocks, directed connections, and a variable environment
//! for parameter expressions. [`graph`] derives the per-run structures the
//! engine needs from it (port counts, the input map, resolved parameters).

mod graph;
mod model;

pub use graph::{
    build_input_map, infer_input_counts, resolve_block_params, source_block_id, source_key,
    BlockParams,
};
pub(crate) use graph::resolve_param_array;
pub use model::{Block, BlockType, Connection, Diagram, ParamValue, PortRef, SubsystemSpec};
