//! Error types for the Simflow simulation core.
//!
//! This module provides a unified error type [`SimflowError`] that covers
//! all error conditions that can occur while extracting linear analysis
//! results from a diagram or coefficient data. Simulation itself never
//! fails: handlers degrade to documented defaults and non-convergence is
//! reported through the step status instead.

use thiserror::Error;

/// Result type alias using [`SimflowError`].
pub type Result<T> = std::result::Result<T, SimflowError>;

/// Unified error type for all Simflow operations.
#[derive(Error, Debug)]
pub enum SimflowError {
    // ============ Linear Analysis Errors ============
    /// The named input label source does not exist in the diagram
    #[error("Input label source '{name}' not found for linear extraction")]
    InputLabelNotFound { name: String },

    /// The named output endpoint does not exist in the diagram
    #[error("Output label sink '{name}' not found for linear extraction")]
    OutputLabelNotFound { name: String },

    /// Blocks inside the active loop cannot be expressed as complex gains
    #[error("Unsupported blocks for linear extraction: {types}")]
    UnsupportedLinearBlocks { types: String },

    /// Transfer-function coefficients with an identically zero denominator
    #[error("Transfer function denominator is identically zero")]
    ZeroDenominator,

    /// System data shape not accepted by the margins solver
    #[error("Unsupported system data for stability margin analysis")]
    UnsupportedSystemData,
}

impl SimflowError {
    /// Create a missing input label error
    pub fn input_label_not_found(name: impl Into<String>) -> Self {
        Self::InputLabelNotFound { name: name.into() }
    }

    /// Create a missing output endpoint error
    pub fn output_label_not_found(name: impl Into<String>) -> Self {
        Self::OutputLabelNotFound { name: name.into() }
    }

    /// Create an unsupported-blocks error from the offending type tags
    pub fn unsupported_linear_blocks<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        Self::UnsupportedLinearBlocks {
            types: types.join(", "),
        }
    }
}
