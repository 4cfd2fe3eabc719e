//! Per-run structure derivation: port counts, the input map, and resolved
//! block parameters.

use std::collections::HashMap;

use crate::expr::resolve_numeric;

use super::model::{Block, BlockType, Connection, ParamValue};

/// The outputs-map key for a block port: `id` for port 0, `id:index`
/// otherwise.
pub fn source_key(from: &str, from_index: usize) -> String {
    if from_index > 0 {
        format!("{from}:{from_index}")
    } else {
        from.to_string()
    }
}

/// Recover the block id from a source key.
pub fn source_block_id(key: &str) -> &str {
    match key.find(':') {
        Some(idx) => &key[..idx],
        None => key,
    }
}

/// Number of signs a `sum` block declares, from its raw `signs` parameter.
fn declared_sign_count(block: &Block) -> usize {
    match block.param("signs") {
        Some(ParamValue::List(items)) => items.len(),
        Some(ParamValue::Text(text)) => text.split(',').filter(|s| !s.trim().is_empty()).count(),
        _ => 0,
    }
}

/// Infer each block's input count: the highest connected `toIndex` plus one,
/// extended for `sum` blocks to the length of their `signs` array.
pub fn infer_input_counts(
    blocks: &[Block],
    connections: &[Connection],
) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = blocks
        .iter()
        .map(|block| {
            let base = if block.kind == BlockType::Sum {
                declared_sign_count(block)
            } else {
                0
            };
            (block.id.clone(), base)
        })
        .collect();
    for conn in connections {
        if let Some(count) = counts.get_mut(&conn.to) {
            *count = (*count).max(conn.to_index + 1);
        }
    }
    counts
}

/// Build the per-block ordered list of source keys. `None` entries are
/// unconnected ports. At most one connection may terminate at a given
/// `(to, toIndex)`; later connections overwrite earlier ones.
pub fn build_input_map(
    blocks: &[Block],
    connections: &[Connection],
    input_counts: &HashMap<String, usize>,
) -> HashMap<String, Vec<Option<String>>> {
    let mut map: HashMap<String, Vec<Option<String>>> = blocks
        .iter()
        .map(|block| {
            let count = input_counts.get(&block.id).copied().unwrap_or(0);
            (block.id.clone(), vec![None; count])
        })
        .collect();
    for conn in connections {
        if let Some(inputs) = map.get_mut(&conn.to) {
            if conn.to_index < inputs.len() {
                inputs[conn.to_index] = Some(source_key(&conn.from, conn.from_index));
            }
        }
    }
    map
}

/// Resolved parameters for one block: numeric values and arrays where the
/// Expression Resolver applied, raw values for the pass-through keys.
#[derive(Debug, Clone, Default)]
pub struct BlockParams(HashMap<String, ParamValue>);

impl BlockParams {
    /// The raw (possibly pass-through) value for a key.
    pub fn raw(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    /// A resolved scalar, if the key resolved to one.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ParamValue::as_number)
    }

    /// A resolved scalar with a fallback for missing keys.
    pub fn number_or(&self, key: &str, fallback: f64) -> f64 {
        self.number(key).unwrap_or(fallback)
    }

    /// A saturation limit: the resolved value when the key is present,
    /// otherwise the (typically infinite) fallback.
    pub fn limit(&self, key: &str, fallback: f64) -> f64 {
        match self.number(key) {
            Some(value) if value.is_finite() => value,
            Some(_) | None => fallback,
        }
    }

    /// A resolved coefficient array (empty when the key is absent or
    /// scalar).
    pub fn array(&self, key: &str) -> Vec<f64> {
        match self.0.get(key) {
            Some(ParamValue::List(items)) => items
                .iter()
                .map(|item| item.as_number().unwrap_or(0.0))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The sign applied to a `sum` input port. Missing entries default to
    /// +1; unparseable entries are NaN and contaminate the sum.
    pub fn sign_at(&self, idx: usize) -> f64 {
        match self.0.get("signs") {
            Some(ParamValue::List(items)) => match items.get(idx) {
                Some(item) => coerce_number(item),
                None => 1.0,
            },
            _ => 1.0,
        }
    }

    /// The raw text of a pass-through key (switch conditions, label names).
    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ParamValue::as_text)
    }
}

/// Loose numeric coercion for raw sign entries, matching the editor's JSON.
fn coerce_number(value: &ParamValue) -> f64 {
    match value {
        ParamValue::Number(v) => *v,
        ParamValue::Bool(true) => 1.0,
        ParamValue::Bool(false) | ParamValue::Null => 0.0,
        ParamValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

/// Keys that skip the Expression Resolver for a given block type.
fn is_pass_through(kind: BlockType, key: &str) -> bool {
    if key == "signs" {
        return true;
    }
    match kind {
        BlockType::LabelSource | BlockType::LabelSink => {
            matches!(key, "name" | "isExternalPort")
        }
        BlockType::Subsystem => matches!(
            key,
            "name" | "subsystem" | "externalInputs" | "externalOutputs"
        ),
        BlockType::Switch => key == "condition",
        BlockType::FileSource | BlockType::FileSink => {
            matches!(key, "path" | "times" | "values")
        }
        _ => false,
    }
}

/// Resolve one block's parameters against the variable environment.
/// Scalars and arrays evaluate through the Expression Resolver with
/// non-finite results mapped to 0; pass-through keys keep their raw value.
pub fn resolve_block_params(block: &Block, variables: &HashMap<String, f64>) -> BlockParams {
    let mut resolved = HashMap::with_capacity(block.params.len());
    for (key, value) in &block.params {
        if is_pass_through(block.kind, key) {
            resolved.insert(key.clone(), value.clone());
            continue;
        }
        let out = match value {
            ParamValue::List(items) => ParamValue::List(
                items
                    .iter()
                    .map(|item| ParamValue::Number(resolve_numeric(item, variables)))
                    .collect(),
            ),
            other => ParamValue::Number(resolve_numeric(other, variables)),
        };
        resolved.insert(key.clone(), out);
    }
    BlockParams(resolved)
}

/// Resolve a raw value to a numeric array for handlers that accept either
/// lists or comma-separated expression strings (`times`/`values` payloads).
pub(crate) fn resolve_param_array(
    value: Option<&ParamValue>,
    variables: &HashMap<String, f64>,
) -> Vec<f64> {
    match value {
        Some(value) => crate::expr::resolve_array(value, variables),
        None => Vec::new(),
    }
}
