//! Serde-backed diagram types, mirroring the editor's camelCase JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The closed set of block types the engine knows how to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockType {
    // Sources
    Constant,
    Step,
    Ramp,
    Impulse,
    Sine,
    Chirp,
    Noise,
    FileSource,
    LabelSource,
    // Math
    Gain,
    Sum,
    Mult,
    // Nonlinear
    Saturation,
    Rate,
    Backlash,
    // Continuous dynamics
    Integrator,
    Tf,
    Delay,
    StateSpace,
    Lpf,
    Hpf,
    Derivative,
    Pid,
    // Discrete dynamics
    Zoh,
    Foh,
    Dtf,
    Ddelay,
    DstateSpace,
    // Utility
    Switch,
    Subsystem,
    // Sinks
    Scope,
    XyScope,
    FileSink,
    LabelSink,
}

impl BlockType {
    /// The camelCase tag used in diagram JSON and diagnostics.
    pub fn tag(self) -> &'static str {
        match self {
            BlockType::Constant => "constant",
            BlockType::Step => "step",
            BlockType::Ramp => "ramp",
            BlockType::Impulse => "impulse",
            BlockType::Sine => "sine",
            BlockType::Chirp => "chirp",
            BlockType::Noise => "noise",
            BlockType::FileSource => "fileSource",
            BlockType::LabelSource => "labelSource",
            BlockType::Gain => "gain",
            BlockType::Sum => "sum",
            BlockType::Mult => "mult",
            BlockType::Saturation => "saturation",
            BlockType::Rate => "rate",
            BlockType::Backlash => "backlash",
            BlockType::Integrator => "integrator",
            BlockType::Tf => "tf",
            BlockType::Delay => "delay",
            BlockType::StateSpace => "stateSpace",
            BlockType::Lpf => "lpf",
            BlockType::Hpf => "hpf",
            BlockType::Derivative => "derivative",
            BlockType::Pid => "pid",
            BlockType::Zoh => "zoh",
            BlockType::Foh => "foh",
            BlockType::Dtf => "dtf",
            BlockType::Ddelay => "ddelay",
            BlockType::DstateSpace => "dstateSpace",
            BlockType::Switch => "switch",
            BlockType::Subsystem => "subsystem",
            BlockType::Scope => "scope",
            BlockType::XyScope => "xyScope",
            BlockType::FileSink => "fileSink",
            BlockType::LabelSink => "labelSink",
        }
    }
}

/// A raw block parameter value as it appears in the diagram.
///
/// Numbers and expression strings are the common cases; lists hold
/// coefficient arrays, and `Subsystem` carries a nested diagram spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ParamValue>),
    Subsystem(Box<SubsystemSpec>),
}

impl Default for ParamValue {
    fn default() -> Self {
        ParamValue::Null
    }
}

impl ParamValue {
    /// True only for an explicit boolean `true`.
    pub fn is_true(&self) -> bool {
        matches!(self, ParamValue::Bool(true))
    }

    /// The text content, if this value is a string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The numeric content, if this value is a plain number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// One block instance in a diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockType,
    #[serde(default)]
    pub params: HashMap<String, ParamValue>,
}

impl Block {
    /// Build a block with no parameters.
    pub fn new(id: impl Into<String>, kind: BlockType) -> Self {
        Self {
            id: id.into(),
            kind,
            params: HashMap::new(),
        }
    }

    /// Look up a raw parameter.
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// The trimmed `name` parameter of a label block (empty when absent).
    pub fn label_name(&self) -> &str {
        self.param("name")
            .and_then(ParamValue::as_text)
            .map(str::trim)
            .unwrap_or("")
    }

    /// Whether this label source is bound to a subsystem boundary port.
    pub fn is_external_port(&self) -> bool {
        self.param("isExternalPort").is_some_and(ParamValue::is_true)
    }
}

/// A directed connection between two block ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    #[serde(rename = "fromIndex", default)]
    pub from_index: usize,
    pub to: String,
    #[serde(rename = "toIndex", default)]
    pub to_index: usize,
}

impl Connection {
    /// Connect two blocks on their first ports.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_index: 0,
            to: to.into(),
            to_index: 0,
        }
    }

    /// Connect explicit ports.
    pub fn ports(
        from: impl Into<String>,
        from_index: usize,
        to: impl Into<String>,
        to_index: usize,
    ) -> Self {
        Self {
            from: from.into(),
            from_index,
            to: to.into(),
            to_index,
        }
    }
}

/// A reference to an inner block acting as a subsystem boundary port.
/// Port indices come from the entry's position in the declaring list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRef {
    pub id: String,
}

/// The nested diagram owned by a `subsystem` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubsystemSpec {
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
    pub external_inputs: Vec<PortRef>,
    pub external_outputs: Vec<PortRef>,
}

/// A complete diagram: the input shape shared by both engines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagram {
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
    pub variables: HashMap<String, f64>,
}

impl Diagram {
    /// Find a block by id.
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_editor_json() {
        let diagram: Diagram = serde_json::from_value(json!({
            "blocks": [
                { "id": "src", "type": "labelSource", "params": { "name": "loop_in" } },
                { "id": "ctrl", "type": "pid", "params": { "kp": "100", "ki": 0, "kd": 0 } },
                { "id": "plant", "type": "tf", "params": { "num": [1], "den": ["I", 0, "-mg"] } },
                { "id": "out", "type": "labelSink", "params": { "name": "loop_out" } }
            ],
            "connections": [
                { "from": "src", "to": "ctrl" },
                { "from": "ctrl", "to": "plant", "fromIndex": 0, "toIndex": 0 },
                { "from": "plant", "to": "out" }
            ],
            "variables": { "I": 1.0, "mg": 1.0 }
        }))
        .expect("diagram should deserialize");

        assert_eq!(diagram.blocks.len(), 4);
        assert_eq!(diagram.blocks[1].kind, BlockType::Pid);
        assert_eq!(diagram.blocks[0].label_name(), "loop_in");
        assert_eq!(diagram.connections[1].from_index, 0);
        assert_eq!(diagram.variables["mg"], 1.0);
        let den = diagram.blocks[2].param("den").expect("den param");
        assert_eq!(
            den,
            &ParamValue::List(vec![
                ParamValue::Number(1.0),
                ParamValue::Number(0.0),
                ParamValue::Text("-mg".into()),
            ])
        );
    }

    #[test]
    fn camel_case_type_tags_round_trip() {
        for (kind, tag) in [
            (BlockType::LabelSource, "\"labelSource\""),
            (BlockType::DstateSpace, "\"dstateSpace\""),
            (BlockType::XyScope, "\"xyScope\""),
            (BlockType::Tf, "\"tf\""),
            (BlockType::Zoh, "\"zoh\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), tag);
            let parsed: BlockType = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn subsystem_param_parses_as_nested_spec() {
        let value: ParamValue = serde_json::from_value(json!({
            "blocks": [{ "id": "g", "type": "gain", "params": { "gain": 2.0 } }],
            "connections": [],
            "externalInputs": [{ "id": "g" }],
            "externalOutputs": [{ "id": "g" }]
        }))
        .unwrap();
        match value {
            ParamValue::Subsystem(spec) => {
                assert_eq!(spec.blocks.len(), 1);
                assert_eq!(spec.external_inputs[0].id, "g");
            }
            other => panic!("expected subsystem spec, got {other:?}"),
        }
    }

    #[test]
    fn external_port_flag_reads_booleans_only() {
        let mut block = Block::new("l", BlockType::LabelSource);
        assert!(!block.is_external_port());
        block
            .params
            .insert("isExternalPort".into(), ParamValue::Bool(true));
        assert!(block.is_external_port());
        block
            .params
            .insert("isExternalPort".into(), ParamValue::Number(1.0));
        assert!(!block.is_external_port());
    }
}
