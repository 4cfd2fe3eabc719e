//! The per-run simulation context and block state records.

use std::collections::HashMap;

use rand::rngs::StdRng;

use crate::blocks::continuous::TfModel;
use crate::blocks::discrete::DiscreteTf;
use crate::blocks::subsystem::SubsystemState;
use crate::diagram::BlockParams;

/// Two floats compare as changed unless equal, with `NaN -> NaN` counting
/// as unchanged.
pub fn value_changed(prev: f64, next: f64) -> bool {
    prev != next && !(prev.is_nan() && next.is_nan())
}

/// What a handler sees when it reads one of its input ports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PortReading {
    /// No connection terminates at this port.
    Unconnected,
    /// Connected, but the upstream value has not resolved this step.
    Pending,
    /// Connected and resolved.
    Value(f64),
}

/// Per-block mutable state, private to the owning handler. Created by
/// `init`, mutated by `update`/`afterStep`, discarded when the run ends.
#[derive(Debug)]
pub enum BlockState {
    Integrator {
        x: f64,
    },
    Tf {
        model: Option<TfModel>,
        x: Vec<f64>,
    },
    Delay {
        buffer: Vec<f64>,
        index: usize,
        samples: f64,
    },
    StateSpace {
        x: f64,
        output: f64,
    },
    Lowpass {
        x: f64,
        output: f64,
    },
    Highpass {
        x: f64,
        output: f64,
    },
    Derivative {
        prev: f64,
        output: f64,
    },
    Pid {
        integral: f64,
        prev: f64,
        output: f64,
    },
    Rate {
        held: f64,
    },
    Backlash {
        edge: f64,
        output: f64,
    },
    Zoh {
        sample: f64,
        next_time: f64,
        output: f64,
    },
    Foh {
        prev_sample: f64,
        sample: f64,
        sample_time: f64,
        next_time: f64,
        output: f64,
    },
    Dtf {
        model: DiscreteTf,
        x_hist: Vec<f64>,
        y_hist: Vec<f64>,
        next_time: f64,
        output: f64,
    },
    Ddelay {
        queue: Vec<f64>,
        next_time: f64,
        last: f64,
        ts: f64,
        output: f64,
    },
    DstateSpace {
        x: f64,
        next_time: f64,
        last: f64,
        ts: f64,
        output: f64,
    },
    FileSource {
        times: Vec<f64>,
        values: Vec<f64>,
        cursor: usize,
    },
    Noise {
        rng: StdRng,
    },
    Switch {
        output: f64,
    },
    Subsystem(Box<SubsystemState>),
    Scope {
        series: Vec<Vec<Option<f64>>>,
    },
    XyScope {
        x: Vec<Option<f64>>,
        y: Vec<Option<f64>>,
    },
    FileSink {
        time: Vec<f64>,
        values: Vec<f64>,
        csv: Option<String>,
    },
}

impl BlockState {
    /// The value this block would publish if asked right now, for holders
    /// (e.g. `switch`) falling back to an upstream block whose output has
    /// not resolved yet. Only update-phase dynamics hold one.
    pub fn held_output(&self) -> Option<f64> {
        let output = match self {
            BlockState::StateSpace { output, .. }
            | BlockState::Lowpass { output, .. }
            | BlockState::Highpass { output, .. }
            | BlockState::Derivative { output, .. }
            | BlockState::Pid { output, .. }
            | BlockState::Backlash { output, .. }
            | BlockState::Zoh { output, .. }
            | BlockState::Foh { output, .. }
            | BlockState::Dtf { output, .. }
            | BlockState::Ddelay { output, .. }
            | BlockState::DstateSpace { output, .. }
            | BlockState::Switch { output } => *output,
            _ => return None,
        };
        output.is_finite().then_some(output)
    }
}

/// Per-step algebraic-loop outcome, observable after every step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlgebraicStatus {
    /// Fixed-point passes actually run this step.
    pub iterations: usize,
    /// True when the loop was still reporting changes at the bound.
    pub hit_max_iterations: bool,
}

/// Everything a handler call can see: step timing, the variable
/// environment, resolved parameters, wiring, and the shared per-step
/// outputs and per-run state maps.
#[derive(Debug)]
pub struct SimContext {
    /// Step size in seconds.
    pub dt: f64,
    /// Simulated time of the step in progress.
    pub t: f64,
    /// Algebraic iteration bound, shared with nested subsystem solves.
    pub max_iterations: usize,
    /// Variable environment parameters were resolved against.
    pub variables: HashMap<String, f64>,
    /// Resolved parameters keyed by block id.
    pub resolved: HashMap<String, BlockParams>,
    /// Ordered source keys per block id; `None` marks unconnected ports.
    pub input_map: HashMap<String, Vec<Option<String>>>,
    /// Current scalar value per source key; rebuilt every step.
    pub outputs: HashMap<String, f64>,
    /// Per-block handler state keyed by block id.
    pub states: HashMap<String, BlockState>,
    /// Label name to `labelSink` block id.
    pub label_sinks: HashMap<String, String>,
}

impl SimContext {
    /// An empty context for the given timing and bound.
    pub fn new(dt: f64, max_iterations: usize, variables: HashMap<String, f64>) -> Self {
        Self {
            dt,
            t: 0.0,
            max_iterations,
            variables,
            resolved: HashMap::new(),
            input_map: HashMap::new(),
            outputs: HashMap::new(),
            states: HashMap::new(),
            label_sinks: HashMap::new(),
        }
    }

    /// Resolved parameters for a block (empty set when absent).
    pub fn params(&self, id: &str) -> &BlockParams {
        static EMPTY: std::sync::OnceLock<BlockParams> = std::sync::OnceLock::new();
        self.resolved
            .get(id)
            .unwrap_or_else(|| EMPTY.get_or_init(BlockParams::default))
    }

    /// The source key feeding a block's input port, if connected.
    pub fn input_key(&self, id: &str, idx: usize) -> Option<&str> {
        self.input_map
            .get(id)
            .and_then(|inputs| inputs.get(idx))
            .and_then(|key| key.as_deref())
    }

    /// Read an input port with full connected/pending discrimination.
    pub fn read_port(&self, id: &str, idx: usize) -> PortReading {
        match self.input_key(id, idx) {
            None => PortReading::Unconnected,
            Some(key) => match self.outputs.get(key) {
                Some(value) => PortReading::Value(*value),
                None => PortReading::Pending,
            },
        }
    }

    /// Read an input port, collapsing unconnected and unresolved ports to
    /// the fallback (the common case for update-phase handlers).
    pub fn input_value(&self, id: &str, idx: usize, fallback: f64) -> f64 {
        match self.read_port(id, idx) {
            PortReading::Value(value) => value,
            _ => fallback,
        }
    }

    /// Declared input count for a block.
    pub fn input_count(&self, id: &str) -> usize {
        self.input_map.get(id).map_or(0, Vec::len)
    }

    /// Publish a value under a source key, reporting whether it changed
    /// from what was already there (first publication counts as changed).
    pub fn publish(&mut self, key: &str, value: f64) -> bool {
        match self.outputs.insert(key.to_string(), value) {
            None => true,
            Some(prev) => value_changed(prev, value),
        }
    }

    /// The held output of the block behind a source key, when its state
    /// record carries one. Keys addressing secondary ports hold nothing.
    pub fn held_output(&self, key: &str) -> Option<f64> {
        self.states.get(key).and_then(BlockState::held_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reports_changes_with_nan_rule() {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        assert!(ctx.publish("a", 1.0));
        assert!(!ctx.publish("a", 1.0));
        assert!(ctx.publish("a", 2.0));
        assert!(ctx.publish("a", f64::NAN));
        assert!(!ctx.publish("a", f64::NAN));
    }

    #[test]
    fn port_reading_distinguishes_pending_from_unconnected() {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.input_map
            .insert("g".into(), vec![Some("src".into()), None]);
        assert_eq!(ctx.read_port("g", 0), PortReading::Pending);
        assert_eq!(ctx.read_port("g", 1), PortReading::Unconnected);
        ctx.outputs.insert("src".into(), 4.0);
        assert_eq!(ctx.read_port("g", 0), PortReading::Value(4.0));
        assert_eq!(ctx.input_value("g", 1, 0.0), 0.0);
    }

    #[test]
    fn held_output_requires_finite_value() {
        let mut ctx = SimContext::new(0.01, 50, HashMap::new());
        ctx.states
            .insert("z".into(), BlockState::Switch { output: 3.0 });
        assert_eq!(ctx.held_output("z"), Some(3.0));
        ctx.states.insert(
            "z".into(),
            BlockState::Switch {
                output: f64::INFINITY,
            },
        );
        assert_eq!(ctx.held_output("z"), None);
        assert_eq!(ctx.held_output("missing"), None);
    }
}
