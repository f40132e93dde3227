use std::collections::BTreeMap;
use std::fmt::Write as _;

use kg_tensor::Tensor;

use crate::config::Config;
use crate::error::{KernelError, Result};
use crate::grad::GradOutput;
use crate::graph::{Context, ResultId, Spec, Value};

/// Output index -> the one input index whose storage it reuses.
pub type DestroyMap = BTreeMap<usize, usize>;

/// Output index -> the input index it shares storage with.
pub type ViewMap = BTreeMap<usize, usize>;

/// Aliasing capabilities of an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Overwrites input buffers to produce outputs.
    pub destroyer: bool,
    /// Produces outputs sharing an input's storage without copying.
    pub viewer: bool,
}

/// The native body of an operator, before it is wrapped into a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCode {
    /// Buffer names visible to `body`, inputs first, then outputs.
    pub params: Vec<String>,
    /// Statements run by the unit's execute entry point.
    pub body: String,
}

/// Behavior shared by every graph operator.
///
/// Operators are plain values. The graph calls into them while building
/// (`specs`), while evaluating (`perform` or the compiled kernel built from
/// `c_code`) and while differentiating (`grad`).
pub trait Operator {
    /// Name used in diagnostics and generated unit names.
    fn name(&self) -> String;

    /// Number of outputs.
    fn nout(&self) -> usize {
        1
    }

    fn destroy_map(&self) -> DestroyMap {
        DestroyMap::new()
    }

    fn view_map(&self) -> ViewMap {
        ViewMap::new()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            destroyer: !self.destroy_map().is_empty(),
            viewer: !self.view_map().is_empty(),
        }
    }

    /// Output specs from input specs. `None` marks an input whose spec is
    /// not known yet.
    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>>;

    /// Interpreted implementation.
    ///
    /// `outputs` arrives pre-allocated: destroyed outputs hold the aliased
    /// input, other array outputs hold fresh buffers of their spec, and view
    /// outputs are `None` for the implementation to fill.
    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()>;

    /// Gradient rule: one gradient per input, given one gradient per output.
    fn grad(
        &self,
        ctx: &mut Context,
        inputs: &[ResultId],
        output_grads: &[ResultId],
    ) -> Result<GradOutput>;

    fn c_code(&self) -> Option<NativeCode> {
        None
    }

    fn c_support_code(&self, _config: &Config) -> String {
        String::new()
    }

    fn c_headers(&self, _config: &Config) -> Vec<String> {
        Vec::new()
    }

    fn c_libs(&self, _config: &Config) -> Vec<String> {
        Vec::new()
    }
}

/// Check an operator's aliasing tables against its arguments.
pub(crate) fn validate_aliasing(
    op: &dyn Operator,
    ninputs: usize,
    constants: &[bool],
) -> Result<()> {
    let violation = |reason: String| KernelError::AliasingViolation {
        op: op.name(),
        reason,
    };
    let nout = op.nout();

    let mut destroyed = vec![false; ninputs];
    for (&output, &input) in &op.destroy_map() {
        if output >= nout {
            return Err(violation(format!("output {output} does not exist")));
        }
        if input >= ninputs {
            return Err(violation(format!("input {input} does not exist")));
        }
        if destroyed[input] {
            return Err(violation(format!("input {input} is destroyed twice")));
        }
        if constants.get(input).copied().unwrap_or(false) {
            return Err(violation(format!("input {input} is a constant")));
        }
        destroyed[input] = true;
    }

    for (&output, &input) in &op.view_map() {
        if output >= nout || input >= ninputs {
            return Err(violation(format!(
                "view {output} -> {input} is out of range"
            )));
        }
    }
    Ok(())
}

/// Render a destroy map the way operator names spell it.
pub(crate) fn format_map(map: &DestroyMap) -> String {
    let mut out = String::from("{");
    for (i, (o, input)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{o}: {input}");
    }
    out.push('}');
    out
}

/// The array held by an input value.
pub fn array_arg<'a>(op: &str, inputs: &'a [Value], index: usize) -> Result<&'a Tensor> {
    match inputs.get(index) {
        Some(Value::Array(t)) => Ok(t),
        Some(Value::Host(_)) => Err(KernelError::Unsupported(format!(
            "{op} expects an array for input {index}"
        ))),
        None => Err(KernelError::Unsupported(format!(
            "{op} is missing input {index}"
        ))),
    }
}

/// The pre-allocated array of an output slot.
pub fn array_out<'a>(op: &str, outputs: &'a [Option<Value>], index: usize) -> Result<&'a Tensor> {
    match outputs.get(index) {
        Some(Some(Value::Array(t))) => Ok(t),
        _ => Err(KernelError::Unsupported(format!(
            "{op} has no array allocated for output {index}"
        ))),
    }
}
