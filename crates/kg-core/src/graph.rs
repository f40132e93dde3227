use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use kg_tensor::{DType, Shape, SliceArg, Tensor};
use tracing::{debug, trace, warn};

use crate::cache::{CacheStats, KernelCache, Thunk, ThunkStatus};
use crate::codegen::{self, LoopPath};
use crate::config::Config;
use crate::error::{KernelError, Result};
use crate::op::{self, Capabilities, DestroyMap, Operator, ViewMap};

/// Index of a result node in its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultId(usize);

impl ResultId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Index of an operator node in its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(usize);

impl OpId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A non-array value carried through the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostValue {
    /// An indexing expression, consumed by `get_slice`.
    Slices(Vec<SliceArg>),
}

/// Data bound to a result.
#[derive(Debug, Clone)]
pub enum Value {
    Array(Tensor),
    Host(HostValue),
}

impl Value {
    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            Value::Array(t) => Some(t),
            Value::Host(_) => None,
        }
    }

    /// Container kind, dtype and shape of this value.
    pub fn spec(&self) -> Spec {
        match self {
            Value::Array(t) => Spec::Array {
                dtype: t.dtype(),
                shape: t.shape().clone(),
            },
            Value::Host(_) => Spec::Host,
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Array(t)
    }
}

impl From<HostValue> for Value {
    fn from(h: HostValue) -> Self {
        Value::Host(h)
    }
}

/// Container kind, element type and shape of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Array { dtype: DType, shape: Shape },
    Host,
}

impl Spec {
    pub fn array(dtype: DType, shape: impl Into<Shape>) -> Spec {
        Spec::Array {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        match self {
            Spec::Array { dtype, .. } => Some(*dtype),
            Spec::Host => None,
        }
    }

    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Spec::Array { shape, .. } => Some(shape),
            Spec::Host => None,
        }
    }
}

/// Anything an operator accepts as an argument.
#[derive(Debug, Clone)]
pub enum Arg {
    /// An existing result, passed through unchanged.
    Result(ResultId),
    /// An operator whose sole output is used.
    Op(OpId),
    /// A bare number, held as a zero-rank f64 array.
    Number(f64),
    /// Any other raw value.
    Value(Value),
}

impl From<ResultId> for Arg {
    fn from(id: ResultId) -> Self {
        Arg::Result(id)
    }
}

impl From<&ResultId> for Arg {
    fn from(id: &ResultId) -> Self {
        Arg::Result(*id)
    }
}

impl From<OpId> for Arg {
    fn from(id: OpId) -> Self {
        Arg::Op(id)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Number(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Number(v as f64)
    }
}

impl From<Tensor> for Arg {
    fn from(t: Tensor) -> Self {
        Arg::Value(Value::Array(t))
    }
}

impl From<HostValue> for Arg {
    fn from(h: HostValue) -> Self {
        Arg::Value(Value::Host(h))
    }
}

impl From<Vec<SliceArg>> for Arg {
    fn from(slices: Vec<SliceArg>) -> Self {
        Arg::Value(Value::Host(HostValue::Slices(slices)))
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

/// A placeholder for one value.
#[derive(Debug)]
pub struct ResultNode {
    spec: Option<Spec>,
    value: Option<Value>,
    constant: bool,
    producer: Option<(OpId, usize)>,
    up_to_date: bool,
    destroyed_by: Option<OpId>,
}

impl ResultNode {
    pub fn spec(&self) -> Option<&Spec> {
        self.spec.as_ref()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// The producing operator and the output index within it.
    pub fn producer(&self) -> Option<(OpId, usize)> {
        self.producer
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    /// The operator that last overwrote this result's buffer in place.
    pub fn destroyed_by(&self) -> Option<OpId> {
        self.destroyed_by
    }
}

/// An applied operator.
pub struct OpNode {
    inputs: Vec<ResultId>,
    outputs: Vec<ResultId>,
    op: Rc<dyn Operator>,
    capabilities: Capabilities,
    destroy_map: DestroyMap,
    view_map: ViewMap,
    thunk: Option<Thunk>,
}

impl OpNode {
    pub fn inputs(&self) -> &[ResultId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ResultId] {
        &self.outputs
    }

    pub fn op(&self) -> &Rc<dyn Operator> {
        &self.op
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn destroy_map(&self) -> &DestroyMap {
        &self.destroy_map
    }

    pub fn view_map(&self) -> &ViewMap {
        &self.view_map
    }

    pub fn thunk(&self) -> Option<&Thunk> {
        self.thunk.as_ref()
    }
}

impl fmt::Debug for OpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpNode")
            .field("op", &self.op.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("destroy_map", &self.destroy_map)
            .field("view_map", &self.view_map)
            .finish()
    }
}

/// When operators are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Build only; values are computed on request.
    #[default]
    Build,
    /// Compute every operator as soon as it is applied.
    BuildEval,
}

/// How operators are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// Always run the interpreted implementation.
    #[default]
    Interpret,
    /// Prefer generated native kernels, falling back when they decline.
    Compile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LiteralKey {
    Number(u64),
    Host(HostValue),
    Array {
        storage: usize,
        offset: usize,
        dims: Vec<usize>,
        strides: Vec<isize>,
    },
}

/// Owns a graph: its nodes, literal table, evaluation settings and kernel
/// cache. Nodes live as long as the context.
pub struct Context {
    results: Vec<ResultNode>,
    ops: Vec<OpNode>,
    literals: HashMap<LiteralKey, ResultId>,
    mode: Mode,
    policy: Policy,
    loop_path: LoopPath,
    config: Config,
    cache: Option<KernelCache>,
}

impl Context {
    /// Create a context configured from the environment, in build mode with
    /// interpreted evaluation.
    pub fn new() -> Self {
        Context::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        Context {
            results: Vec::new(),
            ops: Vec::new(),
            literals: HashMap::new(),
            mode: Mode::default(),
            policy: Policy::default(),
            loop_path: LoopPath::Auto,
            config,
            cache: None,
        }
    }

    /// Use an already opened kernel cache.
    pub fn with_cache(mut self, cache: KernelCache) -> Self {
        self.config = cache.config().clone();
        self.cache = Some(cache);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn loop_path(&self) -> LoopPath {
        self.loop_path
    }

    /// Force the iteration strategy of generated elementwise kernels.
    /// Thunks are rebound on their next run.
    pub fn set_loop_path(&mut self, path: LoopPath) {
        self.loop_path = path;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The kernel cache, if one has been opened.
    pub fn cache(&self) -> Option<&KernelCache> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.as_ref().map(KernelCache::stats).unwrap_or_default()
    }

    pub fn node(&self, id: ResultId) -> Result<&ResultNode> {
        self.results
            .get(id.0)
            .ok_or(KernelError::UnknownResult(id.0))
    }

    fn node_mut(&mut self, id: ResultId) -> Result<&mut ResultNode> {
        self.results
            .get_mut(id.0)
            .ok_or(KernelError::UnknownResult(id.0))
    }

    pub fn op_node(&self, id: OpId) -> Result<&OpNode> {
        self.ops.get(id.0).ok_or(KernelError::UnknownOp(id.0))
    }

    pub fn spec(&self, id: ResultId) -> Option<&Spec> {
        self.results.get(id.0).and_then(|n| n.spec.as_ref())
    }

    pub fn producer(&self, id: ResultId) -> Option<OpId> {
        self.results
            .get(id.0)
            .and_then(|n| n.producer)
            .map(|(op, _)| op)
    }

    pub fn outputs(&self, op: OpId) -> Result<&[ResultId]> {
        Ok(&self.op_node(op)?.outputs)
    }

    /// True for constants holding a zero-rank array.
    pub fn is_zero_rank_constant(&self, id: ResultId) -> bool {
        match self.results.get(id.0) {
            Some(node) => {
                node.constant
                    && matches!(&node.spec, Some(Spec::Array { shape, .. }) if shape.ndim() == 0)
            }
            None => false,
        }
    }

    fn push_result(&mut self, node: ResultNode) -> ResultId {
        self.results.push(node);
        ResultId(self.results.len() - 1)
    }

    fn raw_value(arg: Arg) -> Result<Value> {
        match arg {
            Arg::Result(_) | Arg::Op(_) => Err(KernelError::AlreadyAResult),
            Arg::Number(v) => Ok(Value::Array(Tensor::scalar(v))),
            Arg::Value(v) => Ok(v),
        }
    }

    /// Wrap a raw value as a new, mutable graph input.
    pub fn input(&mut self, raw: impl Into<Arg>) -> Result<ResultId> {
        let value = Context::raw_value(raw.into())?;
        Ok(self.push_result(ResultNode {
            spec: Some(value.spec()),
            value: Some(value),
            constant: false,
            producer: None,
            up_to_date: true,
            destroyed_by: None,
        }))
    }

    /// The memoized constant for a raw value.
    ///
    /// Numbers are keyed by bit pattern, host values by structure and arrays
    /// by the identity of their storage and layout.
    pub fn literal(&mut self, raw: impl Into<Arg>) -> Result<ResultId> {
        let arg = raw.into();
        let key = match &arg {
            Arg::Result(_) | Arg::Op(_) => return Err(KernelError::AlreadyAResult),
            Arg::Number(v) => LiteralKey::Number(v.to_bits()),
            Arg::Value(Value::Host(h)) => LiteralKey::Host(h.clone()),
            Arg::Value(Value::Array(t)) => LiteralKey::Array {
                storage: t.storage_id(),
                offset: t.offset(),
                dims: t.shape().dims().to_vec(),
                strides: t.strides().to_vec(),
            },
        };
        if let Some(&id) = self.literals.get(&key) {
            return Ok(id);
        }
        let value = Context::raw_value(arg)?;
        let id = self.push_result(ResultNode {
            spec: Some(value.spec()),
            value: Some(value),
            constant: true,
            producer: None,
            up_to_date: true,
            destroyed_by: None,
        });
        self.literals.insert(key, id);
        Ok(id)
    }

    /// Normalize an argument into a result: results pass through, an
    /// operator yields its sole output, raw values become literals.
    pub fn wrap(&mut self, raw: impl Into<Arg>) -> Result<ResultId> {
        match raw.into() {
            Arg::Result(id) => {
                self.node(id)?;
                Ok(id)
            }
            Arg::Op(op) => self.sole_output(op),
            other => self.literal(other),
        }
    }

    /// A result with no spec and no value.
    pub fn placeholder(&mut self) -> ResultId {
        self.push_result(ResultNode {
            spec: None,
            value: None,
            constant: false,
            producer: None,
            up_to_date: false,
            destroyed_by: None,
        })
    }

    /// An array input whose spec is known before its data.
    pub fn symbol(&mut self, dtype: DType, shape: impl Into<Shape>) -> ResultId {
        self.push_result(ResultNode {
            spec: Some(Spec::array(dtype, shape)),
            value: None,
            constant: false,
            producer: None,
            up_to_date: false,
            destroyed_by: None,
        })
    }

    /// Bind data to a graph input. Results computed from it are marked
    /// stale and an input consumed by an in-place operator becomes readable
    /// again.
    pub fn set_value(&mut self, id: ResultId, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let node = self.node_mut(id)?;
        if node.constant {
            return Err(KernelError::Unsupported(format!(
                "constant {id} is immutable"
            )));
        }
        if let Some((op, _)) = node.producer {
            return Err(KernelError::Unsupported(format!(
                "{id} is produced by operator {} and cannot be set",
                op.0
            )));
        }
        node.spec = Some(value.spec());
        node.value = Some(value);
        node.up_to_date = true;
        node.destroyed_by = None;
        self.invalidate_from(id);
        Ok(())
    }

    /// Assign one element of a graph input. The write goes into the current
    /// buffer, so an input already overwritten in place stays consumed.
    pub fn set_item(&mut self, id: ResultId, index: &[usize], value: f64) -> Result<()> {
        let node = self.node(id)?;
        if let Some((op, _)) = node.producer {
            let name = self.op_node(op)?.op.name();
            return Err(KernelError::Unsupported(format!(
                "the result of {name} does not support item assignment"
            )));
        }
        if node.constant {
            return Err(KernelError::Unsupported(format!(
                "constant {id} is immutable"
            )));
        }
        let tensor = match &node.value {
            Some(Value::Array(t)) => t.clone(),
            Some(Value::Host(_)) => {
                return Err(KernelError::Unsupported(format!(
                    "{id} does not hold an array"
                )))
            }
            None => return Err(KernelError::MissingValue(id.0)),
        };
        tensor.set(index, value)?;
        self.invalidate_from(id);
        Ok(())
    }

    /// Mark every result computed from `changed` as stale. Ops are stored in
    /// creation order, so one forward pass sees producers before consumers.
    fn invalidate_from(&mut self, changed: ResultId) {
        let mut dirty = HashSet::from([changed]);
        for node in &self.ops {
            if node.inputs.iter().any(|i| dirty.contains(i)) {
                for &out in &node.outputs {
                    dirty.insert(out);
                    self.results[out.0].up_to_date = false;
                }
            }
        }
    }

    /// `id` and every result sharing its buffer through view operators,
    /// both the views it was taken from and the views taken of it.
    fn view_group(&self, id: ResultId) -> HashSet<ResultId> {
        let mut root = id;
        while let Some((op, o)) = self.results[root.0].producer {
            match self.ops[op.0].view_map.get(&o) {
                Some(&i) => root = self.ops[op.0].inputs[i],
                None => break,
            }
        }
        let mut group = HashSet::from([root]);
        for node in &self.ops {
            for (&o, &i) in &node.view_map {
                if group.contains(&node.inputs[i]) {
                    group.insert(node.outputs[o]);
                }
            }
        }
        group
    }

    /// Whether `op` reads, directly or transitively, an output of `target`.
    fn depends_on(&self, op: OpId, target: OpId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![op];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            // Inputs always predate their consumer.
            if current < target || !seen.insert(current) {
                continue;
            }
            for &input in &self.ops[current.0].inputs {
                if let Some((producer, _)) = self.results[input.0].producer {
                    stack.push(producer);
                }
            }
        }
        false
    }

    /// Run the stale readers of the buffers `op_id` is about to overwrite, so
    /// they see the old contents. Readers downstream of `op_id` cannot go
    /// first and will find their input consumed instead.
    fn run_readers_before(&mut self, op_id: OpId) {
        let node = &self.ops[op_id.0];
        let mut overwritten = HashSet::new();
        for &i in node.destroy_map.values() {
            overwritten.extend(self.view_group(node.inputs[i]));
        }
        let readers: Vec<OpId> = self
            .ops
            .iter()
            .enumerate()
            .map(|(index, other)| (OpId(index), other))
            .filter(|(id, other)| {
                *id != op_id
                    && other.inputs.iter().any(|i| overwritten.contains(i))
                    && !other
                        .destroy_map
                        .values()
                        .any(|&i| overwritten.contains(&other.inputs[i]))
                    && other.outputs.iter().any(|o| !self.results[o.0].up_to_date)
            })
            .map(|(id, _)| id)
            .filter(|&id| !self.depends_on(id, op_id))
            .collect();
        for reader in readers {
            if let Err(err) = self.run_op(reader) {
                debug!(op = %self.ops[reader.0].op.name(), %err, "reader not ready before in-place write");
            }
        }
    }

    /// The up-to-date value of a result.
    pub fn value(&mut self, id: ResultId) -> Result<Value> {
        self.compute(id)?;
        self.node(id)?
            .value
            .clone()
            .ok_or(KernelError::MissingValue(id.0))
    }

    /// The up-to-date array of a result.
    pub fn array(&mut self, id: ResultId) -> Result<Tensor> {
        match self.value(id)? {
            Value::Array(t) => Ok(t),
            Value::Host(_) => Err(KernelError::Unsupported(format!(
                "{id} does not hold an array"
            ))),
        }
    }

    /// Bring a result up to date, computing its producers first.
    pub fn compute(&mut self, id: ResultId) -> Result<()> {
        let node = self.node(id)?;
        if node.up_to_date {
            return Ok(());
        }
        let (producer, has_value) = (node.producer, node.value.is_some());
        match producer {
            Some((op, _)) => self.run_op(op),
            None if has_value => Ok(()),
            None => Err(KernelError::MissingValue(id.0)),
        }
    }

    /// Apply an operator to arguments, creating its output results.
    pub fn apply(&mut self, op: Rc<dyn Operator>, args: &[Arg]) -> Result<OpId> {
        let mut inputs = Vec::with_capacity(args.len());
        for arg in args {
            inputs.push(self.wrap(arg.clone())?);
        }

        let constants: Vec<bool> = inputs.iter().map(|&i| self.results[i.0].constant).collect();
        op::validate_aliasing(op.as_ref(), inputs.len(), &constants)?;

        let in_specs: Vec<Option<Spec>> =
            inputs.iter().map(|&i| self.results[i.0].spec.clone()).collect();
        let mut out_specs = op.specs(&in_specs)?;
        if out_specs.len() != op.nout() {
            return Err(KernelError::ShapeOrDtypeUnresolved {
                op: op.name(),
                reason: format!(
                    "expected {} output specs, got {}",
                    op.nout(),
                    out_specs.len()
                ),
            });
        }
        let destroy_map = op.destroy_map();
        for (&o, &i) in &destroy_map {
            out_specs[o] = in_specs[i].clone();
        }

        let op_id = OpId(self.ops.len());
        let outputs: Vec<ResultId> = out_specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                self.push_result(ResultNode {
                    spec,
                    value: None,
                    constant: false,
                    producer: Some((op_id, index)),
                    up_to_date: false,
                    destroyed_by: None,
                })
            })
            .collect();

        trace!(op = %op.name(), inputs = ?inputs, outputs = ?outputs, "applied operator");
        self.ops.push(OpNode {
            inputs,
            outputs,
            capabilities: op.capabilities(),
            view_map: op.view_map(),
            destroy_map,
            op,
            thunk: None,
        });

        if self.mode == Mode::BuildEval {
            self.run_op(op_id)?;
        }
        Ok(op_id)
    }

    /// Apply a single-output operator and return that output.
    pub fn apply1(&mut self, op: Rc<dyn Operator>, args: &[Arg]) -> Result<ResultId> {
        let op_id = self.apply(op, args)?;
        self.sole_output(op_id)
    }

    fn sole_output(&self, op: OpId) -> Result<ResultId> {
        let node = self.op_node(op)?;
        match node.outputs.as_slice() {
            [only] => Ok(*only),
            outputs => Err(KernelError::Unsupported(format!(
                "{} has {} outputs, expected exactly one",
                node.op.name(),
                outputs.len()
            ))),
        }
    }

    fn run_op(&mut self, op_id: OpId) -> Result<()> {
        let inputs = self.op_node(op_id)?.inputs.clone();
        for &input in &inputs {
            self.compute(input)?;
        }
        if !self.ops[op_id.0].destroy_map.is_empty() {
            self.run_readers_before(op_id);
        }

        let mut values = Vec::with_capacity(inputs.len());
        for &input in &inputs {
            if let Some(by) = self.results[input.0].destroyed_by {
                return Err(KernelError::AliasingViolation {
                    op: self.ops[op_id.0].op.name(),
                    reason: format!(
                        "input {input} was overwritten by {}; set it again before recomputing",
                        self.ops[by.0].op.name()
                    ),
                });
            }
            let value = self.results[input.0]
                .value
                .clone()
                .ok_or(KernelError::MissingValue(input.0))?;
            values.push(value);
        }

        let mut outputs = self.allocate_outputs(op_id, &values);
        let op = Rc::clone(&self.ops[op_id.0].op);
        trace!(op = %op.name(), policy = ?self.policy, "executing operator");

        let status = match self.policy {
            Policy::Interpret => None,
            Policy::Compile => self.run_native(op_id, &values, &outputs)?,
        };
        match status {
            Some(ThunkStatus::Done) => {}
            Some(ThunkStatus::Unsupported) => {
                warn!(op = %op.name(), "native kernel unavailable for these buffers, using interpreted implementation");
                op.perform(&values, &mut outputs)?;
            }
            None => op.perform(&values, &mut outputs)?,
        }

        let node = &self.ops[op_id.0];
        for (&o, &i) in &node.destroy_map {
            let shared = match (&outputs[o], &values[i]) {
                (Some(Value::Array(out)), Value::Array(input)) => out.shares_storage(input),
                _ => false,
            };
            if !shared {
                return Err(KernelError::AliasingViolation {
                    op: op.name(),
                    reason: format!("output {o} does not share storage with input {i}"),
                });
            }
        }

        let output_ids = node.outputs.clone();
        let mut consumed = HashSet::new();
        for &i in node.destroy_map.values() {
            consumed.extend(self.view_group(node.inputs[i]));
        }
        for id in consumed {
            if !output_ids.contains(&id) {
                self.results[id.0].destroyed_by = Some(op_id);
            }
        }
        for (id, value) in output_ids.into_iter().zip(outputs) {
            let value = value.ok_or_else(|| {
                KernelError::Unsupported(format!("{} did not produce {id}", op.name()))
            })?;
            let node = &mut self.results[id.0];
            node.value = Some(value);
            node.up_to_date = true;
            node.destroyed_by = None;
        }
        Ok(())
    }

    /// Output slots for one execution. Destroyed outputs take the aliased
    /// input, views are left for the implementation, and other arrays reuse
    /// their previous buffer when its spec still matches.
    fn allocate_outputs(&self, op_id: OpId, values: &[Value]) -> Vec<Option<Value>> {
        let node = &self.ops[op_id.0];
        node.outputs
            .iter()
            .enumerate()
            .map(|(o, id)| {
                if let Some(&i) = node.destroy_map.get(&o) {
                    return Some(values[i].clone());
                }
                if node.view_map.contains_key(&o) {
                    return None;
                }
                let result = &self.results[id.0];
                match &result.spec {
                    Some(Spec::Array { dtype, shape }) => match &result.value {
                        Some(Value::Array(prev))
                            if prev.is_contiguous()
                                && prev.dtype() == *dtype
                                && prev.shape() == shape =>
                        {
                            Some(Value::Array(prev.clone()))
                        }
                        _ => Some(Value::Array(Tensor::zeros(*dtype, shape.clone()))),
                    },
                    _ => None,
                }
            })
            .collect()
    }

    /// Run the operator's native kernel. `None` means the operator has no
    /// native rule for this call.
    fn run_native(
        &mut self,
        op_id: OpId,
        values: &[Value],
        outputs: &[Option<Value>],
    ) -> Result<Option<ThunkStatus>> {
        let op = Rc::clone(&self.ops[op_id.0].op);
        let Some(native) = op.c_code() else {
            return Ok(None);
        };

        let mut buffers = Vec::with_capacity(values.len() + outputs.len());
        for value in values.iter().chain(outputs.iter().flatten()) {
            match value {
                Value::Array(t) => buffers.push(t.clone()),
                Value::Host(_) => return Ok(None),
            }
        }
        if buffers.len() != native.params.len() {
            return Ok(None);
        }

        let path = self.loop_path;
        let dtypes = codegen::dtypes_of(&buffers);
        let existing = self.ops[op_id.0].thunk.as_ref().map(|thunk| {
            (
                thunk.is_bound_to(&buffers, path),
                thunk.dtypes() == dtypes.as_slice(),
                Rc::clone(thunk.module()),
            )
        });
        let rebind = match existing {
            Some((true, _, _)) => None,
            Some((false, true, module)) => Some(module),
            _ => {
                let config = self.config.clone();
                let headers = op.c_headers(&config);
                let support = op.c_support_code(&config);
                let Some(unit) =
                    codegen::generate_unit(&op.name(), &native, &dtypes, &headers, &support)
                else {
                    return Ok(Some(ThunkStatus::Unsupported));
                };
                let mut libs = op.c_libs(&config);
                libs.push("m".to_string());
                let cache = self.kernel_cache()?;
                Some(cache.get_or_compile(&op.name(), &unit, &libs)?)
            }
        };

        if let Some(module) = rebind {
            let thunk = module.instantiate(&buffers, path)?;
            debug!(op = %op.name(), unit = %module.name(), ?path, "bound thunk");
            self.ops[op_id.0].thunk = Some(thunk);
        }

        match &self.ops[op_id.0].thunk {
            Some(thunk) => thunk.run().map(Some),
            None => Ok(None),
        }
    }

    fn kernel_cache(&mut self) -> Result<&mut KernelCache> {
        if self.cache.is_none() {
            self.cache = Some(KernelCache::open(self.config.clone())?);
        }
        match self.cache.as_mut() {
            Some(cache) => Ok(cache),
            None => Err(KernelError::Unsupported(
                "kernel cache unavailable".to_string(),
            )),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Graph inputs (results without a producer) reachable from `outputs`, in
/// first-visit order.
pub fn inputs(ctx: &Context, outputs: &[ResultId]) -> Result<Vec<ResultId>> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut stack: Vec<ResultId> = outputs.iter().rev().copied().collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match ctx.node(id)?.producer {
            None => found.push(id),
            Some((op, _)) => {
                let node = ctx.op_node(op)?;
                stack.extend(node.inputs.iter().rev().copied());
            }
        }
    }
    Ok(found)
}

/// Operators needed to compute `outputs`, producers before consumers.
pub fn toposort(ctx: &Context, outputs: &[ResultId]) -> Result<Vec<OpId>> {
    enum Visit {
        Enter(OpId),
        Exit(OpId),
    }

    let mut order = Vec::new();
    let mut done = HashSet::new();
    let mut stack = Vec::new();
    for &id in outputs.iter().rev() {
        if let Some((op, _)) = ctx.node(id)?.producer {
            stack.push(Visit::Enter(op));
        }
    }

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(op) => {
                if done.contains(&op) {
                    continue;
                }
                stack.push(Visit::Exit(op));
                for &input in ctx.op_node(op)?.inputs.iter().rev() {
                    if let Some((producer, _)) = ctx.node(input)?.producer {
                        if !done.contains(&producer) {
                            stack.push(Visit::Enter(producer));
                        }
                    }
                }
            }
            Visit::Exit(op) => {
                if done.insert(op) {
                    order.push(op);
                }
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    fn vector(values: &[f64]) -> Tensor {
        Tensor::from_f64(values.to_vec(), vec![values.len()]).unwrap()
    }

    #[test]
    fn test_input_wraps_numbers_as_f64_scalars() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(3).unwrap();
        let spec = ctx.spec(x).unwrap();
        assert_eq!(spec, &Spec::array(DType::F64, Shape::scalar()));
        assert!(!ctx.node(x).unwrap().is_constant());
    }

    #[test]
    fn test_input_of_a_result_is_rejected() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(1.0).unwrap();
        assert!(matches!(ctx.input(x), Err(KernelError::AlreadyAResult)));
    }

    #[test]
    fn test_literals_are_memoized() {
        let mut ctx = Context::with_config(Config::default());
        let a = ctx.literal(2.5).unwrap();
        let b = ctx.literal(2.5).unwrap();
        let c = ctx.literal(3.5).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(ctx.node(a).unwrap().is_constant());

        let t = vector(&[1.0, 2.0]);
        let d = ctx.literal(t.clone()).unwrap();
        let e = ctx.literal(t.clone()).unwrap();
        let f = ctx.literal(vector(&[1.0, 2.0])).unwrap();
        assert_eq!(d, e);
        assert_ne!(d, f);
    }

    #[test]
    fn test_wrap_passes_results_and_ops_through() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        assert_eq!(ctx.wrap(x).unwrap(), x);

        let op = ctx.apply(Rc::new(ops::neg_op()), &[x.into()]).unwrap();
        let out = ctx.outputs(op).unwrap()[0];
        assert_eq!(ctx.wrap(op).unwrap(), out);
    }

    #[test]
    fn test_lazy_build_then_compute() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        let y = ops::neg(&mut ctx, x).unwrap();
        assert!(!ctx.node(y).unwrap().is_up_to_date());
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![-1.0, -2.0, -3.0]);
        assert!(ctx.node(y).unwrap().is_up_to_date());
    }

    #[test]
    fn test_build_eval_computes_on_construction() {
        let mut ctx = Context::with_config(Config::default());
        ctx.set_mode(Mode::BuildEval);
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ops::twice(&mut ctx, x).unwrap();
        assert!(ctx.node(y).unwrap().is_up_to_date());
    }

    #[test]
    fn test_set_value_invalidates_results() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ops::sqr(&mut ctx, x).unwrap();
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![1.0, 4.0]);

        ctx.set_value(x, vector(&[3.0, 4.0])).unwrap();
        assert!(!ctx.node(y).unwrap().is_up_to_date());
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![9.0, 16.0]);
    }

    #[test]
    fn test_symbol_needs_a_value_before_compute() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.symbol(DType::F64, vec![2]);
        let y = ops::neg(&mut ctx, x).unwrap();
        assert!(matches!(ctx.compute(y), Err(KernelError::MissingValue(_))));
        ctx.set_value(x, vector(&[1.0, -1.0])).unwrap();
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![-1.0, 1.0]);
    }

    #[test]
    fn test_constants_cannot_be_set() {
        let mut ctx = Context::with_config(Config::default());
        let c = ctx.literal(1.0).unwrap();
        assert!(ctx.set_value(c, Tensor::scalar(2.0)).is_err());
    }

    #[test]
    fn test_set_item_on_input() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        ctx.set_item(x, &[1], 7.0).unwrap();
        assert_eq!(ctx.array(x).unwrap().to_vec_f64(), vec![1.0, 7.0]);
    }

    #[test]
    fn test_inputs_and_toposort() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ctx.input(vector(&[3.0, 4.0])).unwrap();
        let s = ops::add_elemwise(&mut ctx, x, y).unwrap();
        let n = ops::neg(&mut ctx, s).unwrap();
        let m = ops::mul_elemwise(&mut ctx, n, x).unwrap();

        assert_eq!(inputs(&ctx, &[m]).unwrap(), vec![x, y]);

        let order = toposort(&ctx, &[m]).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(Some(order[0]), ctx.producer(s));
        assert_eq!(Some(order[1]), ctx.producer(n));
        assert_eq!(Some(order[2]), ctx.producer(m));
    }

    #[test]
    fn test_destroying_a_constant_is_rejected() {
        let mut ctx = Context::with_config(Config::default());
        let c = ctx.literal(vector(&[1.0, 2.0])).unwrap();
        let err = ops::neg_inplace(&mut ctx, c).unwrap_err();
        assert!(matches!(err, KernelError::AliasingViolation { .. }));
    }

    #[test]
    fn test_unrelated_input_keeps_inplace_result() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let w = ctx.input(vector(&[5.0])).unwrap();
        let z = ops::neg_inplace(&mut ctx, x).unwrap();
        let v = ops::neg(&mut ctx, w).unwrap();
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![-1.0, -2.0]);
        assert_eq!(ctx.array(v).unwrap().to_vec_f64(), vec![-5.0]);

        ctx.set_value(w, vector(&[6.0])).unwrap();
        assert!(ctx.node(z).unwrap().is_up_to_date());
        assert!(!ctx.node(v).unwrap().is_up_to_date());
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![-1.0, -2.0]);
        assert_eq!(ctx.array(v).unwrap().to_vec_f64(), vec![-6.0]);
    }

    #[test]
    fn test_consumed_input_must_be_set_again() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ctx.input(vector(&[10.0, 20.0])).unwrap();
        let z = ops::add_elemwise_inplace(&mut ctx, x, y).unwrap();
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![11.0, 22.0]);
        let op = ctx.producer(z).unwrap();
        assert_eq!(ctx.node(x).unwrap().destroyed_by(), Some(op));

        ctx.set_value(y, vector(&[100.0, 200.0])).unwrap();
        let err = ctx.compute(z).unwrap_err();
        assert!(matches!(err, KernelError::AliasingViolation { .. }));
        assert!(err.to_string().contains("was overwritten by add_elemwise_inplace"));

        ctx.set_item(x, &[0], 1.0).unwrap();
        assert!(ctx.compute(z).is_err());

        ctx.set_value(x, vector(&[1.0, 2.0])).unwrap();
        assert_eq!(ctx.node(x).unwrap().destroyed_by(), None);
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![101.0, 202.0]);
    }

    #[test]
    fn test_readers_run_before_inplace_write() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ops::twice(&mut ctx, x).unwrap();
        let xt = ops::transpose(&mut ctx, x).unwrap();
        let s = ops::sqr(&mut ctx, xt).unwrap();
        let z = ops::neg_inplace(&mut ctx, x).unwrap();

        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![-1.0, -2.0]);
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![2.0, 4.0]);
        assert_eq!(ctx.array(s).unwrap().to_vec_f64(), vec![1.0, 4.0]);
    }

    #[test]
    fn test_reader_after_inplace_write_is_rejected() {
        let mut ctx = Context::with_config(Config::default());
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let z = ops::neg_inplace(&mut ctx, x).unwrap();
        let w = ops::add_elemwise(&mut ctx, z, x).unwrap();
        let err = ctx.compute(w).unwrap_err();
        assert!(matches!(err, KernelError::AliasingViolation { .. }));
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![-1.0, -2.0]);
    }

    #[test]
    fn test_unknown_result() {
        let ctx = Context::with_config(Config::default());
        assert!(matches!(
            ctx.node(ResultId(42)),
            Err(KernelError::UnknownResult(42))
        ));
    }
}
