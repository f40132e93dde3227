use kg_tensor::{DType, Shape, Tensor, TensorError};

use crate::codegen::{self, LoopVars};
use crate::error::{KernelError, Result};
use crate::grad::GradOutput;
use crate::graph::{Context, ResultId, Spec, Value};
use crate::op::{self, DestroyMap, NativeCode, Operator};

/// How a parameter is bound inside the generated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Iterated element by element, visible as `<name>_i`.
    Loop,
    /// Visible only as a whole buffer (`<name>`, `<name>_data`).
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One row of an elementwise operator's parameter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub role: Role,
    pub dir: Direction,
}

impl Param {
    pub const fn loop_in(name: &'static str) -> Param {
        Param {
            name,
            role: Role::Loop,
            dir: Direction::In,
        }
    }

    pub const fn loop_out(name: &'static str) -> Param {
        Param {
            name,
            role: Role::Loop,
            dir: Direction::Out,
        }
    }

    pub const fn whole_in(name: &'static str) -> Param {
        Param {
            name,
            role: Role::Whole,
            dir: Direction::In,
        }
    }

    pub const fn whole_out(name: &'static str) -> Param {
        Param {
            name,
            role: Role::Whole,
            dir: Direction::Out,
        }
    }
}

pub type PerformFn = fn(&[Value], &mut [Option<Value>]) -> Result<()>;
pub type GradFn = fn(&mut Context, &[ResultId], &[ResultId]) -> Result<GradOutput>;
pub type SpecsFn = fn(&[Option<Spec>]) -> Result<Vec<Option<Spec>>>;

/// An elementwise operator described by a parameter table and three C
/// fragments.
///
/// `init` runs once before the loop, `foreach` once per element and
/// `finalize` once after. Fragments see `<name>_dtype`, `<name>` and
/// `<name>_data` for every parameter, `<name>_i` for loop parameters, and
/// `kg_count` for the number of iterations.
#[derive(Clone, Debug)]
pub struct Elemwise {
    name: String,
    params: Vec<Param>,
    init: String,
    foreach: String,
    finalize: String,
    perform: PerformFn,
    grad: GradFn,
    specs: Option<SpecsFn>,
    destroy_map: DestroyMap,
    inplace_impl: Option<PerformFn>,
}

impl Elemwise {
    pub fn new(name: impl Into<String>, params: &[Param], perform: PerformFn, grad: GradFn) -> Self {
        Elemwise {
            name: name.into(),
            params: params.to_vec(),
            init: String::new(),
            foreach: String::new(),
            finalize: String::new(),
            perform,
            grad,
            specs: None,
            destroy_map: DestroyMap::new(),
            inplace_impl: None,
        }
    }

    pub fn init(mut self, code: &str) -> Self {
        self.init = code.to_string();
        self
    }

    pub fn foreach(mut self, code: &str) -> Self {
        self.foreach = code.to_string();
        self
    }

    pub fn finalize(mut self, code: &str) -> Self {
        self.finalize = code.to_string();
        self
    }

    /// Replace the default shape/dtype inference.
    pub fn with_specs(mut self, specs: SpecsFn) -> Self {
        self.specs = Some(specs);
        self
    }

    /// A true in-place implementation for the destroying variant.
    pub fn with_inplace_impl(mut self, perform: PerformFn) -> Self {
        self.inplace_impl = Some(perform);
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.dir == Direction::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.dir == Direction::Out)
    }

    /// Derive the variant that writes output `o` into input `i` for every
    /// `o -> i` of `dmap`.
    ///
    /// Both sides of every entry must be loop parameters.
    pub fn inplace_version(&self, dmap: DestroyMap) -> Result<Elemwise> {
        let violation = |reason: String| KernelError::AliasingViolation {
            op: self.name.clone(),
            reason,
        };
        let inputs: Vec<&Param> = self.inputs().collect();
        let outputs: Vec<&Param> = self.outputs().collect();
        for (&o, &i) in &dmap {
            match outputs.get(o) {
                Some(p) if p.role == Role::Loop => {}
                Some(p) => {
                    return Err(violation(format!(
                        "destroyed output {} is not a loop variable",
                        p.name
                    )))
                }
                None => return Err(violation(format!("output {o} does not exist"))),
            }
            match inputs.get(i) {
                Some(p) if p.role == Role::Loop => {}
                Some(p) => {
                    return Err(violation(format!(
                        "destroyed input {} is not a loop variable",
                        p.name
                    )))
                }
                None => return Err(violation(format!("input {i} does not exist"))),
            }
        }

        let name = if dmap.len() == 1 && dmap.get(&0) == Some(&0) {
            format!("{}_inplace", self.name)
        } else {
            format!("{}_inplace{}", self.name, op::format_map(&dmap))
        };
        Ok(Elemwise {
            name,
            destroy_map: dmap,
            ..self.clone()
        })
    }

    fn unresolved(&self, reason: impl Into<String>) -> KernelError {
        KernelError::ShapeOrDtypeUnresolved {
            op: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Shape from the loop inputs, dtype from the upcast of every array
    /// input.
    fn default_specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        if let Some(p) = self.outputs().find(|p| p.role != Role::Loop) {
            return Err(self.unresolved(format!("output {} is not a loop variable", p.name)));
        }
        let params: Vec<&Param> = self.inputs().collect();
        if params.len() != inputs.len() {
            return Err(self.unresolved(format!(
                "expected {} inputs, got {}",
                params.len(),
                inputs.len()
            )));
        }

        let mut shape: Option<&Shape> = None;
        let mut dtypes = Vec::with_capacity(inputs.len());
        for (i, (param, spec)) in params.iter().zip(inputs).enumerate() {
            match spec {
                Some(Spec::Array { dtype, shape: s }) => {
                    dtypes.push(*dtype);
                    if param.role != Role::Loop {
                        continue;
                    }
                    match shape {
                        None => shape = Some(s),
                        Some(prev) if prev != s => {
                            return Err(TensorError::ShapeMismatch {
                                expected: prev.dims().to_vec(),
                                got: s.dims().to_vec(),
                            }
                            .into())
                        }
                        Some(_) => {}
                    }
                }
                Some(Spec::Host) => {}
                None => return Err(self.unresolved(format!("input {i} has no spec"))),
            }
        }

        let shape = shape.ok_or_else(|| self.unresolved("no loop input has a known shape"))?;
        let dtype: DType = DType::upcast(dtypes).ok_or_else(|| self.unresolved("no array input"))?;
        Ok(self
            .outputs()
            .map(|_| Some(Spec::array(dtype, shape.clone())))
            .collect())
    }

    /// Run the base implementation into fresh buffers, then copy each
    /// destroyed output into its input.
    fn perform_via_copy(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let mut fresh: Vec<Option<Value>> = outputs
            .iter()
            .map(|slot| match slot {
                Some(Value::Array(t)) => Some(Value::Array(Tensor::zeros(t.dtype(), t.shape().clone()))),
                other => other.clone(),
            })
            .collect();
        (self.perform)(inputs, &mut fresh)?;

        for (o, slot) in fresh.into_iter().enumerate() {
            match self.destroy_map.get(&o) {
                Some(&i) => {
                    let target = op::array_arg(&self.name, inputs, i)?;
                    let computed = match &slot {
                        Some(Value::Array(t)) => t,
                        _ => {
                            return Err(KernelError::Unsupported(format!(
                                "{} produced no array for output {o}",
                                self.name
                            )))
                        }
                    };
                    target.assign(computed)?;
                    outputs[o] = Some(Value::Array(target.clone()));
                }
                None => outputs[o] = slot,
            }
        }
        Ok(())
    }
}

impl Operator for Elemwise {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn nout(&self) -> usize {
        self.outputs().count()
    }

    fn destroy_map(&self) -> DestroyMap {
        self.destroy_map.clone()
    }

    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        match self.specs {
            Some(specs) => specs(inputs),
            None => self.default_specs(inputs),
        }
    }

    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        if self.destroy_map.is_empty() {
            return (self.perform)(inputs, outputs);
        }
        match self.inplace_impl {
            Some(perform) => perform(inputs, outputs),
            None => self.perform_via_copy(inputs, outputs),
        }
    }

    fn grad(
        &self,
        ctx: &mut Context,
        inputs: &[ResultId],
        output_grads: &[ResultId],
    ) -> Result<GradOutput> {
        (self.grad)(ctx, inputs, output_grads)
    }

    fn c_code(&self) -> Option<NativeCode> {
        if self.init.is_empty() && self.foreach.is_empty() && self.finalize.is_empty() {
            return None;
        }
        let inputs: Vec<&Param> = self.inputs().collect();
        let outputs: Vec<&Param> = self.outputs().collect();

        let mut vars = LoopVars::default();
        for (&o, &i) in &self.destroy_map {
            vars.aliases
                .push((inputs[i].name.to_string(), outputs[o].name.to_string()));
        }
        let aliased: Vec<usize> = self.destroy_map.values().copied().collect();
        vars.inputs = inputs
            .iter()
            .enumerate()
            .filter(|(i, p)| p.role == Role::Loop && !aliased.contains(i))
            .map(|(_, p)| p.name.to_string())
            .collect();
        vars.outputs = outputs
            .iter()
            .filter(|p| p.role == Role::Loop)
            .map(|p| p.name.to_string())
            .collect();

        Some(NativeCode {
            params: inputs
                .iter()
                .chain(&outputs)
                .map(|p| p.name.to_string())
                .collect(),
            body: codegen::elemwise_body(&vars, &self.init, &self.foreach, &self.finalize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grad::Grad;

    fn add_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let x = op::array_arg("add", inputs, 0)?.to_vec_f64();
        let y = op::array_arg("add", inputs, 1)?.to_vec_f64();
        let z: Vec<f64> = x.iter().zip(&y).map(|(a, b)| a + b).collect();
        op::array_out("add", outputs, 0)?.write_f64(&z)?;
        Ok(())
    }

    fn no_grad(_: &mut Context, inputs: &[ResultId], _: &[ResultId]) -> Result<GradOutput> {
        Ok(GradOutput::Each(vec![Grad::Undefined; inputs.len()]))
    }

    fn add() -> Elemwise {
        Elemwise::new(
            "add",
            &[Param::loop_in("x"), Param::loop_in("y"), Param::loop_out("z")],
            add_perform,
            no_grad,
        )
        .foreach("z_i = x_i + y_i;")
    }

    fn array(dtype: DType, dims: &[usize]) -> Option<Spec> {
        Some(Spec::array(dtype, dims.to_vec()))
    }

    #[test]
    fn test_default_specs_upcast_dtypes() {
        let specs = add()
            .specs(&[array(DType::F32, &[2, 3]), array(DType::I32, &[2, 3])])
            .unwrap();
        assert_eq!(specs, vec![array(DType::F64, &[2, 3])]);

        let specs = add()
            .specs(&[array(DType::I32, &[4]), array(DType::I64, &[4])])
            .unwrap();
        assert_eq!(specs, vec![array(DType::I64, &[4])]);
    }

    #[test]
    fn test_default_specs_shape_mismatch() {
        let err = add()
            .specs(&[array(DType::F64, &[2]), array(DType::F64, &[3])])
            .unwrap_err();
        assert!(matches!(err, KernelError::Tensor(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_default_specs_need_every_input_spec() {
        let err = add().specs(&[array(DType::F64, &[2]), None]).unwrap_err();
        assert!(matches!(err, KernelError::ShapeOrDtypeUnresolved { .. }));
    }

    #[test]
    fn test_default_specs_need_a_loop_shape() {
        let op = Elemwise::new(
            "fill_like",
            &[Param::whole_in("v"), Param::loop_out("z")],
            add_perform,
            no_grad,
        );
        let err = op.specs(&[array(DType::F64, &[])]).unwrap_err();
        assert!(matches!(err, KernelError::ShapeOrDtypeUnresolved { .. }));
    }

    #[test]
    fn test_whole_outputs_need_explicit_specs() {
        let op = Elemwise::new(
            "total",
            &[Param::loop_in("x"), Param::whole_out("s")],
            add_perform,
            no_grad,
        );
        let err = op.specs(&[array(DType::F64, &[3])]).unwrap_err();
        assert!(matches!(err, KernelError::ShapeOrDtypeUnresolved { .. }));
    }

    #[test]
    fn test_inplace_names() {
        let base = add();
        let a = base.inplace_version(DestroyMap::from([(0, 0)])).unwrap();
        assert_eq!(a.name(), "add_inplace");
        let b = base.inplace_version(DestroyMap::from([(0, 1)])).unwrap();
        assert_eq!(b.name(), "add_inplace{0: 1}");
        assert!(b.capabilities().destroyer);
        assert!(!base.capabilities().destroyer);
    }

    #[test]
    fn test_inplace_requires_loop_variables() {
        let op = Elemwise::new(
            "scale",
            &[Param::loop_in("x"), Param::whole_in("a"), Param::loop_out("z")],
            add_perform,
            no_grad,
        );
        let err = op.inplace_version(DestroyMap::from([(0, 1)])).unwrap_err();
        assert!(matches!(err, KernelError::AliasingViolation { .. }));
        let err = add().inplace_version(DestroyMap::from([(1, 0)])).unwrap_err();
        assert!(matches!(err, KernelError::AliasingViolation { .. }));
    }

    #[test]
    fn test_inplace_code_reads_through_output() {
        let op = add().inplace_version(DestroyMap::from([(0, 1)])).unwrap();
        let code = op.c_code().unwrap();
        assert_eq!(code.params, vec!["x", "y", "z"]);
        assert!(code.body.contains("const y_dtype y_i = z_i;"));
        assert!(code.body.contains("kg_cursor_init(&x_cur"));
        assert!(!code.body.contains("y_cur"));
    }

    #[test]
    fn test_inplace_perform_copies_into_input() {
        let op = add().inplace_version(DestroyMap::from([(0, 0)])).unwrap();
        let x = Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap();
        let y = Tensor::from_f64(vec![10.0, 20.0], vec![2]).unwrap();
        let inputs = vec![Value::Array(x.clone()), Value::Array(y)];
        let mut outputs = vec![Some(Value::Array(x.clone()))];
        op.perform(&inputs, &mut outputs).unwrap();

        assert_eq!(x.to_vec_f64(), vec![11.0, 22.0]);
        match &outputs[0] {
            Some(Value::Array(z)) => assert!(z.shares_storage(&x)),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_no_fragments_means_no_native_code() {
        let op = Elemwise::new(
            "plain",
            &[Param::loop_in("x"), Param::loop_out("z")],
            add_perform,
            no_grad,
        );
        assert!(op.c_code().is_none());
    }
}
