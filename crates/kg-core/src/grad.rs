use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{KernelError, Result};
use crate::graph::{self, Context, ResultId};
use crate::ops;

/// Gradient of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grad {
    Value(ResultId),
    /// The operator has no gradient with respect to this input.
    Undefined,
}

impl From<ResultId> for Grad {
    fn from(id: ResultId) -> Self {
        Grad::Value(id)
    }
}

/// What a gradient rule returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradOutput {
    /// Shorthand for single-input operators.
    Single(Grad),
    /// One gradient per input.
    Each(Vec<Grad>),
}

impl GradOutput {
    /// One defined gradient per input.
    pub fn values(ids: &[ResultId]) -> Self {
        GradOutput::Each(ids.iter().map(|&id| Grad::Value(id)).collect())
    }

    pub fn undefined(ninputs: usize) -> Self {
        GradOutput::Each(vec![Grad::Undefined; ninputs])
    }

    /// Gradients parallel to the `ninputs` inputs of `op`.
    pub fn into_vec(self, op: &str, ninputs: usize) -> Result<Vec<Grad>> {
        let mismatch = |got: usize| KernelError::GradientArityMismatch {
            op: op.to_string(),
            expected: ninputs,
            got,
        };
        match self {
            GradOutput::Single(g) if ninputs == 1 => Ok(vec![g]),
            GradOutput::Single(_) => Err(mismatch(1)),
            GradOutput::Each(grads) if grads.len() == ninputs => Ok(grads),
            GradOutput::Each(grads) => Err(mismatch(grads.len())),
        }
    }
}

impl From<ResultId> for GradOutput {
    fn from(id: ResultId) -> Self {
        GradOutput::Single(Grad::Value(id))
    }
}

impl From<Grad> for GradOutput {
    fn from(g: Grad) -> Self {
        GradOutput::Single(g)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Value(ResultId),
    /// Poisoned by the named operator.
    Undefined(String),
}

/// Gradients accumulated per result.
#[derive(Debug, Default)]
pub struct GradMap {
    entries: HashMap<ResultId, Entry>,
}

impl GradMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ResultId) -> bool {
        self.entries.contains_key(&id)
    }

    /// The accumulated gradient of `id`, if anything reached it.
    pub fn get(&self, id: ResultId) -> Option<Grad> {
        self.entries.get(&id).map(|entry| match entry {
            Entry::Value(g) => Grad::Value(*g),
            Entry::Undefined(_) => Grad::Undefined,
        })
    }

    /// The gradient of `id`. Reading an undefined gradient is an error.
    pub fn value(&self, id: ResultId) -> Result<Option<ResultId>> {
        match self.entries.get(&id) {
            Some(Entry::Value(g)) => Ok(Some(*g)),
            Some(Entry::Undefined(op)) => Err(KernelError::UndefinedGradient { op: op.clone() }),
            None => Ok(None),
        }
    }

    fn accumulate(&mut self, ctx: &mut Context, id: ResultId, grad: Grad, origin: &str) -> Result<()> {
        let next = match (self.entries.get(&id), grad) {
            (Some(Entry::Undefined(_)), _) => return Ok(()),
            (_, Grad::Undefined) => Entry::Undefined(origin.to_string()),
            (None, Grad::Value(g)) => Entry::Value(g),
            (Some(Entry::Value(prev)), Grad::Value(g)) => {
                let prev = *prev;
                Entry::Value(ops::add_elemwise(ctx, prev, g)?)
            }
        };
        self.entries.insert(id, next);
        Ok(())
    }
}

/// Reverse-mode accumulation from `(result, gradient)` seeds.
///
/// Operators reachable from the seeds run their gradient rules consumers
/// first. Missing gradients of unused outputs are zeros.
pub fn backprop(ctx: &mut Context, seeds: &[(ResultId, ResultId)]) -> Result<GradMap> {
    let mut map = GradMap::default();
    for &(result, seed) in seeds {
        map.accumulate(ctx, result, Grad::Value(seed), "seed")?;
    }

    let roots: Vec<ResultId> = seeds.iter().map(|&(result, _)| result).collect();
    let order = graph::toposort(ctx, &roots)?;
    for op_id in order.into_iter().rev() {
        let node = ctx.op_node(op_id)?;
        let inputs = node.inputs().to_vec();
        let outputs = node.outputs().to_vec();
        let op = Rc::clone(node.op());
        if !outputs.iter().any(|&o| map.contains(o)) {
            continue;
        }

        let mut output_grads = Vec::with_capacity(outputs.len());
        for &output in &outputs {
            match map.entries.get(&output) {
                Some(Entry::Value(g)) => output_grads.push(*g),
                Some(Entry::Undefined(origin)) => {
                    return Err(KernelError::UndefinedGradient {
                        op: origin.clone(),
                    })
                }
                None => output_grads.push(ops::zeros_like(ctx, output)?),
            }
        }

        let name = op.name();
        let grads = op
            .grad(ctx, &inputs, &output_grads)?
            .into_vec(&name, inputs.len())?;
        for (input, g) in inputs.into_iter().zip(grads) {
            map.accumulate(ctx, input, g, &name)?;
        }
    }
    Ok(map)
}

/// Gradients of `cost` with respect to each of `wrt`. Results `cost` does
/// not depend on get zeros.
pub fn grad(ctx: &mut Context, cost: ResultId, wrt: &[ResultId]) -> Result<Vec<ResultId>> {
    let seed = ops::ones_like(ctx, cost)?;
    let map = backprop(ctx, &[(cost, seed)])?;
    let mut out = Vec::with_capacity(wrt.len());
    for &w in wrt {
        match map.value(w)? {
            Some(g) => out.push(g),
            None => out.push(ops::zeros_like(ctx, w)?),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use approx::assert_abs_diff_eq;
    use kg_tensor::Tensor;

    fn ctx() -> Context {
        Context::with_config(Config::default())
    }

    fn vector(values: &[f64]) -> Tensor {
        Tensor::from_f64(values.to_vec(), vec![values.len()]).unwrap()
    }

    fn assert_values(ctx: &mut Context, id: ResultId, expected: &[f64]) {
        let got = ctx.array(id).unwrap().to_vec_f64();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert_abs_diff_eq!(*g, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_add_gradient_is_ones() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        let y = ctx.input(vector(&[4.0, 5.0, 6.0])).unwrap();
        let z = ops::add_elemwise(&mut ctx, x, y).unwrap();
        let g = grad(&mut ctx, z, &[x, y]).unwrap();
        assert_values(&mut ctx, g[0], &[1.0, 1.0, 1.0]);
        assert_values(&mut ctx, g[1], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mul_gradient_swaps_operands() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        let y = ctx.input(vector(&[4.0, 5.0, 6.0])).unwrap();
        let z = ops::mul_elemwise(&mut ctx, x, y).unwrap();
        let g = grad(&mut ctx, z, &[x, y]).unwrap();
        assert_values(&mut ctx, g[0], &[4.0, 5.0, 6.0]);
        assert_values(&mut ctx, g[1], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_gradients_accumulate_over_uses() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, -2.0])).unwrap();
        let z = ops::mul_elemwise(&mut ctx, x, x).unwrap();
        let w = ops::add_elemwise(&mut ctx, z, x).unwrap();
        let g = grad(&mut ctx, w, &[x]).unwrap();
        assert_values(&mut ctx, g[0], &[3.0, -3.0]);
    }

    #[test]
    fn test_unreachable_input_gets_zeros() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ctx.input(vector(&[3.0, 4.0])).unwrap();
        let z = ops::neg(&mut ctx, x).unwrap();
        let g = grad(&mut ctx, z, &[y]).unwrap();
        assert_values(&mut ctx, g[0], &[0.0, 0.0]);
    }

    #[test]
    fn test_undefined_gradient_fails_only_when_read() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ctx.input(vector(&[3.0, 4.0])).unwrap();
        let ones = ops::ones_like(&mut ctx, y).unwrap();
        let z = ops::mul_elemwise(&mut ctx, x, ones).unwrap();

        let g = grad(&mut ctx, z, &[x]).unwrap();
        assert_values(&mut ctx, g[0], &[1.0, 1.0]);

        let err = grad(&mut ctx, z, &[y]).unwrap_err();
        assert!(matches!(err, KernelError::UndefinedGradient { op } if op == "ones_like"));
    }

    #[test]
    fn test_undefined_output_gradient_is_an_error() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let n = ops::neg(&mut ctx, x).unwrap();
        let ones = ops::ones_like(&mut ctx, n).unwrap();
        let w = ops::exp(&mut ctx, ones).unwrap();
        let seed = ops::ones_like(&mut ctx, w).unwrap();
        let err = backprop(&mut ctx, &[(w, seed)]).unwrap_err();
        assert!(matches!(err, KernelError::UndefinedGradient { op } if op == "ones_like"));
    }

    #[test]
    fn test_backprop_marks_poisoned_leaves() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let ones = ops::ones_like(&mut ctx, x).unwrap();
        let w = ops::exp(&mut ctx, ones).unwrap();
        let seed = ops::ones_like(&mut ctx, w).unwrap();
        let map = backprop(&mut ctx, &[(w, seed)]).unwrap();
        assert_eq!(map.get(x), Some(Grad::Undefined));
        assert!(matches!(map.get(ones), Some(Grad::Value(_))));
        assert!(map.value(x).is_err());
    }

    #[test]
    fn test_arity_is_checked() {
        let x = Grad::Undefined;
        assert!(GradOutput::Single(x).into_vec("neg", 1).is_ok());
        let err = GradOutput::Single(x).into_vec("add", 2).unwrap_err();
        assert!(matches!(
            err,
            KernelError::GradientArityMismatch { expected: 2, got: 1, .. }
        ));
        let err = GradOutput::undefined(3).into_vec("add", 2).unwrap_err();
        assert!(matches!(
            err,
            KernelError::GradientArityMismatch { expected: 2, got: 3, .. }
        ));
    }
}
