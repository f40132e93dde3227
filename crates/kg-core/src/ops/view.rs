use std::rc::Rc;

use kg_tensor::{slice_shape, DType, Shape, SliceArg};

use crate::error::{KernelError, Result};
use crate::grad::GradOutput;
use crate::graph::{Arg, Context, HostValue, ResultId, Spec, Value};
use crate::op::{array_arg, Operator, ViewMap};

use super::array_copy;

fn array_spec<'a>(op: &str, inputs: &'a [Option<Spec>]) -> Result<(DType, &'a Shape)> {
    match inputs.first() {
        Some(Some(Spec::Array { dtype, shape })) => Ok((*dtype, shape)),
        _ => Err(KernelError::ShapeOrDtypeUnresolved {
            op: op.to_string(),
            reason: "input is not an array with a known spec".to_string(),
        }),
    }
}

/// Reversed-axes view of its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transpose;

impl Operator for Transpose {
    fn name(&self) -> String {
        "transpose".to_string()
    }

    fn view_map(&self) -> ViewMap {
        ViewMap::from([(0, 0)])
    }

    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        let (dtype, shape) = array_spec("transpose", inputs)?;
        Ok(vec![Some(Spec::array(dtype, shape.reversed()))])
    }

    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let x = array_arg("transpose", inputs, 0)?;
        outputs[0] = Some(Value::Array(x.transpose()));
        Ok(())
    }

    fn grad(&self, ctx: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
        Ok(transpose_copy(ctx, gz[0])?.into())
    }
}

/// A view of `x` with its axes reversed. Writes through either side are
/// visible through the other.
pub fn transpose(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    ctx.apply1(Rc::new(Transpose), &[x.into()])
}

/// A contiguous copy of the transpose of `x`.
pub fn transpose_copy(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    let view = transpose(ctx, x)?;
    array_copy(ctx, view)
}

/// Basic indexing of an array by a fixed slice expression.
///
/// The expression is also passed as a host-valued second input so that the
/// interpreted implementation reads it from its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetSlice {
    slices: Vec<SliceArg>,
}

impl GetSlice {
    pub fn new(slices: Vec<SliceArg>) -> Self {
        GetSlice { slices }
    }

    pub fn slices(&self) -> &[SliceArg] {
        &self.slices
    }
}

impl Operator for GetSlice {
    fn name(&self) -> String {
        "get_slice".to_string()
    }

    fn view_map(&self) -> ViewMap {
        ViewMap::from([(0, 0)])
    }

    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        let (dtype, shape) = array_spec("get_slice", inputs)?;
        Ok(vec![Some(Spec::array(dtype, slice_shape(shape, &self.slices)?))])
    }

    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let x = array_arg("get_slice", inputs, 0)?;
        let slices = match inputs.get(1) {
            Some(Value::Host(HostValue::Slices(slices))) => slices.as_slice(),
            _ => self.slices.as_slice(),
        };
        outputs[0] = Some(Value::Array(x.slice(slices)?));
        Ok(())
    }

    fn grad(&self, _: &mut Context, inputs: &[ResultId], _: &[ResultId]) -> Result<GradOutput> {
        Ok(GradOutput::undefined(inputs.len()))
    }
}

/// A view of `x` selected by `slices`.
pub fn get_slice(ctx: &mut Context, x: impl Into<Arg>, slices: Vec<SliceArg>) -> Result<ResultId> {
    let op = GetSlice::new(slices.clone());
    ctx.apply1(Rc::new(op), &[x.into(), slices.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use kg_tensor::Tensor;

    fn ctx() -> Context {
        Context::with_config(Config::default())
    }

    fn grid() -> Tensor {
        Tensor::from_f64((0..6).map(f64::from).collect(), vec![2, 3]).unwrap()
    }

    #[test]
    fn test_transpose_shares_storage() {
        let mut ctx = ctx();
        let t = grid();
        let x = ctx.input(t.clone()).unwrap();
        let xt = transpose(&mut ctx, x).unwrap();
        assert_eq!(ctx.spec(xt).unwrap().shape(), Some(&Shape::new(vec![3, 2])));

        let view = ctx.array(xt).unwrap();
        assert!(view.shares_storage(&t));
        assert_eq!(view.get(&[2, 1]).unwrap(), 5.0);

        view.set(&[0, 1], 10.0).unwrap();
        assert_eq!(t.get(&[1, 0]).unwrap(), 10.0);
        t.set(&[0, 2], -1.0).unwrap();
        assert_eq!(view.get(&[2, 0]).unwrap(), -1.0);
    }

    #[test]
    fn test_transpose_copy_is_isolated() {
        let mut ctx = ctx();
        let t = grid();
        let x = ctx.input(t.clone()).unwrap();
        let c = transpose_copy(&mut ctx, x).unwrap();
        let copy = ctx.array(c).unwrap();
        assert!(!copy.shares_storage(&t));
        assert!(copy.is_contiguous());
        assert_eq!(copy.to_vec_f64(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_transpose_gradient() {
        let mut ctx = ctx();
        let x = ctx.input(grid()).unwrap();
        let xt = transpose(&mut ctx, x).unwrap();
        let s = crate::ops::sum(&mut ctx, xt).unwrap();
        let g = crate::grad::grad(&mut ctx, s, &[x]).unwrap();
        let gx = ctx.array(g[0]).unwrap();
        assert_eq!(gx.shape(), &Shape::new(vec![2, 3]));
        assert_eq!(gx.to_vec_f64(), vec![1.0; 6]);
    }

    #[test]
    fn test_slice_shares_storage() {
        let mut ctx = ctx();
        let t = grid();
        let x = ctx.input(t.clone()).unwrap();
        let row = get_slice(&mut ctx, x, vec![SliceArg::Index(1), SliceArg::stepped(0, 3, 2)]).unwrap();
        assert_eq!(ctx.spec(row), Some(&Spec::array(DType::F64, vec![2])));

        let view = ctx.array(row).unwrap();
        assert_eq!(view.to_vec_f64(), vec![3.0, 5.0]);
        view.set(&[1], 50.0).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 50.0);
    }

    #[test]
    fn test_slice_of_zero_rank_is_rejected() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::scalar(1.0)).unwrap();
        let err = get_slice(&mut ctx, x, vec![SliceArg::Index(0)]).unwrap_err();
        assert!(err.to_string().contains("0-d arrays can't be indexed."));
    }

    #[test]
    fn test_slice_gradient_is_undefined() {
        let mut ctx = ctx();
        let x = ctx.input(grid()).unwrap();
        let row = get_slice(&mut ctx, x, vec![SliceArg::Index(0)]).unwrap();
        let s = crate::ops::sum(&mut ctx, row).unwrap();
        assert!(matches!(
            crate::grad::grad(&mut ctx, s, &[x]),
            Err(KernelError::UndefinedGradient { .. })
        ));
    }

    #[test]
    fn test_view_result_rejects_item_assignment() {
        let mut ctx = ctx();
        let x = ctx.input(grid()).unwrap();
        let xt = transpose(&mut ctx, x).unwrap();
        let err = ctx.set_item(xt, &[0, 0], 1.0).unwrap_err();
        assert!(err
            .to_string()
            .contains("the result of transpose does not support item assignment"));
    }
}
