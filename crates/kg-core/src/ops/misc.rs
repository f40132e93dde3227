use std::rc::Rc;

use kg_tensor::Shape;

use crate::elemwise::{Elemwise, Param};
use crate::error::{KernelError, Result};
use crate::grad::{Grad, GradOutput};
use crate::graph::{Arg, Context, ResultId, Spec, Value};
use crate::op::{array_arg, array_out};

use super::{apply, inplace, map_unary, scalar_arg, UNARY};

fn copy_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    let x = array_arg("array_copy", inputs, 0)?;
    array_out("array_copy", outputs, 0)?.assign(x)?;
    Ok(())
}

fn copy_grad(_: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(gz[0].into())
}

pub fn array_copy_op() -> Elemwise {
    Elemwise::new("array_copy", &UNARY, copy_perform, copy_grad).foreach("z_i = x_i;")
}

/// A fresh contiguous copy of `x`.
pub fn array_copy(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, array_copy_op(), &[x.into()])
}

const FILL: [Param; 3] = [
    Param::loop_in("model"),
    Param::whole_in("value"),
    Param::loop_out("z"),
];

fn fill_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    let value = scalar_arg("fill", inputs, 1)?;
    map_unary("fill", inputs, outputs, |_| value)
}

fn fill_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let gmodel = zeros_like(ctx, inputs[0])?;
    let gvalue = sum(ctx, gz[0])?;
    Ok(GradOutput::values(&[gmodel, gvalue]))
}

pub fn fill_op() -> Elemwise {
    Elemwise::new("fill", &FILL, fill_perform, fill_grad)
        .init("if (kg_numel(value) != 1) return KG_FAILED;\nconst value_dtype value0 = value_data[0];")
        .foreach("z_i = value0;")
}

/// An array shaped like `model` holding `value` everywhere.
pub fn fill(ctx: &mut Context, model: impl Into<Arg>, value: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, fill_op(), &[model.into(), value.into()])
}

pub fn fill_inplace(ctx: &mut Context, model: impl Into<Arg>, value: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(fill_op())?, &[model.into(), value.into()])
}

/// Zero-rank specs of the input's dtype, one per output.
fn reduced_specs<const N: usize>(inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
    match inputs.first() {
        Some(Some(Spec::Array { dtype, .. })) => {
            Ok(vec![Some(Spec::array(*dtype, Shape::scalar())); N])
        }
        _ => Err(KernelError::ShapeOrDtypeUnresolved {
            op: "reduction".to_string(),
            reason: "input is not an array with a known spec".to_string(),
        }),
    }
}

fn sum_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    let total: f64 = array_arg("sum", inputs, 0)?.to_vec_f64().iter().sum();
    array_out("sum", outputs, 0)?.write_f64(&[total])?;
    Ok(())
}

fn sum_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(fill(ctx, inputs[0], gz[0])?.into())
}

pub fn sum_op() -> Elemwise {
    Elemwise::new(
        "sum",
        &[Param::loop_in("x"), Param::whole_out("sum")],
        sum_perform,
        sum_grad,
    )
    .with_specs(reduced_specs::<1>)
    .init("sum_data[0] = 0;")
    .foreach("sum_data[0] += x_i;")
}

/// Zero-rank sum of every element.
pub fn sum(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, sum_op(), &[x.into()])
}

fn minmax_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    let values = array_arg("minmax", inputs, 0)?.to_vec_f64();
    let Some(&first) = values.first() else {
        return Err(KernelError::Unsupported(
            "minmax of an empty array".to_string(),
        ));
    };
    let (lo, hi) = values
        .iter()
        .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    array_out("minmax", outputs, 0)?.write_f64(&[lo])?;
    array_out("minmax", outputs, 1)?.write_f64(&[hi])?;
    Ok(())
}

fn minmax_grad(_: &mut Context, _: &[ResultId], _: &[ResultId]) -> Result<GradOutput> {
    Ok(Grad::Undefined.into())
}

pub fn minmax_op() -> Elemwise {
    Elemwise::new(
        "minmax",
        &[Param::loop_in("x"), Param::whole_out("lo"), Param::whole_out("hi")],
        minmax_perform,
        minmax_grad,
    )
    .with_specs(reduced_specs::<2>)
    .init("if (kg_count == 0) return KG_FAILED;\nx_dtype lo_v = x_data[0];\nx_dtype hi_v = x_data[0];")
    .foreach("if (x_i < lo_v) lo_v = x_i;\nif (x_i > hi_v) hi_v = x_i;")
    .finalize("lo_data[0] = lo_v;\nhi_data[0] = hi_v;")
}

/// Smallest and largest element, as two zero-rank results.
pub fn minmax(ctx: &mut Context, x: impl Into<Arg>) -> Result<(ResultId, ResultId)> {
    let op = ctx.apply(Rc::new(minmax_op()), &[x.into()])?;
    let outputs = ctx.outputs(op)?;
    Ok((outputs[0], outputs[1]))
}

fn ones_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("ones_like", inputs, outputs, |_| 1.0)
}

fn zeros_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("zeros_like", inputs, outputs, |_| 0.0)
}

fn undefined_grad(_: &mut Context, _: &[ResultId], _: &[ResultId]) -> Result<GradOutput> {
    Ok(Grad::Undefined.into())
}

pub fn ones_like_op() -> Elemwise {
    Elemwise::new("ones_like", &UNARY, ones_perform, undefined_grad).foreach("z_i = 1;")
}

pub fn ones_like(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, ones_like_op(), &[x.into()])
}

pub fn zeros_like_op() -> Elemwise {
    Elemwise::new("zeros_like", &UNARY, zeros_perform, undefined_grad).foreach("z_i = 0;")
}

pub fn zeros_like(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, zeros_like_op(), &[x.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use kg_tensor::{DType, Tensor};

    fn ctx() -> Context {
        Context::with_config(Config::default())
    }

    #[test]
    fn test_copy_is_isolated_from_source() {
        let mut ctx = ctx();
        let t = Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap();
        let x = ctx.input(t.clone()).unwrap();
        let c = array_copy(&mut ctx, x).unwrap();
        let copy = ctx.array(c).unwrap();
        assert!(!copy.shares_storage(&t));
        t.set(&[0], 9.0).unwrap();
        assert_eq!(copy.to_vec_f64(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_fill_and_sum() {
        let mut ctx = ctx();
        let x = ctx
            .input(Tensor::zeros(DType::F64, vec![2, 3]))
            .unwrap();
        let f = fill(&mut ctx, x, 1.5).unwrap();
        let s = sum(&mut ctx, f).unwrap();
        assert_eq!(ctx.array(f).unwrap().to_vec_f64(), vec![1.5; 6]);
        let total = ctx.array(s).unwrap();
        assert_eq!(total.ndim(), 0);
        assert_eq!(total.to_vec_f64(), vec![9.0]);
    }

    #[test]
    fn test_sum_gradient_fills() {
        let mut ctx = ctx();
        let x = ctx
            .input(Tensor::from_f64(vec![1.0, 2.0, 3.0], vec![3]).unwrap())
            .unwrap();
        let s = sum(&mut ctx, x).unwrap();
        let g = crate::grad::grad(&mut ctx, s, &[x]).unwrap();
        assert_eq!(ctx.array(g[0]).unwrap().to_vec_f64(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_minmax() {
        let mut ctx = ctx();
        let x = ctx
            .input(Tensor::from_f64(vec![3.0, -1.0, 7.0, 2.0], vec![2, 2]).unwrap())
            .unwrap();
        let (lo, hi) = minmax(&mut ctx, x).unwrap();
        assert_eq!(ctx.array(lo).unwrap().to_vec_f64(), vec![-1.0]);
        assert_eq!(ctx.array(hi).unwrap().to_vec_f64(), vec![7.0]);
        assert_eq!(ctx.spec(lo).unwrap().shape(), Some(&Shape::scalar()));
    }

    #[test]
    fn test_minmax_of_empty_array_fails() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::zeros(DType::F64, vec![0])).unwrap();
        let (lo, _) = minmax(&mut ctx, x).unwrap();
        assert!(ctx.compute(lo).is_err());
    }

    #[test]
    fn test_like_ops_keep_dtype() {
        let mut ctx = ctx();
        let x = ctx
            .input(Tensor::from_vec(DType::I32, vec![5.0, 6.0], vec![2]).unwrap())
            .unwrap();
        let o = ones_like(&mut ctx, x).unwrap();
        let z = zeros_like(&mut ctx, x).unwrap();
        assert_eq!(ctx.spec(o).unwrap().dtype(), Some(DType::I32));
        assert_eq!(ctx.array(o).unwrap().to_vec_f64(), vec![1.0, 1.0]);
        assert_eq!(ctx.array(z).unwrap().to_vec_f64(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_fill_inplace_overwrites_model() {
        let mut ctx = ctx();
        let t = Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap();
        let x = ctx.input(t.clone()).unwrap();
        let z = fill_inplace(&mut ctx, x, 4.0).unwrap();
        assert!(ctx.array(z).unwrap().shares_storage(&t));
        assert_eq!(t.to_vec_f64(), vec![4.0, 4.0]);
    }
}
