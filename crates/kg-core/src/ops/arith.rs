use crate::elemwise::Elemwise;
use crate::error::Result;
use crate::grad::{Grad, GradOutput};
use crate::graph::{Arg, Context, ResultId, Value};

use super::{apply, inplace, map_binary, map_scalar, map_unary, BINARY, SCALAR_INIT, TENSOR_SCALAR, UNARY};

fn add_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_binary("add_elemwise", inputs, outputs, |x, y| x + y)
}

fn add_grad(_: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(GradOutput::values(&[gz[0], gz[0]]))
}

pub fn add_elemwise_op() -> Elemwise {
    Elemwise::new("add_elemwise", &BINARY, add_perform, add_grad)
        .foreach("z_i = x_i + y_i;")
        .with_inplace_impl(add_perform)
}

pub fn add_elemwise(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, add_elemwise_op(), &[x.into(), y.into()])
}

pub fn add_elemwise_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(add_elemwise_op())?, &[x.into(), y.into()])
}

fn add_scalar_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_scalar("add_scalar", inputs, outputs, |x, a| x + a)
}

fn add_scalar_grad(ctx: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let ga = super::sum(ctx, gz[0])?;
    Ok(GradOutput::values(&[gz[0], ga]))
}

pub fn add_scalar_op() -> Elemwise {
    Elemwise::new("add_scalar", &TENSOR_SCALAR, add_scalar_perform, add_scalar_grad)
        .init(SCALAR_INIT)
        .foreach("z_i = x_i + a0;")
        .with_inplace_impl(add_scalar_perform)
}

pub fn add_scalar(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, add_scalar_op(), &[x.into(), a.into()])
}

pub fn add_scalar_inplace(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(add_scalar_op())?, &[x.into(), a.into()])
}

fn sub_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_binary("sub_elemwise", inputs, outputs, |x, y| x - y)
}

fn sub_grad(ctx: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let gy = neg(ctx, gz[0])?;
    Ok(GradOutput::values(&[gz[0], gy]))
}

pub fn sub_elemwise_op() -> Elemwise {
    Elemwise::new("sub_elemwise", &BINARY, sub_perform, sub_grad)
        .foreach("z_i = x_i - y_i;")
        .with_inplace_impl(sub_perform)
}

pub fn sub_elemwise(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, sub_elemwise_op(), &[x.into(), y.into()])
}

pub fn sub_elemwise_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(sub_elemwise_op())?, &[x.into(), y.into()])
}

/// `x - a`.
pub fn sub_scalar_r(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let neg_a = neg(ctx, a)?;
    add_scalar(ctx, x, neg_a)
}

/// `a - x`.
pub fn sub_scalar_l(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let neg_x = neg(ctx, x)?;
    add_scalar(ctx, neg_x, a)
}

pub fn sub_scalar_r_inplace(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let neg_a = neg(ctx, a)?;
    add_scalar_inplace(ctx, x, neg_a)
}

fn mul_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_binary("mul_elemwise", inputs, outputs, |x, y| x * y)
}

fn mul_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let gx = mul_elemwise(ctx, inputs[1], gz[0])?;
    let gy = mul_elemwise(ctx, inputs[0], gz[0])?;
    Ok(GradOutput::values(&[gx, gy]))
}

pub fn mul_elemwise_op() -> Elemwise {
    Elemwise::new("mul_elemwise", &BINARY, mul_perform, mul_grad)
        .foreach("z_i = x_i * y_i;")
        .with_inplace_impl(mul_perform)
}

pub fn mul_elemwise(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, mul_elemwise_op(), &[x.into(), y.into()])
}

pub fn mul_elemwise_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(mul_elemwise_op())?, &[x.into(), y.into()])
}

fn scale_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_scalar("scale", inputs, outputs, |x, a| x * a)
}

fn scale_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let gx = scale(ctx, gz[0], inputs[1])?;
    let xgz = mul_elemwise(ctx, inputs[0], gz[0])?;
    let ga = super::sum(ctx, xgz)?;
    Ok(GradOutput::values(&[gx, ga]))
}

pub fn scale_op() -> Elemwise {
    Elemwise::new("scale", &TENSOR_SCALAR, scale_perform, scale_grad)
        .init(SCALAR_INIT)
        .foreach("z_i = x_i * a0;")
        .with_inplace_impl(scale_perform)
}

pub fn scale(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, scale_op(), &[x.into(), a.into()])
}

pub fn scale_inplace(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(scale_op())?, &[x.into(), a.into()])
}

fn div_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_binary("div_elemwise", inputs, outputs, |x, y| x / y)
}

fn div_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let (x, y) = (inputs[0], inputs[1]);
    let gx = div_elemwise(ctx, gz[0], y)?;
    let xgz = mul_elemwise(ctx, x, gz[0])?;
    let yy = super::sqr(ctx, y)?;
    let q = div_elemwise(ctx, xgz, yy)?;
    let gy = neg(ctx, q)?;
    Ok(GradOutput::values(&[gx, gy]))
}

pub fn div_elemwise_op() -> Elemwise {
    Elemwise::new("div_elemwise", &BINARY, div_perform, div_grad)
        .foreach("z_i = x_i / y_i;")
        .with_inplace_impl(div_perform)
}

pub fn div_elemwise(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, div_elemwise_op(), &[x.into(), y.into()])
}

pub fn div_elemwise_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(div_elemwise_op())?, &[x.into(), y.into()])
}

/// `x / a`.
pub fn div_scalar_r(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let inv_a = inv_elemwise(ctx, a)?;
    scale(ctx, x, inv_a)
}

/// `a / x`.
pub fn div_scalar_l(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let inv_x = inv_elemwise(ctx, x)?;
    scale(ctx, inv_x, a)
}

pub fn div_scalar_r_inplace(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    let inv_a = inv_elemwise(ctx, a)?;
    scale_inplace(ctx, x, inv_a)
}

fn neg_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("neg", inputs, outputs, |x| -x)
}

fn neg_grad(ctx: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(neg(ctx, gz[0])?.into())
}

pub fn neg_op() -> Elemwise {
    Elemwise::new("neg", &UNARY, neg_perform, neg_grad)
        .foreach("z_i = -x_i;")
        .with_inplace_impl(neg_perform)
}

pub fn neg(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, neg_op(), &[x.into()])
}

pub fn neg_inplace(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(neg_op())?, &[x.into()])
}

fn inv_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("inv_elemwise", inputs, outputs, |x| 1.0 / x)
}

fn inv_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let xx = super::sqr(ctx, inputs[0])?;
    let q = div_elemwise(ctx, gz[0], xx)?;
    Ok(neg(ctx, q)?.into())
}

pub fn inv_elemwise_op() -> Elemwise {
    Elemwise::new("inv_elemwise", &UNARY, inv_perform, inv_grad).foreach("z_i = 1 / x_i;")
}

pub fn inv_elemwise(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inv_elemwise_op(), &[x.into()])
}

fn twice_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("twice", inputs, outputs, |x| x + x)
}

fn twice_grad(ctx: &mut Context, _: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(Grad::Value(scale(ctx, gz[0], 2.0)?).into())
}

pub fn twice_op() -> Elemwise {
    Elemwise::new("twice", &UNARY, twice_perform, twice_grad).foreach("z_i = x_i + x_i;")
}

pub fn twice(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, twice_op(), &[x.into()])
}

pub fn twice_inplace(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(twice_op())?, &[x.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::KernelError;
    use approx::assert_relative_eq;
    use kg_tensor::{DType, Tensor};

    fn ctx() -> Context {
        Context::with_config(Config::default())
    }

    fn vector(values: &[f64]) -> Tensor {
        Tensor::from_f64(values.to_vec(), vec![values.len()]).unwrap()
    }

    #[test]
    fn test_binary_arithmetic() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        let y = ctx.input(vector(&[4.0, 5.0, 8.0])).unwrap();
        let a = add_elemwise(&mut ctx, x, y).unwrap();
        let s = sub_elemwise(&mut ctx, x, y).unwrap();
        let m = mul_elemwise(&mut ctx, x, y).unwrap();
        let d = div_elemwise(&mut ctx, x, y).unwrap();
        assert_eq!(ctx.array(a).unwrap().to_vec_f64(), vec![5.0, 7.0, 11.0]);
        assert_eq!(ctx.array(s).unwrap().to_vec_f64(), vec![-3.0, -3.0, -5.0]);
        assert_eq!(ctx.array(m).unwrap().to_vec_f64(), vec![4.0, 10.0, 24.0]);
        assert_eq!(ctx.array(d).unwrap().to_vec_f64(), vec![0.25, 0.4, 0.375]);
    }

    #[test]
    fn test_mismatched_shapes_fail_at_construction() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let y = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(
            add_elemwise(&mut ctx, x, y),
            Err(KernelError::Tensor(_))
        ));
    }

    #[test]
    fn test_scalar_operand_must_be_zero_rank() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let a = ctx.input(vector(&[1.0, 2.0])).unwrap();
        let z = scale(&mut ctx, x, a).unwrap();
        assert!(matches!(ctx.compute(z), Err(KernelError::Unsupported(_))));
    }

    #[test]
    fn test_scalar_compositions() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[2.0, 4.0])).unwrap();
        let r = sub_scalar_r(&mut ctx, x, 1.0).unwrap();
        let l = sub_scalar_l(&mut ctx, x, 1.0).unwrap();
        let dr = div_scalar_r(&mut ctx, x, 2.0).unwrap();
        let dl = div_scalar_l(&mut ctx, x, 2.0).unwrap();
        assert_eq!(ctx.array(r).unwrap().to_vec_f64(), vec![1.0, 3.0]);
        assert_eq!(ctx.array(l).unwrap().to_vec_f64(), vec![-1.0, -3.0]);
        assert_eq!(ctx.array(dr).unwrap().to_vec_f64(), vec![1.0, 2.0]);
        assert_eq!(ctx.array(dl).unwrap().to_vec_f64(), vec![1.0, 0.5]);
    }

    #[test]
    fn test_inplace_shares_storage_with_input() {
        let mut ctx = ctx();
        let t = vector(&[1.0, -2.0]);
        let x = ctx.input(t.clone()).unwrap();
        let z = neg_inplace(&mut ctx, x).unwrap();
        let out = ctx.array(z).unwrap();
        assert!(out.shares_storage(&t));
        assert_eq!(t.to_vec_f64(), vec![-1.0, 2.0]);
    }

    #[test]
    fn test_inplace_keeps_input_dtype() {
        let mut ctx = ctx();
        let t = Tensor::from_vec(DType::F32, vec![1.5, 2.5], vec![2]).unwrap();
        let x = ctx.input(t.clone()).unwrap();
        let z = add_scalar_inplace(&mut ctx, x, 1.0).unwrap();
        assert_eq!(ctx.spec(z).unwrap().dtype(), Some(DType::F32));
        ctx.compute(z).unwrap();
        assert_eq!(t.to_vec_f64(), vec![2.5, 3.5]);

        let y = add_scalar(&mut ctx, x, 1.0).unwrap();
        assert_eq!(ctx.spec(y).unwrap().dtype(), Some(DType::F64));
    }

    #[test]
    fn test_twice_inplace_via_copy() {
        let mut ctx = ctx();
        let t = vector(&[1.0, 3.0]);
        let x = ctx.input(t.clone()).unwrap();
        let z = twice_inplace(&mut ctx, x).unwrap();
        assert!(ctx.array(z).unwrap().shares_storage(&t));
        assert_eq!(t.to_vec_f64(), vec![2.0, 6.0]);
    }

    #[test]
    fn test_inv_gradient() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[2.0, -4.0])).unwrap();
        let z = inv_elemwise(&mut ctx, x).unwrap();
        let g = crate::grad::grad(&mut ctx, z, &[x]).unwrap();
        let g = ctx.array(g[0]).unwrap().to_vec_f64();
        assert_relative_eq!(g[0], -0.25);
        assert_relative_eq!(g[1], -0.0625);
    }

    #[test]
    fn test_scale_gradients() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[1.0, 2.0, 3.0])).unwrap();
        let a = ctx.input(3.0).unwrap();
        let z = scale(&mut ctx, x, a).unwrap();
        let g = crate::grad::grad(&mut ctx, z, &[x, a]).unwrap();
        assert_eq!(ctx.array(g[0]).unwrap().to_vec_f64(), vec![3.0, 3.0, 3.0]);
        assert_eq!(ctx.array(g[1]).unwrap().to_vec_f64(), vec![6.0]);
    }

    #[test]
    fn test_div_gradients() {
        let mut ctx = ctx();
        let x = ctx.input(vector(&[3.0])).unwrap();
        let y = ctx.input(vector(&[2.0])).unwrap();
        let z = div_elemwise(&mut ctx, x, y).unwrap();
        let g = crate::grad::grad(&mut ctx, z, &[x, y]).unwrap();
        assert_relative_eq!(ctx.array(g[0]).unwrap().to_vec_f64()[0], 0.5);
        assert_relative_eq!(ctx.array(g[1]).unwrap().to_vec_f64()[0], -0.75);
    }
}
