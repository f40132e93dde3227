//! Operator catalog.
//!
//! Every operator has a constructor returning the operator value
//! (`neg_op`) and a graph function applying it (`neg`). Binary operators
//! are also grouped into dispatch families (`add`, `sub`, `mul`, `div`,
//! `pow` and their in-place counterparts) that pick a scalar variant when
//! an operand is a zero-rank constant.

mod arith;
mod blas;
mod math;
mod misc;
mod view;

pub use arith::*;
pub use blas::*;
pub use math::*;
pub use misc::*;
pub use view::*;

use std::rc::Rc;

use kg_tensor::TensorError;

use crate::dispatch::{Family, FamilyBuilder};
use crate::elemwise::{Elemwise, Param};
use crate::error::{KernelError, Result};
use crate::graph::{Arg, Context, ResultId, Value};
use crate::op::{array_arg, array_out, DestroyMap};

pub(crate) const UNARY: [Param; 2] = [Param::loop_in("x"), Param::loop_out("z")];
pub(crate) const BINARY: [Param; 3] = [Param::loop_in("x"), Param::loop_in("y"), Param::loop_out("z")];
pub(crate) const TENSOR_SCALAR: [Param; 3] =
    [Param::loop_in("x"), Param::whole_in("a"), Param::loop_out("z")];

/// Reads the scalar operand of a tensor-scalar kernel.
pub(crate) const SCALAR_INIT: &str =
    "if (kg_numel(a) != 1) return KG_FAILED;\nconst a_dtype a0 = a_data[0];";

pub(crate) fn apply(ctx: &mut Context, op: Elemwise, args: &[Arg]) -> Result<ResultId> {
    ctx.apply1(Rc::new(op), args)
}

/// The `{0: 0}` in-place variant of `op`.
pub(crate) fn inplace(op: Elemwise) -> Result<Elemwise> {
    op.inplace_version(DestroyMap::from([(0, 0)]))
}

pub(crate) fn map_unary(
    name: &str,
    inputs: &[Value],
    outputs: &mut [Option<Value>],
    f: impl Fn(f64) -> f64,
) -> Result<()> {
    let x = array_arg(name, inputs, 0)?.to_vec_f64();
    let values: Vec<f64> = x.into_iter().map(f).collect();
    array_out(name, outputs, 0)?.write_f64(&values)?;
    Ok(())
}

pub(crate) fn map_binary(
    name: &str,
    inputs: &[Value],
    outputs: &mut [Option<Value>],
    f: impl Fn(f64, f64) -> f64,
) -> Result<()> {
    let x = array_arg(name, inputs, 0)?;
    let y = array_arg(name, inputs, 1)?;
    if x.shape() != y.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: x.shape().dims().to_vec(),
            got: y.shape().dims().to_vec(),
        }
        .into());
    }
    let values: Vec<f64> = x
        .to_vec_f64()
        .into_iter()
        .zip(y.to_vec_f64())
        .map(|(a, b)| f(a, b))
        .collect();
    array_out(name, outputs, 0)?.write_f64(&values)?;
    Ok(())
}

/// `z = f(x, a)` where the second operand must be zero-rank.
pub(crate) fn map_scalar(
    name: &str,
    inputs: &[Value],
    outputs: &mut [Option<Value>],
    f: impl Fn(f64, f64) -> f64,
) -> Result<()> {
    let a = scalar_arg(name, inputs, 1)?;
    let x = array_arg(name, inputs, 0)?.to_vec_f64();
    let values: Vec<f64> = x.into_iter().map(|v| f(v, a)).collect();
    array_out(name, outputs, 0)?.write_f64(&values)?;
    Ok(())
}

/// The value of a zero-rank array input.
pub(crate) fn scalar_arg(name: &str, inputs: &[Value], index: usize) -> Result<f64> {
    let a = array_arg(name, inputs, index)?;
    if a.ndim() != 0 {
        return Err(KernelError::Unsupported(format!(
            "argument {index} of {name} must be a scalar, got shape {}",
            a.shape()
        )));
    }
    Ok(a.get(&[])?)
}

pub fn add_family() -> Result<Family> {
    FamilyBuilder::new("add", add_elemwise, add_scalar)
        .commutative()
        .build()
}

pub fn add_inplace_family() -> Result<Family> {
    FamilyBuilder::new("add_inplace", add_elemwise_inplace, add_scalar_inplace)
        .inplace()
        .build()
}

pub fn sub_family() -> Result<Family> {
    FamilyBuilder::new("sub", sub_elemwise, sub_scalar_r)
        .reverse(sub_scalar_l)
        .build()
}

pub fn sub_inplace_family() -> Result<Family> {
    FamilyBuilder::new("sub_inplace", sub_elemwise_inplace, sub_scalar_r_inplace)
        .inplace()
        .build()
}

pub fn mul_family() -> Result<Family> {
    FamilyBuilder::new("mul", mul_elemwise, scale)
        .commutative()
        .build()
}

pub fn mul_inplace_family() -> Result<Family> {
    FamilyBuilder::new("mul_inplace", mul_elemwise_inplace, scale_inplace)
        .inplace()
        .build()
}

pub fn div_family() -> Result<Family> {
    FamilyBuilder::new("div", div_elemwise, div_scalar_r)
        .reverse(div_scalar_l)
        .build()
}

pub fn div_inplace_family() -> Result<Family> {
    FamilyBuilder::new("div_inplace", div_elemwise_inplace, div_scalar_r_inplace)
        .inplace()
        .build()
}

pub fn pow_family() -> Result<Family> {
    FamilyBuilder::new("pow", pow_elemwise, pow_scalar_r)
        .reverse(pow_scalar_l)
        .build()
}

pub fn pow_inplace_family() -> Result<Family> {
    FamilyBuilder::new("pow_inplace", pow_elemwise_inplace, pow_scalar_r_inplace)
        .inplace()
        .build()
}

pub fn add(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    add_family()?.call(ctx, x, y)
}

pub fn add_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    add_inplace_family()?.call(ctx, x, y)
}

pub fn sub(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    sub_family()?.call(ctx, x, y)
}

pub fn sub_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    sub_inplace_family()?.call(ctx, x, y)
}

pub fn mul(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    mul_family()?.call(ctx, x, y)
}

pub fn mul_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    mul_inplace_family()?.call(ctx, x, y)
}

pub fn div(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    div_family()?.call(ctx, x, y)
}

pub fn div_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    div_inplace_family()?.call(ctx, x, y)
}

pub fn pow(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    pow_family()?.call(ctx, x, y)
}

pub fn pow_inplace(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    pow_inplace_family()?.call(ctx, x, y)
}
