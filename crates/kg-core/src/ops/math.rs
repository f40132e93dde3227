use std::f64::consts::LN_2;

use crate::elemwise::Elemwise;
use crate::error::Result;
use crate::grad::GradOutput;
use crate::graph::{Arg, Context, ResultId, Value};

use super::{
    add_scalar, apply, div_elemwise, inplace, map_binary, map_scalar, map_unary, mul_elemwise,
    scale, sum, BINARY, SCALAR_INIT, TENSOR_SCALAR, UNARY,
};

fn sqr_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("sqr", inputs, outputs, |x| x * x)
}

fn sqr_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let xgz = mul_elemwise(ctx, inputs[0], gz[0])?;
    Ok(scale(ctx, xgz, 2.0)?.into())
}

pub fn sqr_op() -> Elemwise {
    Elemwise::new("sqr", &UNARY, sqr_perform, sqr_grad)
        .foreach("z_i = x_i * x_i;")
        .with_inplace_impl(sqr_perform)
}

pub fn sqr(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, sqr_op(), &[x.into()])
}

pub fn sqr_inplace(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(sqr_op())?, &[x.into()])
}

fn sqrt_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("sqrt", inputs, outputs, f64::sqrt)
}

fn sqrt_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let root = sqrt(ctx, inputs[0])?;
    let q = div_elemwise(ctx, gz[0], root)?;
    Ok(scale(ctx, q, 0.5)?.into())
}

pub fn sqrt_op() -> Elemwise {
    Elemwise::new("sqrt", &UNARY, sqrt_perform, sqrt_grad)
        .foreach("z_i = sqrt(x_i);")
        .with_inplace_impl(sqrt_perform)
}

pub fn sqrt(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, sqrt_op(), &[x.into()])
}

pub fn sqrt_inplace(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(sqrt_op())?, &[x.into()])
}

fn exp_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("exp", inputs, outputs, f64::exp)
}

fn exp_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let e = exp(ctx, inputs[0])?;
    Ok(mul_elemwise(ctx, gz[0], e)?.into())
}

pub fn exp_op() -> Elemwise {
    Elemwise::new("exp", &UNARY, exp_perform, exp_grad).foreach("z_i = exp(x_i);")
}

pub fn exp(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, exp_op(), &[x.into()])
}

fn log_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("log", inputs, outputs, f64::ln)
}

fn log_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    Ok(div_elemwise(ctx, gz[0], inputs[0])?.into())
}

pub fn log_op() -> Elemwise {
    Elemwise::new("log", &UNARY, log_perform, log_grad).foreach("z_i = log(x_i);")
}

pub fn log(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, log_op(), &[x.into()])
}

fn log2_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_unary("log2", inputs, outputs, f64::log2)
}

fn log2_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let x_ln2 = scale(ctx, inputs[0], LN_2)?;
    Ok(div_elemwise(ctx, gz[0], x_ln2)?.into())
}

pub fn log2_op() -> Elemwise {
    Elemwise::new("log2", &UNARY, log2_perform, log2_grad).foreach("z_i = log2(x_i);")
}

pub fn log2(ctx: &mut Context, x: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, log2_op(), &[x.into()])
}

fn pow_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_binary("pow_elemwise", inputs, outputs, f64::powf)
}

/// d(x^s)/dx = s x^(s-1), d(x^s)/ds = x^s ln x.
fn pow_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let (x, s) = (inputs[0], inputs[1]);
    let s_minus_one = add_scalar(ctx, s, -1.0)?;
    let lowered = pow_elemwise(ctx, x, s_minus_one)?;
    let dx = mul_elemwise(ctx, s, lowered)?;
    let gx = mul_elemwise(ctx, gz[0], dx)?;

    let z = pow_elemwise(ctx, x, s)?;
    let ln_x = super::log(ctx, x)?;
    let ds = mul_elemwise(ctx, z, ln_x)?;
    let gs = mul_elemwise(ctx, gz[0], ds)?;
    Ok(GradOutput::values(&[gx, gs]))
}

pub fn pow_elemwise_op() -> Elemwise {
    Elemwise::new("pow_elemwise", &BINARY, pow_perform, pow_grad)
        .foreach("z_i = pow(x_i, y_i);")
        .with_inplace_impl(pow_perform)
}

pub fn pow_elemwise(ctx: &mut Context, x: impl Into<Arg>, s: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, pow_elemwise_op(), &[x.into(), s.into()])
}

pub fn pow_elemwise_inplace(ctx: &mut Context, x: impl Into<Arg>, s: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(pow_elemwise_op())?, &[x.into(), s.into()])
}

fn pow_scalar_r_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_scalar("pow_scalar_r", inputs, outputs, f64::powf)
}

fn pow_scalar_r_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let (x, s) = (inputs[0], inputs[1]);
    let s_minus_one = add_scalar(ctx, s, -1.0)?;
    let lowered = pow_scalar_r(ctx, x, s_minus_one)?;
    let dx = scale(ctx, lowered, s)?;
    let gx = mul_elemwise(ctx, gz[0], dx)?;

    let z = pow_scalar_r(ctx, x, s)?;
    let ln_x = super::log(ctx, x)?;
    let ds = mul_elemwise(ctx, z, ln_x)?;
    let gds = mul_elemwise(ctx, gz[0], ds)?;
    let gs = sum(ctx, gds)?;
    Ok(GradOutput::values(&[gx, gs]))
}

pub fn pow_scalar_r_op() -> Elemwise {
    Elemwise::new("pow_scalar_r", &TENSOR_SCALAR, pow_scalar_r_perform, pow_scalar_r_grad)
        .init(SCALAR_INIT)
        .foreach("z_i = pow(x_i, a0);")
        .with_inplace_impl(pow_scalar_r_perform)
}

/// `x ^ a`.
pub fn pow_scalar_r(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, pow_scalar_r_op(), &[x.into(), a.into()])
}

pub fn pow_scalar_r_inplace(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, inplace(pow_scalar_r_op())?, &[x.into(), a.into()])
}

fn pow_scalar_l_perform(inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
    map_scalar("pow_scalar_l", inputs, outputs, |x, a| a.powf(x))
}

/// d(a^x)/dx = a^x ln a, d(a^x)/da = x a^(x-1).
fn pow_scalar_l_grad(ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
    let (x, a) = (inputs[0], inputs[1]);
    let z = pow_scalar_l(ctx, x, a)?;
    let ln_a = super::log(ctx, a)?;
    let dx = scale(ctx, z, ln_a)?;
    let gx = mul_elemwise(ctx, gz[0], dx)?;

    let x_minus_one = add_scalar(ctx, x, -1.0)?;
    let lowered = pow_scalar_l(ctx, x_minus_one, a)?;
    let da = mul_elemwise(ctx, x, lowered)?;
    let gda = mul_elemwise(ctx, gz[0], da)?;
    let ga = sum(ctx, gda)?;
    Ok(GradOutput::values(&[gx, ga]))
}

pub fn pow_scalar_l_op() -> Elemwise {
    Elemwise::new("pow_scalar_l", &TENSOR_SCALAR, pow_scalar_l_perform, pow_scalar_l_grad)
        .init(SCALAR_INIT)
        .foreach("z_i = pow(a0, x_i);")
}

/// `a ^ x`.
pub fn pow_scalar_l(ctx: &mut Context, x: impl Into<Arg>, a: impl Into<Arg>) -> Result<ResultId> {
    apply(ctx, pow_scalar_l_op(), &[x.into(), a.into()])
}
