use crate::error::{KernelError, Result};
use crate::graph::{Arg, Context, ResultId};

/// Constructor of one binary operator variant.
pub type BinaryCtor = fn(&mut Context, ResultId, ResultId) -> Result<ResultId>;

/// Which variant a call dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    TensorTensor,
    /// Right operand is a zero-rank constant.
    TensorScalar,
    /// Left operand is a zero-rank constant; the operands are swapped.
    ScalarTensor,
}

/// A binary operator with tensor and scalar variants.
#[derive(Clone)]
pub struct Family {
    name: &'static str,
    tensor: BinaryCtor,
    scalar: BinaryCtor,
    reverse: Option<BinaryCtor>,
    inplace: bool,
}

impl Family {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_inplace(&self) -> bool {
        self.inplace
    }

    /// The variant `(x, y)` dispatches to.
    pub fn select(&self, ctx: &Context, x: ResultId, y: ResultId) -> Result<Variant> {
        if ctx.is_zero_rank_constant(y) {
            return Ok(Variant::TensorScalar);
        }
        if ctx.is_zero_rank_constant(x) {
            if self.reverse.is_none() {
                return Err(KernelError::DispatchConfiguration {
                    family: self.name.to_string(),
                    reason: "no scalar-tensor variant for a constant left operand".to_string(),
                });
            }
            return Ok(Variant::ScalarTensor);
        }
        Ok(Variant::TensorTensor)
    }

    /// Wrap both operands and apply the selected variant.
    pub fn call(
        &self,
        ctx: &mut Context,
        x: impl Into<Arg>,
        y: impl Into<Arg>,
    ) -> Result<ResultId> {
        let x = ctx.wrap(x)?;
        let y = ctx.wrap(y)?;
        match (self.select(ctx, x, y)?, self.reverse) {
            (Variant::TensorScalar, _) => (self.scalar)(ctx, x, y),
            (Variant::ScalarTensor, Some(reverse)) => reverse(ctx, y, x),
            _ => (self.tensor)(ctx, x, y),
        }
    }
}

/// Builds a [`Family`], checking that constant left operands are covered.
pub struct FamilyBuilder {
    name: &'static str,
    tensor: BinaryCtor,
    scalar: BinaryCtor,
    reverse: Option<BinaryCtor>,
    commutative: bool,
    inplace: bool,
}

impl FamilyBuilder {
    pub fn new(name: &'static str, tensor: BinaryCtor, scalar: BinaryCtor) -> Self {
        FamilyBuilder {
            name,
            tensor,
            scalar,
            reverse: None,
            commutative: false,
            inplace: false,
        }
    }

    /// Variant for a constant left operand, called as `reverse(right, left)`.
    pub fn reverse(mut self, reverse: BinaryCtor) -> Self {
        self.reverse = Some(reverse);
        self
    }

    /// The scalar variant also serves constant left operands.
    pub fn commutative(mut self) -> Self {
        self.commutative = true;
        self
    }

    /// Variants destroy their left operand.
    pub fn inplace(mut self) -> Self {
        self.inplace = true;
        self
    }

    pub fn build(self) -> Result<Family> {
        let reverse = match (self.reverse, self.commutative && !self.inplace) {
            (Some(reverse), _) => Some(reverse),
            (None, true) => Some(self.scalar),
            (None, false) => None,
        };
        if reverse.is_none() && !self.inplace {
            return Err(KernelError::DispatchConfiguration {
                family: self.name.to_string(),
                reason: "neither commutative nor given a scalar-tensor variant".to_string(),
            });
        }
        Ok(Family {
            name: self.name,
            tensor: self.tensor,
            scalar: self.scalar,
            reverse,
            inplace: self.inplace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ops;
    use kg_tensor::Tensor;

    fn ctx() -> Context {
        Context::with_config(Config::default())
    }

    fn producer_name(ctx: &Context, id: ResultId) -> String {
        let op = ctx.producer(id).unwrap();
        ctx.op_node(op).unwrap().op().name()
    }

    #[test]
    fn test_right_scalar_selects_tensor_scalar() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap()).unwrap();
        let five = ctx.literal(5.0).unwrap();
        let family = ops::add_family().unwrap();
        assert_eq!(family.select(&ctx, x, five).unwrap(), Variant::TensorScalar);
        assert_eq!(family.select(&ctx, five, x).unwrap(), Variant::ScalarTensor);

        let y = family.call(&mut ctx, x, 5.0).unwrap();
        assert_eq!(producer_name(&ctx, y), "add_scalar");
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![6.0, 7.0]);
    }

    #[test]
    fn test_left_scalar_matches_right_scalar() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap()).unwrap();
        let a = ops::add(&mut ctx, x, 5.0).unwrap();
        let b = ops::add(&mut ctx, 5.0, x).unwrap();
        assert_eq!(
            ctx.array(a).unwrap().to_vec_f64(),
            ctx.array(b).unwrap().to_vec_f64()
        );
    }

    #[test]
    fn test_reverse_variant_keeps_operand_order() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::from_f64(vec![1.0, 4.0], vec![2]).unwrap()).unwrap();
        let d = ops::sub(&mut ctx, 10.0, x).unwrap();
        assert_eq!(ctx.array(d).unwrap().to_vec_f64(), vec![9.0, 6.0]);
        let q = ops::div(&mut ctx, 8.0, x).unwrap();
        assert_eq!(ctx.array(q).unwrap().to_vec_f64(), vec![8.0, 2.0]);
    }

    #[test]
    fn test_two_tensors_select_tensor_tensor() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap()).unwrap();
        let y = ctx.input(Tensor::from_f64(vec![3.0, 4.0], vec![2]).unwrap()).unwrap();
        let z = ops::mul(&mut ctx, x, y).unwrap();
        assert_eq!(producer_name(&ctx, z), "mul_elemwise");
        // A zero-rank input is not a constant and stays a tensor operand.
        let s = ctx.input(2.0).unwrap();
        let family = ops::mul_family().unwrap();
        assert_eq!(family.select(&ctx, x, s).unwrap(), Variant::TensorTensor);
    }

    #[test]
    fn test_missing_reverse_is_rejected_at_build() {
        let err = FamilyBuilder::new("sub", ops::sub_elemwise, ops::sub_scalar_r)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::DispatchConfiguration { .. }));
        assert!(FamilyBuilder::new("sub", ops::sub_elemwise, ops::sub_scalar_r)
            .reverse(ops::sub_scalar_l)
            .build()
            .is_ok());
    }

    #[test]
    fn test_inplace_family_rejects_constant_left_operand() {
        let mut ctx = ctx();
        let x = ctx.input(Tensor::from_f64(vec![1.0, 2.0], vec![2]).unwrap()).unwrap();
        let family = ops::sub_inplace_family().unwrap();
        assert!(family.is_inplace());
        let err = family.call(&mut ctx, 3.0, x).unwrap_err();
        assert!(matches!(err, KernelError::DispatchConfiguration { .. }));

        let y = family.call(&mut ctx, x, 1.0).unwrap();
        assert_eq!(ctx.array(y).unwrap().to_vec_f64(), vec![0.0, 1.0]);
        assert_eq!(ctx.array(x).unwrap().to_vec_f64(), vec![0.0, 1.0]);
    }
}
