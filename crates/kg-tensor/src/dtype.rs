use std::fmt;
use std::ops::Add;

use half::f16;

/// Supported element types for tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point. Bare numeric inputs default to this type.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
}

impl DType {
    pub const ALL: [DType; 5] = [DType::F16, DType::F32, DType::F64, DType::I32, DType::I64];

    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Returns true for the floating point types.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Stable numeric tag shared with generated kernels.
    pub fn tag(&self) -> i32 {
        match self {
            DType::F16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            DType::I32 => 4,
            DType::I64 => 5,
        }
    }

    /// Type promotion join of two dtypes.
    ///
    /// Computed the way array libraries do it: add a zero of each type and
    /// read the type of the sum.
    pub fn join(self, other: DType) -> DType {
        (Scalar::zero(self) + Scalar::zero(other)).dtype()
    }

    /// Upcast of a non-empty list of dtypes, or `None` for an empty list.
    pub fn upcast<I: IntoIterator<Item = DType>>(dtypes: I) -> Option<DType> {
        let mut iter = dtypes.into_iter();
        let first = Scalar::zero(iter.next()?);
        Some(iter.fold(first, |acc, d| acc + Scalar::zero(d)).dtype())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

/// A single typed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F16(f16),
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
}

impl Scalar {
    /// The zero value of `dtype`.
    pub fn zero(dtype: DType) -> Scalar {
        Scalar::from_f64(dtype, 0.0)
    }

    /// Cast an f64 into a scalar of `dtype`. Integer casts truncate.
    pub fn from_f64(dtype: DType, value: f64) -> Scalar {
        match dtype {
            DType::F16 => Scalar::F16(f16::from_f64(value)),
            DType::F32 => Scalar::F32(value as f32),
            DType::F64 => Scalar::F64(value),
            DType::I32 => Scalar::I32(value as i32),
            DType::I64 => Scalar::I64(value as i64),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Scalar::F16(_) => DType::F16,
            Scalar::F32(_) => DType::F32,
            Scalar::F64(_) => DType::F64,
            Scalar::I32(_) => DType::I32,
            Scalar::I64(_) => DType::I64,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match *self {
            Scalar::F16(v) => v.to_f64(),
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
            Scalar::I32(v) => v as f64,
            Scalar::I64(v) => v as f64,
        }
    }
}

/// Result dtype of adding a value of `a` to a value of `b`.
fn promote(a: DType, b: DType) -> DType {
    use DType::*;
    match (a, b) {
        _ if a == b => a,
        (I32, I64) | (I64, I32) => I64,
        (F16, F32) | (F32, F16) => F32,
        (F64, _) | (_, F64) => F64,
        // Integers mixed with any float need the full f64 mantissa.
        (I32 | I64, _) | (_, I32 | I64) => F64,
        _ => F64,
    }
}

impl Add for Scalar {
    type Output = Scalar;

    fn add(self, rhs: Scalar) -> Scalar {
        let dtype = promote(self.dtype(), rhs.dtype());
        match (self, rhs) {
            (Scalar::I32(a), Scalar::I32(b)) => Scalar::I32(a.wrapping_add(b)),
            (Scalar::I64(a), Scalar::I64(b)) => Scalar::I64(a.wrapping_add(b)),
            (a, b) if dtype == DType::I64 => Scalar::I64(a.to_f64() as i64 + b.to_f64() as i64),
            (a, b) => Scalar::from_f64(dtype, a.to_f64() + b.to_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_join_same_type() {
        for dtype in DType::ALL {
            assert_eq!(dtype.join(dtype), dtype);
        }
    }

    #[test]
    fn test_join_floats() {
        assert_eq!(DType::F16.join(DType::F32), DType::F32);
        assert_eq!(DType::F32.join(DType::F64), DType::F64);
        assert_eq!(DType::F64.join(DType::F16), DType::F64);
    }

    #[test]
    fn test_join_mixed() {
        assert_eq!(DType::I32.join(DType::I64), DType::I64);
        assert_eq!(DType::I32.join(DType::F32), DType::F64);
        assert_eq!(DType::I64.join(DType::F16), DType::F64);
    }

    #[test]
    fn test_upcast_list() {
        assert_eq!(DType::upcast([DType::F32, DType::F16, DType::F32]), Some(DType::F32));
        assert_eq!(DType::upcast([DType::I32]), Some(DType::I32));
        assert_eq!(DType::upcast(Vec::new()), None);
    }

    #[test]
    fn test_scalar_add() {
        let sum = Scalar::I32(2) + Scalar::I64(3);
        assert_eq!(sum, Scalar::I64(5));
        let sum = Scalar::F32(1.5) + Scalar::I32(1);
        assert_eq!(sum, Scalar::F64(2.5));
    }
}
