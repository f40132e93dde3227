use half::f16;

use crate::dtype::{DType, Scalar};
use crate::error::{Result, TensorError};

/// CPU-side flat element storage.
///
/// Storage never changes length after creation, so raw pointers handed to
/// native kernels stay valid for as long as the storage is alive.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl CpuStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F16 => CpuStorage::F16(vec![f16::ZERO; n]),
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F64 => CpuStorage::F64(vec![0.0; n]),
            DType::I32 => CpuStorage::I32(vec![0; n]),
            DType::I64 => CpuStorage::I64(vec![0; n]),
        }
    }

    /// Create storage of `dtype` from f64 values, casting each element.
    pub fn from_f64_vec(dtype: DType, data: Vec<f64>) -> Self {
        match dtype {
            DType::F64 => CpuStorage::F64(data),
            DType::F32 => CpuStorage::F32(data.into_iter().map(|v| v as f32).collect()),
            DType::F16 => CpuStorage::F16(data.into_iter().map(f16::from_f64).collect()),
            DType::I32 => CpuStorage::I32(data.into_iter().map(|v| v as i32).collect()),
            DType::I64 => CpuStorage::I64(data.into_iter().map(|v| v as i64).collect()),
        }
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    /// Read element `i` as a typed scalar.
    ///
    /// # Panics
    /// Panics if `i >= len()`.
    pub fn get(&self, i: usize) -> Scalar {
        match self {
            CpuStorage::F16(v) => Scalar::F16(v[i]),
            CpuStorage::F32(v) => Scalar::F32(v[i]),
            CpuStorage::F64(v) => Scalar::F64(v[i]),
            CpuStorage::I32(v) => Scalar::I32(v[i]),
            CpuStorage::I64(v) => Scalar::I64(v[i]),
        }
    }

    /// Write element `i`, casting `value` to the storage dtype.
    ///
    /// # Panics
    /// Panics if `i >= len()`.
    pub fn set(&mut self, i: usize, value: Scalar) {
        let value = value.to_f64();
        match self {
            CpuStorage::F16(v) => v[i] = f16::from_f64(value),
            CpuStorage::F32(v) => v[i] = value as f32,
            CpuStorage::F64(v) => v[i] = value,
            CpuStorage::I32(v) => v[i] = value as i32,
            CpuStorage::I64(v) => v[i] = value as i64,
        }
    }

    /// Returns the data as an f64 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F64.
    pub fn as_f64_slice(&self) -> Result<&[f64]> {
        match self {
            CpuStorage::F64(v) => Ok(v.as_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F64.to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Base pointer of the element buffer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            CpuStorage::F16(v) => v.as_mut_ptr() as *mut u8,
            CpuStorage::F32(v) => v.as_mut_ptr() as *mut u8,
            CpuStorage::F64(v) => v.as_mut_ptr() as *mut u8,
            CpuStorage::I32(v) => v.as_mut_ptr() as *mut u8,
            CpuStorage::I64(v) => v.as_mut_ptr() as *mut u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_from_f64_vec() {
        let s = CpuStorage::from_f64_vec(DType::F64, vec![1.0, 2.0, 3.0]);
        assert_eq!(s.len(), 3);
        assert!(!s.is_empty());
        assert_eq!(s.as_f64_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zeros() {
        for dtype in DType::ALL {
            let s = CpuStorage::zeros(dtype, 5);
            assert_eq!(s.len(), 5);
            assert_eq!(s.dtype(), dtype);
            assert_eq!(s.get(4).to_f64(), 0.0);
        }
    }

    #[test]
    fn test_set_casts() {
        let mut s = CpuStorage::zeros(DType::I32, 2);
        s.set(0, Scalar::F64(2.9));
        assert_eq!(s.get(0), Scalar::I32(2));
    }

    #[test]
    fn test_set_rounds_to_narrow_floats() {
        let mut half = CpuStorage::zeros(DType::F16, 1);
        half.set(0, Scalar::F64(0.1));
        assert_abs_diff_eq!(half.get(0).to_f64(), 0.1, epsilon = 1e-4);
        assert_ne!(half.get(0).to_f64(), 0.1);

        let mut single = CpuStorage::zeros(DType::F32, 1);
        single.set(0, Scalar::F64(std::f64::consts::PI));
        assert_relative_eq!(single.get(0).to_f64(), std::f64::consts::PI, max_relative = 1e-7);
    }

    #[test]
    fn test_as_f64_slice_wrong_dtype() {
        let s = CpuStorage::zeros(DType::F32, 2);
        assert!(s.as_f64_slice().is_err());
    }
}
