use std::cell::RefCell;
use std::rc::Rc;

use crate::dtype::{DType, Scalar};
use crate::error::{Result, TensorError};
use crate::index::{self, SliceArg};
use crate::shape::Shape;
use crate::storage::CpuStorage;

/// A strided n-d array over shared CPU storage.
///
/// Cloning a `Tensor` clones the handle, not the data: both handles address
/// the same elements. Views (`transpose`, `slice`) share storage with their
/// source, so writes through one are visible through the other.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Rc<RefCell<CpuStorage>>,
    shape: Shape,
    strides: Vec<isize>,
    offset: usize,
}

impl Tensor {
    /// Wrap storage as a row-major tensor of `shape`.
    ///
    /// # Errors
    /// Returns an error if the storage length differs from `shape.numel()`.
    pub fn from_storage(storage: CpuStorage, shape: Shape) -> Result<Self> {
        if storage.len() != shape.numel() {
            return Err(TensorError::LengthMismatch {
                len: storage.len(),
                shape: shape.dims().to_vec(),
            });
        }
        let strides = shape.strides();
        Ok(Tensor {
            storage: Rc::new(RefCell::new(storage)),
            shape,
            strides,
            offset: 0,
        })
    }

    /// Create an f64 tensor from row-major data.
    pub fn from_f64(data: Vec<f64>, shape: impl Into<Shape>) -> Result<Self> {
        Tensor::from_storage(CpuStorage::F64(data), shape.into())
    }

    /// Create a tensor of `dtype` from row-major f64 data, casting each value.
    pub fn from_vec(dtype: DType, data: Vec<f64>, shape: impl Into<Shape>) -> Result<Self> {
        Tensor::from_storage(CpuStorage::from_f64_vec(dtype, data), shape.into())
    }

    /// A zero-rank f64 tensor holding `value`.
    pub fn scalar(value: f64) -> Self {
        Tensor {
            storage: Rc::new(RefCell::new(CpuStorage::F64(vec![value]))),
            shape: Shape::scalar(),
            strides: Vec::new(),
            offset: 0,
        }
    }

    /// Create a zero-filled row-major tensor.
    pub fn zeros(dtype: DType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let strides = shape.strides();
        Tensor {
            storage: Rc::new(RefCell::new(CpuStorage::zeros(dtype, shape.numel()))),
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a row-major tensor with every element set to `value`.
    pub fn full(dtype: DType, shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.numel()];
        let strides = shape.strides();
        Tensor {
            storage: Rc::new(RefCell::new(CpuStorage::from_f64_vec(dtype, data))),
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a tensor filled with ones.
    pub fn ones(dtype: DType, shape: impl Into<Shape>) -> Self {
        Tensor::full(dtype, shape, 1.0)
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Element strides, one per axis.
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Element offset of the first logical element within the storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.storage.borrow().dtype()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// True when the elements are laid out in row-major order.
    pub fn is_contiguous(&self) -> bool {
        self.shape.is_contiguous(&self.strides)
    }

    /// True when the elements are laid out in column-major order.
    pub fn is_fortran_contiguous(&self) -> bool {
        self.shape.is_fortran_contiguous(&self.strides)
    }

    /// True if both handles address the same storage buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    /// Identity of the underlying storage buffer.
    pub fn storage_id(&self) -> usize {
        Rc::as_ptr(&self.storage) as *const u8 as usize
    }

    /// True if both handles address the same elements with the same layout.
    pub fn same_binding(&self, other: &Tensor) -> bool {
        self.shares_storage(other)
            && self.shape == other.shape
            && self.strides == other.strides
            && self.offset == other.offset
    }

    /// Pointer to the first logical element, for native kernels.
    ///
    /// The pointer stays valid while any handle to the storage is alive,
    /// since storage never reallocates.
    pub fn data_ptr(&self) -> *mut u8 {
        let elsize = self.dtype().size_in_bytes();
        let base = self.storage.borrow_mut().as_mut_ptr();
        base.wrapping_add(self.offset * elsize)
    }

    /// Storage positions of every element, in row-major logical order.
    pub fn storage_offsets(&self) -> Vec<usize> {
        let n = self.numel();
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return out;
        }
        let dims = self.shape.dims();
        let mut index = vec![0usize; dims.len()];
        let mut pos = self.offset as isize;
        for _ in 0..n {
            out.push(pos as usize);
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                pos += self.strides[axis];
                if index[axis] < dims[axis] {
                    break;
                }
                pos -= self.strides[axis] * dims[axis] as isize;
                index[axis] = 0;
            }
        }
        out
    }

    fn position(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.ndim() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: index.to_vec(),
            });
        }
        let mut pos = self.offset as isize;
        for (axis, (&i, &size)) in index.iter().zip(self.shape.dims()).enumerate() {
            if i >= size {
                return Err(TensorError::IndexOutOfBounds {
                    index: i as isize,
                    axis,
                    size,
                });
            }
            pos += i as isize * self.strides[axis];
        }
        Ok(pos as usize)
    }

    /// Read one element.
    pub fn get(&self, index: &[usize]) -> Result<f64> {
        let pos = self.position(index)?;
        Ok(self.storage.borrow().get(pos).to_f64())
    }

    /// Write one element through this handle; every view of the same
    /// storage observes the change.
    pub fn set(&self, index: &[usize], value: f64) -> Result<()> {
        let pos = self.position(index)?;
        self.storage.borrow_mut().set(pos, Scalar::F64(value));
        Ok(())
    }

    /// All elements as typed scalars, in row-major logical order.
    pub fn to_scalars(&self) -> Vec<Scalar> {
        let storage = self.storage.borrow();
        self.storage_offsets()
            .into_iter()
            .map(|pos| storage.get(pos))
            .collect()
    }

    /// All elements cast to f64, in row-major logical order.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        self.to_scalars().iter().map(Scalar::to_f64).collect()
    }

    /// Overwrite every element, in row-major logical order.
    pub fn write_f64(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.numel() {
            return Err(TensorError::LengthMismatch {
                len: values.len(),
                shape: self.shape.dims().to_vec(),
            });
        }
        let offsets = self.storage_offsets();
        let mut storage = self.storage.borrow_mut();
        for (pos, value) in offsets.into_iter().zip(values) {
            storage.set(pos, Scalar::F64(*value));
        }
        Ok(())
    }

    /// Copy the values of `src` into this tensor's elements.
    ///
    /// Values are read completely before any write, so `src` may alias
    /// `self`.
    pub fn assign(&self, src: &Tensor) -> Result<()> {
        if src.shape != self.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: src.shape.dims().to_vec(),
            });
        }
        let values = src.to_scalars();
        let offsets = self.storage_offsets();
        let mut storage = self.storage.borrow_mut();
        for (pos, value) in offsets.into_iter().zip(values) {
            storage.set(pos, value);
        }
        Ok(())
    }

    /// A view with the axes in reverse order. For 2-D this is the matrix
    /// transpose.
    pub fn transpose(&self) -> Tensor {
        Tensor {
            storage: Rc::clone(&self.storage),
            shape: self.shape.reversed(),
            strides: self.strides.iter().rev().copied().collect(),
            offset: self.offset,
        }
    }

    /// A view selecting `args` along the leading axes.
    pub fn slice(&self, args: &[SliceArg]) -> Result<Tensor> {
        let view = index::resolve(self.shape.dims(), &self.strides, args)?;
        Ok(Tensor {
            storage: Rc::clone(&self.storage),
            shape: Shape::new(view.dims),
            strides: view.strides,
            offset: (self.offset as isize + view.offset) as usize,
        })
    }

    /// A fresh row-major copy with the same dtype.
    pub fn to_contiguous(&self) -> Tensor {
        let out = Tensor::zeros(self.dtype(), self.shape.clone());
        // Fresh storage never aliases `self`.
        let _ = out.assign(self);
        out
    }

    /// A fresh column-major copy with the same dtype.
    pub fn to_fortran(&self) -> Tensor {
        let shape = self.shape.clone();
        let out = Tensor {
            storage: Rc::new(RefCell::new(CpuStorage::zeros(self.dtype(), shape.numel()))),
            strides: shape.fortran_strides(),
            shape,
            offset: 0,
        };
        let _ = out.assign(self);
        out
    }

    /// Reference matrix product of two 2-D tensors of any layout.
    ///
    /// self is [m, k], other is [k, n], the result is a row-major [m, n]
    /// tensor of the joined dtype.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.ndim() != 2 || other.ndim() != 2 {
            return Err(TensorError::Other(
                "matmul requires 2D tensors".to_string(),
            ));
        }

        let m = self.shape.dim(0);
        let k = self.shape.dim(1);
        let k2 = other.shape.dim(0);
        let n = other.shape.dim(1);

        if k != k2 {
            return Err(TensorError::MatmulMismatch { m, k, k2, n });
        }

        let a = self.to_vec_f64();
        let b = other.to_vec_f64();
        let mut c = vec![0.0f64; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f64;
                for p in 0..k {
                    sum += a[i * k + p] * b[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        Tensor::from_vec(self.dtype().join(other.dtype()), c, vec![m, n])
    }
}
