use std::fmt;

/// A tensor shape, wrapping a vector of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// The zero-rank shape of a scalar.
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Row-major (C order) element strides for this shape.
    ///
    /// For a shape [d0, d1, d2], the strides are [d1*d2, d2, 1].
    pub fn strides(&self) -> Vec<isize> {
        let mut strides = vec![0isize; self.dims.len()];
        let mut acc = 1isize;
        for i in (0..self.dims.len()).rev() {
            strides[i] = acc;
            acc *= self.dims[i].max(1) as isize;
        }
        strides
    }

    /// Column-major (Fortran order) element strides for this shape.
    ///
    /// For a shape [d0, d1, d2], the strides are [1, d0, d0*d1].
    pub fn fortran_strides(&self) -> Vec<isize> {
        let mut strides = vec![0isize; self.dims.len()];
        let mut acc = 1isize;
        for (i, dim) in self.dims.iter().enumerate() {
            strides[i] = acc;
            acc *= (*dim).max(1) as isize;
        }
        strides
    }

    /// Checks whether `strides` describe a row-major layout of this shape.
    ///
    /// Axes of size one never constrain contiguity, and an empty shape is
    /// trivially contiguous.
    pub fn is_contiguous(&self, strides: &[isize]) -> bool {
        self.matches_layout(strides, (0..self.dims.len()).rev())
    }

    /// Checks whether `strides` describe a column-major layout of this shape.
    pub fn is_fortran_contiguous(&self, strides: &[isize]) -> bool {
        self.matches_layout(strides, 0..self.dims.len())
    }

    fn matches_layout<I: Iterator<Item = usize>>(&self, strides: &[isize], order: I) -> bool {
        if strides.len() != self.dims.len() {
            return false;
        }
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1isize;
        for axis in order {
            let dim = self.dims[axis];
            if dim == 1 {
                continue;
            }
            if strides[axis] != expected {
                return false;
            }
            expected *= dim as isize;
        }
        true
    }

    /// The shape with its axes in reverse order.
    pub fn reversed(&self) -> Shape {
        Shape::new(self.dims.iter().rev().copied().collect())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.dim(1), 3);
        assert_eq!(s.dim(2), 4);
    }

    #[test]
    fn test_strides() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.fortran_strides(), vec![1, 2, 6]);
    }

    #[test]
    fn test_is_contiguous() {
        let s = Shape::new(vec![2, 3, 4]);
        assert!(s.is_contiguous(&[12, 4, 1]));
        assert!(!s.is_contiguous(&[12, 1, 4]));
        assert!(s.is_fortran_contiguous(&[1, 2, 6]));
        assert!(!s.is_fortran_contiguous(&[12, 4, 1]));
    }

    #[test]
    fn test_unit_axes_are_both_layouts() {
        let s = Shape::new(vec![1, 5]);
        assert!(s.is_contiguous(&[5, 1]));
        assert!(s.is_fortran_contiguous(&[5, 1]));
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1); // product of empty = 1
        assert!(s.strides().is_empty());
        assert!(s.is_contiguous(&[]));
        assert!(s.is_fortran_contiguous(&[]));
    }

    #[test]
    fn test_reversed() {
        let s = Shape::new(vec![10, 3, 5]);
        assert_eq!(s.reversed().dims(), &[5, 3, 10]);
    }
}
