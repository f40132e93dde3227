use crate::error::{Result, TensorError};
use crate::shape::Shape;

/// One component of a basic indexing expression, applied to one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceArg {
    /// Select a single position and drop the axis. Negative values count
    /// from the end.
    Index(isize),
    /// Keep the axis, restricted to `start..stop` with a positive `step`.
    /// Missing bounds default to the full axis; negative bounds count from
    /// the end and out-of-range bounds are clamped.
    Range {
        start: Option<isize>,
        stop: Option<isize>,
        step: Option<isize>,
    },
}

impl SliceArg {
    /// The whole axis (`:`).
    pub fn full() -> Self {
        SliceArg::Range {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// `start:stop`.
    pub fn range(start: isize, stop: isize) -> Self {
        SliceArg::Range {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// `start:stop:step`.
    pub fn stepped(start: isize, stop: isize, step: isize) -> Self {
        SliceArg::Range {
            start: Some(start),
            stop: Some(stop),
            step: Some(step),
        }
    }
}

/// A resolved view: new dims, new strides and the element offset to add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedView {
    pub dims: Vec<usize>,
    pub strides: Vec<isize>,
    pub offset: isize,
}

/// Apply `args` to a layout. Axes not covered by `args` are kept whole.
pub(crate) fn resolve(dims: &[usize], strides: &[isize], args: &[SliceArg]) -> Result<ResolvedView> {
    if dims.is_empty() {
        return Err(TensorError::InvalidSlice(
            "0-d arrays can't be indexed.".to_string(),
        ));
    }
    if args.len() > dims.len() {
        return Err(TensorError::InvalidSlice(format!(
            "too many indices: {} for an array of rank {}",
            args.len(),
            dims.len()
        )));
    }

    let mut out = ResolvedView {
        dims: Vec::with_capacity(dims.len()),
        strides: Vec::with_capacity(dims.len()),
        offset: 0,
    };
    for (axis, (&size, &stride)) in dims.iter().zip(strides).enumerate() {
        match args.get(axis) {
            Some(SliceArg::Index(index)) => {
                let resolved = if *index < 0 {
                    *index + size as isize
                } else {
                    *index
                };
                if resolved < 0 || resolved >= size as isize {
                    return Err(TensorError::IndexOutOfBounds {
                        index: *index,
                        axis,
                        size,
                    });
                }
                out.offset += resolved * stride;
            }
            Some(SliceArg::Range { start, stop, step }) => {
                let step = step.unwrap_or(1);
                if step <= 0 {
                    return Err(TensorError::InvalidSlice(format!(
                        "slice step must be positive, got {step}"
                    )));
                }
                let clamp = |bound: isize| -> isize {
                    let bound = if bound < 0 { bound + size as isize } else { bound };
                    bound.clamp(0, size as isize)
                };
                let start = start.map(clamp).unwrap_or(0);
                let stop = stop.map(clamp).unwrap_or(size as isize);
                let len = if stop > start {
                    ((stop - start) + step - 1) / step
                } else {
                    0
                };
                out.dims.push(len as usize);
                out.strides.push(stride * step);
                if len > 0 {
                    out.offset += start * stride;
                }
            }
            None => {
                out.dims.push(size);
                out.strides.push(stride);
            }
        }
    }
    Ok(out)
}

/// Shape of the view `args` would select from an array of `shape`.
pub fn slice_shape(shape: &Shape, args: &[SliceArg]) -> Result<Shape> {
    let view = resolve(shape.dims(), &shape.strides(), args)?;
    Ok(Shape::new(view.dims))
}
