//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

pub const INLINE_DIMS: usize = 6;

pub type ShapeVec = SmallVec<[usize; INLINE_DIMS]>;
pub type StrideVec = SmallVec<[isize; INLINE_DIMS]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ElementsOverflowError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnknownOrderError;

/// Memory / iteration order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Order {
	C,
	F,
	A,
	#[default]
	K,
}

impl std::str::FromStr for Order {
	type Err = UnknownOrderError;

	fn from_str(s: &str) -> Result<Self, UnknownOrderError> {
		match s {
			"C" | "c" => Ok(Self::C),
			"F" | "f" => Ok(Self::F),
			"A" | "a" => Ok(Self::A),
			"K" | "k" => Ok(Self::K),
			_ => {
				cold_path();
				Err(UnknownOrderError)
			},
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct SizeAndStride {
	pub size: usize,
	pub stride: isize,
}

pub struct StrideCounter {
	pub elems: usize,
	pub nonzero_elems: usize,
}

impl StrideCounter {
	/// `elems()` will be the product of all prepended dimensions multiplied by `stride`.
	pub fn with_stride(stride: usize) -> Self {
		Self { elems: stride, nonzero_elems: stride.max(1) }
	}

	pub fn prepend_dim(&mut self, size: usize) -> Result<SizeAndStride, ElementsOverflowError> {
		// Check that if we ignore zero length dimensions, the byte count does not overflow.
		// This keeps the calculation valid for any permutation of the same dimensions.
		if size != 0 {
			let Some(e) = self.nonzero_elems.checked_mul(size) else {
				cold_path();
				return Err(ElementsOverflowError);
			};
			if e > isize::MAX as usize {
				cold_path();
				return Err(ElementsOverflowError);
			}
			self.nonzero_elems = e;
		}

		let stride = self.elems as isize;
		self.elems *= size;

		Ok(SizeAndStride { size, stride })
	}

	pub fn elems(&self) -> usize {
		self.elems
	}
}

/// Byte strides of a freshly allocated array. `order` must be `C` or `F`;
/// anything else is treated as `C`.
pub fn contiguous_strides(
	shape: &[usize],
	itemsize: usize,
	order: Order,
) -> Result<(StrideVec, usize), ElementsOverflowError> {
	let mut strides: StrideVec = SmallVec::from_elem(0, shape.len());
	let mut counter = StrideCounter::with_stride(itemsize);
	if order == Order::F {
		for (stride, &size) in strides.iter_mut().zip(shape.iter()) {
			*stride = counter.prepend_dim(size)?.stride;
		}
	} else {
		for (stride, &size) in strides.iter_mut().zip(shape.iter()).rev() {
			*stride = counter.prepend_dim(size)?.stride;
		}
	}
	Ok((strides, counter.elems()))
}

pub fn size_of_shape(shape: &[usize]) -> usize {
	shape.iter().product()
}

pub fn is_c_contiguous(shape: &[usize], strides: &[isize], itemsize: usize) -> bool {
	if shape.contains(&0) {
		return true;
	}
	let mut expected = itemsize as isize;
	for (&size, &stride) in shape.iter().zip(strides.iter()).rev() {
		if size != 1 {
			if stride != expected {
				return false;
			}
			expected *= size as isize;
		}
	}
	true
}

pub fn is_f_contiguous(shape: &[usize], strides: &[isize], itemsize: usize) -> bool {
	if shape.contains(&0) {
		return true;
	}
	let mut expected = itemsize as isize;
	for (&size, &stride) in shape.iter().zip(strides.iter()) {
		if size != 1 {
			if stride != expected {
				return false;
			}
			expected *= size as isize;
		}
	}
	true
}

//--------------------------------------------------------------------------------------------------

/// Traversal order in which a single stride walks the whole array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrivialOrder {
	/// At most one dimension is longer than 1, so the order doesn't matter.
	Any,
	C,
	F,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrivialLayout {
	pub order: TrivialOrder,
	pub stride: isize,
	pub count: usize,
}

/// If all elements of the array can be visited with one pointer and one fixed
/// byte stride, returns that stride and the traversal order it implies.
pub fn trivial_layout(shape: &[usize], strides: &[isize], itemsize: usize) -> Option<TrivialLayout> {
	let count = size_of_shape(shape);
	if count <= 1 {
		return Some(TrivialLayout { order: TrivialOrder::Any, stride: 0, count });
	}
	let mut long_dims = shape.iter().zip(strides.iter()).filter(|(size, _)| **size > 1);
	if let Some((_, &stride)) = long_dims.next()
		&& long_dims.next().is_none()
	{
		return Some(TrivialLayout { order: TrivialOrder::Any, stride, count });
	}
	let stride = itemsize as isize;
	if is_c_contiguous(shape, strides, itemsize) {
		Some(TrivialLayout { order: TrivialOrder::C, stride, count })
	} else if is_f_contiguous(shape, strides, itemsize) {
		Some(TrivialLayout { order: TrivialOrder::F, stride, count })
	} else {
		None
	}
}

/// Byte range `[low, high)` touched by the array, relative to its data pointer.
/// Returns `None` for empty arrays.
pub fn byte_extent(shape: &[usize], strides: &[isize], itemsize: usize) -> Option<(isize, isize)> {
	if shape.contains(&0) {
		return None;
	}
	let mut low = 0_isize;
	let mut high = itemsize as isize;
	for (&size, &stride) in shape.iter().zip(strides.iter()) {
		let span = (size as isize - 1) * stride;
		if span < 0 {
			low += span;
		} else {
			high += span;
		}
	}
	Some((low, high))
}

//--------------------------------------------------------------------------------------------------
