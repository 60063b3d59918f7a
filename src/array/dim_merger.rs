//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use arrayvec::ArrayVec;
use smallvec::SmallVec;

use crate::MAXARGS;
use crate::util::cold_path;

use super::layout::SizeAndStride;

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedDim {
	pub size: usize,
	pub strides: ArrayVec<isize, MAXARGS>,
}

impl MergedDim {
	pub fn get(&self, i: usize) -> SizeAndStride {
		SizeAndStride {
			size: self.size,
			stride: self.strides.get(i).copied().unwrap_or(0),
		}
	}
}

pub type MergedDims = SmallVec<[MergedDim; 8]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DimsDontMatchError {
	/// Index of the first operand whose size disagrees with the common size.
	pub operand: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DimMergerError {
	DimsDontMatch,
	TooManyDimensions,
}

impl From<DimsDontMatchError> for DimMergerError {
	fn from(_: DimsDontMatchError) -> Self {
		Self::DimsDontMatch
	}
}

pub struct DimMerger;

impl DimMerger {
	/// Finds common size and resets stride to 0 for broadcasted inputs
	///
	/// If there are no inputs, this function always returns size = 1.
	pub fn merge_single_dim(dim: &[SizeAndStride]) -> Result<MergedDim, DimsDontMatchError> {
		let size = dim.iter().fold(1, |size, inp| if size == 1 { inp.size } else { size });
		let mut strides = ArrayVec::new();
		for (operand, inp) in dim.iter().enumerate() {
			let stride = if inp.size == size {
				inp.stride
			} else {
				if inp.size != 1 {
					cold_path();
					return Err(DimsDontMatchError { operand });
				}
				0
			};
			if strides.try_push(stride).is_err() {
				cold_path();
				return Err(DimsDontMatchError { operand });
			}
		}
		Ok(MergedDim { size, strides })
	}

	/// Merges adjacent dimensions where every operand steps through memory
	/// uniformly. `dims` is ordered from outermost to innermost.
	///
	/// Dimensions of size 1 are dropped. If any dimension has size 0, the result
	/// is a single dimension of size 0.
	pub fn coalesce(dims: &[MergedDim], nop: usize) -> MergedDims {
		let mut result: MergedDims = SmallVec::new();
		for dim in dims.iter().rev() {
			if dim.size == 0 {
				cold_path();
				result.clear();
				let mut strides = ArrayVec::new();
				strides.extend(std::iter::repeat_n(0, nop));
				result.push(MergedDim { size: 0, strides });
				return result;
			}
			if dim.size == 1 {
				continue;
			}
			if let Some(prev) = result.last_mut()
				&& (0..nop).all(|i| dim.get(i).stride == prev.get(i).stride * prev.size as isize)
			{
				// Fast path: Extend the previous dimension
				prev.size *= dim.size;
			} else {
				result.push(dim.clone());
			}
		}
		result.reverse();
		result
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn dim(size: usize, strides: &[isize]) -> MergedDim {
		MergedDim {
			size,
			strides: strides.iter().copied().collect(),
		}
	}

	#[test]
	fn test_merge_single_dim() {
		let m = DimMerger::merge_single_dim(&[
			SizeAndStride { size: 1, stride: 8 },
			SizeAndStride { size: 5, stride: 4 },
		])
		.unwrap();
		assert_eq!(m.size, 5);
		assert_eq!(m.strides.as_slice(), &[0, 4]);

		let e = DimMerger::merge_single_dim(&[
			SizeAndStride { size: 3, stride: 8 },
			SizeAndStride { size: 5, stride: 4 },
		]);
		assert_eq!(e, Err(DimsDontMatchError { operand: 1 }));
	}

	#[test]
	fn test_coalesce() {
		// two C-contiguous operands, 2x3x4 f64 / f32
		let dims = [dim(2, &[96, 48]), dim(3, &[32, 16]), dim(4, &[8, 4])];
		let merged = DimMerger::coalesce(&dims, 2);
		assert_eq!(merged.len(), 1);
		assert_eq!(merged[0].size, 24);
		assert_eq!(merged[0].strides.as_slice(), &[8, 4]);

		// broadcast operand blocks merging of the outer dim
		let dims = [dim(2, &[0, 48]), dim(3, &[32, 16]), dim(1, &[0, 0]), dim(4, &[8, 4])];
		let merged = DimMerger::coalesce(&dims, 2);
		assert_eq!(merged.len(), 2);
		assert_eq!(merged[0].size, 2);
		assert_eq!(merged[1].size, 12);

		let dims = [dim(2, &[8, 8]), dim(0, &[8, 8])];
		let merged = DimMerger::coalesce(&dims, 2);
		assert_eq!(merged.len(), 1);
		assert_eq!(merged[0].size, 0);
	}
}
