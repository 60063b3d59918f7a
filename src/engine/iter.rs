//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Broadcasting iterator over device arrays.
//!
//! The iterator never touches element data itself. It produces data pointers,
//! inner strides and an inner count for each step, which are then handed to a
//! device kernel.

use std::sync::Arc;

use arrayvec::ArrayVec;
use smallvec::{SmallVec, smallvec};

use crate::MAXARGS;
use crate::array::DeviceArray;
use crate::array::dim_merger::{DimMerger, MergedDim, MergedDims};
use crate::array::dtype::DType;
use crate::array::layout::{Order, ShapeVec, SizeAndStride};
use crate::device::Device;
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::{cold_path, fmt_shape};

use super::assign;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OpFlags(u8);

impl OpFlags {
	pub const READ: Self = Self(1);
	pub const WRITE: Self = Self(2);
	/// Allocate the array if the operand has none.
	pub const ALLOCATE: Self = Self(4);
	pub const NO_BROADCAST: Self = Self(8);
	/// The operand may skip iteration axes (its `op_axes` entry is `None`).
	pub const REDUCE_OK: Self = Self(16);

	pub const INPUT: Self = Self::READ;
	pub const OUTPUT: Self = Self(Self::WRITE.0 | Self::ALLOCATE.0 | Self::NO_BROADCAST.0);

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub const fn union(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}
}

/// For each iteration axis, the operand axis it maps to, or `None` if the
/// operand is not indexed by that axis.
pub type OpAxes = SmallVec<[Option<usize>; 8]>;

pub struct IterOperand {
	pub array: Option<DeviceArray>,
	/// Dtype the inner loop expects. A different array dtype gets buffered.
	pub dtype: DType,
	pub flags: OpFlags,
	pub op_axes: Option<OpAxes>,
	/// Trailing core dimensions, excluded from iteration.
	pub core_shape: SmallVec<[usize; 4]>,
}

impl IterOperand {
	pub fn new(array: Option<DeviceArray>, dtype: DType, flags: OpFlags) -> Self {
		Self {
			array,
			dtype,
			flags,
			op_axes: None,
			core_shape: SmallVec::new(),
		}
	}

	pub fn with_op_axes(mut self, op_axes: OpAxes) -> Self {
		self.op_axes = Some(op_axes);
		self
	}

	pub fn with_core_shape(mut self, core_shape: &[usize]) -> Self {
		self.core_shape = SmallVec::from_slice(core_shape);
		self
	}

	fn is_output(&self) -> bool {
		self.flags.contains(OpFlags::WRITE)
	}

	/// Shape and strides without the core dimensions.
	fn loop_part(&self) -> (&[usize], &[isize]) {
		let Some(array) = &self.array else {
			return (&[], &[]);
		};
		let n = array.ndim().saturating_sub(self.core_shape.len());
		(&array.shape()[..n], &array.strides()[..n])
	}

	fn loop_ndim(&self) -> usize {
		match &self.op_axes {
			Some(axes) => axes.len(),
			None => self.loop_part().0.len(),
		}
	}

	fn is_skipped_axis(&self, axis: usize) -> bool {
		self.op_axes.as_ref().is_some_and(|axes| axes.get(axis).copied().flatten().is_none())
	}

	fn dim(&self, ndim: usize, axis: usize) -> SizeAndStride {
		let (shape, strides) = self.loop_part();
		let index = match &self.op_axes {
			Some(axes) => axes.get(axis).copied().flatten(),
			None => (axis + shape.len()).checked_sub(ndim),
		};
		match index.and_then(|i| Some((*shape.get(i)?, *strides.get(i)?))) {
			Some((size, stride)) => SizeAndStride { size, stride },
			None => SizeAndStride { size: 1, stride: 0 },
		}
	}
}

pub struct IterSpec {
	pub order: Order,
	/// Number of iteration axes. Defaults to the largest operand.
	pub ndim: Option<usize>,
	/// Where missing outputs and buffers are allocated.
	pub device: Arc<dyn Device>,
}

struct Writeback {
	op: usize,
	target: DeviceArray,
}

//--------------------------------------------------------------------------------------------------

pub struct BroadcastIter {
	arrays: ArrayVec<DeviceArray, MAXARGS>,
	core_ndims: ArrayVec<usize, MAXARGS>,
	writebacks: Vec<Writeback>,
	shape: ShapeVec,
	outer: MergedDims,
	inner: MergedDim,
	index: SmallVec<[usize; 8]>,
	ptrs: ArrayVec<*mut u8, MAXARGS>,
	size: usize,
}

impl BroadcastIter {
	pub fn new(mut ops: Vec<IterOperand>, spec: &IterSpec) -> UFuncResult<Self> {
		let nop = ops.len();
		if nop > MAXARGS {
			cold_path();
			return err(UFuncError::Internal, format!("too many operands ({nop}) for the iterator"));
		}
		let ndim = spec.ndim.unwrap_or_else(|| ops.iter().map(IterOperand::loop_ndim).max().unwrap_or(0));
		let shape = broadcast_shape(&ops, ndim)?;

		let f_order = prefers_f_order(&ops);
		allocate_outputs(&mut ops, &shape, spec, f_order)?;
		let writebacks = buffer_operands(&mut ops)?;

		let mut dims: SmallVec<[MergedDim; 8]> = SmallVec::with_capacity(ndim);
		for axis in 0..ndim {
			let per_op: ArrayVec<SizeAndStride, MAXARGS> =
				ops.iter().map(|op| op.dim(ndim, axis)).collect();
			dims.push(DimMerger::merge_single_dim(&per_op)?);
		}
		match spec.order {
			Order::C => {},
			Order::F => dims.reverse(),
			Order::A => {
				if f_order {
					dims.reverse();
				}
			},
			Order::K => sort_by_strides(&mut dims, nop),
		}

		let mut outer = DimMerger::coalesce(&dims, nop);
		let inner = outer.pop().unwrap_or_else(|| MergedDim {
			size: 1,
			strides: std::iter::repeat_n(0, nop).collect(),
		});
		let size = outer.iter().fold(inner.size, |size, dim| size * dim.size);

		let mut arrays = ArrayVec::new();
		let mut core_ndims = ArrayVec::new();
		for op in ops {
			let Some(array) = op.array else {
				cold_path();
				return err(UFuncError::Internal, "iterator operand without an array");
			};
			core_ndims.push(op.core_shape.len());
			arrays.push(array);
		}
		let ptrs = arrays.iter().map(|a| unsafe { a.data().as_ptr::<u8>() }).collect();

		log::trace!(
			"iterator: shape={} steps={} inner={}",
			fmt_shape(&shape),
			outer.iter().map(|d| d.size).product::<usize>(),
			inner.size
		);
		Ok(Self {
			arrays,
			core_ndims,
			writebacks,
			shape,
			index: smallvec![0; outer.len()],
			outer,
			inner,
			ptrs,
			size,
		})
	}

	/// Total number of elements visited.
	pub fn iter_size(&self) -> usize {
		self.size
	}

	/// Broadcast shape, in the order the axes were given.
	pub fn shape(&self) -> &[usize] {
		&self.shape
	}

	pub fn ptrs(&self) -> &[*mut u8] {
		&self.ptrs
	}

	pub fn inner_strides(&self) -> &[isize] {
		&self.inner.strides
	}

	pub fn inner_count(&self) -> usize {
		self.inner.size
	}

	/// Byte strides of the core dimensions of operand `op`.
	pub fn core_strides(&self, op: usize) -> &[isize] {
		match (self.arrays.get(op), self.core_ndims.get(op)) {
			(Some(array), Some(&n)) => &array.strides()[array.ndim().saturating_sub(n)..],
			_ => &[],
		}
	}

	pub fn array(&self, op: usize) -> Option<&DeviceArray> {
		self.arrays.get(op)
	}

	/// Moves to the next step. Returns `false` after the last one.
	pub fn advance(&mut self) -> bool {
		if self.size == 0 {
			return false;
		}
		let Self { outer, index, ptrs, .. } = self;
		for (dim, i) in outer.iter().zip(index.iter_mut()).rev() {
			*i += 1;
			if *i < dim.size {
				for (op, ptr) in ptrs.iter_mut().enumerate() {
					*ptr = ptr.wrapping_offset(dim.get(op).stride);
				}
				return true;
			}
			let back = (dim.size - 1) as isize;
			*i = 0;
			for (op, ptr) in ptrs.iter_mut().enumerate() {
				*ptr = ptr.wrapping_offset(-back * dim.get(op).stride);
			}
		}
		false
	}

	/// True if the current step is the first time the memory of `op` is seen,
	/// i.e. every outer axis along which `op` does not move is at index 0.
	pub fn is_first_visit(&self, op: usize) -> bool {
		self.outer.iter().zip(self.index.iter()).all(|(dim, &i)| i == 0 || dim.get(op).stride != 0)
	}

	/// Calls `f` once per step. Does nothing when the iteration is empty.
	pub fn run(&mut self, mut f: impl FnMut(&Self) -> UFuncResult<()>) -> UFuncResult<()> {
		if self.size == 0 {
			return Ok(());
		}
		loop {
			f(self)?;
			if !self.advance() {
				return Ok(());
			}
		}
	}

	/// Copies buffered outputs back and returns the operand arrays.
	pub fn finish(mut self) -> UFuncResult<ArrayVec<DeviceArray, MAXARGS>> {
		for wb in self.writebacks.drain(..) {
			let Some(slot) = self.arrays.get_mut(wb.op) else {
				cold_path();
				return err(UFuncError::Internal, "writeback operand out of range");
			};
			assign::assign(&wb.target, slot)?;
			*slot = wb.target;
		}
		Ok(self.arrays)
	}
}

//--------------------------------------------------------------------------------------------------

fn broadcast_shape(ops: &[IterOperand], ndim: usize) -> UFuncResult<ShapeVec> {
	let mut shape: ShapeVec = smallvec![1; ndim];
	for op in ops.iter().filter(|op| !op.is_output() && op.array.is_some()) {
		for (axis, size) in shape.iter_mut().enumerate() {
			let dim = op.dim(ndim, axis);
			if dim.size != 1 && dim.size != *size {
				if *size != 1 {
					cold_path();
					return broadcast_error(ops);
				}
				*size = dim.size;
			}
		}
	}

	// Outputs may extend axes the inputs leave at 1, but they never broadcast themselves.
	let outputs = || ops.iter().filter(|op| op.is_output() && op.array.is_some());
	for op in outputs() {
		for (axis, size) in shape.iter_mut().enumerate() {
			if *size == 1 && !op.is_skipped_axis(axis) {
				*size = op.dim(ndim, axis).size;
			}
		}
	}
	for op in outputs() {
		// Without axis maps an output must have every loop axis itself.
		if op.loop_ndim() > ndim || (op.op_axes.is_none() && op.loop_ndim() != ndim) {
			cold_path();
			return output_error(op, &shape);
		}
		for (axis, &size) in shape.iter().enumerate() {
			if op.is_skipped_axis(axis) {
				if !op.flags.contains(OpFlags::REDUCE_OK) {
					cold_path();
					return err(UFuncError::Internal, "output operand skips an axis");
				}
				continue;
			}
			if op.dim(ndim, axis).size != size {
				cold_path();
				return output_error(op, &shape);
			}
		}
	}
	Ok(shape)
}

#[cold]
fn broadcast_error<T>(ops: &[IterOperand]) -> UFuncResult<T> {
	let shapes: Vec<String> = ops
		.iter()
		.filter(|op| !op.is_output())
		.filter_map(|op| op.array.as_ref().map(|a| fmt_shape(a.shape())))
		.collect();
	err(
		UFuncError::Broadcast,
		format!("operands could not be broadcast together with shapes {}", shapes.join(" ")),
	)
}

#[cold]
fn output_error<T>(op: &IterOperand, shape: &[usize]) -> UFuncResult<T> {
	err(
		UFuncError::ShapeMismatch,
		format!(
			"non-broadcastable output operand with shape {} doesn't match the broadcast shape {}",
			fmt_shape(op.loop_part().0),
			fmt_shape(shape)
		),
	)
}

/// True if every multi-dimensional input is Fortran-contiguous and not C-contiguous.
fn prefers_f_order(ops: &[IterOperand]) -> bool {
	let mut inputs = ops
		.iter()
		.filter(|op| !op.is_output())
		.filter_map(|op| op.array.as_ref())
		.filter(|a| a.ndim() > 1)
		.peekable();
	inputs.peek().is_some() && inputs.all(|a| a.is_f_contiguous() && !a.is_c_contiguous())
}

fn allocate_outputs(
	ops: &mut [IterOperand],
	shape: &[usize],
	spec: &IterSpec,
	f_order: bool,
) -> UFuncResult<()> {
	let order = match spec.order {
		Order::C | Order::F => spec.order,
		Order::A | Order::K => {
			if f_order {
				Order::F
			} else {
				Order::C
			}
		},
	};
	for op in ops.iter_mut().filter(|op| op.array.is_none()) {
		if !op.flags.contains(OpFlags::ALLOCATE) || op.op_axes.is_some() {
			cold_path();
			return err(UFuncError::Internal, "operand has no array and cannot be allocated");
		}
		let full: ShapeVec = shape.iter().chain(op.core_shape.iter()).copied().collect();
		op.array = Some(DeviceArray::new_empty_on(&full, op.dtype, spec.device.clone(), order)?);
	}
	Ok(())
}

/// Replaces operands whose dtype differs from the loop dtype by buffers.
/// Inputs are cast into the buffer now, outputs are cast back in `finish()`.
fn buffer_operands(ops: &mut [IterOperand]) -> UFuncResult<Vec<Writeback>> {
	let mut writebacks = Vec::new();
	for (i, op) in ops.iter_mut().enumerate() {
		let Some(array) = &op.array else {
			continue;
		};
		if array.dtype() == op.dtype {
			continue;
		}
		log::debug!("iterator: buffering operand {i} from {} to {}", array.dtype(), op.dtype);
		let buffer = array.new_like(Some(op.dtype), Order::K)?;
		match (op.flags.contains(OpFlags::READ), op.flags.contains(OpFlags::WRITE)) {
			(true, false) => {
				assign::assign(&buffer, array)?;
				op.array = Some(buffer);
			},
			(false, true) => {
				// The loop may leave elements untouched (masked calls), so they start
				// out with the current contents.
				assign::assign(&buffer, array)?;
				let target = std::mem::replace(&mut op.array, Some(buffer));
				if let Some(target) = target {
					writebacks.push(Writeback { op: i, target });
				}
			},
			_ => {
				cold_path();
				return err(UFuncError::Internal, "cannot buffer a read-write operand");
			},
		}
	}
	Ok(writebacks)
}

/// Insertion sort of the axes so that operands walk memory in increasing
/// address order, innermost axis last. The first operand with distinct
/// non-zero strides on both axes decides.
fn sort_by_strides(dims: &mut [MergedDim], nop: usize) {
	let is_inner = |a: &MergedDim, b: &MergedDim| {
		for op in 0..nop {
			let (sa, sb) = (a.get(op).stride.unsigned_abs(), b.get(op).stride.unsigned_abs());
			if sa != 0 && sb != 0 && sa != sb {
				return sa < sb;
			}
		}
		false
	};
	for i in 1..dims.len() {
		let mut j = i;
		while j > 0 && is_inner(&dims[j - 1], &dims[j]) {
			dims.swap(j - 1, j);
			j -= 1;
		}
	}
}

//--------------------------------------------------------------------------------------------------
