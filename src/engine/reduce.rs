//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Reductions over axes with the binary inner loop of a ufunc.

use std::sync::Arc;

use bit_set::BitSet;
use smallvec::SmallVec;

use crate::array::DeviceArray;
use crate::array::dtype::{Casting, DType, DTypeKind};
use crate::array::layout::{Order, ShapeVec};
use crate::config::Config;
use crate::device::{Device, FpStatus};
use crate::error::{UFuncError, UFuncResult, err};
use crate::ufunc::UFunc;
use crate::ufunc::kernels::{self, CastPair};
use crate::util::{cold_path, fmt_shape};

use super::args::TypeOverride;
use super::dispatch::Executor;
use super::iter::{BroadcastIter, IterOperand, IterSpec, OpAxes, OpFlags};
use super::typeres::{self, ResolvedLoop};
use super::{Operands, assign};

//--------------------------------------------------------------------------------------------------

/// Axes to reduce over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Axis {
	/// The first axis.
	#[default]
	Default,
	/// All axes (`axis=None`).
	All,
	Single(isize),
	Many(Vec<isize>),
}

impl From<isize> for Axis {
	fn from(axis: isize) -> Self {
		Self::Single(axis)
	}
}

impl From<&[isize]> for Axis {
	fn from(axes: &[isize]) -> Self {
		Self::Many(axes.to_vec())
	}
}

#[derive(Debug, Clone, Default)]
pub struct ReduceArgs {
	pub axis: Axis,
	pub dtype: Option<DType>,
	pub out: Option<DeviceArray>,
	pub keepdims: bool,
	pub config: Option<Config>,
}

#[derive(Debug, Clone, Default)]
pub struct AccumulateArgs {
	pub axis: isize,
	pub dtype: Option<DType>,
	pub out: Option<DeviceArray>,
	pub config: Option<Config>,
}

//--------------------------------------------------------------------------------------------------

fn normalize_axis(axis: isize, ndim: usize) -> UFuncResult<usize> {
	let n = ndim as isize;
	if axis < -n || axis >= n {
		cold_path();
		return err(
			UFuncError::AxisOutOfBounds,
			format!("axis {axis} is out of bounds for array of dimension {ndim}"),
		);
	}
	Ok(if axis < 0 { (axis + n) as usize } else { axis as usize })
}

/// Set of reduced axes.
fn reduction_axes(axis: &Axis, ndim: usize) -> UFuncResult<BitSet> {
	let mut axes = BitSet::with_capacity(ndim);
	if ndim == 0 {
		// A 0-d array has nothing to reduce over; axis 0 is accepted as "no axis".
		let list: &[isize] = match axis {
			Axis::Default | Axis::All => &[],
			Axis::Single(a) => std::slice::from_ref(a),
			Axis::Many(list) => list,
		};
		if let Some(&a) = list.iter().find(|&&a| a != 0 && a != -1) {
			cold_path();
			return err(
				UFuncError::AxisOutOfBounds,
				format!("axis {a} is out of bounds for array of dimension 0"),
			);
		}
		return Ok(axes);
	}
	let list: SmallVec<[isize; 8]> = match axis {
		Axis::Default => SmallVec::from_elem(0, 1),
		Axis::All => (0..ndim as isize).collect(),
		Axis::Single(a) => SmallVec::from_elem(*a, 1),
		Axis::Many(list) => SmallVec::from_slice(list),
	};
	for a in list {
		if !axes.insert(normalize_axis(a, ndim)?) {
			cold_path();
			return err(UFuncError::DuplicateAxis, "duplicate value in 'axis'");
		}
	}
	Ok(axes)
}

fn ensure_binary(ufunc: &UFunc, method: &str) -> UFuncResult<()> {
	if ufunc.nin() != 2 || ufunc.nout() != 1 {
		cold_path();
		return err(UFuncError::InvalidValue, format!("{method} only supported for binary functions"));
	}
	if ufunc.core_signature().is_some() {
		cold_path();
		return err(
			UFuncError::NotSupported,
			format!("{method} is not supported for ufunc '{}' with a core signature", ufunc.name()),
		);
	}
	Ok(())
}

/// `add` and `multiply` over bools and narrow integers accumulate in 64 bits.
fn default_reduce_dtype(ufunc: &UFunc, dtype: DType) -> DType {
	if !matches!(ufunc.name(), "add" | "multiply") || dtype.itemsize() >= 8 {
		return dtype;
	}
	match dtype.kind() {
		DTypeKind::Bool | DTypeKind::Int => DType::I64,
		DTypeKind::Uint => DType::U64,
		_ => dtype,
	}
}

/// Resolves the loop `(otype, otype) -> ?`. The loop must take and return a
/// single dtype, since its output is fed back as its first input.
fn resolve_self_loop(ufunc: &UFunc, array: &DeviceArray, otype: DType) -> UFuncResult<ResolvedLoop> {
	let operands: Operands = [Some(array.clone()), Some(array.clone()), None].into_iter().collect();
	let pattern = TypeOverride::Full([Some(otype), Some(otype), None].into_iter().collect());
	let resolved = typeres::resolve_types(ufunc, Casting::Unsafe, &operands, Some(&pattern))?
		.into_result(ufunc.name())?;
	match resolved.dtypes.as_slice() {
		[a, b, c] if a.is_equiv(*b) && a.is_equiv(*c) => Ok(resolved),
		_ => {
			cold_path();
			err(
				UFuncError::NotSupported,
				format!("could not find a type resolution appropriate for reduce ufunc {}", ufunc.name()),
			)
		},
	}
}

/// Where the result is computed: the caller's `out` when it can be written
/// directly, otherwise a new array that is copied to `out` at the end.
fn result_array(
	out: Option<&DeviceArray>,
	array: &DeviceArray,
	shape: &[usize],
	dtype: DType,
	device: &Arc<dyn Device>,
	name: &str,
) -> UFuncResult<DeviceArray> {
	if let Some(out) = out {
		out.ensure_writeable()?;
		if out.shape() != shape {
			cold_path();
			return err(
				UFuncError::ShapeMismatch,
				format!(
					"output parameter for reduction operation {name} has the wrong shape (expected {}, got {})",
					fmt_shape(shape),
					fmt_shape(out.shape())
				),
			);
		}
		if out.dtype() == dtype && !out.overlaps(array) {
			return Ok(out.clone());
		}
	}
	DeviceArray::new_empty_on(shape, dtype, device.clone(), Order::C)
}

fn finish_result(out: Option<DeviceArray>, result: DeviceArray) -> UFuncResult<DeviceArray> {
	match out {
		Some(out) if !out.is_same_view(&result) => {
			assign::assign(&out, &result)?;
			Ok(out)
		},
		_ => Ok(result),
	}
}

//--------------------------------------------------------------------------------------------------

/// Reduces `array` along `args.axis` with the binary ufunc.
pub fn reduce(ufunc: &UFunc, array: &DeviceArray, args: ReduceArgs) -> UFuncResult<DeviceArray> {
	let name = ufunc.name();
	ensure_binary(ufunc, "reduce")?;
	if let Some(out) = &args.out {
		super::placement::resolve_device([Some(array), Some(out)])?;
	}
	let ndim = array.ndim();
	let axes = reduction_axes(&args.axis, ndim)?;

	let identity = ufunc.identity();
	if !identity.is_reorderable() && axes.len() > 1 {
		cold_path();
		return err(
			UFuncError::InvalidValue,
			format!("reduction operation '{name}' is not reorderable, so at most one axis may be specified"),
		);
	}
	let identity_value = match identity.value() {
		Some(_) if array.dtype().is_object() && array.size() > 0 => None,
		value => value,
	};

	let otype = args
		.dtype
		.or(args.out.as_ref().map(DeviceArray::dtype))
		.unwrap_or_else(|| default_reduce_dtype(ufunc, array.dtype()));
	let resolved = resolve_self_loop(ufunc, array, otype)?;
	let dtype = resolved.dtypes[0];

	let shape = array.shape();
	let kept: ShapeVec = (0..ndim)
		.filter_map(|axis| {
			if !axes.contains(axis) {
				Some(shape[axis])
			} else if args.keepdims {
				Some(1)
			} else {
				None
			}
		})
		.collect();
	let device = array.device().clone();
	let result = result_array(args.out.as_ref(), array, &kept, dtype, &device, name)?;

	// The iterator sees the result without the reduced axes.
	let mut op_axes = OpAxes::with_capacity(ndim);
	let mut view_shape = ShapeVec::new();
	let mut view_strides: SmallVec<[isize; 8]> = SmallVec::new();
	let mut result_axis = 0;
	for axis in 0..ndim {
		if axes.contains(axis) {
			op_axes.push(None);
			if args.keepdims {
				result_axis += 1;
			}
		} else {
			op_axes.push(Some(view_shape.len()));
			view_shape.push(result.shape()[result_axis]);
			view_strides.push(result.strides()[result_axis]);
			result_axis += 1;
		}
	}
	let view = result.with_layout(0, &view_shape, &view_strides);

	let config = args.config.unwrap_or_else(Config::defaults);
	let fp = FpStatus::default();

	let ops = vec![
		IterOperand::new(Some(array.clone()), dtype, OpFlags::INPUT),
		IterOperand::new(Some(view), dtype, OpFlags::WRITE.union(OpFlags::REDUCE_OK)).with_op_axes(op_axes),
	];
	let spec = IterSpec { order: Order::K, ndim: Some(ndim), device: device.clone() };
	let mut iter = BroadcastIter::new(ops, &spec)?;

	if iter.iter_size() == 0 {
		if result.size() > 0 {
			let Some(value) = identity_value else {
				cold_path();
				return err(
					UFuncError::NoIdentity,
					format!("zero-size array to reduction operation {name} which has no identity"),
				);
			};
			assign::fill(&result, value)?;
		}
		return finish_result(args.out, result);
	}

	log::debug!(
		"reduce '{name}': axes {:?} of shape {}, {}",
		axes.iter().collect::<Vec<_>>(),
		fmt_shape(shape),
		if identity_value.is_some() { "from identity" } else { "copying first elements" }
	);
	let combine = Executor::new(device.as_ref(), resolved.func, resolved.aux.as_deref(), &fp)
		.with_host_lock(config.host_lock.as_deref(), resolved.needs_api());
	match identity_value {
		Some(value) => {
			assign::fill(&result, value)?;
			iter.run(|it| {
				let (ptrs, strides) = reduce_operands(it);
				combine.execute(&ptrs, &strides, it.inner_count())
			})?;
		},
		None => {
			let pair = CastPair { from: dtype, to: dtype };
			let copy = Executor::new(device.as_ref(), kernels::cast, Some(&pair), &fp);
			iter.run(|it| {
				let (ptrs, strides) = reduce_operands(it);
				let count = it.inner_count();
				if !it.is_first_visit(1) {
					return combine.execute(&ptrs, &strides, count);
				}
				let [out, input, _] = ptrs;
				let [out_stride, in_stride, _] = strides;
				if out_stride != 0 {
					return copy.execute(&[input, out], &[in_stride, out_stride], count);
				}
				copy.execute(&[input, out], &[in_stride, 0], 1)?;
				let rest = [out, input.wrapping_offset(in_stride), out];
				combine.execute(&rest, &strides, count - 1)
			})?;
		},
	}
	iter.finish()?;

	config.handle_fp_flags(name, fp.take())?;
	finish_result(args.out, result)
}

/// Pointers and strides of the combining loop `out = op(out, in)`.
fn reduce_operands(it: &BroadcastIter) -> ([*mut u8; 3], [isize; 3]) {
	let ptrs = it.ptrs();
	let strides = it.inner_strides();
	([ptrs[1], ptrs[0], ptrs[1]], [strides[1], strides[0], strides[1]])
}

//--------------------------------------------------------------------------------------------------

/// Running reduction along one axis: `out[0] = a[0]`, `out[i] = op(out[i-1], a[i])`.
pub fn accumulate(ufunc: &UFunc, array: &DeviceArray, args: AccumulateArgs) -> UFuncResult<DeviceArray> {
	let name = ufunc.name();
	ensure_binary(ufunc, "accumulate")?;
	if let Some(out) = &args.out {
		super::placement::resolve_device([Some(array), Some(out)])?;
	}
	let ndim = array.ndim();
	if ndim == 0 {
		cold_path();
		return err(UFuncError::InvalidValue, "cannot accumulate on a scalar");
	}
	let axis = normalize_axis(args.axis, ndim)?;

	let otype = args.dtype.or(args.out.as_ref().map(DeviceArray::dtype)).unwrap_or(array.dtype());
	let resolved = resolve_self_loop(ufunc, array, otype)?;
	let dtype = resolved.dtypes[0];
	let device = array.device().clone();
	let result = result_array(args.out.as_ref(), array, array.shape(), dtype, &device, name)?;

	let n = array.shape()[axis];
	if array.size() == 0 {
		return finish_result(args.out, result);
	}
	let config = args.config.unwrap_or_else(Config::defaults);
	let fp = FpStatus::default();

	assign::assign(&result.select(axis, 0)?, &array.select(axis, 0)?)?;
	if n > 1 {
		// The accumulated axis goes first, so each slice is done before the next reads it.
		let mut perm: SmallVec<[usize; 8]> = SmallVec::with_capacity(ndim);
		perm.push(axis);
		perm.extend((0..ndim).filter(|&a| a != axis));
		let prev = result.slice(axis, 0, n - 1, 1)?.permuted(&perm)?;
		let input = array.slice(axis, 1, n, 1)?.permuted(&perm)?;
		let cur = result.slice(axis, 1, n, 1)?.permuted(&perm)?;

		let ops = vec![
			IterOperand::new(Some(prev), dtype, OpFlags::INPUT),
			IterOperand::new(Some(input), dtype, OpFlags::INPUT),
			IterOperand::new(Some(cur), dtype, OpFlags::WRITE),
		];
		let spec = IterSpec { order: Order::C, ndim: None, device: device.clone() };
		let mut iter = BroadcastIter::new(ops, &spec)?;
		let exec = Executor::new(device.as_ref(), resolved.func, resolved.aux.as_deref(), &fp)
			.with_host_lock(config.host_lock.as_deref(), resolved.needs_api());
		log::debug!("accumulate '{name}': axis {axis} of shape {}", fmt_shape(array.shape()));
		iter.run(|it| exec.execute(it.ptrs(), it.inner_strides(), it.inner_count()))?;
		iter.finish()?;
	}

	config.handle_fp_flags(name, fp.take())?;
	finish_result(args.out, result)
}

/// Checks the arguments of a reduction over index ranges. The reduction itself
/// is not available on devices.
pub fn reduceat(
	ufunc: &UFunc,
	array: &DeviceArray,
	indices: &DeviceArray,
	axis: isize,
) -> UFuncResult<DeviceArray> {
	ensure_binary(ufunc, "reduceat")?;
	super::placement::resolve_device([Some(array), Some(indices)])?;
	if array.ndim() == 0 {
		cold_path();
		return err(UFuncError::InvalidValue, "cannot reduceat a scalar");
	}
	normalize_axis(axis, array.ndim())?;
	if indices.ndim() != 1 || !matches!(indices.dtype().kind(), DTypeKind::Int | DTypeKind::Uint) {
		cold_path();
		return err(UFuncError::InvalidArguments, "reduceat indices must be a 1-d integer array");
	}
	cold_path();
	err(UFuncError::NotSupported, "reduceat is not supported")
}

//--------------------------------------------------------------------------------------------------
