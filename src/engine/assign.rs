//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Device to device copies with casting and broadcasting.

use crate::array::DeviceArray;
use crate::array::dtype::Scalar;
use crate::array::layout::Order;
use crate::device::FpStatus;
use crate::error::UFuncResult;
use crate::ufunc::kernels::{self, CastPair};

use super::dispatch::Executor;
use super::iter::{BroadcastIter, IterOperand, IterSpec, OpFlags};
use super::placement;

//--------------------------------------------------------------------------------------------------

/// Copies `src` into `dst`, casting to the dtype of `dst` and broadcasting
/// `src` to its shape.
///
/// Overlapping memory is handled by copying through a temporary.
pub fn assign(dst: &DeviceArray, src: &DeviceArray) -> UFuncResult<()> {
	dst.ensure_writeable()?;
	placement::resolve_device([Some(dst), Some(src)])?;
	if src.is_same_view(dst) {
		return Ok(());
	}
	if src.overlaps(dst) {
		let tmp = src.new_like(None, Order::K)?;
		cast_into(&tmp, src)?;
		return cast_into(dst, &tmp);
	}
	cast_into(dst, src)
}

/// Sets every element of `dst` to `value`.
pub fn fill(dst: &DeviceArray, value: Scalar) -> UFuncResult<()> {
	dst.ensure_writeable()?;
	let src = DeviceArray::from_scalar(value, dst.dtype(), dst.device().clone())?;
	cast_into(dst, &src)
}

fn cast_into(dst: &DeviceArray, src: &DeviceArray) -> UFuncResult<()> {
	let device = dst.device().clone();
	let ops = vec![
		IterOperand::new(Some(src.clone()), src.dtype(), OpFlags::INPUT),
		IterOperand::new(Some(dst.clone()), dst.dtype(), OpFlags::OUTPUT),
	];
	let spec = IterSpec { order: Order::K, ndim: None, device: device.clone() };
	let mut iter = BroadcastIter::new(ops, &spec)?;
	let pair = CastPair { from: src.dtype(), to: dst.dtype() };
	// Copies do not report floating-point errors.
	let fp = FpStatus::default();
	let exec = Executor::new(device.as_ref(), kernels::cast, Some(&pair), &fp);
	iter.run(|it| exec.execute(it.ptrs(), it.inner_strides(), it.inner_count()))
}

//--------------------------------------------------------------------------------------------------
