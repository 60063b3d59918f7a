//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::device::{AuxData, Device, FpStatus, InnerLoopFn, KernelCall};
use crate::error::UFuncResult;

//--------------------------------------------------------------------------------------------------

/// Offloads with at least this many elements run without the host lock.
pub const RELEASE_THRESHOLD: usize = 500;

/// A lock the host holds while running ufunc code, like an interpreter lock.
/// It is released around long offloads so other host threads can proceed.
pub trait HostLock: Send + Sync {
	fn release(&self);

	fn acquire(&self);
}

struct Released<'a> {
	lock: &'a dyn HostLock,
}

impl<'a> Released<'a> {
	fn new(lock: &'a dyn HostLock) -> Self {
		lock.release();
		Self { lock }
	}
}

impl Drop for Released<'_> {
	fn drop(&mut self) {
		self.lock.acquire();
	}
}

//--------------------------------------------------------------------------------------------------

/// Runs one inner loop on one device.
///
/// Only pointers, strides, counts and the aux data cross to the device. Errors
/// reported by the device are passed through unchanged.
pub struct Executor<'a> {
	device: &'a dyn Device,
	func: InnerLoopFn,
	aux: Option<&'a AuxData>,
	fp: &'a FpStatus,
	host_lock: Option<&'a dyn HostLock>,
}

impl<'a> Executor<'a> {
	/// Flags raised by the loop are collected in `fp`.
	pub fn new(
		device: &'a dyn Device,
		func: InnerLoopFn,
		aux: Option<&'a AuxData>,
		fp: &'a FpStatus,
	) -> Self {
		Self { device, func, aux, fp, host_lock: None }
	}

	/// Releases `lock` around large offloads, unless the loop needs the host API.
	pub fn with_host_lock(mut self, lock: Option<&'a dyn HostLock>, needs_api: bool) -> Self {
		self.host_lock = if needs_api { None } else { lock };
		self
	}

	pub fn execute(&self, ptrs: &[*mut u8], strides: &[isize], count: usize) -> UFuncResult<()> {
		self.execute_core(ptrs, strides, count, &[], &[])
	}

	pub fn execute_core(
		&self,
		ptrs: &[*mut u8],
		strides: &[isize],
		count: usize,
		core_dims: &[usize],
		core_strides: &[isize],
	) -> UFuncResult<()> {
		if count == 0 {
			return Ok(());
		}
		let call = KernelCall {
			ptrs,
			strides,
			count,
			core_dims,
			core_strides,
			aux: self.aux,
		};
		let _released = match self.host_lock {
			Some(lock) if count >= RELEASE_THRESHOLD => Some(Released::new(lock)),
			_ => None,
		};
		unsafe { self.device.run_kernel(self.func, &call, self.fp) }
	}
}

//--------------------------------------------------------------------------------------------------

/// Aux data of `masked_loop`: the wrapped loop and the number of its operands.
pub struct MaskedLoop {
	pub func: InnerLoopFn,
	pub aux: Option<Arc<AuxData>>,
	pub nop: usize,
}

/// Runs the wrapped loop on the runs of elements where the mask operand
/// (operand `nop`, one byte per element) is non-zero.
pub unsafe fn masked_loop(call: &KernelCall, fp: &FpStatus) {
	let Some(masked) = call.aux.and_then(|aux| aux.downcast_ref::<MaskedLoop>()) else {
		return;
	};
	let nop = masked.nop;
	let (Some(&mask), Some(&mask_stride), Some(strides)) =
		(call.ptrs.get(nop), call.strides.get(nop), call.strides.get(..nop))
	else {
		return;
	};
	let mut ptrs: ArrayVec<*mut u8, MAXARGS> = call.ptrs.iter().take(nop).copied().collect();
	let mask_at = |i: usize| unsafe { mask.wrapping_offset(i as isize * mask_stride).read() != 0 };
	let skip = |ptrs: &mut ArrayVec<*mut u8, MAXARGS>, n: usize| {
		for (ptr, &stride) in ptrs.iter_mut().zip(strides) {
			*ptr = ptr.wrapping_offset(n as isize * stride);
		}
	};

	let mut i = 0;
	while i < call.count {
		let start = i;
		while i < call.count && !mask_at(i) {
			i += 1;
		}
		skip(&mut ptrs, i - start);

		let start = i;
		while i < call.count && mask_at(i) {
			i += 1;
		}
		if i > start {
			let inner = KernelCall {
				ptrs: &ptrs,
				strides,
				count: i - start,
				core_dims: &[],
				core_strides: &[],
				aux: masked.aux.as_deref(),
			};
			unsafe { (masked.func)(&inner, fp) };
			skip(&mut ptrs, i - start);
		}
	}
}

//--------------------------------------------------------------------------------------------------
