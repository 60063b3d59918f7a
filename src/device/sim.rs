//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::UFuncResult;
use crate::util::cold_path;

use super::{Device, DeviceAllocError, DeviceId, DevicePtr, FpStatus, InnerLoopFn, KernelCall};

//--------------------------------------------------------------------------------------------------

const BUFFER_ALIGN: usize = std::mem::align_of::<u64>();

/// Simulated accelerator. Device memory lives in the host heap and kernels run
/// synchronously on the calling thread, but all access still goes through the
/// `Device` interface.
pub struct SimDevice {
	id: DeviceId,
	name: String,
	memory_limit: Option<usize>,
	allocated: AtomicUsize,
	offloads: AtomicUsize,
}

impl SimDevice {
	pub fn new(id: DeviceId) -> Arc<Self> {
		Self::with_memory_limit(id, None)
	}

	/// A device that fails allocations once `limit` bytes are in use.
	pub fn with_memory_limit(id: DeviceId, memory_limit: Option<usize>) -> Arc<Self> {
		Arc::new(Self {
			id,
			name: format!("sim:{id}"),
			memory_limit,
			allocated: AtomicUsize::new(0),
			offloads: AtomicUsize::new(0),
		})
	}

	/// Number of kernels run on this device so far.
	pub fn offload_count(&self) -> usize {
		self.offloads.load(Ordering::Relaxed)
	}

	/// Bytes currently allocated on this device.
	pub fn allocated_bytes(&self) -> usize {
		self.allocated.load(Ordering::Relaxed)
	}

	fn layout(bytes: usize) -> Result<std::alloc::Layout, DeviceAllocError> {
		std::alloc::Layout::from_size_align(bytes.max(1), BUFFER_ALIGN).map_err(|_| DeviceAllocError)
	}
}

impl Device for SimDevice {
	fn id(&self) -> DeviceId {
		self.id
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn is_host_addressable(&self) -> bool {
		true
	}

	fn new_buffer(&self, bytes: usize) -> Result<DevicePtr, DeviceAllocError> {
		if let Some(limit) = self.memory_limit {
			let in_use = self.allocated.load(Ordering::Relaxed);
			if in_use.saturating_add(bytes) > limit {
				cold_path();
				log::debug!("{}: allocation of {bytes} bytes over limit {limit}", self.name);
				return Err(DeviceAllocError);
			}
		}
		let layout = Self::layout(bytes)?;
		let memory = unsafe { std::alloc::alloc_zeroed(layout) };
		if memory.is_null() {
			cold_path();
			return Err(DeviceAllocError);
		}
		self.allocated.fetch_add(bytes, Ordering::Relaxed);
		Ok(DevicePtr::new(memory))
	}

	unsafe fn drop_buffer(&self, ptr: DevicePtr, bytes: usize) {
		if let Ok(layout) = Self::layout(bytes) {
			unsafe { std::alloc::dealloc(ptr.as_ptr::<u8>(), layout) };
			self.allocated.fetch_sub(bytes, Ordering::Relaxed);
		}
	}

	unsafe fn upload_data(&self, src: *const u8, dst: DevicePtr, bytes: usize) -> UFuncResult<()> {
		unsafe {
			std::ptr::copy_nonoverlapping(src, dst.as_ptr::<u8>(), bytes);
		}
		Ok(())
	}

	unsafe fn download_data(
		&self,
		src: DevicePtr,
		dst: *mut u8,
		bytes: usize,
	) -> UFuncResult<()> {
		unsafe {
			std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst, bytes);
		}
		Ok(())
	}

	unsafe fn run_kernel(&self, kernel: InnerLoopFn, call: &KernelCall, fp: &FpStatus) -> UFuncResult<()> {
		self.offloads.fetch_add(1, Ordering::Relaxed);
		log::trace!("{}: offload count={}", self.name, call.count);
		unsafe { kernel(call, fp) };
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
