//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use super::{Device, DeviceAllocError, DeviceId, DevicePtr};

//--------------------------------------------------------------------------------------------------

/// A block of device memory. Freed on the owning device when the last
/// reference goes away.
pub struct DeviceBuffer {
	memory: DevicePtr,
	bytes: usize,
	device: Arc<dyn Device>,
}

impl DeviceBuffer {
	pub fn new(device: Arc<dyn Device>, bytes: usize) -> Result<Arc<Self>, DeviceAllocError> {
		let memory = device.new_buffer(bytes)?;
		Ok(Arc::new(Self { memory, bytes, device }))
	}

	#[inline]
	pub fn memory(&self) -> DevicePtr {
		self.memory
	}

	#[inline]
	pub fn bytes(&self) -> usize {
		self.bytes
	}

	#[inline]
	pub fn device(&self) -> &Arc<dyn Device> {
		&self.device
	}

	#[inline]
	pub fn device_id(&self) -> DeviceId {
		self.device.id()
	}
}

impl Drop for DeviceBuffer {
	fn drop(&mut self) {
		unsafe {
			self.device.drop_buffer(self.memory, self.bytes);
		}
	}
}
