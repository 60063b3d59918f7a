//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{UFuncError, UFuncResult, err};

pub mod buffer;
pub mod sim;

pub use buffer::DeviceBuffer;
pub use sim::SimDevice;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl std::fmt::Display for DeviceId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DevicePtr {
	ptr: *mut u8,
}

// A device address is plain data. Only the owning device dereferences it.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
	#[inline]
	pub fn new(ptr: *mut u8) -> Self {
		Self { ptr }
	}

	/// # Safety
	/// The pointer should only be used by device-specific code that knows what the pointer is.
	///
	/// It is a device address. Dereferencing it on the host is only valid for
	/// devices that report `is_host_addressable()`.
	#[inline]
	pub unsafe fn as_ptr<T>(&self) -> *mut T {
		self.ptr.cast::<T>()
	}

	#[inline]
	pub fn byte_offset(self, offset: isize) -> Self {
		Self { ptr: self.ptr.wrapping_offset(offset) }
	}

	#[inline]
	pub fn addr(self) -> usize {
		self.ptr as usize
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceAllocError;

/// Floating-point exception flags raised by inner loops.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FpFlags(u8);

impl FpFlags {
	pub const DIVIDE_BY_ZERO: Self = Self(1);
	pub const OVERFLOW: Self = Self(2);
	pub const UNDERFLOW: Self = Self(4);
	pub const INVALID: Self = Self(8);

	pub const fn empty() -> Self {
		Self(0)
	}

	pub const fn bits(self) -> u8 {
		self.0
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub const fn union(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}
}

impl std::fmt::Display for FpFlags {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let names = [
			(Self::DIVIDE_BY_ZERO, "divide by zero"),
			(Self::OVERFLOW, "overflow"),
			(Self::UNDERFLOW, "underflow"),
			(Self::INVALID, "invalid value"),
		];
		let mut first = true;
		for (flag, name) in names {
			if self.contains(flag) {
				if !first {
					write!(f, ", ")?;
				}
				write!(f, "{name}")?;
				first = false;
			}
		}
		Ok(())
	}
}

/// Floating-point status flags raised by the inner loops of one call.
#[derive(Debug, Default)]
pub struct FpStatus {
	bits: AtomicU8,
}

impl FpStatus {
	pub fn raise(&self, flags: FpFlags) {
		self.bits.fetch_or(flags.bits(), Ordering::Relaxed);
	}

	pub fn get(&self) -> FpFlags {
		FpFlags(self.bits.load(Ordering::Relaxed))
	}

	/// Returns the current flags and clears them.
	pub fn take(&self) -> FpFlags {
		FpFlags(self.bits.swap(0, Ordering::Relaxed))
	}
}

//--------------------------------------------------------------------------------------------------

pub type AuxData = dyn Any + Send + Sync;

/// Everything an inner loop receives. Only addresses, strides and counts.
///
/// `strides` holds one outer byte stride per operand. Generalized loops also get
/// the core dimension sizes and, per operand, the byte strides of its core dims
/// (concatenated in operand order).
pub struct KernelCall<'a> {
	pub ptrs: &'a [*mut u8],
	pub strides: &'a [isize],
	pub count: usize,
	pub core_dims: &'a [usize],
	pub core_strides: &'a [isize],
	pub aux: Option<&'a AuxData>,
}

impl<'a> KernelCall<'a> {
	pub fn elementwise(ptrs: &'a [*mut u8], strides: &'a [isize], count: usize) -> Self {
		Self {
			ptrs,
			strides,
			count,
			core_dims: &[],
			core_strides: &[],
			aux: None,
		}
	}
}

/// Strided inner loop. Runs on the device, reading and writing device memory.
pub type InnerLoopFn = unsafe fn(call: &KernelCall, fp: &FpStatus);

//--------------------------------------------------------------------------------------------------

pub trait Device: Send + Sync {
	fn id(&self) -> DeviceId;

	fn name(&self) -> &str;

	/// True if device addresses can be dereferenced by the host.
	fn is_host_addressable(&self) -> bool {
		false
	}

	fn new_buffer(&self, bytes: usize) -> Result<DevicePtr, DeviceAllocError>;

	/// # Safety
	/// `ptr` must come from `new_buffer(bytes)` on this device and must not be used afterwards.
	unsafe fn drop_buffer(&self, ptr: DevicePtr, bytes: usize);

	/// # Safety
	/// `src` must be readable for `bytes` host bytes, `dst` a valid device range.
	unsafe fn upload_data(&self, src: *const u8, dst: DevicePtr, bytes: usize) -> UFuncResult<()>;

	/// # Safety
	/// `src` must be a valid device range, `dst` writable for `bytes` host bytes.
	unsafe fn download_data(&self, src: DevicePtr, dst: *mut u8, bytes: usize)
	-> UFuncResult<()>;

	/// Runs one inner loop invocation on the device and blocks until it finishes.
	///
	/// # Safety
	/// Pointers in `call` must be valid device addresses of this device for the
	/// strides and count given.
	/// Flags raised by the loop are added to `fp`.
	unsafe fn run_kernel(&self, kernel: InnerLoopFn, call: &KernelCall, fp: &FpStatus) -> UFuncResult<()>;
}

//--------------------------------------------------------------------------------------------------

pub const DEFAULT_DEVICE_COUNT: usize = 2;

pub struct DeviceRegistry {
	devices: Vec<Arc<dyn Device>>,
	current: DeviceId,
}

impl DeviceRegistry {
	pub fn instance() -> Arc<RwLock<Self>> {
		static instance: OnceLock<Arc<RwLock<DeviceRegistry>>> = OnceLock::new();
		instance
			.get_or_init(|| {
				let devices = (0..DEFAULT_DEVICE_COUNT)
					.map(|i| SimDevice::new(DeviceId(i)) as Arc<dyn Device>)
					.collect();
				log::debug!("device registry: {DEFAULT_DEVICE_COUNT} simulated devices");
				Arc::new(RwLock::new(Self { devices, current: DeviceId(0) }))
			})
			.clone()
	}

	pub fn with<R>(f: impl FnOnce(&Self) -> R) -> R {
		let instance = Self::instance();
		let registry = instance.read().unwrap_or_else(PoisonError::into_inner);
		f(&registry)
	}

	pub fn with_mut<R>(f: impl FnOnce(&mut Self) -> R) -> R {
		let instance = Self::instance();
		let mut registry = instance.write().unwrap_or_else(PoisonError::into_inner);
		f(&mut registry)
	}

	pub fn count(&self) -> usize {
		self.devices.len()
	}

	pub fn current(&self) -> DeviceId {
		self.current
	}

	pub fn set_current(&mut self, id: DeviceId) -> UFuncResult<()> {
		if id.0 >= self.devices.len() {
			return err(UFuncError::InvalidValue, format!("invalid device id {id}"));
		}
		self.current = id;
		Ok(())
	}

	pub fn get(&self, id: DeviceId) -> UFuncResult<Arc<dyn Device>> {
		match self.devices.get(id.0) {
			Some(device) => Ok(device.clone()),
			None => err(UFuncError::InvalidValue, format!("invalid device id {id}")),
		}
	}

	/// Adds a device built by `make` with the next free id.
	pub fn register(&mut self, make: impl FnOnce(DeviceId) -> Arc<dyn Device>) -> DeviceId {
		let id = DeviceId(self.devices.len());
		self.devices.push(make(id));
		id
	}
}

pub fn device(id: DeviceId) -> UFuncResult<Arc<dyn Device>> {
	DeviceRegistry::with(|r| r.get(id))
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fp_status() {
		let status = FpStatus::default();
		assert!(status.get().is_empty());
		status.raise(FpFlags::DIVIDE_BY_ZERO);
		status.raise(FpFlags::INVALID);
		let flags = status.take();
		assert!(flags.contains(FpFlags::DIVIDE_BY_ZERO));
		assert!(flags.contains(FpFlags::INVALID));
		assert!(!flags.contains(FpFlags::OVERFLOW));
		assert_eq!(flags.to_string(), "divide by zero, invalid value");
		assert!(status.get().is_empty());
	}

	#[test]
	fn test_registry_lookup() {
		let count = DeviceRegistry::with(DeviceRegistry::count);
		assert!(count >= DEFAULT_DEVICE_COUNT);
		assert_eq!(device(DeviceId(1)).unwrap().id(), DeviceId(1));
		let e = device(DeviceId(usize::MAX)).err().unwrap();
		assert_eq!(e.code, UFuncError::InvalidValue);
	}
}
