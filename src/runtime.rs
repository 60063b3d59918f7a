//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Module-level entry points: device selection, allocation and host transfers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{ArrayD, IxDyn};

use crate::array::DeviceArray;
use crate::array::dtype::{DType, HasDType};
use crate::array::layout::Order;
use crate::device::{Device, DeviceId, DeviceRegistry};
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

pub fn current_device() -> DeviceId {
	DeviceRegistry::with(DeviceRegistry::current)
}

pub fn set_current_device(id: DeviceId) -> UFuncResult<()> {
	DeviceRegistry::with_mut(|r| r.set_current(id))?;
	log::debug!("current device set to {id}");
	Ok(())
}

pub fn device_count() -> usize {
	DeviceRegistry::with(DeviceRegistry::count)
}

/// Adds a device to the registry and returns its id.
pub fn register_device(make: impl FnOnce(DeviceId) -> Arc<dyn Device>) -> DeviceId {
	let id = DeviceRegistry::with_mut(|r| r.register(make));
	log::debug!("registered device {id}");
	id
}

fn check_order(order: Order) -> UFuncResult<()> {
	if !matches!(order, Order::C | Order::F) {
		cold_path();
		return err(UFuncError::InvalidValue, "only 'C' or 'F' order is permitted");
	}
	Ok(())
}

/// Uninitialized array on `device`, or on the current device.
pub fn empty(shape: &[usize], dtype: DType, order: Order, device: Option<DeviceId>) -> UFuncResult<DeviceArray> {
	check_order(order)?;
	DeviceArray::new_empty(shape, dtype, device.unwrap_or_else(current_device), order)
}

pub fn zeros(shape: &[usize], dtype: DType, order: Order, device: Option<DeviceId>) -> UFuncResult<DeviceArray> {
	check_order(order)?;
	DeviceArray::new_zeroed(shape, dtype, device.unwrap_or_else(current_device), order)
}

pub fn empty_like(array: &DeviceArray, dtype: Option<DType>, order: Order) -> UFuncResult<DeviceArray> {
	check_order(order)?;
	array.new_like(dtype, order)
}

/// Copies a device array to a host `ndarray` in logical (C) order.
pub fn to_host<T: HasDType>(array: &DeviceArray) -> UFuncResult<ArrayD<T>> {
	let data = array.to_vec::<T>()?;
	match ArrayD::from_shape_vec(IxDyn(array.shape()), data) {
		Ok(host) => Ok(host),
		Err(e) => {
			cold_path();
			err(UFuncError::Internal, format!("cannot build host array: {e}"))
		},
	}
}

/// Copies a host `ndarray` to `device`, or to the current device.
pub fn to_device<T: HasDType>(host: &ArrayD<T>, device: Option<DeviceId>) -> UFuncResult<DeviceArray> {
	let device = device.unwrap_or_else(current_device);
	let data: Vec<T> = host.iter().copied().collect();
	DeviceArray::from_slice(&data, host.shape(), device)
}

/// Diagnostic loop that spins until `interrupt` is set, checking the flag
/// between iterations. Returns the number of completed iterations in the error.
pub fn test_interrupt(interrupt: &AtomicBool, limit: Option<u64>) -> UFuncResult<u64> {
	let mut count: u64 = 0;
	loop {
		if interrupt.load(Ordering::Relaxed) {
			cold_path();
			return err(UFuncError::Interrupted, format!("interrupted after {count} iterations"));
		}
		if limit.is_some_and(|limit| count >= limit) {
			return Ok(count);
		}
		count += 1;
		std::hint::spin_loop();
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorCategory;

	#[test]
	fn test_orders() {
		let a = empty(&[2, 3], DType::F32, Order::F, Some(DeviceId(1))).unwrap();
		assert!(a.is_f_contiguous());
		assert_eq!(a.device_id(), DeviceId(1));
		let e = zeros(&[2], DType::F32, Order::K, None).unwrap_err();
		assert_eq!(e.message(), "only 'C' or 'F' order is permitted");
		assert_eq!(e.category(), ErrorCategory::ValueError);
	}

	#[test]
	fn test_zeros() {
		let z = zeros(&[3], DType::I16, Order::C, None).unwrap();
		assert_eq!(z.to_vec::<i16>().unwrap(), vec![0; 3]);
	}

	#[test]
	fn test_host_round_trip() {
		let host = ndarray::Array::from_shape_vec((2, 2), vec![1.5_f32, 2.5, 3.5, 4.5]).unwrap().into_dyn();
		let dev = to_device(&host, Some(DeviceId(1))).unwrap();
		assert_eq!(dev.shape(), &[2, 2]);
		let back = to_host::<f32>(&dev.transposed()).unwrap();
		assert_eq!(back, host.t());
	}

	#[test]
	fn test_interrupt_flag() {
		let flag = AtomicBool::new(false);
		assert_eq!(test_interrupt(&flag, Some(10)).unwrap(), 10);
		flag.store(true, Ordering::Relaxed);
		let e = test_interrupt(&flag, None).unwrap_err();
		assert_eq!(e.category(), ErrorCategory::KeyboardInterrupt);
	}

	#[test]
	fn test_current_device() {
		let e = set_current_device(DeviceId(usize::MAX)).unwrap_err();
		assert_eq!(e.code, UFuncError::InvalidValue);
		assert!(device_count() >= 2);
		set_current_device(current_device()).unwrap();

		let a = empty(&[2, 2], DType::U8, Order::C, Some(DeviceId(1))).unwrap();
		let b = empty_like(&a, Some(DType::F32), Order::F).unwrap();
		assert_eq!(b.device_id(), DeviceId(1));
		assert_eq!(b.dtype(), DType::F32);
		assert!(b.is_f_contiguous());
		assert!(empty_like(&a, None, Order::A).is_err());
	}
}
