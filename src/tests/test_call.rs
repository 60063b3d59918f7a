//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_approx_eq::assert_approx_eq;

use super::{device_f64, host_f64, private_device, ramp};
use crate::array::layout::Order;
use crate::config::{Config, ErrorAction, ErrorMask};
use crate::device::DeviceId;
use crate::engine::dispatch::HostLock;
use crate::ufunc::builtins;
use crate::{Arg, DType, DeviceArray, Dispatch, ErrPack, ErrorCategory, KwValue, UFuncError};

//--------------------------------------------------------------------------------------------------

#[test]
fn test_device_consistency() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0], &[2], DeviceId(0))?;
	let b = DeviceArray::from_slice(&[3.0_f64, 4.0], &[2], DeviceId(1))?;

	let e = builtins::add().apply(&[&a, &b]).unwrap_err();
	assert_eq!(e.code, UFuncError::DeviceMismatch);
	assert_eq!(e.category(), ErrorCategory::ValueError);

	let out = DeviceArray::new_empty(&[2], DType::F64, DeviceId(1), Order::C)?;
	let e = builtins::add().apply_out(&[&a, &a], &[&out]).unwrap_err();
	assert_eq!(e.code, UFuncError::DeviceMismatch);

	let r = builtins::add().apply(&[&b, &b])?;
	assert_eq!(r[0].device_id(), DeviceId(1));
	Ok(())
}

#[test]
fn test_scalar_follows_array_device() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1_i8, 2, 3], &[3], DeviceId(1))?;
	let r = builtins::add().call(&[Arg::from(&a), Arg::from(1)], &[])?.into_result("add")?;
	assert_eq!(r[0].device_id(), DeviceId(1));
	assert_eq!(r[0].dtype(), DType::I8);
	assert_eq!(r[0].to_vec::<i8>()?, vec![2, 3, 4]);
	Ok(())
}

#[test]
fn test_trivial_matches_iterator() -> Result<(), ErrPack<UFuncError>> {
	let (dev, sim) = private_device();
	let x = ramp(&[6, 5], 0.5);
	let y = ramp(&[6, 5], -2.0);
	let expected = &x + &y;

	// Contiguous operands run as a single offload.
	let a = device_f64(&x, dev);
	let b = device_f64(&y, dev);
	let before = sim.offload_count();
	let r = builtins::add().apply(&[&a, &b])?;
	assert_eq!(sim.offload_count() - before, 1);
	assert_eq!(host_f64(&r[0]), expected);

	// The same values through mixed layouts need the iterator.
	let bt = device_f64(&y.t().to_owned(), dev).transposed();
	let before = sim.offload_count();
	let r = builtins::add().apply(&[&a, &bt])?;
	assert!(sim.offload_count() - before > 1);
	assert_eq!(host_f64(&r[0]), expected);
	Ok(())
}

#[test]
fn test_broadcast() -> Result<(), ErrPack<UFuncError>> {
	let x = ramp(&[3, 1], 1.0);
	let y = ramp(&[1, 4], 10.0);
	let a = device_f64(&x, DeviceId(0));
	let b = device_f64(&y, DeviceId(0));
	let r = builtins::multiply().apply(&[&a, &b])?;
	assert_eq!(r[0].shape(), &[3, 4]);
	assert_eq!(host_f64(&r[0]), &x * &y);

	let row = device_f64(&ramp(&[4], 1.0), DeviceId(0));
	let m = device_f64(&ramp(&[2, 4], 1.0), DeviceId(0));
	let r = builtins::subtract().apply(&[&m, &row])?;
	assert_eq!(host_f64(&r[0]), &ramp(&[2, 4], 1.0) - &ramp(&[4], 1.0));
	Ok(())
}

#[test]
fn test_broadcast_errors() -> Result<(), ErrPack<UFuncError>> {
	let a = device_f64(&ramp(&[2, 3], 1.0), DeviceId(0));
	let b = device_f64(&ramp(&[4], 1.0), DeviceId(0));
	let e = builtins::add().apply(&[&a, &b]).unwrap_err();
	assert_eq!(e.code, UFuncError::Broadcast);
	assert_eq!(e.message(), "operands could not be broadcast together with shapes (2,3) (4,)");

	// Outputs are never broadcast.
	let out = DeviceArray::new_empty(&[3], DType::F64, DeviceId(0), Order::C)?;
	let e = builtins::add().apply_out(&[&a, &a], &[&out]).unwrap_err();
	assert_eq!(e.code, UFuncError::ShapeMismatch);
	Ok(())
}

#[test]
fn test_output_aliasing() -> Result<(), ErrPack<UFuncError>> {
	let x = ramp(&[8], 1.0) + 1.0;
	let y = ramp(&[8], 0.25);
	let a = device_f64(&x, DeviceId(0));
	let b = device_f64(&y, DeviceId(0));

	// multiply(a, b, out=a[::-1])
	let out = a.reversed(0)?;
	builtins::multiply()
		.call(&[Arg::from(&a), Arg::from(&b)], &[("out", (&out).into())])?
		.into_result("multiply")?;

	let mut expected: Vec<f64> = (&x * &y).iter().copied().collect();
	expected.reverse();
	assert_eq!(a.to_vec::<f64>()?, expected);

	// Exactly the same view is not a conflict.
	let c = device_f64(&x, DeviceId(0));
	builtins::add().apply_out(&[&c, &b], &[&c])?;
	assert_eq!(host_f64(&c), &x + &y);
	Ok(())
}

#[test]
fn test_masked_execution() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], DeviceId(0))?;
	let b = DeviceArray::from_slice(&[10.0_f64, 20.0, 30.0], &[3], DeviceId(0))?;
	let mask = DeviceArray::from_slice(&[true, false, true], &[3], DeviceId(0))?;
	let out = DeviceArray::from_slice(&[-1.0_f64; 6], &[2, 3], DeviceId(0))?;

	let r = builtins::add()
		.call(
			&[Arg::from(&a), Arg::from(&b)],
			&[("out", (&out).into()), ("where", (&mask).into())],
		)?
		.into_result("add")?;
	assert!(r[0].is_same_view(&out));
	assert_eq!(out.to_vec::<f64>()?, vec![11.0, -1.0, 33.0, 14.0, -1.0, 36.0]);

	// A numeric mask is converted with `!= 0`.
	let mask = DeviceArray::from_slice(&[0_i32, 7, 0], &[3], DeviceId(0))?;
	builtins::multiply()
		.call(&[Arg::from(&a), Arg::from(&b)], &[("out", (&out).into()), ("where", (&mask).into())])?
		.into_result("multiply")?;
	assert_eq!(out.to_vec::<f64>()?, vec![11.0, 40.0, 33.0, 14.0, 100.0, 36.0]);
	Ok(())
}

#[test]
fn test_keyword_validation() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0], &[2], DeviceId(0))?;
	let args = [Arg::from(&a), Arg::from(&a)];

	for (t1, t2) in [(DType::F64, DType::F64), (DType::F32, DType::I64), (DType::I32, DType::F64)] {
		let sig = t2.to_string();
		let e = builtins::add()
			.call(&args, &[("dtype", t1.into()), ("sig", sig.as_str().into())])
			.unwrap_err();
		assert_eq!(e.message(), "cannot specify both 'sig' and 'dtype'", "dtype={t1} sig={t2}");
		assert_eq!(e.category(), ErrorCategory::RuntimeError);
	}

	let e = builtins::multiply().call(&args, &[("axis", KwValue::None)]).unwrap_err();
	assert_eq!(e.message(), "'axis' is an invalid keyword to ufunc 'multiply'");
	assert_eq!(e.category(), ErrorCategory::TypeError);
	Ok(())
}

#[test]
fn test_output_dtype_override() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1_i32, 2, 3], &[3], DeviceId(0))?;
	let r = builtins::add()
		.call(&[Arg::from(&a), Arg::from(&a)], &[("dtype", DType::F32.into())])?
		.into_result("add")?;
	assert_eq!(r[0].dtype(), DType::F32);
	assert_eq!(r[0].to_vec::<f32>()?, vec![2.0, 4.0, 6.0]);

	// An output of another dtype is written through a buffer.
	let out = DeviceArray::new_empty(&[3], DType::I64, DeviceId(0), Order::C)?;
	builtins::negative().apply_out(&[&a], &[&out])?;
	assert_eq!(out.to_vec::<i64>()?, vec![-1, -2, -3]);
	Ok(())
}

#[test]
fn test_fortran_inputs_give_fortran_output() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::new_zeroed(&[3, 4], DType::F64, DeviceId(0), Order::F)?;
	let r = builtins::absolute().apply(&[&a])?;
	assert!(r[0].is_f_contiguous());

	let r = builtins::add()
		.call(&[Arg::from(&a), Arg::from(&a)], &[("order", "C".into())])?
		.into_result("add")?;
	assert!(r[0].is_c_contiguous());
	Ok(())
}

#[test]
fn test_floating_point_errors() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1.0_f64, 4.0], &[2], DeviceId(0))?;
	let zero = DeviceArray::from_slice(&[0.0_f64, 2.0], &[2], DeviceId(0))?;

	// Default policy warns and returns the result.
	let r = builtins::divide().apply(&[&a, &zero])?;
	let values = r[0].to_vec::<f64>()?;
	assert!(values[0].is_infinite());
	assert_approx_eq!(values[1], 2.0);

	let raise = Config::default().with_error_mask(ErrorMask::all(ErrorAction::Raise));
	let e = builtins::divide()
		.call(&[Arg::from(&a), Arg::from(&zero)], &[("extobj", raise.clone().into())])
		.unwrap_err();
	assert_eq!(e.category(), ErrorCategory::FloatingPointError);
	assert_eq!(e.message(), "divide by zero encountered in divide");

	// Flags from an earlier call do not leak into the next one.
	let ok = builtins::divide().call(&[Arg::from(&a), Arg::from(&a)], &[("extobj", raise.into())])?;
	assert!(!ok.is_not_implemented());

	let neg = DeviceArray::from_slice(&[-1.0_f32], &[1], DeviceId(0))?;
	let r = builtins::sqrt().apply(&[&neg])?;
	assert!(r[0].to_vec::<f32>()?[0].is_nan());
	Ok(())
}

#[derive(Default)]
struct CountingLock {
	released: AtomicUsize,
	acquired: AtomicUsize,
}

impl HostLock for CountingLock {
	fn release(&self) {
		self.released.fetch_add(1, Ordering::Relaxed);
	}

	fn acquire(&self) {
		self.acquired.fetch_add(1, Ordering::Relaxed);
	}
}

#[test]
fn test_host_lock_released_for_large_offloads() -> Result<(), ErrPack<UFuncError>> {
	let lock = Arc::new(CountingLock::default());
	let config = Config::default().with_host_lock(lock.clone());

	let small = device_f64(&ramp(&[499], 1.0), DeviceId(0));
	builtins::add()
		.call(&[Arg::from(&small), Arg::from(&small)], &[("extobj", config.clone().into())])?
		.into_result("add")?;
	assert_eq!(lock.released.load(Ordering::Relaxed), 0);

	let large = device_f64(&ramp(&[500], 1.0), DeviceId(0));
	builtins::add()
		.call(&[Arg::from(&large), Arg::from(&large)], &[("extobj", config.into())])?
		.into_result("add")?;
	assert_eq!(lock.released.load(Ordering::Relaxed), 1);
	assert_eq!(lock.acquired.load(Ordering::Relaxed), 1);
	Ok(())
}

#[test]
fn test_flexible_input_not_implemented() -> Result<(), ErrPack<UFuncError>> {
	let bytes = DeviceArray::new_empty(&[2], DType::Bytes(4), DeviceId(0), Order::C)?;
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0], &[2], DeviceId(0))?;

	let result = builtins::add().call(&[Arg::from(&bytes), Arg::from(&a)], &[])?;
	assert!(matches!(result, Dispatch::NotImplemented));

	let e = builtins::add().apply(&[&bytes, &a]).unwrap_err();
	assert_eq!(e.code, UFuncError::TypeResolution);
	assert_eq!(e.message(), "operand types are not supported by ufunc 'add'");
	Ok(())
}

#[test]
fn test_empty_arrays() -> Result<(), ErrPack<UFuncError>> {
	let (dev, sim) = private_device();
	let a = DeviceArray::new_empty(&[0, 3], DType::F64, dev, Order::C)?;
	let b = DeviceArray::new_empty(&[3], DType::F64, dev, Order::C)?;
	let before = sim.offload_count();
	let r = builtins::add().apply(&[&a, &b])?;
	assert_eq!(r[0].shape(), &[0, 3]);
	assert_eq!(sim.offload_count(), before);
	Ok(())
}

#[test]
fn test_user_loop_priority() -> Result<(), ErrPack<UFuncError>> {
	unsafe fn times_ten(call: &crate::device::KernelCall, _fp: &crate::device::FpStatus) {
		let (Some(&p0), Some(&p1)) = (call.ptrs.first(), call.ptrs.get(1)) else {
			return;
		};
		let (s0, s1) = (call.strides[0], call.strides[1]);
		for i in 0..call.count as isize {
			unsafe {
				let x = p0.offset(i * s0).cast::<i32>().read_unaligned();
				p1.offset(i * s1).cast::<i32>().write_unaligned(x * 10);
			}
		}
	}

	let u = crate::UFunc::new("scale", 1, 1, crate::ufunc::Identity::None)?
		.with_loop(&[DType::I32, DType::I32], crate::ufunc::kernels::negative::<i32>);
	u.register_loop(&[DType::I32, DType::I32], times_ten, None, 5)?;

	let a = DeviceArray::from_slice(&[1_i32, 2], &[2], DeviceId(0))?;
	let r = u.apply(&[&a])?;
	assert_eq!(r[0].to_vec::<i32>()?, vec![10, 20]);
	Ok(())
}
