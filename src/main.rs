//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use offload_ufunc::array::layout::Order;
use offload_ufunc::device::DeviceId;
use offload_ufunc::engine::reduce::{Axis, ReduceArgs};
use offload_ufunc::ufunc::builtins;
use offload_ufunc::{DType, DeviceArray, ErrPack, UFuncError, runtime};

fn main() -> Result<(), ErrPack<UFuncError>> {
	stderrlog::new().module("offload_ufunc").verbosity(3).init().ok();

	let dev = DeviceId(runtime::device_count() - 1);
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], dev)?;
	let b = DeviceArray::from_slice(&[10.0_f64, 20.0, 30.0], &[3], dev)?;
	println!("a = {:?}", runtime::to_host::<f64>(&a)?);

	let sum = builtins::add().apply(&[&a, &b])?;
	println!("a + b = {:?}", runtime::to_host::<f64>(&sum[0])?);

	let at = a.transposed();
	let prod = builtins::matmul().apply(&[&a, &at])?;
	println!("a @ a.T = {:?}", runtime::to_host::<f64>(&prod[0])?);

	let total = builtins::add().reduce(&a, ReduceArgs { axis: Axis::All, ..Default::default() })?;
	println!("sum(a) = {:?}", total.scalar_value()?);

	let z = runtime::zeros(&[4], DType::I32, Order::C, Some(dev))?;
	println!("zeros = {:?}", runtime::to_host::<i32>(&z)?);
	Ok(())
}
