//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use assert_approx_eq::assert_approx_eq;
use ndarray::{Axis as NdAxis, Ix2};

use super::{device_f64, host_f64, private_device, ramp};
use crate::array::layout::Order;
use crate::device::DeviceId;
use crate::ufunc::builtins;
use crate::{Arg, DType, DeviceArray, ErrPack, ErrorCategory, UFuncError};

//--------------------------------------------------------------------------------------------------

fn assert_all_close(got: &ndarray::ArrayD<f64>, want: &ndarray::ArrayD<f64>) {
	assert_eq!(got.shape(), want.shape());
	for (g, w) in got.iter().zip(want.iter()) {
		assert_approx_eq!(*g, *w, 1e-9);
	}
}

#[test]
fn test_matmul_batch() -> Result<(), ErrPack<UFuncError>> {
	let (dev, sim) = private_device();
	let x = ramp(&[4, 2, 3], 0.5);
	let y = ramp(&[3, 5], -0.25);
	let a = device_f64(&x, dev);
	let b = device_f64(&y, dev);

	let before = sim.offload_count();
	let r = builtins::matmul().apply(&[&a, &b])?;
	assert!(sim.offload_count() > before);
	assert_eq!(r[0].shape(), &[4, 2, 5]);

	let y2 = y.view().into_dimensionality::<Ix2>().unwrap();
	let got = host_f64(&r[0]);
	for i in 0..4 {
		let xi = x.index_axis(NdAxis(0), i).into_dimensionality::<Ix2>().unwrap();
		let want = xi.dot(&y2).into_dyn();
		assert_all_close(&got.index_axis(NdAxis(0), i).to_owned(), &want);
	}
	Ok(())
}

#[test]
fn test_matmul_strided_core() -> Result<(), ErrPack<UFuncError>> {
	let x = ramp(&[3, 4], 1.0);
	let a = device_f64(&x, DeviceId(1));

	// a @ a.T, where the second operand has swapped core strides.
	let r = builtins::matmul().apply(&[&a, &a.transposed()])?;
	let x2 = x.view().into_dimensionality::<Ix2>().unwrap();
	let want = x2.dot(&x2.t()).into_dyn();
	assert_eq!(r[0].shape(), &[3, 3]);
	assert_all_close(&host_f64(&r[0]), &want);
	Ok(())
}

#[test]
fn test_matmul_int_inputs() -> Result<(), ErrPack<UFuncError>> {
	// No integer loops: i32 is only safely cast to f64.
	let a = DeviceArray::from_slice(&[1_i32, 2, 3, 4], &[2, 2], DeviceId(0))?;
	let r = builtins::matmul().apply(&[&a, &a])?;
	assert_eq!(r[0].dtype(), DType::F64);
	assert_eq!(r[0].to_vec::<f64>()?, vec![7.0, 10.0, 15.0, 22.0]);

	let s = DeviceArray::from_slice(&[1.5_f32, 2.0], &[1, 2], DeviceId(0))?;
	let t = DeviceArray::from_slice(&[2.0_f32, 4.0], &[2, 1], DeviceId(0))?;
	let r = builtins::matmul().apply(&[&s, &t])?;
	assert_eq!(r[0].dtype(), DType::F32);
	assert_eq!(r[0].to_vec::<f32>()?, vec![11.0]);
	Ok(())
}

#[test]
fn test_inner1d_broadcast() -> Result<(), ErrPack<UFuncError>> {
	let x = ramp(&[2, 1, 6], 1.0);
	let y = ramp(&[3, 6], 0.5);
	let a = device_f64(&x, DeviceId(0));
	let b = device_f64(&y, DeviceId(0));

	let r = builtins::inner1d().apply(&[&a, &b])?;
	assert_eq!(r[0].shape(), &[2, 3]);
	let got = host_f64(&r[0]);
	for i in 0..2 {
		for j in 0..3 {
			let u = x.index_axis(NdAxis(0), i).index_axis(NdAxis(0), 0).to_owned();
			let v = y.index_axis(NdAxis(0), j).to_owned();
			let want: f64 = u.iter().zip(v.iter()).map(|(p, q)| p * q).sum();
			assert_approx_eq!(got[[i, j]], want);
		}
	}

	// The core dimension of a 1-d pair collapses to a 0-d result.
	let v = device_f64(&ramp(&[6], 1.0), DeviceId(0));
	let r = builtins::inner1d().apply(&[&v, &v])?;
	assert_eq!(r[0].ndim(), 0);
	assert_approx_eq!(r[0].to_vec::<f64>()?[0], 55.0);
	Ok(())
}

#[test]
fn test_core_dim_errors() -> Result<(), ErrPack<UFuncError>> {
	let a = device_f64(&ramp(&[2, 3], 1.0), DeviceId(0));
	let b = device_f64(&ramp(&[4, 2], 1.0), DeviceId(0));

	let e = builtins::matmul().apply(&[&a, &b]).unwrap_err();
	assert_eq!(e.code, UFuncError::CoreDimension);
	assert_eq!(e.category(), ErrorCategory::ValueError);
	assert_eq!(
		e.message(),
		"matmul: Input operand 1 has a mismatch in its core dimension 0, with gufunc signature (m,n),(n,p)->(m,p) (size 4 is different from 3)"
	);

	let v = device_f64(&ramp(&[3], 1.0), DeviceId(0));
	let e = builtins::matmul().apply(&[&v, &a]).unwrap_err();
	assert_eq!(e.code, UFuncError::CoreDimension);

	// Loop dimensions broadcast, core dimensions do not.
	let x = device_f64(&ramp(&[2, 4], 1.0), DeviceId(0));
	let y = device_f64(&ramp(&[3, 4], 1.0), DeviceId(0));
	let e = builtins::inner1d().apply(&[&x, &y]).unwrap_err();
	assert_eq!(e.code, UFuncError::Broadcast);
	Ok(())
}

#[test]
fn test_matmul_into_out() -> Result<(), ErrPack<UFuncError>> {
	let x = ramp(&[2, 3], 1.0);
	let y = ramp(&[3, 2], 2.0);
	let a = device_f64(&x, DeviceId(0));
	let b = device_f64(&y, DeviceId(0));

	let out = DeviceArray::new_empty(&[2, 2], DType::F64, DeviceId(0), Order::F)?;
	builtins::matmul().apply_out(&[&a, &b], &[&out])?;
	let x2 = x.view().into_dimensionality::<Ix2>().unwrap();
	let y2 = y.view().into_dimensionality::<Ix2>().unwrap();
	assert_all_close(&host_f64(&out), &x2.dot(&y2).into_dyn());

	// The output fixes the size of core dimensions it shares with the inputs.
	let wrong = DeviceArray::new_empty(&[2, 3], DType::F64, DeviceId(0), Order::C)?;
	let e = builtins::matmul().apply_out(&[&a, &b], &[&wrong]).unwrap_err();
	assert_eq!(e.code, UFuncError::CoreDimension);
	Ok(())
}

#[test]
fn test_where_rejected() -> Result<(), ErrPack<UFuncError>> {
	let a = DeviceArray::from_slice(&[1.0_f64, 2.0, 3.0, 4.0], &[2, 2], DeviceId(0))?;
	let out = DeviceArray::from_slice(&[-1.0_f64; 4], &[2, 2], DeviceId(0))?;
	let mask = DeviceArray::from_slice(&[false], &[1], DeviceId(0))?;

	let e = builtins::matmul()
		.call(&[Arg::from(&a), Arg::from(&a)], &[("out", (&out).into()), ("where", (&mask).into())])
		.unwrap_err();
	assert_eq!(e.code, UFuncError::UnknownKeyword);
	assert_eq!(e.category(), ErrorCategory::TypeError);
	assert_eq!(e.message(), "'where' is an invalid keyword to ufunc 'matmul'");
	assert_eq!(out.to_vec::<f64>()?, vec![-1.0; 4]);
	Ok(())
}
