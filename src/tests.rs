//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use crate::DeviceArray;
use crate::device::sim::SimDevice;
use crate::device::{Device, DeviceId};
use crate::runtime;

mod test_call;
mod test_gufunc;

//--------------------------------------------------------------------------------------------------

/// A fresh simulated device, so offload counts are not shared with other tests.
fn private_device() -> (DeviceId, Arc<SimDevice>) {
	let mut sim = None;
	let id = runtime::register_device(|id| {
		let device = SimDevice::new(id);
		sim = Some(device.clone());
		device as Arc<dyn Device>
	});
	(id, sim.unwrap())
}

fn host_f64(array: &DeviceArray) -> ndarray::ArrayD<f64> {
	runtime::to_host::<f64>(array).unwrap()
}

fn device_f64(host: &ndarray::ArrayD<f64>, device: DeviceId) -> DeviceArray {
	runtime::to_device(host, Some(device)).unwrap()
}

/// `0, 1, 2, ...` scaled by `scale`, in the given shape.
fn ramp(shape: &[usize], scale: f64) -> ndarray::ArrayD<f64> {
	let size = shape.iter().product::<usize>();
	let data: Vec<f64> = (0..size).map(|i| i as f64 * scale).collect();
	ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(shape), data).unwrap()
}
