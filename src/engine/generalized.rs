//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Generalized ufuncs: loops over core dimensions inside each element.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::array::layout::Order;
use crate::device::Device;
use crate::error::{UFuncError, UFuncResult, err};
use crate::ufunc::UFunc;
use crate::ufunc::signature::CoreSignature;
use crate::util::cold_path;

use super::Operands;
use super::dispatch::Executor;
use super::iter::{BroadcastIter, IterOperand, IterSpec};
use super::typeres::ResolvedLoop;

//--------------------------------------------------------------------------------------------------

/// Limit on loop dimensions plus core dimensions of one operand.
pub const MAX_DIMS: usize = 32;

pub type CoreShape = SmallVec<[usize; 4]>;

/// Sizes of the named core dimensions and the core shape of every operand.
#[derive(Debug)]
pub struct CoreDims {
	pub sizes: SmallVec<[usize; 8]>,
	pub shapes: Vec<CoreShape>,
}

fn operand_name(ufunc: &UFunc, op: usize) -> (&'static str, usize) {
	if op < ufunc.nin() { ("Input", op) } else { ("Output", op - ufunc.nin()) }
}

/// Checks the core dimensions of all present operands against `core`.
pub fn core_dims(ufunc: &UFunc, core: &CoreSignature, operands: &Operands) -> UFuncResult<CoreDims> {
	let name = ufunc.name();
	let sig = core.as_str();
	let mut sizes: SmallVec<[Option<usize>; 8]> = SmallVec::from_elem(None, core.num_dims());

	for (op, array) in operands.iter().enumerate() {
		let Some(array) = array else {
			continue;
		};
		let (kind, j) = operand_name(ufunc, op);
		let n = core.operand_ndim(op);
		let ndim = array.ndim();
		if ndim < n {
			cold_path();
			return err(
				UFuncError::CoreDimension,
				format!(
					"{name}: {kind} operand {j} does not have enough dimensions (has {ndim}, gufunc core with signature {sig} requires {n})"
				),
			);
		}
		if ndim > MAX_DIMS {
			cold_path();
			return err(UFuncError::CoreDimension, format!("too many dimensions for generalized ufunc {name}"));
		}
		let core_shape = &array.shape()[ndim - n..];
		for (k, (&dim, &size)) in core.operand_dims(op).iter().zip(core_shape).enumerate() {
			match sizes.get_mut(dim) {
				Some(slot @ None) => *slot = Some(size),
				Some(Some(known)) if *known != size => {
					cold_path();
					return err(
						UFuncError::CoreDimension,
						format!(
							"{name}: {kind} operand {j} has a mismatch in its core dimension {k}, with gufunc signature {sig} (size {size} is different from {known})"
						),
					);
				},
				_ => {},
			}
		}
	}

	let mut shapes = Vec::with_capacity(ufunc.nargs());
	for op in 0..ufunc.nargs() {
		let mut shape = CoreShape::new();
		for (k, &dim) in core.operand_dims(op).iter().enumerate() {
			let Some(Some(size)) = sizes.get(dim) else {
				cold_path();
				let (kind, j) = operand_name(ufunc, op);
				return err(
					UFuncError::CoreDimension,
					format!(
						"{name}: {kind} operand {j} has core dimension {k} unspecified, with gufunc signature {sig}"
					),
				);
			};
			shape.push(*size);
		}
		shapes.push(shape);
	}
	Ok(CoreDims {
		sizes: sizes.into_iter().map(|s| s.unwrap_or(0)).collect(),
		shapes,
	})
}

/// Runs a generalized ufunc. Missing outputs are allocated in `operands`.
pub fn execute(
	ufunc: &UFunc,
	operands: &mut Operands,
	resolved: &ResolvedLoop,
	order: Order,
	device: &Arc<dyn Device>,
	exec: &Executor,
) -> UFuncResult<()> {
	let Some(core) = ufunc.core_signature() else {
		cold_path();
		return err(UFuncError::Internal, format!("ufunc '{}' has no core signature", ufunc.name()));
	};
	let dims = core_dims(ufunc, core, operands)?;

	let ops: Vec<IterOperand> = operands
		.iter()
		.zip(&resolved.dtypes)
		.zip(&dims.shapes)
		.enumerate()
		.map(|(op, ((array, &dtype), shape))| {
			IterOperand::new(array.clone(), dtype, ufunc.op_flags(op)).with_core_shape(shape)
		})
		.collect();
	let spec = IterSpec { order, ndim: None, device: device.clone() };
	let mut iter = BroadcastIter::new(ops, &spec)?;
	if iter.shape().len() + dims.shapes.iter().map(SmallVec::len).max().unwrap_or(0) > MAX_DIMS {
		cold_path();
		return err(
			UFuncError::CoreDimension,
			format!("too many dimensions for generalized ufunc {}", ufunc.name()),
		);
	}

	let core_strides: SmallVec<[isize; 16]> =
		(0..ufunc.nargs()).flat_map(|op| iter.core_strides(op).iter().copied()).collect();
	log::debug!(
		"ufunc '{}': generalized loop, core dims {:?}, {} elements",
		ufunc.name(),
		dims.sizes.as_slice(),
		iter.iter_size()
	);
	iter.run(|it| {
		exec.execute_core(it.ptrs(), it.inner_strides(), it.inner_count(), &dims.sizes, &core_strides)
	})?;

	let arrays = iter.finish()?;
	for (slot, array) in operands.iter_mut().zip(arrays) {
		*slot = Some(array);
	}
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::array::DeviceArray;
	use crate::array::dtype::DType;
	use crate::device::DeviceId;
	use crate::ufunc::builtins;

	fn array(shape: &[usize]) -> Option<DeviceArray> {
		Some(DeviceArray::new_empty(shape, DType::F64, DeviceId(0), Order::C).unwrap())
	}

	#[test]
	fn test_core_dims() {
		let matmul = builtins::matmul();
		let core = matmul.core_signature().unwrap();

		let ops: Operands = [array(&[5, 2, 3]), array(&[3, 4]), None].into_iter().collect();
		let dims = core_dims(matmul, core, &ops).unwrap();
		assert_eq!(dims.sizes.as_slice(), &[2, 3, 4]);
		assert_eq!(dims.shapes[2].as_slice(), &[2, 4]);

		let ops: Operands = [array(&[2, 3]), array(&[4, 4]), None].into_iter().collect();
		let e = core_dims(matmul, core, &ops).unwrap_err();
		assert_eq!(e.code, UFuncError::CoreDimension);
		assert_eq!(
			e.message(),
			"matmul: Input operand 1 has a mismatch in its core dimension 0, with gufunc signature (m,n),(n,p)->(m,p) (size 4 is different from 3)"
		);

		let ops: Operands = [array(&[3]), array(&[3, 4]), None].into_iter().collect();
		let e = core_dims(matmul, core, &ops).unwrap_err();
		assert_eq!(
			e.message(),
			"matmul: Input operand 0 does not have enough dimensions (has 1, gufunc core with signature (m,n),(n,p)->(m,p) requires 2)"
		);
	}

	#[test]
	fn test_unspecified_output_dim() {
		let u = UFunc::new("spread", 1, 1, crate::ufunc::Identity::None)
			.unwrap()
			.with_signature("(n)->(n,k)")
			.unwrap();
		let core = u.core_signature().unwrap();
		let ops: Operands = [array(&[3]), None].into_iter().collect();
		let e = core_dims(&u, core, &ops).unwrap_err();
		assert_eq!(
			e.message(),
			"spread: Output operand 0 has core dimension 1 unspecified, with gufunc signature (n)->(n,k)"
		);
	}
}
