//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::array::DeviceArray;
use crate::array::dtype::DType;
use crate::array::layout::{self, Order, TrivialLayout, TrivialOrder};
use crate::device::Device;
use crate::error::UFuncResult;
use crate::ufunc::UFunc;

use super::{Operands, assign};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
	TrivialUnary,
	TrivialBinary,
	Iterator,
	MaskedIterator,
	Generalized,
}

/// Strategy before looking at layouts. `Iterator` may still become trivial.
pub fn select(ufunc: &UFunc, masked: bool) -> Strategy {
	if ufunc.core_signature().is_some() {
		Strategy::Generalized
	} else if masked {
		Strategy::MaskedIterator
	} else {
		Strategy::Iterator
	}
}

/// A call that runs as a single inner loop invocation.
#[derive(Debug)]
pub struct TrivialPlan {
	pub strategy: Strategy,
	pub ptrs: ArrayVec<*mut u8, 3>,
	pub strides: ArrayVec<isize, 3>,
	pub count: usize,
}

/// Checks whether a `1 -> 1` or `2 -> 1` call can skip the iterator.
///
/// Small inputs of the wrong dtype or alignment are copied to the loop dtype
/// first, which replaces them in `operands`. A missing output is allocated in
/// the layout of the larger input. Returns `None` when the iterator is needed.
pub fn trivial_plan(
	ufunc: &UFunc,
	operands: &mut Operands,
	dtypes: &[DType],
	order: Order,
	buffer_size: usize,
	device: &Arc<dyn Device>,
) -> UFuncResult<Option<TrivialPlan>> {
	let strategy = match (ufunc.nin(), ufunc.nout()) {
		(1, 1) => Strategy::TrivialUnary,
		(2, 1) => Strategy::TrivialBinary,
		_ => return Ok(None),
	};
	let nin = ufunc.nin();

	for (op, &dtype) in operands.iter_mut().zip(dtypes).take(nin) {
		let Some(array) = op else {
			return Ok(None);
		};
		if array.dtype() == dtype && array.is_aligned() {
			continue;
		}
		let small = array.ndim() == 0 || (array.ndim() == 1 && array.size() <= buffer_size);
		if !small {
			return Ok(None);
		}
		let copy = array.new_like(Some(dtype), Order::C)?;
		assign::assign(&copy, array)?;
		log::debug!("trivial loop: copied small input from {} to {dtype}", array.dtype());
		*op = Some(copy);
	}

	let inputs: ArrayVec<&DeviceArray, 2> = operands.iter().take(nin).flatten().collect();
	let out_dtype = dtypes.get(nin).copied();
	let output = operands.get(nin).and_then(Option::as_ref);

	let shape: &[usize] = match output {
		Some(out) => {
			if Some(out.dtype()) != out_dtype
				|| !out.is_aligned()
				|| inputs.iter().any(|a| a.ndim() > out.ndim())
			{
				return Ok(None);
			}
			out.shape()
		},
		None => {
			if !matches!(order, Order::A | Order::K) {
				return Ok(None);
			}
			match inputs.iter().max_by_key(|a| (a.ndim(), a.size())) {
				Some(a) => a.shape(),
				None => return Ok(None),
			}
		},
	};
	let count = layout::size_of_shape(shape);

	let mut layouts: ArrayVec<TrivialLayout, 3> = ArrayVec::new();
	for array in inputs.iter().copied().chain(output) {
		let l = if array.shape() == shape {
			layout::trivial_layout(array.shape(), array.strides(), array.itemsize())
		} else if array.size() == 1 && array.ndim() <= shape.len() {
			Some(TrivialLayout { order: TrivialOrder::Any, stride: 0, count })
		} else {
			None
		};
		let Some(l) = l else {
			return Ok(None);
		};
		layouts.push(l);
	}
	let mut common = TrivialOrder::Any;
	for l in &layouts {
		match (common, l.order) {
			(_, TrivialOrder::Any) => {},
			(TrivialOrder::Any, o) => common = o,
			(a, b) if a == b => {},
			_ => return Ok(None),
		}
	}

	let mut ptrs: ArrayVec<*mut u8, 3> = inputs.iter().map(|a| unsafe { a.data().as_ptr::<u8>() }).collect();
	let mut strides: ArrayVec<isize, 3> = layouts.iter().take(nin).map(|l| l.stride).collect();
	let mut allocated = None;
	match output {
		Some(out) => {
			ptrs.push(unsafe { out.data().as_ptr::<u8>() });
			strides.push(layouts.get(nin).map_or(0, |l| l.stride));
		},
		None => {
			let Some(dtype) = out_dtype else {
				return Ok(None);
			};
			let alloc_order = if common == TrivialOrder::F { Order::F } else { Order::C };
			let out = DeviceArray::new_empty_on(shape, dtype, device.clone(), alloc_order)?;
			ptrs.push(unsafe { out.data().as_ptr::<u8>() });
			strides.push(if count <= 1 { 0 } else { dtype.itemsize() as isize });
			allocated = Some(out);
		},
	}
	drop(inputs);
	if let (Some(out), Some(slot)) = (allocated, operands.get_mut(nin)) {
		*slot = Some(out);
	}

	log::debug!("ufunc '{}': {strategy:?} over {count} elements", ufunc.name());
	Ok(Some(TrivialPlan { strategy, ptrs, strides, count }))
}

//--------------------------------------------------------------------------------------------------
