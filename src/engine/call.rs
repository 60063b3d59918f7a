//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Top-level ufunc call: binds the arguments, resolves placement and types,
//! picks a strategy and runs it.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::array::DeviceArray;
use crate::array::dtype::DType;
use crate::array::layout::Order;
use crate::config::Config;
use crate::device::{self, AuxData, Device, FpStatus};
use crate::error::{UFuncError, UFuncResult, err};
use crate::ufunc::UFunc;
use crate::util::cold_path;

use super::args::{self, Arg, KwValue};
use super::dispatch::{self, Executor, MaskedLoop};
use super::iter::{BroadcastIter, IterOperand, IterSpec, OpFlags};
use super::strategy::{self, Strategy};
use super::typeres::{self, ResolvedLoop};
use super::{Dispatch, Operands, assign, generalized, placement};

//--------------------------------------------------------------------------------------------------

/// An output replaced by a temporary because it overlaps an input.
struct Aliased {
	op: usize,
	target: DeviceArray,
}

/// Replaces outputs that share memory with an input, without being the very
/// same view, by fresh arrays. With `keep_contents` the temporaries start as a
/// copy of the output.
fn unalias_outputs(nin: usize, operands: &mut Operands, keep_contents: bool) -> UFuncResult<Vec<Aliased>> {
	let mut aliased = Vec::new();
	for op in nin..operands.len() {
		let Some(out) = &operands[op] else {
			continue;
		};
		let conflict = operands[..nin]
			.iter()
			.flatten()
			.any(|input| input.overlaps(out) && !input.is_same_view(out));
		if !conflict {
			continue;
		}
		let tmp = out.new_like(None, Order::K)?;
		if keep_contents {
			assign::assign(&tmp, out)?;
		}
		log::debug!("output {} overlaps an input, computing into a temporary", op - nin);
		aliased.push(Aliased { op, target: out.clone() });
		operands[op] = Some(tmp);
	}
	Ok(aliased)
}

/// Calls `ufunc` with positional `args` and keyword `kwargs`.
///
/// Returns the output arrays, or `NotImplemented` when the operand types are
/// not handled by this ufunc.
pub fn call(
	ufunc: &UFunc,
	args: &[Arg],
	kwargs: &[(&str, KwValue)],
) -> UFuncResult<Dispatch<Vec<DeviceArray>>> {
	// Generalized loops have no masked variant.
	let allow_where = ufunc.core_signature().is_none();
	let Dispatch::Done(bound) = args::bind(ufunc, args, kwargs, allow_where)? else {
		return Ok(Dispatch::NotImplemented);
	};
	let config = bound.config.unwrap_or_else(Config::defaults);
	let mut operands = bound.operands;
	let where_mask = bound.where_mask;

	placement::resolve_device(operands.iter().map(Option::as_ref).chain([where_mask.as_ref()]))?;
	if where_mask.is_some() && ufunc.nargs() >= MAXARGS {
		cold_path();
		return err(
			UFuncError::InvalidArguments,
			format!("ufunc '{}' has too many operands to use 'where'", ufunc.name()),
		);
	}

	let resolved =
		match typeres::resolve_types(ufunc, bound.casting, &operands, bound.type_override.as_ref())? {
			Dispatch::Done(resolved) => resolved,
			Dispatch::NotImplemented => return Ok(Dispatch::NotImplemented),
		};
	let device = device::device(bound.device)?;

	let aliased = unalias_outputs(ufunc.nin(), &mut operands, where_mask.is_some())?;

	let fp = FpStatus::default();
	let aux: Option<&AuxData> = resolved.aux.as_deref();
	let exec = Executor::new(device.as_ref(), resolved.func, aux, &fp)
		.with_host_lock(config.host_lock.as_deref(), resolved.needs_api());

	match strategy::select(ufunc, where_mask.is_some()) {
		Strategy::Generalized => {
			generalized::execute(ufunc, &mut operands, &resolved, bound.order, &device, &exec)?;
		},
		Strategy::MaskedIterator => {
			let Some(mask) = where_mask else {
				cold_path();
				return err(UFuncError::Internal, "masked strategy without a mask");
			};
			run_masked(ufunc, &mut operands, &resolved, mask, bound.order, &device, &config, &fp)?;
		},
		_ => {
			let plan = strategy::trivial_plan(
				ufunc,
				&mut operands,
				&resolved.dtypes,
				bound.order,
				config.buffer_size,
				&device,
			)?;
			match plan {
				Some(plan) => exec.execute(&plan.ptrs, &plan.strides, plan.count)?,
				None => run_iterator(ufunc, &mut operands, &resolved, bound.order, &device, &exec)?,
			}
		},
	}

	for Aliased { op, target } in aliased {
		if let Some(tmp) = &operands[op] {
			assign::assign(&target, tmp)?;
		}
		operands[op] = Some(target);
	}

	config.handle_fp_flags(ufunc.name(), fp.take())?;

	let mut outputs = Vec::with_capacity(ufunc.nout());
	for out in operands.into_iter().skip(ufunc.nin()) {
		let Some(out) = out else {
			cold_path();
			return err(UFuncError::Internal, format!("ufunc '{}' left an output unallocated", ufunc.name()));
		};
		outputs.push(out);
	}
	Ok(Dispatch::Done(outputs))
}

//--------------------------------------------------------------------------------------------------

fn iter_operands(ufunc: &UFunc, operands: &Operands, dtypes: &[DType]) -> Vec<IterOperand> {
	operands
		.iter()
		.zip(dtypes)
		.enumerate()
		.map(|(op, (array, &dtype))| IterOperand::new(array.clone(), dtype, ufunc.op_flags(op)))
		.collect()
}

fn store_outputs(operands: &mut Operands, arrays: ArrayVec<DeviceArray, MAXARGS>) {
	for (slot, array) in operands.iter_mut().zip(arrays) {
		*slot = Some(array);
	}
}

fn run_iterator(
	ufunc: &UFunc,
	operands: &mut Operands,
	resolved: &ResolvedLoop,
	order: Order,
	device: &Arc<dyn Device>,
	exec: &Executor,
) -> UFuncResult<()> {
	let ops = iter_operands(ufunc, operands, &resolved.dtypes);
	let spec = IterSpec { order, ndim: None, device: device.clone() };
	let mut iter = BroadcastIter::new(ops, &spec)?;
	log::debug!("ufunc '{}': iterator loop over {} elements", ufunc.name(), iter.iter_size());
	iter.run(|it| exec.execute(it.ptrs(), it.inner_strides(), it.inner_count()))?;
	store_outputs(operands, iter.finish()?);
	Ok(())
}

/// Iterator loop with the `where=` mask as an extra read operand. Elements
/// where the mask is false keep the previous contents of the outputs.
fn run_masked(
	ufunc: &UFunc,
	operands: &mut Operands,
	resolved: &ResolvedLoop,
	mask: DeviceArray,
	order: Order,
	device: &Arc<dyn Device>,
	config: &Config,
	fp: &FpStatus,
) -> UFuncResult<()> {
	let nop = ufunc.nargs();
	let mut ops = iter_operands(ufunc, operands, &resolved.dtypes);
	ops.push(IterOperand::new(Some(mask), DType::Bool, OpFlags::INPUT));
	let spec = IterSpec { order, ndim: None, device: device.clone() };
	let mut iter = BroadcastIter::new(ops, &spec)?;
	log::debug!("ufunc '{}': masked iterator loop over {} elements", ufunc.name(), iter.iter_size());

	let masked = MaskedLoop { func: resolved.func, aux: resolved.aux.clone(), nop };
	let exec = Executor::new(device.as_ref(), dispatch::masked_loop, Some(&masked), fp)
		.with_host_lock(config.host_lock.as_deref(), resolved.needs_api());
	iter.run(|it| exec.execute(it.ptrs(), it.inner_strides(), it.inner_count()))?;

	let mut arrays = iter.finish()?;
	arrays.truncate(nop);
	store_outputs(operands, arrays);
	Ok(())
}

//--------------------------------------------------------------------------------------------------
