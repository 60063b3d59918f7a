//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Selection of the inner loop and the operand dtypes of a call.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::array::dtype::{Casting, DType, DTypeKind, Scalar};
use crate::device::{AuxData, DevicePtr, InnerLoopFn};
use crate::error::{UFuncError, UFuncResult, err};
use crate::ufunc::UFunc;
use crate::ufunc::loops::{LoopEntry, LoopSource};
use crate::util::cold_path;

use super::args::TypeOverride;
use super::{Dispatch, Operands};

//--------------------------------------------------------------------------------------------------

/// Machine words of host scratch per input.
pub const SCRATCH_WORDS: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OperandData {
	Device(DevicePtr),
	/// Staged copy of a 0-d operand in host memory.
	Host(*const u8),
}

/// What a type resolver sees of one operand.
#[derive(Debug, Clone)]
pub struct OperandView<'a> {
	pub dtype: DType,
	pub shape: &'a [usize],
	data: OperandData,
}

impl OperandView<'_> {
	pub fn ndim(&self) -> usize {
		self.shape.len()
	}

	/// Value of a 0-d operand, available while its data is staged on the host.
	pub fn host_value(&self) -> Option<Scalar> {
		match self.data {
			OperandData::Host(ptr) if self.shape.is_empty() => unsafe { Scalar::read(ptr, self.dtype) },
			_ => None,
		}
	}
}

#[derive(Clone)]
pub struct ResolvedLoop {
	pub dtypes: ArrayVec<DType, MAXARGS>,
	pub func: InnerLoopFn,
	pub aux: Option<Arc<AuxData>>,
	pub source: LoopSource,
}

impl ResolvedLoop {
	fn from_entry(source: LoopSource, entry: &LoopEntry) -> Self {
		Self {
			dtypes: entry.types.clone(),
			func: entry.func,
			aux: entry.aux.clone(),
			source,
		}
	}

	/// True if some dtype needs the host API, i.e. has ownership semantics.
	pub fn needs_api(&self) -> bool {
		self.dtypes.iter().any(|d| d.needs_api())
	}
}

impl std::fmt::Debug for ResolvedLoop {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ResolvedLoop")
			.field("dtypes", &self.dtypes.as_slice())
			.field("source", &self.source)
			.finish_non_exhaustive()
	}
}

/// Picks the loop of a call. `views` holds the inputs followed by the outputs;
/// absent outputs are `None`.
pub trait TypeResolver: Send + Sync {
	fn resolve(
		&self,
		ufunc: &UFunc,
		casting: Casting,
		views: &[Option<OperandView>],
		type_override: Option<&TypeOverride>,
	) -> UFuncResult<Dispatch<ResolvedLoop>>;
}

//--------------------------------------------------------------------------------------------------

/// Points the views of 0-d inputs at host copies of their element and puts
/// the device pointers back when dropped.
struct ScratchGuard<'v, 'a> {
	views: &'v mut [Option<OperandView<'a>>],
	saved: ArrayVec<(usize, DevicePtr), MAXARGS>,
}

impl<'v, 'a> ScratchGuard<'v, 'a> {
	fn stage(
		views: &'v mut [Option<OperandView<'a>>],
		operands: &Operands,
		scratch: &'v mut [[u64; SCRATCH_WORDS]],
	) -> UFuncResult<Self> {
		let mut guard = Self { views, saved: ArrayVec::new() };
		for ((i, slot), words) in guard.views.iter_mut().enumerate().zip(scratch.iter_mut()) {
			let (Some(view), Some(Some(array))) = (slot, operands.get(i)) else {
				continue;
			};
			let OperandData::Device(device_ptr) = view.data else {
				continue;
			};
			if view.ndim() != 0 || !view.dtype.is_numeric() {
				continue;
			}
			let host: *mut u8 = words.as_mut_ptr().cast();
			unsafe { array.device().download_data(device_ptr, host, view.dtype.itemsize())? };
			guard.saved.push((i, device_ptr));
			view.data = OperandData::Host(host);
		}
		Ok(guard)
	}

	fn views(&self) -> &[Option<OperandView<'a>>] {
		self.views
	}
}

impl Drop for ScratchGuard<'_, '_> {
	fn drop(&mut self) {
		for &(i, ptr) in &self.saved {
			if let Some(Some(view)) = self.views.get_mut(i) {
				view.data = OperandData::Device(ptr);
			}
		}
	}
}

/// Runs the type resolver of `ufunc` on `operands`.
///
/// The single element of every 0-d input is copied to host scratch first, so
/// the resolver can look at scalar values.
pub fn resolve_types(
	ufunc: &UFunc,
	casting: Casting,
	operands: &Operands,
	type_override: Option<&TypeOverride>,
) -> UFuncResult<Dispatch<ResolvedLoop>> {
	let nin = ufunc.nin();
	let mut scratch = [[0_u64; SCRATCH_WORDS]; MAXARGS];
	let mut views: ArrayVec<Option<OperandView>, MAXARGS> = operands
		.iter()
		.map(|op| {
			op.as_ref().map(|array| OperandView {
				dtype: array.dtype(),
				shape: array.shape(),
				data: OperandData::Device(array.data()),
			})
		})
		.collect();
	let scratch = scratch.get_mut(..nin).unwrap_or_default();
	let guard = ScratchGuard::stage(&mut views, operands, scratch)?;
	let result = ufunc.resolver().resolve(ufunc, casting, guard.views(), type_override);
	drop(guard);
	let resolved = match result? {
		Dispatch::Done(resolved) => resolved,
		Dispatch::NotImplemented => return Ok(Dispatch::NotImplemented),
	};
	if resolved.dtypes.len() != ufunc.nargs() {
		cold_path();
		return err(
			UFuncError::Internal,
			format!("type resolver of ufunc '{}' returned a wrong number of dtypes", ufunc.name()),
		);
	}
	log::debug!(
		"ufunc '{}': resolved loop {:?} ({:?})",
		ufunc.name(),
		resolved.dtypes.as_slice(),
		resolved.source
	);
	Ok(Dispatch::Done(resolved))
}

//--------------------------------------------------------------------------------------------------

/// Linear search over the loop table, user loops first.
///
/// Inputs must cast safely (or by the stricter requested rule) to the loop
/// types. A 0-d input of no higher kind than the array inputs is judged by its
/// value, so `int8_array + 1` stays `int8`.
pub struct DefaultTypeResolver;

fn kind_rank(dtype: DType) -> Option<u8> {
	match dtype.kind() {
		DTypeKind::Bool => Some(0),
		DTypeKind::Uint | DTypeKind::Int => Some(1),
		DTypeKind::Float => Some(2),
		DTypeKind::Object | DTypeKind::Bytes => None,
	}
}

struct InputCheck {
	dtype: DType,
	/// Set when the input is judged by its value.
	value: Option<Scalar>,
}

impl InputCheck {
	fn can_cast(&self, to: DType, casting: Casting) -> bool {
		match self.value {
			Some(value) => {
				let min = value.min_dtype();
				// A non-negative value also fits a signed type of the same kind.
				min.can_cast(to, casting)
					|| (casting >= Casting::Safe
						&& min.kind() == DTypeKind::Uint
						&& to.kind() == DTypeKind::Int
						&& value.as_u64() <= signed_max(to))
			},
			None => self.dtype.can_cast(to, casting),
		}
	}
}

fn signed_max(dtype: DType) -> u64 {
	(1_u64 << (dtype.itemsize() * 8 - 1)) - 1
}

impl DefaultTypeResolver {
	fn input_checks(nin: usize, views: &[Option<OperandView>]) -> ArrayVec<InputCheck, MAXARGS> {
		let inputs = views.iter().take(nin).flatten();
		let max_array_rank = inputs.clone().filter(|v| v.ndim() > 0).filter_map(|v| kind_rank(v.dtype)).max();
		inputs
			.map(|view| {
				let by_value = view.ndim() == 0
					&& matches!((kind_rank(view.dtype), max_array_rank), (Some(r), Some(m)) if r <= m);
				InputCheck {
					dtype: view.dtype,
					value: if by_value { view.host_value() } else { None },
				}
			})
			.collect()
	}

	fn check_outputs(
		ufunc: &UFunc,
		casting: Casting,
		views: &[Option<OperandView>],
		entry: &LoopEntry,
	) -> UFuncResult<()> {
		let nin = ufunc.nin();
		for (view, &t) in views.iter().skip(nin).zip(entry.outputs(nin)) {
			if let Some(view) = view
				&& !t.can_cast(view.dtype, casting)
			{
				cold_path();
				return err(
					UFuncError::TypeResolution,
					format!(
						"Cannot cast ufunc '{}' output from dtype('{t}') to dtype('{}') with casting rule '{casting}'",
						ufunc.name(),
						view.dtype
					),
				);
			}
		}
		Ok(())
	}
}

impl TypeResolver for DefaultTypeResolver {
	fn resolve(
		&self,
		ufunc: &UFunc,
		casting: Casting,
		views: &[Option<OperandView>],
		type_override: Option<&TypeOverride>,
	) -> UFuncResult<Dispatch<ResolvedLoop>> {
		let nin = ufunc.nin();
		let checks = Self::input_checks(nin, views);
		let loops = ufunc.loops();

		if let Some(type_override) = type_override {
			let pattern = type_override.pattern(nin, ufunc.nargs());
			let found = loops.iter().find(|(_, entry)| {
				entry.types.iter().zip(pattern.iter()).all(|(t, p)| p.is_none_or(|p| p == *t))
					&& checks.iter().zip(entry.inputs(nin)).all(|(c, &t)| c.can_cast(t, casting))
			});
			let Some((source, entry)) = found else {
				cold_path();
				return err(
					UFuncError::TypeResolution,
					format!(
						"No loop matching the specified signature and casting was found for ufunc {}",
						ufunc.name()
					),
				);
			};
			Self::check_outputs(ufunc, casting, views, entry)?;
			return Ok(Dispatch::Done(ResolvedLoop::from_entry(source, entry)));
		}

		let input_casting = casting.min(Casting::Safe);
		let found = loops.iter().find(|(_, entry)| {
			checks.iter().zip(entry.inputs(nin)).all(|(c, &t)| c.can_cast(t, input_casting))
		});
		let Some((source, entry)) = found else {
			if checks.iter().any(|c| c.dtype.is_flexible()) {
				return Ok(Dispatch::NotImplemented);
			}
			cold_path();
			let types: Vec<String> = checks.iter().map(|c| c.dtype.to_string()).collect();
			return err(
				UFuncError::TypeResolution,
				format!(
					"ufunc '{}' not supported for the input types ({}), and the inputs could not be safely coerced to any supported types according to the casting rule '{casting}'",
					ufunc.name(),
					types.join(", ")
				),
			);
		};
		Self::check_outputs(ufunc, casting, views, entry)?;
		Ok(Dispatch::Done(ResolvedLoop::from_entry(source, entry)))
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::array::DeviceArray;
	use crate::array::layout::Order;
	use crate::device::DeviceId;
	use crate::ufunc::builtins;

	fn operands(arrays: &[Option<DeviceArray>]) -> Operands {
		arrays.iter().cloned().collect()
	}

	fn resolve(ufunc: &UFunc, ops: &Operands) -> Vec<DType> {
		resolve_types(ufunc, Casting::SameKind, ops, None)
			.unwrap()
			.done()
			.unwrap()
			.dtypes
			.to_vec()
	}

	#[test]
	fn test_array_promotion() {
		let a = DeviceArray::new_empty(&[3], DType::I8, DeviceId(0), Order::C).unwrap();
		let b = DeviceArray::new_empty(&[3], DType::U8, DeviceId(0), Order::C).unwrap();
		let ops = operands(&[Some(a), Some(b), None]);
		assert_eq!(resolve(builtins::add(), &ops), vec![DType::I16; 3]);
	}

	#[test]
	fn test_value_based_scalar() {
		let dev = crate::device::device(DeviceId(0)).unwrap();
		let a = DeviceArray::new_empty(&[3], DType::I8, DeviceId(0), Order::C).unwrap();
		let small = DeviceArray::from_scalar(Scalar::Int(3), DType::I64, dev.clone()).unwrap();
		let big = DeviceArray::from_scalar(Scalar::Int(1000), DType::I64, dev.clone()).unwrap();
		let float = DeviceArray::from_scalar(Scalar::Float(0.5), DType::F64, dev).unwrap();

		let ops = operands(&[Some(a.clone()), Some(small.clone()), None]);
		assert_eq!(resolve(builtins::add(), &ops), vec![DType::I8; 3]);

		let ops = operands(&[Some(a.clone()), Some(big), None]);
		assert_eq!(resolve(builtins::add(), &ops), vec![DType::I16; 3]);

		// A float scalar is of a higher kind than an int array, so its dtype counts.
		let ops = operands(&[Some(a), Some(float), None]);
		assert_eq!(resolve(builtins::add(), &ops), vec![DType::F64; 3]);

		// Only scalars: plain dtype rules.
		let ops = operands(&[Some(small.clone()), Some(small), None]);
		assert_eq!(resolve(builtins::add(), &ops), vec![DType::I64; 3]);
	}

	#[test]
	fn test_scratch_restored() {
		let dev = crate::device::device(DeviceId(0)).unwrap();
		let s = DeviceArray::from_scalar(Scalar::Float(2.0), DType::F64, dev).unwrap();
		let ops = operands(&[Some(s.clone())]);
		let mut views: ArrayVec<Option<OperandView>, MAXARGS> = ops
			.iter()
			.map(|op| {
				op.as_ref().map(|a| OperandView {
					dtype: a.dtype(),
					shape: a.shape(),
					data: OperandData::Device(a.data()),
				})
			})
			.collect();
		let mut scratch = [[0_u64; SCRATCH_WORDS]; 1];
		{
			let guard = ScratchGuard::stage(&mut views, &ops, &mut scratch).unwrap();
			assert_eq!(guard.views()[0].as_ref().unwrap().host_value(), Some(Scalar::Float(2.0)));
		}
		let view = views[0].as_ref().unwrap();
		assert_eq!(view.data, OperandData::Device(s.data()));
		assert_eq!(view.host_value(), None);
	}

	#[test]
	fn test_output_cast_error() {
		let a = DeviceArray::new_empty(&[3], DType::F64, DeviceId(0), Order::C).unwrap();
		let out = DeviceArray::new_empty(&[3], DType::I32, DeviceId(0), Order::C).unwrap();
		let ops = operands(&[Some(a.clone()), Some(a), Some(out)]);
		let e = resolve_types(builtins::add(), Casting::SameKind, &ops, None).unwrap_err();
		assert_eq!(e.code, UFuncError::TypeResolution);
		assert_eq!(
			e.message(),
			"Cannot cast ufunc 'add' output from dtype('float64') to dtype('int32') with casting rule 'same_kind'"
		);
	}

	#[test]
	fn test_override() {
		let a = DeviceArray::new_empty(&[3], DType::I32, DeviceId(0), Order::C).unwrap();
		let ops = operands(&[Some(a.clone()), Some(a), None]);
		let r = resolve_types(builtins::add(), Casting::SameKind, &ops, Some(&TypeOverride::Output(DType::F32)))
			.unwrap()
			.done()
			.unwrap();
		assert_eq!(r.dtypes.as_slice(), &[DType::F32; 3]);

		let e = resolve_types(builtins::add(), Casting::Safe, &ops, Some(&TypeOverride::All(DType::I8)))
			.unwrap_err();
		assert_eq!(e.code, UFuncError::TypeResolution);
	}
}
