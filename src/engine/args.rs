//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Binding of positional and keyword arguments of a ufunc call.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::array::DeviceArray;
use crate::array::dtype::{Casting, DType, Scalar};
use crate::array::layout::Order;
use crate::config::Config;
use crate::device::{self, Device, DeviceId, DeviceRegistry};
use crate::error::{UFuncError, UFuncResult, err};
use crate::ufunc::UFunc;
use crate::util::cold_path;

use super::{Dispatch, Operands, assign};

//--------------------------------------------------------------------------------------------------

/// A positional argument.
#[derive(Debug, Clone)]
pub enum Arg {
	Array(DeviceArray),
	/// Host scalar. Materialized as a 0-d array on the call's device.
	Scalar(Scalar),
	/// Only valid in output positions: allocate this output.
	None,
}

impl From<DeviceArray> for Arg {
	fn from(array: DeviceArray) -> Self {
		Self::Array(array)
	}
}

impl From<&DeviceArray> for Arg {
	fn from(array: &DeviceArray) -> Self {
		Self::Array(array.clone())
	}
}

impl From<Scalar> for Arg {
	fn from(value: Scalar) -> Self {
		Self::Scalar(value)
	}
}

macro_rules! arg_from_scalar {
	($($t:ty),*) => {
		$(
			impl From<$t> for Arg {
				fn from(value: $t) -> Self {
					Self::Scalar(Scalar::from(value))
				}
			}
		)*
	};
}

arg_from_scalar!(bool, i32, i64, u64, f64);

/// A keyword argument value.
#[derive(Debug, Clone)]
pub enum KwValue {
	None,
	Array(DeviceArray),
	Scalar(Scalar),
	Tuple(Vec<KwValue>),
	DType(DType),
	Str(String),
	Bool(bool),
	Config(Config),
}

impl From<DeviceArray> for KwValue {
	fn from(array: DeviceArray) -> Self {
		Self::Array(array)
	}
}

impl From<&DeviceArray> for KwValue {
	fn from(array: &DeviceArray) -> Self {
		Self::Array(array.clone())
	}
}

impl From<DType> for KwValue {
	fn from(dtype: DType) -> Self {
		Self::DType(dtype)
	}
}

impl From<&str> for KwValue {
	fn from(s: &str) -> Self {
		Self::Str(s.to_string())
	}
}

impl From<bool> for KwValue {
	fn from(b: bool) -> Self {
		Self::Bool(b)
	}
}

impl From<Config> for KwValue {
	fn from(config: Config) -> Self {
		Self::Config(config)
	}
}

impl From<Vec<KwValue>> for KwValue {
	fn from(items: Vec<KwValue>) -> Self {
		Self::Tuple(items)
	}
}

//--------------------------------------------------------------------------------------------------

/// Dtypes requested by `dtype=`, `sig=` or `signature=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeOverride {
	/// `dtype=`: the dtype of every output.
	Output(DType),
	/// A single dtype for every operand.
	All(DType),
	/// One entry per operand, `None` where the resolver is free to choose.
	Full(ArrayVec<Option<DType>, MAXARGS>),
}

impl TypeOverride {
	/// The fixed dtype of each of the `nargs` operands.
	pub fn pattern(&self, nin: usize, nargs: usize) -> ArrayVec<Option<DType>, MAXARGS> {
		match self {
			Self::Output(dtype) => (0..nargs).map(|i| (i >= nin).then_some(*dtype)).collect(),
			Self::All(dtype) => (0..nargs).map(|_| Some(*dtype)).collect(),
			Self::Full(types) => (0..nargs).map(|i| types.get(i).copied().flatten()).collect(),
		}
	}
}

/// Arguments of one call after binding.
#[derive(Debug)]
pub struct BoundArgs {
	pub operands: Operands,
	pub device: DeviceId,
	pub order: Order,
	pub casting: Casting,
	/// `extobj=` override of the process defaults.
	pub config: Option<Config>,
	pub type_override: Option<TypeOverride>,
	pub subok: bool,
	pub where_mask: Option<DeviceArray>,
}

//--------------------------------------------------------------------------------------------------

/// Binds `args` and `kwargs` for a call of `ufunc`.
///
/// `allow_where` is false for call sites that cannot mask, which then reject
/// `where=` like any unknown keyword.
pub fn bind(
	ufunc: &UFunc,
	args: &[Arg],
	kwargs: &[(&str, KwValue)],
	allow_where: bool,
) -> UFuncResult<Dispatch<BoundArgs>> {
	let nin = ufunc.nin();
	let nargs = ufunc.nargs();
	if args.len() < nin || args.len() > nargs {
		cold_path();
		return err(
			UFuncError::InvalidArguments,
			format!(
				"invalid number of arguments: ufunc '{}' takes {nin} to {nargs}, got {}",
				ufunc.name(),
				args.len()
			),
		);
	}

	let device_id = call_device(args, kwargs);
	let device = device::device(device_id)?;

	let mut operands = Operands::new();
	for (i, arg) in args.iter().take(nin).enumerate() {
		let array = match arg {
			Arg::Array(array) => array.clone(),
			Arg::Scalar(value) => DeviceArray::from_scalar(*value, value.dtype(), device.clone())?,
			Arg::None => {
				cold_path();
				return err(
					UFuncError::InvalidArguments,
					format!("input {i} of ufunc '{}' is None", ufunc.name()),
				);
			},
		};
		operands.push(Some(array));
	}

	if declines_flexible(ufunc, &operands) {
		log::debug!("ufunc '{}': flexible input without a loop, not implemented", ufunc.name());
		return Ok(Dispatch::NotImplemented);
	}

	for arg in args.iter().skip(nin) {
		match arg {
			Arg::Array(array) => operands.push(Some(array.clone())),
			Arg::None => operands.push(None),
			Arg::Scalar(_) => {
				cold_path();
				return err(UFuncError::InvalidArguments, "return arrays must be arrays");
			},
		}
	}
	let positional_out = operands.len() > nin;
	while operands.len() < nargs {
		operands.push(None);
	}

	let mut bound = BoundArgs {
		operands,
		device: device_id,
		order: Order::K,
		casting: Casting::SameKind,
		config: None,
		type_override: None,
		subok: false,
		where_mask: None,
	};
	let mut dtype_kw = None;
	let mut sig_kw = None;
	let mut signature_kw = None;

	for (kw, value) in kwargs {
		match *kw {
			"out" => {
				if positional_out {
					cold_path();
					return err(
						UFuncError::ArgumentConflict,
						"cannot specify 'out' as both a positional and keyword argument",
					);
				}
				bind_out(ufunc, &mut bound.operands, value)?;
			},
			"where" if allow_where => {
				bound.where_mask = where_mask(value, &device)?;
			},
			"dtype" => {
				dtype_kw = match value {
					KwValue::None => None,
					_ => Some(parse_dtype(kw, value)?),
				};
			},
			"sig" => sig_kw = parse_signature(ufunc, value)?,
			"signature" => signature_kw = parse_signature(ufunc, value)?,
			"casting" => {
				bound.casting = match value {
					KwValue::Str(s) => s.parse().or_else(|_| {
						err(
							UFuncError::InvalidValue,
							"casting must be one of 'no', 'equiv', 'safe', 'same_kind', or 'unsafe'",
						)
					})?,
					_ => return invalid_keyword(kw, "a string"),
				};
			},
			"order" => {
				bound.order = match value {
					KwValue::None => Order::K,
					KwValue::Str(s) => s.parse().or_else(|_| {
						err(UFuncError::InvalidValue, "order must be one of 'C', 'F', 'A', or 'K'")
					})?,
					_ => return invalid_keyword(kw, "a string"),
				};
			},
			"subok" => {
				bound.subok = match value {
					KwValue::Bool(b) | KwValue::Scalar(Scalar::Bool(b)) => *b,
					_ => return invalid_keyword(kw, "a boolean"),
				};
			},
			"extobj" => {
				bound.config = match value {
					KwValue::None => None,
					KwValue::Config(config) => Some(config.clone()),
					_ => return invalid_keyword(kw, "a Config"),
				};
			},
			_ => {
				cold_path();
				return err(
					UFuncError::UnknownKeyword,
					format!("'{kw}' is an invalid keyword to ufunc '{}'", ufunc.name()),
				);
			},
		}
	}

	if sig_kw.is_some() && signature_kw.is_some() {
		cold_path();
		return err(UFuncError::ArgumentConflict, "cannot specify both 'sig' and 'signature'");
	}
	let sig = sig_kw.or(signature_kw);
	bound.type_override = match (dtype_kw, sig) {
		(Some(_), Some(_)) => {
			cold_path();
			return err(UFuncError::KeywordConflict, "cannot specify both 'sig' and 'dtype'");
		},
		(Some(dtype), None) => Some(TypeOverride::Output(dtype)),
		(None, sig) => sig,
	};

	if bound.subok {
		cold_path();
		return err(UFuncError::NotSupported, "subclass output wrapping is not supported");
	}
	for out in bound.operands.iter().skip(nin).flatten() {
		out.ensure_writeable()?;
	}
	Ok(Dispatch::Done(bound))
}

/// Device of the first positional array, else of the first `out=` array,
/// else the current device.
fn call_device(args: &[Arg], kwargs: &[(&str, KwValue)]) -> DeviceId {
	let positional = args.iter().find_map(|arg| match arg {
		Arg::Array(array) => Some(array.device_id()),
		_ => None,
	});
	let out = || {
		kwargs.iter().filter(|(kw, _)| *kw == "out").find_map(|(_, value)| match value {
			KwValue::Array(array) => Some(array.device_id()),
			KwValue::Tuple(items) => items.iter().find_map(|item| match item {
				KwValue::Array(array) => Some(array.device_id()),
				_ => None,
			}),
			_ => None,
		})
	};
	positional.or_else(out).unwrap_or_else(|| DeviceRegistry::with(DeviceRegistry::current))
}

/// A flexible input with no user loop for it and no object input is left to
/// other implementations.
fn declines_flexible(ufunc: &UFunc, inputs: &Operands) -> bool {
	let dtypes = || inputs.iter().flatten().map(DeviceArray::dtype);
	if dtypes().any(DType::is_object) {
		return false;
	}
	let loops = ufunc.loops();
	dtypes().any(|dtype| dtype.is_flexible() && !loops.has_user_loop_for(dtype, ufunc.nin()))
}

fn bind_out(ufunc: &UFunc, operands: &mut Operands, value: &KwValue) -> UFuncResult<()> {
	let nin = ufunc.nin();
	match value {
		KwValue::None => Ok(()),
		KwValue::Array(array) if ufunc.nout() == 1 => {
			if let Some(slot) = operands.get_mut(nin) {
				*slot = Some(array.clone());
			}
			Ok(())
		},
		KwValue::Tuple(items) => {
			if items.len() != ufunc.nout() {
				cold_path();
				return err(
					UFuncError::InvalidArguments,
					"The 'out' tuple must have exactly one entry per ufunc output",
				);
			}
			for (item, slot) in items.iter().zip(operands.iter_mut().skip(nin)) {
				*slot = match item {
					KwValue::Array(array) => Some(array.clone()),
					KwValue::None => None,
					_ => return invalid_keyword("out", "a tuple of arrays"),
				};
			}
			Ok(())
		},
		_ => invalid_keyword("out", "an array or a tuple of arrays"),
	}
}

fn where_mask(value: &KwValue, device: &Arc<dyn Device>) -> UFuncResult<Option<DeviceArray>> {
	match value {
		KwValue::Bool(true) | KwValue::Scalar(Scalar::Bool(true)) | KwValue::None => Ok(None),
		KwValue::Bool(false) | KwValue::Scalar(Scalar::Bool(false)) => {
			Ok(Some(DeviceArray::from_scalar(Scalar::Bool(false), DType::Bool, device.clone())?))
		},
		KwValue::Array(array) if array.dtype() == DType::Bool => Ok(Some(array.clone())),
		KwValue::Array(array) if array.dtype().is_numeric() => {
			let mask = array.new_like(Some(DType::Bool), Order::K)?;
			assign::assign(&mask, array)?;
			Ok(Some(mask))
		},
		_ => invalid_keyword("where", "a boolean array"),
	}
}

fn parse_dtype(kw: &str, value: &KwValue) -> UFuncResult<DType> {
	match value {
		KwValue::DType(dtype) => Ok(*dtype),
		KwValue::Str(s) => s.parse().or_else(|_| {
			err(UFuncError::InvalidKeywordValue, format!("'{kw}': data type '{s}' not understood"))
		}),
		_ => invalid_keyword(kw, "a dtype"),
	}
}

fn parse_signature(ufunc: &UFunc, value: &KwValue) -> UFuncResult<Option<TypeOverride>> {
	match value {
		KwValue::None => Ok(None),
		KwValue::Tuple(items) => {
			if items.len() != ufunc.nargs() {
				cold_path();
				return err(
					UFuncError::InvalidValue,
					format!(
						"a type-tuple must be specified of length {} for ufunc '{}'",
						ufunc.nargs(),
						ufunc.name()
					),
				);
			}
			let mut types = ArrayVec::new();
			for item in items {
				types.push(match item {
					KwValue::None => None,
					_ => Some(parse_dtype("signature", item)?),
				});
			}
			Ok(Some(TypeOverride::Full(types)))
		},
		_ => Ok(Some(TypeOverride::All(parse_dtype("signature", value)?))),
	}
}

#[cold]
fn invalid_keyword<T>(kw: &str, expected: &str) -> UFuncResult<T> {
	err(UFuncError::InvalidKeywordValue, format!("'{kw}' must be {expected}"))
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ufunc::builtins;

	fn array(device: usize) -> DeviceArray {
		DeviceArray::from_slice(&[1.0_f64, 2.0], &[2], DeviceId(device)).unwrap()
	}

	fn bind_err(args: &[Arg], kwargs: &[(&str, KwValue)]) -> crate::ErrPack<UFuncError> {
		bind(builtins::add(), args, kwargs, true).err().unwrap()
	}

	#[test]
	fn test_argument_count() {
		let e = bind_err(&[array(0).into()], &[]);
		assert_eq!(e.code, UFuncError::InvalidArguments);
		let a = array(0);
		let e = bind_err(&[(&a).into(), (&a).into(), (&a).into(), (&a).into()], &[]);
		assert_eq!(e.code, UFuncError::InvalidArguments);
	}

	#[test]
	fn test_scalar_materialized_on_array_device() {
		let bound = bind(builtins::add(), &[1.5.into(), array(1).into()], &[], true)
			.unwrap()
			.done()
			.unwrap();
		let scalar = bound.operands[0].as_ref().unwrap();
		assert_eq!(scalar.device_id(), DeviceId(1));
		assert_eq!(scalar.ndim(), 0);
		assert_eq!(bound.device, DeviceId(1));
		assert!(bound.operands[2].is_none());
	}

	#[test]
	fn test_out_keyword() {
		let a = array(0);
		let out = array(0);
		let bound = bind(builtins::add(), &[(&a).into(), (&a).into()], &[("out", (&out).into())], true)
			.unwrap()
			.done()
			.unwrap();
		assert!(bound.operands[2].as_ref().unwrap().is_same_view(&out));

		let e = bind_err(&[(&a).into(), (&a).into(), (&out).into()], &[("out", (&out).into())]);
		assert_eq!(e.code, UFuncError::ArgumentConflict);

		let e = bind_err(
			&[(&a).into(), (&a).into()],
			&[("out", KwValue::Tuple(vec![KwValue::None, KwValue::None]))],
		);
		assert_eq!(e.code, UFuncError::InvalidArguments);
		assert_eq!(e.message(), "The 'out' tuple must have exactly one entry per ufunc output");

		let e = bind_err(&[(&a).into(), (&a).into()], &[("out", (&out.read_only()).into())]);
		assert_eq!(e.code, UFuncError::NotWriteable);
	}

	#[test]
	fn test_keyword_errors() {
		let a = array(0);
		let args = [Arg::from(&a), Arg::from(&a)];

		let e = bind_err(&args, &[("dtype", DType::F64.into()), ("sig", DType::F64.into())]);
		assert_eq!(e.code, UFuncError::KeywordConflict);
		assert_eq!(e.message(), "cannot specify both 'sig' and 'dtype'");
		assert_eq!(e.category(), crate::ErrorCategory::RuntimeError);

		let e = bind_err(&args, &[("sig", DType::F64.into()), ("signature", DType::F64.into())]);
		assert_eq!(e.code, UFuncError::ArgumentConflict);
		assert_eq!(e.category(), crate::ErrorCategory::ValueError);

		let e = bind_err(&args, &[("bogus", KwValue::None)]);
		assert_eq!(e.code, UFuncError::UnknownKeyword);
		assert_eq!(e.message(), "'bogus' is an invalid keyword to ufunc 'add'");

		let e = bind_err(&args, &[("casting", "sometimes".into())]);
		assert_eq!(e.category(), crate::ErrorCategory::ValueError);

		let e = bind_err(&args, &[("order", "X".into())]);
		assert_eq!(e.code, UFuncError::InvalidValue);

		let e = bind_err(&args, &[("subok", "yes".into())]);
		assert_eq!(e.category(), crate::ErrorCategory::TypeError);

		let e = bind_err(&args, &[("subok", true.into())]);
		assert_eq!(e.code, UFuncError::NotSupported);

		let e = bind_err(&args, &[("where", "everywhere".into())]);
		assert_eq!(e.category(), crate::ErrorCategory::TypeError);

		let e = bind(builtins::add(), &args, &[("where", true.into())], false).err().unwrap();
		assert_eq!(e.code, UFuncError::UnknownKeyword);
	}

	#[test]
	fn test_type_overrides() {
		let a = array(0);
		let args = [Arg::from(&a), Arg::from(&a)];
		let bound = bind(builtins::add(), &args, &[("dtype", "float32".into())], true)
			.unwrap()
			.done()
			.unwrap();
		assert_eq!(bound.type_override, Some(TypeOverride::Output(DType::F32)));
		assert_eq!(
			bound.type_override.unwrap().pattern(2, 3).as_slice(),
			&[None, None, Some(DType::F32)]
		);

		let sig = KwValue::Tuple(vec![DType::I32.into(), KwValue::None, DType::I64.into()]);
		let bound = bind(builtins::add(), &args, &[("signature", sig)], true).unwrap().done().unwrap();
		assert_eq!(
			bound.type_override.unwrap().pattern(2, 3).as_slice(),
			&[Some(DType::I32), None, Some(DType::I64)]
		);

		let e = bind_err(&args, &[("sig", KwValue::Tuple(vec![DType::I32.into()]))]);
		assert_eq!(e.code, UFuncError::InvalidValue);
	}

	#[test]
	fn test_where_conversion() {
		let a = array(0);
		let args = [Arg::from(&a), Arg::from(&a)];
		let mask = DeviceArray::from_slice(&[0_i32, 5], &[2], DeviceId(0)).unwrap();
		let bound = bind(builtins::add(), &args, &[("where", (&mask).into())], true)
			.unwrap()
			.done()
			.unwrap();
		let converted = bound.where_mask.unwrap();
		assert_eq!(converted.dtype(), DType::Bool);
		assert_eq!(converted.to_vec::<bool>().unwrap(), vec![false, true]);
	}

	#[test]
	fn test_flexible_input_not_implemented() {
		let bytes = DeviceArray::new_empty(&[2], DType::Bytes(4), DeviceId(0), Order::C).unwrap();
		let a = array(0);
		let result = bind(builtins::add(), &[(&bytes).into(), (&a).into()], &[], true).unwrap();
		assert!(result.is_not_implemented());
	}
}
