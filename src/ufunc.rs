//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::array::DeviceArray;
use crate::array::dtype::{DType, HasDType, Scalar};
use crate::device::{AuxData, InnerLoopFn};
use crate::engine::Dispatch;
use crate::engine::args::{Arg, KwValue};
use crate::engine::iter::OpFlags;
use crate::engine::reduce::{self, AccumulateArgs, ReduceArgs};
use crate::engine::typeres::{DefaultTypeResolver, TypeResolver};
use crate::engine::call;
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::cold_path;

pub mod builtins;
pub mod kernels;
pub mod loops;
pub mod signature;

use loops::{LoopEntry, LoopTable};
use signature::CoreSignature;

//--------------------------------------------------------------------------------------------------

/// Value a reduction starts from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Identity {
	Zero,
	One,
	MinusOne,
	/// No identity, and the operation may not be reordered.
	None,
	/// No identity, but reducing over several axes at once is allowed.
	ReorderableNone,
}

impl Identity {
	pub fn value(self) -> Option<Scalar> {
		match self {
			Self::Zero => Some(Scalar::Int(0)),
			Self::One => Some(Scalar::Int(1)),
			Self::MinusOne => Some(Scalar::Int(-1)),
			Self::None | Self::ReorderableNone => None,
		}
	}

	pub fn is_reorderable(self) -> bool {
		self != Self::None
	}
}

//--------------------------------------------------------------------------------------------------

pub struct UFunc {
	name: Cow<'static, str>,
	nin: usize,
	nout: usize,
	identity: Identity,
	core: Option<CoreSignature>,
	op_flags: ArrayVec<OpFlags, MAXARGS>,
	loops: RwLock<LoopTable>,
	resolver: Arc<dyn TypeResolver>,
}

impl std::fmt::Debug for UFunc {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("UFunc")
			.field("name", &self.name)
			.field("nin", &self.nin)
			.field("nout", &self.nout)
			.field("identity", &self.identity)
			.field("signature", &self.core.as_ref().map(CoreSignature::as_str))
			.finish_non_exhaustive()
	}
}

impl UFunc {
	pub fn new(
		name: impl Into<Cow<'static, str>>,
		nin: usize,
		nout: usize,
		identity: Identity,
	) -> UFuncResult<Self> {
		let name = name.into();
		if nin == 0 || nout == 0 || nin + nout > MAXARGS {
			cold_path();
			return err(
				UFuncError::InvalidValue,
				format!("ufunc '{name}': invalid operand count nin={nin} nout={nout}"),
			);
		}
		let op_flags = (0..nin + nout)
			.map(|i| if i < nin { OpFlags::INPUT } else { OpFlags::OUTPUT })
			.collect();
		Ok(Self {
			name,
			nin,
			nout,
			identity,
			core: None,
			op_flags,
			loops: RwLock::new(LoopTable::default()),
			resolver: Arc::new(DefaultTypeResolver),
		})
	}

	pub(crate) fn builtin(name: &'static str, nin: usize, nout: usize, identity: Identity) -> Self {
		debug_assert!(nin > 0 && nout > 0 && nin + nout <= MAXARGS);
		Self {
			name: Cow::Borrowed(name),
			nin,
			nout,
			identity,
			core: None,
			op_flags: (0..nin + nout)
				.map(|i| if i < nin { OpFlags::INPUT } else { OpFlags::OUTPUT })
				.collect(),
			loops: RwLock::new(LoopTable::default()),
			resolver: Arc::new(DefaultTypeResolver),
		}
	}

	pub(crate) fn with_core(mut self, core: CoreSignature) -> Self {
		self.core = Some(core);
		self
	}

	/// Makes this a generalized ufunc with the given core signature.
	pub fn with_signature(mut self, signature: &str) -> UFuncResult<Self> {
		self.core = Some(CoreSignature::parse(signature, self.nin, self.nout)?);
		Ok(self)
	}

	pub fn with_resolver(mut self, resolver: Arc<dyn TypeResolver>) -> Self {
		self.resolver = resolver;
		self
	}

	/// Adds a builtin loop. Types are inputs followed by outputs.
	pub fn with_loop(self, types: &[DType], func: InnerLoopFn) -> Self {
		debug_assert_eq!(types.len(), self.nargs());
		self.loops_mut().add_builtin(LoopEntry::new(types, func));
		self
	}

	/// `T, T -> T`
	pub(crate) fn with_binary<T: HasDType>(self, func: InnerLoopFn) -> Self {
		self.with_loop(&[T::dtype, T::dtype, T::dtype], func)
	}

	/// `T, T -> bool`
	pub(crate) fn with_predicate<T: HasDType>(self, func: InnerLoopFn) -> Self {
		self.with_loop(&[T::dtype, T::dtype, DType::Bool], func)
	}

	/// `T -> T`
	pub(crate) fn with_unary<T: HasDType>(self, func: InnerLoopFn) -> Self {
		self.with_loop(&[T::dtype, T::dtype], func)
	}

	/// Registers a user loop. User loops are tried before builtin ones, in
	/// order of decreasing `priority`.
	pub fn register_loop(
		&self,
		types: &[DType],
		func: InnerLoopFn,
		aux: Option<Arc<AuxData>>,
		priority: i32,
	) -> UFuncResult<()> {
		if types.len() != self.nargs() {
			cold_path();
			return err(
				UFuncError::InvalidValue,
				format!(
					"ufunc '{}': loop needs {} types, got {}",
					self.name,
					self.nargs(),
					types.len()
				),
			);
		}
		let mut entry = LoopEntry::new(types, func);
		entry.aux = aux;
		log::debug!("ufunc '{}': user loop {types:?} priority {priority}", self.name);
		self.loops_mut().add_user(priority, entry);
		Ok(())
	}

	fn loops_mut(&self) -> std::sync::RwLockWriteGuard<'_, LoopTable> {
		self.loops.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn loops(&self) -> RwLockReadGuard<'_, LoopTable> {
		self.loops.read().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn nin(&self) -> usize {
		self.nin
	}

	pub fn nout(&self) -> usize {
		self.nout
	}

	pub fn nargs(&self) -> usize {
		self.nin + self.nout
	}

	pub fn identity(&self) -> Identity {
		self.identity
	}

	pub fn core_signature(&self) -> Option<&CoreSignature> {
		self.core.as_ref()
	}

	pub fn op_flags(&self, op: usize) -> OpFlags {
		self.op_flags.get(op).copied().unwrap_or(OpFlags::INPUT)
	}

	pub fn resolver(&self) -> &dyn TypeResolver {
		self.resolver.as_ref()
	}

	//----------------------------------------------------------------------------------------------

	/// Full call with positional arguments and keywords.
	///
	/// Returns `Dispatch::NotImplemented` when the operand types are not handled
	/// by this ufunc and the caller should try something else.
	pub fn call(
		&self,
		args: &[Arg],
		kwargs: &[(&str, KwValue)],
	) -> UFuncResult<Dispatch<Vec<DeviceArray>>> {
		call::call(self, args, kwargs)
	}

	/// Applies the ufunc to `inputs`, allocating the outputs.
	pub fn apply(&self, inputs: &[&DeviceArray]) -> UFuncResult<Vec<DeviceArray>> {
		let args: Vec<Arg> = inputs.iter().map(|&a| Arg::from(a)).collect();
		self.call(&args, &[])?.into_result(self.name())
	}

	/// Applies the ufunc writing into `outputs`.
	pub fn apply_out(&self, inputs: &[&DeviceArray], outputs: &[&DeviceArray]) -> UFuncResult<()> {
		let args: Vec<Arg> = inputs.iter().chain(outputs.iter()).map(|&a| Arg::from(a)).collect();
		self.call(&args, &[])?.into_result(self.name())?;
		Ok(())
	}

	pub fn reduce(&self, array: &DeviceArray, args: ReduceArgs) -> UFuncResult<DeviceArray> {
		reduce::reduce(self, array, args)
	}

	pub fn accumulate(&self, array: &DeviceArray, args: AccumulateArgs) -> UFuncResult<DeviceArray> {
		reduce::accumulate(self, array, args)
	}

	pub fn reduceat(
		&self,
		array: &DeviceArray,
		indices: &DeviceArray,
		axis: isize,
	) -> UFuncResult<DeviceArray> {
		reduce::reduceat(self, array, indices, axis)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_new_validates_operand_count() {
		assert!(UFunc::new("bad", 0, 1, Identity::None).is_err());
		assert!(UFunc::new("bad", 30, 3, Identity::None).is_err());
		let u = UFunc::new("ok", 2, 1, Identity::Zero).unwrap();
		assert_eq!(u.nargs(), 3);
		assert!(u.op_flags(0).contains(OpFlags::READ));
		assert!(u.op_flags(2).contains(OpFlags::WRITE));
	}

	#[test]
	fn test_register_loop() {
		let u = UFunc::new("myadd", 2, 1, Identity::Zero)
			.unwrap()
			.with_binary::<f64>(kernels::add::<f64>);
		assert!(u.register_loop(&[DType::I32, DType::I32], kernels::add::<i32>, None, 0).is_err());
		u.register_loop(&[DType::I32, DType::I32, DType::I32], kernels::add::<i32>, None, 3)
			.unwrap();
		assert_eq!(u.loops().len(), 2);
		assert!(u.loops().has_user_loop_for(DType::I32, 2));
	}

	#[test]
	fn test_identity() {
		assert_eq!(Identity::MinusOne.value(), Some(Scalar::Int(-1)));
		assert!(Identity::ReorderableNone.is_reorderable());
		assert!(!Identity::None.is_reorderable());
		assert_eq!(Identity::None.value(), None);
	}

	struct Declines;

	impl TypeResolver for Declines {
		fn resolve(
			&self,
			_ufunc: &UFunc,
			_casting: crate::Casting,
			_views: &[Option<crate::engine::typeres::OperandView>],
			_type_override: Option<&crate::engine::args::TypeOverride>,
		) -> UFuncResult<Dispatch<crate::engine::typeres::ResolvedLoop>> {
			Ok(Dispatch::NotImplemented)
		}
	}

	#[test]
	fn test_custom_resolver() {
		let u = UFunc::new("picky", 2, 1, Identity::None)
			.unwrap()
			.with_binary::<f64>(kernels::add::<f64>)
			.with_resolver(Arc::new(Declines));
		let a = DeviceArray::from_slice(&[1.0_f64], &[1], crate::device::DeviceId(0)).unwrap();
		let result = u.call(&[Arg::from(&a), Arg::from(&a)], &[]).unwrap();
		assert!(result.is_not_implemented());
		assert_eq!(u.apply(&[&a, &a]).unwrap_err().code, UFuncError::TypeResolution);
	}
}
