//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Ufunc dispatch: argument binding, placement, type resolution, loop strategy
//! selection and execution of inner loops on the device.

use arrayvec::ArrayVec;

use crate::MAXARGS;
use crate::array::DeviceArray;
use crate::error::{UFuncError, UFuncResult, err};

pub mod args;
pub mod assign;
pub mod call;
pub mod dispatch;
pub mod generalized;
pub mod iter;
pub mod placement;
pub mod reduce;
pub mod strategy;
pub mod typeres;

//--------------------------------------------------------------------------------------------------

/// Outcome of a dispatch step that may decline to handle the operands.
///
/// `NotImplemented` is not an error. It tells the caller that another
/// implementation should be tried.
#[must_use]
#[derive(Debug)]
pub enum Dispatch<T> {
	Done(T),
	NotImplemented,
}

impl<T> Dispatch<T> {
	pub fn done(self) -> Option<T> {
		match self {
			Self::Done(value) => Some(value),
			Self::NotImplemented => None,
		}
	}

	pub fn is_not_implemented(&self) -> bool {
		matches!(self, Self::NotImplemented)
	}

	/// Turns `NotImplemented` into a `TypeResolution` error.
	pub fn into_result(self, ufunc: &str) -> UFuncResult<T> {
		match self {
			Self::Done(value) => Ok(value),
			Self::NotImplemented => err(
				UFuncError::TypeResolution,
				format!("operand types are not supported by ufunc '{ufunc}'"),
			),
		}
	}
}

/// One slot per ufunc operand, inputs first. `None` is an output still to be allocated.
pub type Operands = ArrayVec<Option<DeviceArray>, MAXARGS>;
