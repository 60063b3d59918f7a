//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;

use crate::ErrPack;
use crate::array::dim_merger::{DimMergerError, DimsDontMatchError};
use crate::array::dtype::DTypeMismatchError;
use crate::array::layout::ElementsOverflowError;
use crate::device::DeviceAllocError;

//--------------------------------------------------------------------------------------------------

/// Host-visible error category. Every `UFuncError` maps to exactly one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
	TypeError,
	ValueError,
	RuntimeError,
	MemoryError,
	FloatingPointError,
	KeyboardInterrupt,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UFuncError {
	InvalidArguments,
	UnknownKeyword,
	ArgumentConflict,
	KeywordConflict,
	InvalidKeywordValue,
	DeviceMismatch,
	Broadcast,
	ShapeMismatch,
	DuplicateAxis,
	AxisOutOfBounds,
	CoreDimension,
	TypeResolution,
	DTypeMismatch,
	NotWriteable,
	NotSupported,
	OutOfMemory,
	ElementsOverflow,
	NoIdentity,
	FloatingPoint,
	InvalidValue,
	Internal,
	Device,
	Interrupted,
}

impl UFuncError {
	pub fn category(self) -> ErrorCategory {
		match self {
			Self::InvalidArguments
			| Self::UnknownKeyword
			| Self::InvalidKeywordValue
			| Self::TypeResolution
			| Self::DTypeMismatch => ErrorCategory::TypeError,
			Self::ArgumentConflict
			| Self::DeviceMismatch
			| Self::Broadcast
			| Self::ShapeMismatch
			| Self::DuplicateAxis
			| Self::AxisOutOfBounds
			| Self::CoreDimension
			| Self::NotWriteable
			| Self::NoIdentity
			| Self::ElementsOverflow
			| Self::InvalidValue => ErrorCategory::ValueError,
			Self::KeywordConflict | Self::NotSupported | Self::Internal | Self::Device => {
				ErrorCategory::RuntimeError
			},
			Self::OutOfMemory => ErrorCategory::MemoryError,
			Self::FloatingPoint => ErrorCategory::FloatingPointError,
			Self::Interrupted => ErrorCategory::KeyboardInterrupt,
		}
	}
}

impl ErrPack<UFuncError> {
	pub fn category(&self) -> ErrorCategory {
		self.code.category()
	}
}

pub type UFuncResult<T> = Result<T, ErrPack<UFuncError>>;

#[cold]
#[inline(never)]
pub fn err<T>(code: UFuncError, message: impl Into<Cow<'static, str>>) -> UFuncResult<T> {
	Err(ErrPack::new(code, message))
}

//--------------------------------------------------------------------------------------------------

impl From<DimMergerError> for UFuncError {
	#[cold]
	#[inline(never)]
	fn from(err: DimMergerError) -> Self {
		match err {
			DimMergerError::DimsDontMatch => Self::Broadcast,
			DimMergerError::TooManyDimensions => Self::Internal,
		}
	}
}

impl From<DimMergerError> for ErrPack<UFuncError> {
	#[cold]
	#[inline(never)]
	fn from(err: DimMergerError) -> Self {
		Self { code: err.into(), extra: None }
	}
}

impl From<DimsDontMatchError> for ErrPack<UFuncError> {
	fn from(_: DimsDontMatchError) -> Self {
		Self { code: UFuncError::Broadcast, extra: None }
	}
}

impl From<DeviceAllocError> for ErrPack<UFuncError> {
	#[cold]
	#[inline(never)]
	fn from(_: DeviceAllocError) -> Self {
		Self::new(UFuncError::OutOfMemory, "device memory allocation failed")
	}
}

impl From<DTypeMismatchError> for ErrPack<UFuncError> {
	fn from(_: DTypeMismatchError) -> Self {
		Self { code: UFuncError::DTypeMismatch, extra: None }
	}
}

impl From<ElementsOverflowError> for ErrPack<UFuncError> {
	fn from(_: ElementsOverflowError) -> Self {
		Self::new(UFuncError::ElementsOverflow, "array is too big")
	}
}

//--------------------------------------------------------------------------------------------------
