//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! The standard ufuncs.
//!
//! Loops are listed in promotion order (bool, then integers by size, then
//! floats), so the first loop an input can be safely cast to is also the
//! smallest one.

use std::sync::OnceLock;

use super::kernels;
use super::signature::CoreSignature;
use super::{Identity, UFunc};

//--------------------------------------------------------------------------------------------------

macro_rules! typed {
	($ufunc:expr, $with:ident, $kernel:ident, [$($t:ty),* $(,)?]) => {
		$ufunc $(.$with::<$t>(kernels::$kernel::<$t>))*
	};
}

macro_rules! numeric {
	($ufunc:expr, $with:ident, $kernel:ident) => {
		typed!($ufunc, $with, $kernel, [i8, u8, i16, u16, i32, u32, i64, u64, f32, f64])
	};
}

macro_rules! builtin {
	($(#[$meta:meta])* $name:ident => $build:expr) => {
		$(#[$meta])*
		pub fn $name() -> &'static UFunc {
			static instance: OnceLock<UFunc> = OnceLock::new();
			instance.get_or_init(|| $build)
		}
	};
}

//--------------------------------------------------------------------------------------------------

builtin!(add => numeric!(
	UFunc::builtin("add", 2, 1, Identity::Zero).with_binary::<bool>(kernels::logical_or::<u8>),
	with_binary,
	add
));

builtin!(subtract => numeric!(UFunc::builtin("subtract", 2, 1, Identity::None), with_binary, subtract));

builtin!(multiply => numeric!(
	UFunc::builtin("multiply", 2, 1, Identity::One).with_binary::<bool>(kernels::logical_and::<u8>),
	with_binary,
	multiply
));

builtin!(
	/// True division. Integer inputs are computed in floating point.
	divide => typed!(UFunc::builtin("divide", 2, 1, Identity::None), with_binary, divide, [f32, f64])
);

builtin!(maximum => numeric!(
	UFunc::builtin("maximum", 2, 1, Identity::ReorderableNone)
		.with_binary::<bool>(kernels::maximum::<u8>),
	with_binary,
	maximum
));

builtin!(minimum => numeric!(
	UFunc::builtin("minimum", 2, 1, Identity::ReorderableNone)
		.with_binary::<bool>(kernels::minimum::<u8>),
	with_binary,
	minimum
));

builtin!(bitwise_and => typed!(
	UFunc::builtin("bitwise_and", 2, 1, Identity::MinusOne)
		.with_binary::<bool>(kernels::bitwise_and::<u8>),
	with_binary,
	bitwise_and,
	[i8, u8, i16, u16, i32, u32, i64, u64]
));

builtin!(logical_and => numeric!(
	UFunc::builtin("logical_and", 2, 1, Identity::One)
		.with_predicate::<bool>(kernels::logical_and::<u8>),
	with_predicate,
	logical_and
));

builtin!(equal => numeric!(
	UFunc::builtin("equal", 2, 1, Identity::None).with_predicate::<bool>(kernels::equal::<u8>),
	with_predicate,
	equal
));

builtin!(less => numeric!(
	UFunc::builtin("less", 2, 1, Identity::None).with_predicate::<bool>(kernels::less::<u8>),
	with_predicate,
	less
));

builtin!(negative => numeric!(UFunc::builtin("negative", 1, 1, Identity::None), with_unary, negative));

builtin!(absolute => numeric!(UFunc::builtin("absolute", 1, 1, Identity::None), with_unary, absolute));

builtin!(sqrt => typed!(UFunc::builtin("sqrt", 1, 1, Identity::None), with_unary, sqrt, [f32, f64]));

builtin!(
	/// Inner product over the last axis: `(i),(i)->()`.
	inner1d => typed!(
		UFunc::builtin("inner1d", 2, 1, Identity::None)
			.with_core(CoreSignature::from_parts("(i),(i)->()", &["i"], &[&[0], &[0], &[]])),
		with_binary,
		inner1d,
		[f32, f64]
	)
);

builtin!(
	/// Matrix product over the last two axes: `(m,n),(n,p)->(m,p)`.
	matmul => typed!(
		UFunc::builtin("matmul", 2, 1, Identity::None).with_core(CoreSignature::from_parts(
			"(m,n),(n,p)->(m,p)",
			&["m", "n", "p"],
			&[&[0, 1], &[1, 2], &[0, 2]],
		)),
		with_binary,
		matmul,
		[f32, f64]
	)
);

/// Looks a builtin up by name.
pub fn by_name(name: &str) -> Option<&'static UFunc> {
	Some(match name {
		"add" => add(),
		"subtract" => subtract(),
		"multiply" => multiply(),
		"divide" => divide(),
		"maximum" => maximum(),
		"minimum" => minimum(),
		"bitwise_and" => bitwise_and(),
		"logical_and" => logical_and(),
		"equal" => equal(),
		"less" => less(),
		"negative" => negative(),
		"absolute" => absolute(),
		"sqrt" => sqrt(),
		"inner1d" => inner1d(),
		"matmul" => matmul(),
		_ => return None,
	})
}

//--------------------------------------------------------------------------------------------------
