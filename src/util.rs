//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

#[cold]
#[inline]
pub fn cold_path() {}

pub trait LossyInto<T> {
	fn lossy_into(self) -> T;
}

#[allow(clippy::cast_precision_loss)]
impl LossyInto<f64> for u64 {
	fn lossy_into(self) -> f64 {
		self as f64
	}
}

#[allow(clippy::cast_precision_loss)]
impl LossyInto<f64> for i64 {
	fn lossy_into(self) -> f64 {
		self as f64
	}
}

/// Formats a shape the way error messages print it: `(2,3)`, `(4,)`, `()`.
pub fn fmt_shape(shape: &[usize]) -> String {
	match shape {
		[] => "()".to_string(),
		[d] => format!("({d},)"),
		_ => {
			let parts: Vec<String> = shape.iter().map(ToString::to_string).collect();
			format!("({})", parts.join(","))
		},
	}
}
