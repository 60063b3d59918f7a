//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::util::{LossyInto, cold_path};

//--------------------------------------------------------------------------------------------------

pub const MAX_DTYPE_ALIGN: usize = 8; // 64-bit

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DTypeKind {
	Bool,
	Uint,
	Int,
	Float,
	Object,
	Bytes,
}

/// Element type of a device array.
///
/// `Object` is an opaque 8-byte handle with ownership semantics; loops over it
/// need the host (`needs_api`). `Bytes(n)` is a flexible fixed-width type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
	Bool,
	I8,
	I16,
	I32,
	I64,
	U8,
	U16,
	U32,
	U64,
	F32,
	F64,
	Object,
	Bytes(u32),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DTypeMismatchError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnknownDTypeError;

pub trait HasDType: Copy + Send + Sync + 'static {
	const dtype: DType;
}

macro_rules! impl_has_dtype {
	($($t:ty => $d:ident),* $(,)?) => {
		$(
			impl HasDType for $t {
				const dtype: DType = DType::$d;
			}
		)*
	};
}

impl_has_dtype!(
	bool => Bool,
	i8 => I8,
	i16 => I16,
	i32 => I32,
	i64 => I64,
	u8 => U8,
	u16 => U16,
	u32 => U32,
	u64 => U64,
	f32 => F32,
	f64 => F64,
);

impl std::str::FromStr for DType {
	type Err = UnknownDTypeError;

	fn from_str(s: &str) -> Result<Self, UnknownDTypeError> {
		match s {
			"bool" | "?" => Ok(Self::Bool),
			"i8" | "int8" => Ok(Self::I8),
			"i16" | "int16" => Ok(Self::I16),
			"i32" | "int32" => Ok(Self::I32),
			"i64" | "int64" => Ok(Self::I64),
			"u8" | "uint8" => Ok(Self::U8),
			"u16" | "uint16" => Ok(Self::U16),
			"u32" | "uint32" => Ok(Self::U32),
			"u64" | "uint64" => Ok(Self::U64),
			"f32" | "float32" => Ok(Self::F32),
			"f64" | "float64" => Ok(Self::F64),
			"object" | "O" => Ok(Self::Object),
			_ => {
				cold_path();
				Err(UnknownDTypeError)
			},
		}
	}
}

impl std::fmt::Display for DType {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Bool => write!(f, "bool"),
			Self::I8 => write!(f, "int8"),
			Self::I16 => write!(f, "int16"),
			Self::I32 => write!(f, "int32"),
			Self::I64 => write!(f, "int64"),
			Self::U8 => write!(f, "uint8"),
			Self::U16 => write!(f, "uint16"),
			Self::U32 => write!(f, "uint32"),
			Self::U64 => write!(f, "uint64"),
			Self::F32 => write!(f, "float32"),
			Self::F64 => write!(f, "float64"),
			Self::Object => write!(f, "object"),
			Self::Bytes(n) => write!(f, "|S{n}"),
		}
	}
}

impl DType {
	/// Maps the classic type numbers onto dtypes.
	pub fn from_type_num(num: u32) -> Option<Self> {
		match num {
			0 => Some(Self::Bool),
			1 => Some(Self::I8),
			2 => Some(Self::U8),
			3 => Some(Self::I16),
			4 => Some(Self::U16),
			5 => Some(Self::I32),
			6 => Some(Self::U32),
			7 => Some(Self::I64),
			8 => Some(Self::U64),
			11 => Some(Self::F32),
			12 => Some(Self::F64),
			17 => Some(Self::Object),
			_ => None,
		}
	}

	pub fn type_num(self) -> u32 {
		match self {
			Self::Bool => 0,
			Self::I8 => 1,
			Self::U8 => 2,
			Self::I16 => 3,
			Self::U16 => 4,
			Self::I32 => 5,
			Self::U32 => 6,
			Self::I64 => 7,
			Self::U64 => 8,
			Self::F32 => 11,
			Self::F64 => 12,
			Self::Object => 17,
			Self::Bytes(_) => 18,
		}
	}

	pub fn kind(self) -> DTypeKind {
		match self {
			Self::Bool => DTypeKind::Bool,
			Self::I8 | Self::I16 | Self::I32 | Self::I64 => DTypeKind::Int,
			Self::U8 | Self::U16 | Self::U32 | Self::U64 => DTypeKind::Uint,
			Self::F32 | Self::F64 => DTypeKind::Float,
			Self::Object => DTypeKind::Object,
			Self::Bytes(_) => DTypeKind::Bytes,
		}
	}

	pub fn itemsize(self) -> usize {
		match self {
			Self::Bool | Self::I8 | Self::U8 => 1,
			Self::I16 | Self::U16 => 2,
			Self::I32 | Self::U32 | Self::F32 => 4,
			Self::I64 | Self::U64 | Self::F64 | Self::Object => 8,
			Self::Bytes(n) => n as usize,
		}
	}

	pub fn align(self) -> usize {
		match self {
			Self::Bytes(_) => 1,
			_ => self.itemsize(),
		}
	}

	pub fn is_float(self) -> bool {
		self.kind() == DTypeKind::Float
	}

	pub fn is_numeric(self) -> bool {
		matches!(self.kind(), DTypeKind::Bool | DTypeKind::Uint | DTypeKind::Int | DTypeKind::Float)
	}

	/// Flexible types have a per-array width and no builtin loops.
	pub fn is_flexible(self) -> bool {
		matches!(self, Self::Bytes(_))
	}

	pub fn is_object(self) -> bool {
		matches!(self, Self::Object)
	}

	/// Loops over this dtype must run with the host lock held.
	pub fn needs_api(self) -> bool {
		self.is_object()
	}

	pub fn is_equiv(self, other: Self) -> bool {
		self == other
	}

	pub fn can_cast(self, to: Self, casting: Casting) -> bool {
		match casting {
			Casting::No | Casting::Equiv => self == to,
			Casting::Safe => can_cast_safely(self, to),
			Casting::SameKind => can_cast_safely(self, to) || same_kind(self, to),
			Casting::Unsafe => {
				(self.is_numeric() && to.is_numeric())
					|| to.is_object()
					|| (self.is_flexible() && to.is_flexible())
			},
		}
	}

	pub fn ensure(self, expected: Self) -> Result<(), DTypeMismatchError> {
		if self == expected {
			Ok(())
		} else {
			cold_path();
			Err(DTypeMismatchError)
		}
	}
}

fn int_bits(dtype: DType) -> usize {
	dtype.itemsize() * 8
}

fn can_cast_safely(from: DType, to: DType) -> bool {
	if from == to || to.is_object() {
		return true;
	}
	match (from.kind(), to.kind()) {
		(DTypeKind::Bool, DTypeKind::Uint | DTypeKind::Int | DTypeKind::Float) => true,
		(DTypeKind::Uint, DTypeKind::Uint) | (DTypeKind::Int, DTypeKind::Int) => {
			int_bits(to) >= int_bits(from)
		},
		(DTypeKind::Uint, DTypeKind::Int) => int_bits(to) > int_bits(from),
		(DTypeKind::Uint | DTypeKind::Int, DTypeKind::Float) => {
			if to == DType::F32 { int_bits(from) <= 16 } else { true }
		},
		(DTypeKind::Float, DTypeKind::Float) => to.itemsize() >= from.itemsize(),
		(DTypeKind::Bytes, DTypeKind::Bytes) => to.itemsize() >= from.itemsize(),
		_ => false,
	}
}

fn same_kind(from: DType, to: DType) -> bool {
	let order = |k: DTypeKind| match k {
		DTypeKind::Bool => Some(0),
		DTypeKind::Uint => Some(1),
		DTypeKind::Int => Some(2),
		DTypeKind::Float => Some(3),
		_ => None,
	};
	match (order(from.kind()), order(to.kind())) {
		(Some(f), Some(t)) => f <= t,
		_ => false,
	}
}

/// Smallest common dtype both operands can be safely cast to.
pub fn common_dtype(a: DType, b: DType) -> Option<DType> {
	if can_cast_safely(a, b) {
		return Some(b);
	}
	if can_cast_safely(b, a) {
		return Some(a);
	}
	const CANDIDATES: [DType; 5] = [DType::I16, DType::I32, DType::I64, DType::F32, DType::F64];
	CANDIDATES
		.into_iter()
		.find(|&c| can_cast_safely(a, c) && can_cast_safely(b, c))
		.or_else(|| (a.is_object() || b.is_object()).then_some(DType::Object))
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Casting {
	No,
	Equiv,
	Safe,
	SameKind,
	Unsafe,
}

impl std::str::FromStr for Casting {
	type Err = UnknownDTypeError;

	fn from_str(s: &str) -> Result<Self, UnknownDTypeError> {
		match s {
			"no" => Ok(Self::No),
			"equiv" => Ok(Self::Equiv),
			"safe" => Ok(Self::Safe),
			"same_kind" => Ok(Self::SameKind),
			"unsafe" => Ok(Self::Unsafe),
			_ => {
				cold_path();
				Err(UnknownDTypeError)
			},
		}
	}
}

impl std::fmt::Display for Casting {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(match self {
			Self::No => "no",
			Self::Equiv => "equiv",
			Self::Safe => "safe",
			Self::SameKind => "same_kind",
			Self::Unsafe => "unsafe",
		})
	}
}

//--------------------------------------------------------------------------------------------------

/// A single host-side value, used for scalar operands and for identity fills.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Scalar {
	Bool(bool),
	Int(i64),
	UInt(u64),
	Float(f64),
}

impl Scalar {
	/// The dtype a host scalar materializes as.
	pub fn dtype(self) -> DType {
		match self {
			Self::Bool(_) => DType::Bool,
			Self::Int(_) => DType::I64,
			Self::UInt(_) => DType::U64,
			Self::Float(_) => DType::F64,
		}
	}

	pub fn as_f64(self) -> f64 {
		match self {
			Self::Bool(b) => f64::from(u8::from(b)),
			Self::Int(i) => i.lossy_into(),
			Self::UInt(u) => u.lossy_into(),
			Self::Float(f) => f,
		}
	}

	pub fn as_i64(self) -> i64 {
		match self {
			Self::Bool(b) => i64::from(b),
			Self::Int(i) => i,
			Self::UInt(u) => u as i64,
			Self::Float(f) => f as i64,
		}
	}

	pub fn as_u64(self) -> u64 {
		match self {
			Self::Bool(b) => u64::from(b),
			Self::Int(i) => i as u64,
			Self::UInt(u) => u,
			Self::Float(f) => {
				if f < 0.0 { (f as i64) as u64 } else { f as u64 }
			},
		}
	}

	pub fn as_bool(self) -> bool {
		match self {
			Self::Bool(b) => b,
			Self::Int(i) => i != 0,
			Self::UInt(u) => u != 0,
			Self::Float(f) => f != 0.0,
		}
	}

	/// Smallest dtype of the same kind that holds this value exactly.
	pub fn min_dtype(self) -> DType {
		match self {
			Self::Bool(_) => DType::Bool,
			Self::UInt(u) => min_uint_dtype(u),
			Self::Int(i) => {
				if i >= 0 {
					min_uint_dtype(i as u64)
				} else if i >= i64::from(i8::MIN) {
					DType::I8
				} else if i >= i64::from(i16::MIN) {
					DType::I16
				} else if i >= i64::from(i32::MIN) {
					DType::I32
				} else {
					DType::I64
				}
			},
			Self::Float(f) => {
				if !f.is_finite() || f.abs() <= f64::from(f32::MAX) {
					DType::F32
				} else {
					DType::F64
				}
			},
		}
	}

	/// Reads one element of `dtype` from host memory.
	///
	/// # Safety
	/// `ptr` must point to a readable element of `dtype`, which must be numeric.
	pub unsafe fn read(ptr: *const u8, dtype: DType) -> Option<Self> {
		unsafe {
			Some(match dtype {
				DType::Bool => Self::Bool(ptr.read() != 0),
				DType::I8 => Self::Int(i64::from(ptr.cast::<i8>().read_unaligned())),
				DType::I16 => Self::Int(i64::from(ptr.cast::<i16>().read_unaligned())),
				DType::I32 => Self::Int(i64::from(ptr.cast::<i32>().read_unaligned())),
				DType::I64 => Self::Int(ptr.cast::<i64>().read_unaligned()),
				DType::U8 => Self::UInt(u64::from(ptr.read())),
				DType::U16 => Self::UInt(u64::from(ptr.cast::<u16>().read_unaligned())),
				DType::U32 => Self::UInt(u64::from(ptr.cast::<u32>().read_unaligned())),
				DType::U64 => Self::UInt(ptr.cast::<u64>().read_unaligned()),
				DType::F32 => Self::Float(f64::from(ptr.cast::<f32>().read_unaligned())),
				DType::F64 => Self::Float(ptr.cast::<f64>().read_unaligned()),
				DType::Object | DType::Bytes(_) => return None,
			})
		}
	}

	/// Writes this value as one element of `dtype`, converting like an unsafe cast.
	///
	/// # Safety
	/// `ptr` must point to a writable element of `dtype`, which must be numeric.
	pub unsafe fn write(self, ptr: *mut u8, dtype: DType) -> bool {
		unsafe {
			match dtype {
				DType::Bool => ptr.write(u8::from(self.as_bool())),
				DType::I8 => ptr.cast::<i8>().write_unaligned(self.as_i64() as i8),
				DType::I16 => ptr.cast::<i16>().write_unaligned(self.as_i64() as i16),
				DType::I32 => ptr.cast::<i32>().write_unaligned(self.as_i64() as i32),
				DType::I64 => ptr.cast::<i64>().write_unaligned(self.as_i64()),
				DType::U8 => ptr.write(self.as_u64() as u8),
				DType::U16 => ptr.cast::<u16>().write_unaligned(self.as_u64() as u16),
				DType::U32 => ptr.cast::<u32>().write_unaligned(self.as_u64() as u32),
				DType::U64 => ptr.cast::<u64>().write_unaligned(self.as_u64()),
				DType::F32 => ptr.cast::<f32>().write_unaligned(self.as_f64() as f32),
				DType::F64 => ptr.cast::<f64>().write_unaligned(self.as_f64()),
				DType::Object | DType::Bytes(_) => return false,
			}
		}
		true
	}
}

impl From<bool> for Scalar {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i64> for Scalar {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<i32> for Scalar {
	fn from(v: i32) -> Self {
		Self::Int(i64::from(v))
	}
}

impl From<u64> for Scalar {
	fn from(v: u64) -> Self {
		Self::UInt(v)
	}
}

impl From<f64> for Scalar {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

fn min_uint_dtype(u: u64) -> DType {
	if u <= u64::from(u8::MAX) {
		DType::U8
	} else if u <= u64::from(u16::MAX) {
		DType::U16
	} else if u <= u64::from(u32::MAX) {
		DType::U32
	} else {
		DType::U64
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_safe_casting() {
		assert!(DType::I8.can_cast(DType::I16, Casting::Safe));
		assert!(DType::U8.can_cast(DType::I16, Casting::Safe));
		assert!(!DType::U8.can_cast(DType::I8, Casting::Safe));
		assert!(DType::I16.can_cast(DType::F32, Casting::Safe));
		assert!(!DType::I32.can_cast(DType::F32, Casting::Safe));
		assert!(DType::I64.can_cast(DType::F64, Casting::Safe));
		assert!(!DType::F64.can_cast(DType::F32, Casting::Safe));
		assert!(DType::F64.can_cast(DType::F32, Casting::SameKind));
		assert!(!DType::F64.can_cast(DType::I64, Casting::SameKind));
		assert!(DType::F64.can_cast(DType::I64, Casting::Unsafe));
		assert!(!DType::F64.can_cast(DType::Bytes(4), Casting::Unsafe));
		assert!(!DType::I32.can_cast(DType::I64, Casting::No));
	}

	#[test]
	fn test_common_dtype() {
		assert!(DType::F32.is_float() && !DType::I64.is_float());
		assert_eq!(common_dtype(DType::I8, DType::U8), Some(DType::I16));
		assert_eq!(common_dtype(DType::I32, DType::F32), Some(DType::F64));
		assert_eq!(common_dtype(DType::Bool, DType::U16), Some(DType::U16));
		assert_eq!(common_dtype(DType::U64, DType::I64), Some(DType::F64));
		assert_eq!(common_dtype(DType::Bytes(3), DType::I8), None);
	}

	#[test]
	fn test_min_dtype() {
		assert_eq!(Scalar::Int(3).min_dtype(), DType::U8);
		assert_eq!(Scalar::Int(-3).min_dtype(), DType::I8);
		assert_eq!(Scalar::Int(-300).min_dtype(), DType::I16);
		assert_eq!(Scalar::UInt(70000).min_dtype(), DType::U32);
		assert_eq!(Scalar::Float(1.5).min_dtype(), DType::F32);
		assert_eq!(Scalar::Float(1e300).min_dtype(), DType::F64);
	}

	#[test]
	fn test_type_num() {
		for num in 0..20 {
			if let Some(dtype) = DType::from_type_num(num) {
				assert_eq!(dtype.type_num(), num);
			}
		}
		assert_eq!(DType::from_type_num(11), Some(DType::F32));
	}

	#[test]
	fn test_scalar_read_write() {
		let mut buf = [0_u8; 8];
		unsafe {
			assert!(Scalar::Int(-1).write(buf.as_mut_ptr(), DType::U8));
			assert_eq!(Scalar::read(buf.as_ptr(), DType::U8), Some(Scalar::UInt(255)));
			assert!(Scalar::Float(2.5).write(buf.as_mut_ptr(), DType::F32));
			assert_eq!(Scalar::read(buf.as_ptr(), DType::F32), Some(Scalar::Float(2.5)));
		}
	}
}
