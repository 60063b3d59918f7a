//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Builtin strided inner loops.
//!
//! Every loop walks `count` elements, advancing each operand pointer by its own
//! byte stride. Outputs may alias inputs with the same stride, so each element
//! is fully read before it is written. Bool data is stored as one byte and
//! handled through `u8`.

use crate::array::dtype::{DType, HasDType, Scalar};
use crate::device::{FpFlags, FpStatus, KernelCall};

//--------------------------------------------------------------------------------------------------

pub trait Arith: HasDType + PartialOrd {
	fn add(self, other: Self) -> Self;
	fn sub(self, other: Self) -> Self;
	fn mul(self, other: Self) -> Self;
	fn neg(self) -> Self;
	fn abs(self) -> Self;
	fn is_zero(self) -> bool;
	fn maximum(self, other: Self) -> Self;
	fn minimum(self, other: Self) -> Self;
}

pub trait Bits: Arith {
	fn bitand(self, other: Self) -> Self;
}

pub trait Float: Arith {
	fn zero() -> Self;
	fn div(self, other: Self) -> Self;
	fn sqrt(self) -> Self;
	fn is_nan(self) -> bool;
	fn is_finite(self) -> bool;
}

macro_rules! impl_int {
	($($t:ty),*) => {
		$(
			impl Arith for $t {
				#[inline(always)]
				fn add(self, other: Self) -> Self {
					self.wrapping_add(other)
				}

				#[inline(always)]
				fn sub(self, other: Self) -> Self {
					self.wrapping_sub(other)
				}

				#[inline(always)]
				fn mul(self, other: Self) -> Self {
					self.wrapping_mul(other)
				}

				#[inline(always)]
				fn neg(self) -> Self {
					self.wrapping_neg()
				}

				#[inline(always)]
				#[allow(unused_comparisons)]
				fn abs(self) -> Self {
					if self < 0 { self.wrapping_neg() } else { self }
				}

				#[inline(always)]
				fn is_zero(self) -> bool {
					self == 0
				}

				#[inline(always)]
				fn maximum(self, other: Self) -> Self {
					Ord::max(self, other)
				}

				#[inline(always)]
				fn minimum(self, other: Self) -> Self {
					Ord::min(self, other)
				}
			}

			impl Bits for $t {
				#[inline(always)]
				fn bitand(self, other: Self) -> Self {
					self & other
				}
			}
		)*
	};
}

impl_int!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_float {
	($($t:ty),*) => {
		$(
			impl Arith for $t {
				#[inline(always)]
				fn add(self, other: Self) -> Self {
					self + other
				}

				#[inline(always)]
				fn sub(self, other: Self) -> Self {
					self - other
				}

				#[inline(always)]
				fn mul(self, other: Self) -> Self {
					self * other
				}

				#[inline(always)]
				fn neg(self) -> Self {
					-self
				}

				#[inline(always)]
				fn abs(self) -> Self {
					<$t>::abs(self)
				}

				#[inline(always)]
				fn is_zero(self) -> bool {
					self == 0.0
				}

				/// NaN in either operand propagates.
				#[inline(always)]
				fn maximum(self, other: Self) -> Self {
					if self >= other || self.is_nan() { self } else { other }
				}

				#[inline(always)]
				fn minimum(self, other: Self) -> Self {
					if self <= other || self.is_nan() { self } else { other }
				}
			}

			impl Float for $t {
				#[inline(always)]
				fn zero() -> Self {
					0.0
				}

				#[inline(always)]
				fn div(self, other: Self) -> Self {
					self / other
				}

				#[inline(always)]
				fn sqrt(self) -> Self {
					<$t>::sqrt(self)
				}

				#[inline(always)]
				fn is_nan(self) -> bool {
					<$t>::is_nan(self)
				}

				#[inline(always)]
				fn is_finite(self) -> bool {
					<$t>::is_finite(self)
				}
			}
		)*
	};
}

impl_float!(f32, f64);

//--------------------------------------------------------------------------------------------------

#[inline(always)]
fn operands<const N: usize>(call: &KernelCall) -> Option<([*mut u8; N], [isize; N])> {
	let ptrs: [*mut u8; N] = call.ptrs.get(..N)?.try_into().ok()?;
	let strides: [isize; N] = call.strides.get(..N)?.try_into().ok()?;
	Some((ptrs, strides))
}

#[inline(always)]
unsafe fn unary<T: Copy, U: Copy>(call: &KernelCall, mut f: impl FnMut(T) -> U) {
	let Some(([mut p0, mut p1], [s0, s1])) = operands::<2>(call) else {
		return;
	};
	for _ in 0..call.count {
		unsafe {
			let a = p0.cast::<T>().read_unaligned();
			p1.cast::<U>().write_unaligned(f(a));
		}
		p0 = p0.wrapping_offset(s0);
		p1 = p1.wrapping_offset(s1);
	}
}

#[inline(always)]
unsafe fn binary<T: Copy, U: Copy>(call: &KernelCall, mut f: impl FnMut(T, T) -> U) {
	let Some(([mut p0, mut p1, mut p2], [s0, s1, s2])) = operands::<3>(call) else {
		return;
	};
	for _ in 0..call.count {
		unsafe {
			let a = p0.cast::<T>().read_unaligned();
			let b = p1.cast::<T>().read_unaligned();
			p2.cast::<U>().write_unaligned(f(a, b));
		}
		p0 = p0.wrapping_offset(s0);
		p1 = p1.wrapping_offset(s1);
		p2 = p2.wrapping_offset(s2);
	}
}

//--------------------------------------------------------------------------------------------------

pub unsafe fn add<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::add) }
}

pub unsafe fn subtract<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::sub) }
}

pub unsafe fn multiply<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::mul) }
}

pub unsafe fn maximum<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::maximum) }
}

pub unsafe fn minimum<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::minimum) }
}

pub unsafe fn bitwise_and<T: Bits>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, T>(call, T::bitand) }
}

pub unsafe fn logical_and<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, u8>(call, |a, b| u8::from(!a.is_zero() && !b.is_zero())) }
}

pub unsafe fn logical_or<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, u8>(call, |a, b| u8::from(!a.is_zero() || !b.is_zero())) }
}

pub unsafe fn equal<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, u8>(call, |a, b| u8::from(a == b)) }
}

pub unsafe fn less<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { binary::<T, u8>(call, |a, b| u8::from(a < b)) }
}

pub unsafe fn negative<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { unary::<T, T>(call, T::neg) }
}

pub unsafe fn absolute<T: Arith>(call: &KernelCall, _fp: &FpStatus) {
	unsafe { unary::<T, T>(call, T::abs) }
}

pub unsafe fn divide<T: Float>(call: &KernelCall, fp: &FpStatus) {
	let mut flags = FpFlags::empty();
	unsafe {
		binary::<T, T>(call, |a, b| {
			if b.is_zero() {
				if a.is_zero() || a.is_nan() {
					flags = flags.union(FpFlags::INVALID);
				} else {
					flags = flags.union(FpFlags::DIVIDE_BY_ZERO);
				}
			}
			let q = a.div(b);
			if !q.is_finite() && !q.is_nan() && a.is_finite() && b.is_finite() && !b.is_zero() {
				flags = flags.union(FpFlags::OVERFLOW);
			}
			if q.is_zero() && !a.is_zero() && b.is_finite() {
				flags = flags.union(FpFlags::UNDERFLOW);
			}
			q
		});
	}
	if !flags.is_empty() {
		fp.raise(flags);
	}
}

pub unsafe fn sqrt<T: Float>(call: &KernelCall, fp: &FpStatus) {
	let mut invalid = false;
	unsafe {
		unary::<T, T>(call, |a| {
			invalid |= a < T::zero();
			a.sqrt()
		});
	}
	if invalid {
		fp.raise(FpFlags::INVALID);
	}
}

//--------------------------------------------------------------------------------------------------

/// `(i),(i)->()`
pub unsafe fn inner1d<T: Float>(call: &KernelCall, _fp: &FpStatus) {
	let Some(([mut p0, mut p1, mut p2], [s0, s1, s2])) = operands::<3>(call) else {
		return;
	};
	let (Some(&n), Some(&[c0, c1])) = (call.core_dims.first(), call.core_strides.first_chunk::<2>())
	else {
		return;
	};
	for _ in 0..call.count {
		let mut sum = T::zero();
		let (mut a, mut b) = (p0, p1);
		for _ in 0..n {
			unsafe {
				sum = sum.add(a.cast::<T>().read_unaligned().mul(b.cast::<T>().read_unaligned()));
			}
			a = a.wrapping_offset(c0);
			b = b.wrapping_offset(c1);
		}
		unsafe { p2.cast::<T>().write_unaligned(sum) };
		p0 = p0.wrapping_offset(s0);
		p1 = p1.wrapping_offset(s1);
		p2 = p2.wrapping_offset(s2);
	}
}

/// `(m,n),(n,p)->(m,p)`
pub unsafe fn matmul<T: Float>(call: &KernelCall, _fp: &FpStatus) {
	let Some(([mut p0, mut p1, mut p2], [s0, s1, s2])) = operands::<3>(call) else {
		return;
	};
	let (Some(&[m, n, p]), Some(&[a_m, a_n, b_n, b_p, c_m, c_p])) =
		(call.core_dims.first_chunk::<3>(), call.core_strides.first_chunk::<6>())
	else {
		return;
	};
	for _ in 0..call.count {
		for i in 0..m as isize {
			for j in 0..p as isize {
				let mut sum = T::zero();
				for k in 0..n as isize {
					unsafe {
						let a = p0.wrapping_offset(i * a_m + k * a_n).cast::<T>().read_unaligned();
						let b = p1.wrapping_offset(k * b_n + j * b_p).cast::<T>().read_unaligned();
						sum = sum.add(a.mul(b));
					}
				}
				unsafe {
					p2.wrapping_offset(i * c_m + j * c_p).cast::<T>().write_unaligned(sum);
				}
			}
		}
		p0 = p0.wrapping_offset(s0);
		p1 = p1.wrapping_offset(s1);
		p2 = p2.wrapping_offset(s2);
	}
}

//--------------------------------------------------------------------------------------------------

/// Aux data of `cast`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CastPair {
	pub from: DType,
	pub to: DType,
}

/// `1 -> 1` conversion loop driven by a `CastPair` in the aux data.
/// Equal dtypes are copied bytewise, so it also serves as the copy loop.
pub unsafe fn cast(call: &KernelCall, _fp: &FpStatus) {
	let Some(pair) = call.aux.and_then(|aux| aux.downcast_ref::<CastPair>()) else {
		return;
	};
	let Some(([mut p0, mut p1], [s0, s1])) = operands::<2>(call) else {
		return;
	};
	let itemsize = pair.from.itemsize();
	for _ in 0..call.count {
		unsafe {
			if pair.from == pair.to {
				std::ptr::copy(p0, p1, itemsize);
			} else if let Some(value) = Scalar::read(p0, pair.from) {
				value.write(p1, pair.to);
			}
		}
		p0 = p0.wrapping_offset(s0);
		p1 = p1.wrapping_offset(s1);
	}
}

//--------------------------------------------------------------------------------------------------
