//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::{self, Device, DeviceBuffer, DeviceId, DevicePtr};
use crate::engine::assign;
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::{cold_path, fmt_shape};

pub mod dim_merger;
pub mod dtype;
pub mod layout;

use dtype::{DType, HasDType, Scalar};
use layout::{Order, ShapeVec, StrideVec};

//--------------------------------------------------------------------------------------------------

/// Strided n-dimensional array living in the memory of one device.
///
/// Cloning is cheap and produces another view of the same memory.
#[derive(Clone)]
pub struct DeviceArray {
	buffer: Arc<DeviceBuffer>,
	/// Byte offset of the element at index `[0, 0, ..]` from the start of the buffer.
	offset: isize,
	shape: ShapeVec,
	strides: StrideVec,
	dtype: DType,
	writeable: bool,
}

impl std::fmt::Debug for DeviceArray {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("DeviceArray")
			.field("shape", &self.shape.as_slice())
			.field("strides", &self.strides.as_slice())
			.field("dtype", &self.dtype)
			.field("device", &self.device_id())
			.finish()
	}
}

impl DeviceArray {
	pub fn new_empty_on(
		shape: &[usize],
		dtype: DType,
		device: Arc<dyn Device>,
		order: Order,
	) -> UFuncResult<Self> {
		let (strides, bytes) = layout::contiguous_strides(shape, dtype.itemsize(), order)?;
		let buffer = DeviceBuffer::new(device, bytes)?;
		Ok(Self {
			buffer,
			offset: 0,
			shape: SmallVec::from_slice(shape),
			strides,
			dtype,
			writeable: true,
		})
	}

	pub fn new_empty(shape: &[usize], dtype: DType, device: DeviceId, order: Order) -> UFuncResult<Self> {
		Self::new_empty_on(shape, dtype, device::device(device)?, order)
	}

	pub fn new_zeroed(shape: &[usize], dtype: DType, device: DeviceId, order: Order) -> UFuncResult<Self> {
		let array = Self::new_empty(shape, dtype, device, order)?;
		let zeros = vec![0_u8; array.buffer.bytes()];
		unsafe {
			array.buffer.device().upload_data(zeros.as_ptr(), array.buffer.memory(), zeros.len())?;
		}
		Ok(array)
	}

	/// New uninitialized array with the same shape on the same device.
	///
	/// With `Order::K` or `Order::A` the memory order follows `self` when it is
	/// Fortran-contiguous and not C-contiguous.
	pub fn new_like(&self, dtype: Option<DType>, order: Order) -> UFuncResult<Self> {
		let order = match order {
			Order::C | Order::F => order,
			Order::A | Order::K => {
				if self.is_f_contiguous() && !self.is_c_contiguous() {
					Order::F
				} else {
					Order::C
				}
			},
		};
		Self::new_empty_on(&self.shape, dtype.unwrap_or(self.dtype), self.device().clone(), order)
	}

	/// Uploads `data` in C order.
	pub fn from_slice<T: HasDType>(data: &[T], shape: &[usize], device: DeviceId) -> UFuncResult<Self> {
		let size = layout::size_of_shape(shape);
		if size != data.len() {
			cold_path();
			return err(
				UFuncError::ShapeMismatch,
				format!("cannot place {} elements into shape {}", data.len(), fmt_shape(shape)),
			);
		}
		let array = Self::new_empty(shape, T::dtype, device, Order::C)?;
		let bytes = std::mem::size_of_val(data);
		unsafe {
			array.buffer.device().upload_data(data.as_ptr().cast(), array.data(), bytes)?;
		}
		Ok(array)
	}

	/// 0-d array holding `value` converted to `dtype`.
	pub fn from_scalar(value: Scalar, dtype: DType, device: Arc<dyn Device>) -> UFuncResult<Self> {
		let array = Self::new_empty_on(&[], dtype, device, Order::C)?;
		let mut tmp = [0_u8; 8];
		if !unsafe { value.write(tmp.as_mut_ptr(), dtype) } {
			cold_path();
			return err(UFuncError::TypeResolution, format!("cannot store a scalar as {dtype}"));
		}
		unsafe {
			array.buffer.device().upload_data(tmp.as_ptr(), array.data(), dtype.itemsize())?;
		}
		Ok(array)
	}

	/// Downloads all elements in C order.
	pub fn to_vec<T: HasDType>(&self) -> UFuncResult<Vec<T>> {
		self.dtype.ensure(T::dtype)?;
		let src = if self.is_c_contiguous() && self.strides.iter().all(|&s| s >= 0) {
			self.clone()
		} else {
			let tmp = self.new_like(None, Order::C)?;
			assign::assign(&tmp, self)?;
			tmp
		};
		let size = src.size();
		let mut result: Vec<T> = Vec::with_capacity(size);
		unsafe {
			src.device().download_data(
				src.data(),
				result.as_mut_ptr().cast(),
				size * std::mem::size_of::<T>(),
			)?;
			result.set_len(size);
		}
		Ok(result)
	}

	/// Value of a single-element array.
	pub fn scalar_value(&self) -> UFuncResult<Scalar> {
		if self.size() != 1 || !self.dtype.is_numeric() {
			cold_path();
			return err(UFuncError::InvalidValue, "only numeric single-element arrays have a value");
		}
		let mut tmp = [0_u8; 8];
		unsafe {
			self.device().download_data(self.data(), tmp.as_mut_ptr(), self.dtype.itemsize())?;
			Scalar::read(tmp.as_ptr(), self.dtype)
		}
		.map_or_else(|| err(UFuncError::Internal, "unreadable scalar"), Ok)
	}

	//----------------------------------------------------------------------------------------------

	#[inline]
	pub fn shape(&self) -> &[usize] {
		&self.shape
	}

	/// Byte strides.
	#[inline]
	pub fn strides(&self) -> &[isize] {
		&self.strides
	}

	#[inline]
	pub fn ndim(&self) -> usize {
		self.shape.len()
	}

	#[inline]
	pub fn size(&self) -> usize {
		layout::size_of_shape(&self.shape)
	}

	#[inline]
	pub fn nbytes(&self) -> usize {
		self.size() * self.dtype.itemsize()
	}

	#[inline]
	pub fn dtype(&self) -> DType {
		self.dtype
	}

	#[inline]
	pub fn itemsize(&self) -> usize {
		self.dtype.itemsize()
	}

	#[inline]
	pub fn device(&self) -> &Arc<dyn Device> {
		self.buffer.device()
	}

	#[inline]
	pub fn device_id(&self) -> DeviceId {
		self.buffer.device_id()
	}

	/// Device address of the first element.
	#[inline]
	pub fn data(&self) -> DevicePtr {
		self.buffer.memory().byte_offset(self.offset)
	}

	pub fn is_c_contiguous(&self) -> bool {
		layout::is_c_contiguous(&self.shape, &self.strides, self.itemsize())
	}

	pub fn is_f_contiguous(&self) -> bool {
		layout::is_f_contiguous(&self.shape, &self.strides, self.itemsize())
	}

	pub fn is_aligned(&self) -> bool {
		let align = self.dtype.align();
		self.data().addr() % align == 0
			&& self.strides.iter().zip(self.shape.iter()).all(|(&stride, &size)| {
				size <= 1 || stride.unsigned_abs() % align == 0
			})
	}

	#[inline]
	pub fn is_writeable(&self) -> bool {
		self.writeable
	}

	pub fn ensure_writeable(&self) -> UFuncResult<()> {
		if !self.writeable {
			cold_path();
			return err(UFuncError::NotWriteable, "output array is read-only");
		}
		Ok(())
	}

	//----------------------------------------------------------------------------------------------

	/// Read-only view of the same memory.
	pub fn read_only(&self) -> Self {
		let mut view = self.clone();
		view.writeable = false;
		view
	}

	fn check_axis(&self, axis: usize) -> UFuncResult<()> {
		if axis >= self.ndim() {
			cold_path();
			return err(
				UFuncError::AxisOutOfBounds,
				format!("axis {axis} is out of bounds for array of dimension {}", self.ndim()),
			);
		}
		Ok(())
	}

	/// View with the elements along `axis` in reverse order (`a[::-1]` for axis 0).
	pub fn reversed(&self, axis: usize) -> UFuncResult<Self> {
		self.check_axis(axis)?;
		let mut view = self.clone();
		let size = view.shape[axis];
		if size > 1 {
			let stride = view.strides[axis];
			view.offset += (size as isize - 1) * stride;
			view.strides[axis] = -stride;
		}
		Ok(view)
	}

	/// View of `start..stop` with a positive `step` along `axis`.
	pub fn slice(&self, axis: usize, start: usize, stop: usize, step: usize) -> UFuncResult<Self> {
		self.check_axis(axis)?;
		let size = self.shape[axis];
		if step == 0 || start > stop || stop > size {
			cold_path();
			return err(UFuncError::InvalidValue, format!("invalid slice {start}..{stop};{step}"));
		}
		let mut view = self.clone();
		view.offset += start as isize * view.strides[axis];
		view.shape[axis] = (stop - start).div_ceil(step);
		view.strides[axis] *= step as isize;
		Ok(view)
	}

	/// View with `axis` fixed at `index`; the axis is removed.
	pub fn select(&self, axis: usize, index: usize) -> UFuncResult<Self> {
		self.check_axis(axis)?;
		if index >= self.shape[axis] {
			cold_path();
			return err(UFuncError::InvalidValue, format!("index {index} out of range"));
		}
		let mut view = self.clone();
		view.offset += index as isize * view.strides[axis];
		view.shape.remove(axis);
		view.strides.remove(axis);
		Ok(view)
	}

	pub fn permuted(&self, axes: &[usize]) -> UFuncResult<Self> {
		let mut seen: SmallVec<[bool; 8]> = SmallVec::from_elem(false, self.ndim());
		if axes.len() != self.ndim() {
			cold_path();
			return err(UFuncError::InvalidValue, "axes don't match array");
		}
		for &a in axes {
			match seen.get_mut(a) {
				Some(s) if !*s => *s = true,
				_ => {
					cold_path();
					return err(UFuncError::InvalidValue, "axes don't match array");
				},
			}
		}
		let mut view = self.clone();
		view.shape = axes.iter().map(|&a| self.shape[a]).collect();
		view.strides = axes.iter().map(|&a| self.strides[a]).collect();
		Ok(view)
	}

	/// Reverses the order of the axes.
	pub fn transposed(&self) -> Self {
		let mut view = self.clone();
		view.shape.reverse();
		view.strides.reverse();
		view
	}

	/// Reinterprets a C-contiguous array with a new shape of the same size.
	pub fn reshaped(&self, shape: &[usize]) -> UFuncResult<Self> {
		if layout::size_of_shape(shape) != self.size() || !self.is_c_contiguous() {
			cold_path();
			return err(
				UFuncError::ShapeMismatch,
				format!("cannot reshape array of shape {} into {}", fmt_shape(&self.shape), fmt_shape(shape)),
			);
		}
		let (strides, _) = layout::contiguous_strides(shape, self.itemsize(), Order::C)?;
		let mut view = self.clone();
		view.shape = SmallVec::from_slice(shape);
		view.strides = strides;
		Ok(view)
	}

	/// Raw view constructor. The view must stay within the buffer.
	pub(crate) fn with_layout(&self, offset_bytes: isize, shape: &[usize], strides: &[isize]) -> Self {
		let mut view = self.clone();
		view.offset += offset_bytes;
		view.shape = SmallVec::from_slice(shape);
		view.strides = SmallVec::from_slice(strides);
		view
	}

	//----------------------------------------------------------------------------------------------

	fn buffer_extent(&self) -> Option<(isize, isize)> {
		layout::byte_extent(&self.shape, &self.strides, self.itemsize())
			.map(|(low, high)| (self.offset + low, self.offset + high))
	}

	/// True if both arrays may touch the same bytes.
	pub fn overlaps(&self, other: &Self) -> bool {
		if !Arc::ptr_eq(&self.buffer, &other.buffer) {
			return false;
		}
		match (self.buffer_extent(), other.buffer_extent()) {
			(Some((a_low, a_high)), Some((b_low, b_high))) => a_low < b_high && b_low < a_high,
			_ => false,
		}
	}

	/// True if both are the exact same view: same memory, shape, strides and dtype.
	pub fn is_same_view(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.buffer, &other.buffer)
			&& self.offset == other.offset
			&& self.shape == other.shape
			&& self.strides == other.strides
			&& self.dtype == other.dtype
	}
}

//--------------------------------------------------------------------------------------------------
