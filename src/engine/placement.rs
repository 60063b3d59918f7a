//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::array::DeviceArray;
use crate::device::DeviceId;
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

/// Device of the first present operand. Every other present operand must be
/// on the same device.
///
/// Returns `None` when no operand is present.
pub fn resolve_device<'a>(
	operands: impl IntoIterator<Item = Option<&'a DeviceArray>>,
) -> UFuncResult<Option<DeviceId>> {
	let mut result = None;
	for array in operands.into_iter().flatten() {
		let id = array.device_id();
		match result {
			None => result = Some(id),
			Some(first) if first != id => {
				cold_path();
				return err(
					UFuncError::DeviceMismatch,
					format!("arrays are on different devices ({first} and {id})"),
				);
			},
			Some(_) => {},
		}
	}
	Ok(result)
}

//--------------------------------------------------------------------------------------------------
