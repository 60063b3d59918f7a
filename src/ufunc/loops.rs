//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use arrayvec::ArrayVec;
use thin_vec::ThinVec;

use crate::MAXARGS;
use crate::array::dtype::DType;
use crate::device::{AuxData, InnerLoopFn};

//--------------------------------------------------------------------------------------------------

/// One typed inner loop: operand dtypes (inputs then outputs) and the function.
#[derive(Clone)]
pub struct LoopEntry {
	pub types: ArrayVec<DType, MAXARGS>,
	pub func: InnerLoopFn,
	pub aux: Option<Arc<AuxData>>,
}

impl LoopEntry {
	pub fn new(types: &[DType], func: InnerLoopFn) -> Self {
		Self {
			types: types.iter().copied().take(MAXARGS).collect(),
			func,
			aux: None,
		}
	}

	pub fn inputs(&self, nin: usize) -> &[DType] {
		self.types.get(..nin).unwrap_or(&[])
	}

	pub fn outputs(&self, nin: usize) -> &[DType] {
		self.types.get(nin..).unwrap_or(&[])
	}
}

impl std::fmt::Debug for LoopEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("LoopEntry").field("types", &self.types.as_slice()).finish()
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopSource {
	Builtin,
	User { priority: i32 },
}

pub struct UserLoop {
	pub priority: i32,
	pub entry: LoopEntry,
}

/// Loops of one ufunc. User loops are searched first, highest priority first,
/// then the builtin loops in registration order.
#[derive(Default)]
pub struct LoopTable {
	builtin: Vec<LoopEntry>,
	user: ThinVec<UserLoop>,
}

impl LoopTable {
	pub fn add_builtin(&mut self, entry: LoopEntry) {
		self.builtin.push(entry);
	}

	/// Inserts after every user loop with the same or higher priority.
	pub fn add_user(&mut self, priority: i32, entry: LoopEntry) {
		let pos = self.user.iter().position(|u| u.priority < priority).unwrap_or(self.user.len());
		self.user.insert(pos, UserLoop { priority, entry });
	}

	pub fn iter(&self) -> impl Iterator<Item = (LoopSource, &LoopEntry)> {
		self.user
			.iter()
			.map(|u| (LoopSource::User { priority: u.priority }, &u.entry))
			.chain(self.builtin.iter().map(|e| (LoopSource::Builtin, e)))
	}

	pub fn find_exact(&self, types: &[DType]) -> Option<(LoopSource, &LoopEntry)> {
		self.iter().find(|(_, e)| e.types.as_slice() == types)
	}

	/// True if a user loop mentions `dtype` among its inputs.
	pub fn has_user_loop_for(&self, dtype: DType, nin: usize) -> bool {
		self.user.iter().any(|u| u.entry.inputs(nin).contains(&dtype))
	}

	pub fn len(&self) -> usize {
		self.builtin.len() + self.user.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ufunc::kernels;

	#[test]
	fn test_priority_order() {
		let mut table = LoopTable::default();
		table.add_builtin(LoopEntry::new(&[DType::F64, DType::F64, DType::F64], kernels::add::<f64>));
		table.add_user(1, LoopEntry::new(&[DType::I8, DType::I8, DType::I8], kernels::add::<i8>));
		table.add_user(5, LoopEntry::new(&[DType::I16, DType::I16, DType::I16], kernels::add::<i16>));
		table.add_user(1, LoopEntry::new(&[DType::I32, DType::I32, DType::I32], kernels::add::<i32>));

		let order: Vec<DType> = table.iter().map(|(_, e)| e.types[0]).collect();
		assert_eq!(order, vec![DType::I16, DType::I8, DType::I32, DType::F64]);

		let (source, _) = table.find_exact(&[DType::F64, DType::F64, DType::F64]).unwrap();
		assert_eq!(source, LoopSource::Builtin);
		assert!(table.has_user_loop_for(DType::I8, 2));
		assert!(!table.has_user_loop_for(DType::F64, 2));
	}
}
