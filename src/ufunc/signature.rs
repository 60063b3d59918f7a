//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::error::{UFuncError, UFuncResult, err};
use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

/// Parsed core signature of a generalized ufunc, e.g. `(m,n),(n,p)->(m,p)`.
///
/// Core dimension names are numbered in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSignature {
	text: String,
	names: Vec<String>,
	/// For each operand, the indices of its core dimensions.
	operand_dims: Vec<SmallVec<[usize; 4]>>,
}

impl CoreSignature {
	pub fn parse(text: &str, nin: usize, nout: usize) -> UFuncResult<Self> {
		let Some((inputs, outputs)) = text.split_once("->") else {
			cold_path();
			return invalid(text, "missing '->'");
		};
		let mut names: Vec<String> = Vec::new();
		let mut operand_dims = Vec::with_capacity(nin + nout);
		for (part, expected) in [(inputs, nin), (outputs, nout)] {
			let groups = parse_groups(text, part)?;
			if groups.len() != expected {
				cold_path();
				return invalid(text, "wrong number of operands");
			}
			for group in groups {
				let mut dims = SmallVec::new();
				for name in group {
					let index = if let Some(i) = names.iter().position(|n| *n == name) {
						i
					} else {
						names.push(name);
						names.len() - 1
					};
					dims.push(index);
				}
				operand_dims.push(dims);
			}
		}
		Ok(Self { text: text.to_string(), names, operand_dims })
	}

	/// Builds a signature from already numbered dimensions.
	pub(crate) fn from_parts(text: &str, names: &[&str], operand_dims: &[&[usize]]) -> Self {
		Self {
			text: text.to_string(),
			names: names.iter().map(ToString::to_string).collect(),
			operand_dims: operand_dims.iter().map(|d| SmallVec::from_slice(d)).collect(),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.text
	}

	/// Number of distinct core dimension names.
	pub fn num_dims(&self) -> usize {
		self.names.len()
	}

	pub fn dim_name(&self, index: usize) -> &str {
		self.names.get(index).map_or("?", String::as_str)
	}

	pub fn nop(&self) -> usize {
		self.operand_dims.len()
	}

	/// Core dimension indices of operand `op`.
	pub fn operand_dims(&self, op: usize) -> &[usize] {
		self.operand_dims.get(op).map_or(&[], |d| d.as_slice())
	}

	pub fn operand_ndim(&self, op: usize) -> usize {
		self.operand_dims(op).len()
	}
}

#[cold]
#[inline(never)]
fn invalid<T>(text: &str, why: &str) -> UFuncResult<T> {
	err(UFuncError::InvalidValue, format!("{why} in signature '{text}'"))
}

fn parse_groups(text: &str, part: &str) -> UFuncResult<Vec<Vec<String>>> {
	let part: String = part.chars().filter(|c| !c.is_whitespace()).collect();
	let mut groups = Vec::new();
	let mut rest = part.as_str();
	while !rest.is_empty() {
		let Some(inner) = rest.strip_prefix('(') else {
			cold_path();
			return invalid(text, "expected '('");
		};
		let Some((body, after)) = inner.split_once(')') else {
			cold_path();
			return invalid(text, "missing ')'");
		};
		let mut names = Vec::new();
		if !body.is_empty() {
			for name in body.split(',') {
				if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
					cold_path();
					return invalid(text, "bad dimension name");
				}
				names.push(name.to_string());
			}
		}
		groups.push(names);
		rest = after.strip_prefix(',').unwrap_or(after);
		if after.starts_with(',') && rest.is_empty() {
			cold_path();
			return invalid(text, "trailing ','");
		}
	}
	Ok(groups)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_matmul() {
		let sig = CoreSignature::parse("(m,n),(n,p)->(m,p)", 2, 1).unwrap();
		assert_eq!(sig.num_dims(), 3);
		assert_eq!(sig.operand_dims(0), &[0, 1]);
		assert_eq!(sig.operand_dims(1), &[1, 2]);
		assert_eq!(sig.operand_dims(2), &[0, 2]);
		assert_eq!(sig.dim_name(2), "p");
	}

	#[test]
	fn test_from_parts_matches_parse() {
		let text = "(m,n),(n,p)->(m,p)";
		let parsed = CoreSignature::parse(text, 2, 1).unwrap();
		let built = CoreSignature::from_parts(text, &["m", "n", "p"], &[&[0, 1], &[1, 2], &[0, 2]]);
		assert_eq!(parsed, built);
	}

	#[test]
	fn test_parse_scalar_output() {
		let sig = CoreSignature::parse("(i), (i) -> ()", 2, 1).unwrap();
		assert_eq!(sig.num_dims(), 1);
		assert_eq!(sig.operand_ndim(2), 0);
	}

	#[test]
	fn test_parse_errors() {
		assert!(CoreSignature::parse("(i),(i)", 2, 1).is_err());
		assert!(CoreSignature::parse("(i)->()", 2, 1).is_err());
		assert!(CoreSignature::parse("(i,)->()", 1, 1).is_err());
		assert!(CoreSignature::parse("i->()", 1, 1).is_err());
	}
}
