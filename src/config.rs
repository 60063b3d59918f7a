//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::device::FpFlags;
use crate::engine::dispatch::HostLock;
use crate::error::{UFuncError, UFuncResult, err};
use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorAction {
	Ignore,
	/// Log a warning and continue.
	Warn,
	/// Fail the call with a `FloatingPoint` error.
	Raise,
	/// Report to the configured `ErrorSink` and continue.
	Call,
}

/// What to do for each floating-point exception class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ErrorMask {
	pub divide: ErrorAction,
	pub over: ErrorAction,
	pub under: ErrorAction,
	pub invalid: ErrorAction,
}

impl Default for ErrorMask {
	fn default() -> Self {
		Self {
			divide: ErrorAction::Warn,
			over: ErrorAction::Warn,
			under: ErrorAction::Ignore,
			invalid: ErrorAction::Warn,
		}
	}
}

impl ErrorMask {
	pub fn all(action: ErrorAction) -> Self {
		Self {
			divide: action,
			over: action,
			under: action,
			invalid: action,
		}
	}

	fn entries(&self) -> [(FpFlags, ErrorAction); 4] {
		[
			(FpFlags::DIVIDE_BY_ZERO, self.divide),
			(FpFlags::OVERFLOW, self.over),
			(FpFlags::UNDERFLOW, self.under),
			(FpFlags::INVALID, self.invalid),
		]
	}
}

/// Receives floating-point errors under `ErrorAction::Call`.
pub trait ErrorSink: Send + Sync {
	fn on_fp_error(&self, ufunc: &str, flags: FpFlags);
}

//--------------------------------------------------------------------------------------------------

/// Per-call execution settings. Calls take an explicit `Config` (the `extobj`
/// keyword); otherwise the process defaults apply.
#[derive(Clone)]
pub struct Config {
	pub buffer_size: usize,
	pub error_mask: ErrorMask,
	pub error_sink: Option<Arc<dyn ErrorSink>>,
	pub host_lock: Option<Arc<dyn HostLock>>,
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("buffer_size", &self.buffer_size)
			.field("error_mask", &self.error_mask)
			.field("error_sink", &self.error_sink.is_some())
			.field("host_lock", &self.host_lock.is_some())
			.finish()
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			buffer_size: Self::DEFAULT_BUFFER_SIZE,
			error_mask: ErrorMask::default(),
			error_sink: None,
			host_lock: None,
		}
	}
}

impl Config {
	pub const DEFAULT_BUFFER_SIZE: usize = 8192;
	pub const MIN_BUFFER_SIZE: usize = 16;
	pub const MAX_BUFFER_SIZE: usize = 10_000_000;

	fn instance() -> &'static RwLock<Self> {
		static instance: OnceLock<RwLock<Config>> = OnceLock::new();
		instance.get_or_init(|| RwLock::new(Self::default()))
	}

	/// Snapshot of the process-wide defaults.
	pub fn defaults() -> Self {
		Self::instance().read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Replaces the process-wide defaults and returns the previous ones.
	pub fn set_defaults(config: Self) -> Self {
		let mut guard = Self::instance().write().unwrap_or_else(PoisonError::into_inner);
		std::mem::replace(&mut *guard, config)
	}

	pub fn geterr() -> ErrorMask {
		Self::defaults().error_mask
	}

	/// Sets the default error mask, returning the old one.
	pub fn seterr(mask: ErrorMask) -> ErrorMask {
		let mut guard = Self::instance().write().unwrap_or_else(PoisonError::into_inner);
		std::mem::replace(&mut guard.error_mask, mask)
	}

	pub fn with_buffer_size(mut self, buffer_size: usize) -> UFuncResult<Self> {
		if !(Self::MIN_BUFFER_SIZE..=Self::MAX_BUFFER_SIZE).contains(&buffer_size)
			|| buffer_size % 16 != 0
		{
			cold_path();
			return err(
				UFuncError::InvalidValue,
				format!(
					"buffer size ({buffer_size}) is not in range ({} - {}) or not a multiple of 16",
					Self::MIN_BUFFER_SIZE,
					Self::MAX_BUFFER_SIZE,
				),
			);
		}
		self.buffer_size = buffer_size;
		Ok(self)
	}

	pub fn with_error_mask(mut self, error_mask: ErrorMask) -> Self {
		self.error_mask = error_mask;
		self
	}

	pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
		self.error_sink = Some(sink);
		self
	}

	pub fn with_host_lock(mut self, lock: Arc<dyn HostLock>) -> Self {
		self.host_lock = Some(lock);
		self
	}

	/// Applies the error mask to the flags raised during one call.
	pub fn handle_fp_flags(&self, ufunc: &str, flags: FpFlags) -> UFuncResult<()> {
		if flags.is_empty() {
			return Ok(());
		}
		for (flag, action) in self.error_mask.entries() {
			if !flags.contains(flag) {
				continue;
			}
			match action {
				ErrorAction::Ignore => {},
				ErrorAction::Warn => {
					log::warn!("{flag} encountered in {ufunc}");
				},
				ErrorAction::Raise => {
					cold_path();
					return err(UFuncError::FloatingPoint, format!("{flag} encountered in {ufunc}"));
				},
				ErrorAction::Call => {
					let Some(sink) = &self.error_sink else {
						cold_path();
						return err(
							UFuncError::InvalidValue,
							format!("error callback requested for {flag} in {ufunc}, but no sink is set"),
						);
					};
					sink.on_fp_error(ufunc, flag);
				},
			}
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
