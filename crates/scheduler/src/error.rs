//! Error types for blocking invocation and configuration.

use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

/// Backtrace of the thread that waited in `invoke_and_wait`.
///
/// Captured when the failure is handed back, so it shows the waiting call
/// site rather than the consumer thread.
pub struct CallerTrace(Backtrace);

impl CallerTrace {
	pub(crate) fn capture() -> Self {
		Self(Backtrace::capture())
	}

	pub fn backtrace(&self) -> &Backtrace {
		&self.0
	}
}

impl fmt::Debug for CallerTrace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

/// Failure of a blocking `invoke_and_wait` call.
#[derive(Debug, Error)]
pub enum InvokeError {
	/// Called on the consumer thread, which would wait on itself.
	#[error("invoke_and_wait called on the consumer thread")]
	OnConsumerThread,

	/// The wait was cancelled, or the task cancelled itself.
	#[error("invocation cancelled before the task completed")]
	Cancelled,

	/// The queued task was dropped without running.
	#[error("task was dropped before it ran")]
	Abandoned,

	/// The task panicked on the consumer thread.
	#[error("task panicked on the consumer thread: {message}")]
	Panicked {
		/// Rendered panic payload.
		message: String,
		/// Where the waiting thread observed the failure.
		caller_backtrace: CallerTrace,
	},
}

/// Errors that can occur when loading scheduler configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The TOML source did not parse or did not match the schema.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A field parsed but holds an unusable value.
	#[error("invalid value for {field}: {reason}")]
	Invalid {
		/// Offending field name.
		field: &'static str,
		/// What is wrong with it.
		reason: &'static str,
	},
}

/// Result type for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
