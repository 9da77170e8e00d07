//! Error types for ring growth.

use std::collections::TryReserveError;

use thiserror::Error;

/// Ring growth could not be satisfied.
///
/// Both variants are fatal for the infallible entry points, which panic with
/// the rendered error. The `try_*` variants hand it back instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
	/// Capacity arithmetic overflowed `usize`.
	#[error("ring capacity overflow: {requested} slots requested")]
	Overflow {
		/// Number of items the failed request needed room for.
		requested: usize,
	},

	/// The allocator refused the backing array.
	#[error("ring allocation failed: {0}")]
	AllocationFailed(#[from] TryReserveError),
}

/// Result type for fallible ring operations.
pub type Result<T> = std::result::Result<T, CapacityError>;
