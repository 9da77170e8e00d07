//! One-shot completion gate behind `invoke_and_wait`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{CallerTrace, InvokeError};
use crate::task::{is_cancellation, panic_message};

enum Outcome<R> {
	Done(R),
	Cancelled,
	Abandoned,
	Panicked(String),
}

struct Slot<R> {
	outcome: Mutex<Option<Outcome<R>>>,
	ready: Condvar,
}

impl<R> Slot<R> {
	fn complete(&self, outcome: Outcome<R>) {
		let mut guard = self.outcome.lock();
		if guard.is_none() {
			*guard = Some(outcome);
			self.ready.notify_all();
		}
	}
}

/// Producer half, moved into the relay task.
pub(crate) struct Completion<R> {
	slot: Option<Arc<Slot<R>>>,
}

/// Consumer half, held by the blocked caller.
pub(crate) struct Waiter<R> {
	slot: Arc<Slot<R>>,
}

pub(crate) fn oneshot<R>() -> (Completion<R>, Waiter<R>) {
	let slot = Arc::new(Slot {
		outcome: Mutex::new(None),
		ready: Condvar::new(),
	});
	(Completion { slot: Some(Arc::clone(&slot)) }, Waiter { slot })
}

impl<R> Completion<R> {
	/// Runs `task`, capturing its result or failure for the waiter.
	///
	/// The failure is not re-raised on the consumer thread.
	pub(crate) fn run(mut self, task: impl FnOnce() -> R) {
		let Some(slot) = self.slot.take() else {
			return;
		};
		let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
			Ok(value) => Outcome::Done(value),
			Err(payload) if is_cancellation(payload.as_ref()) => Outcome::Cancelled,
			Err(payload) => {
				let message = panic_message(payload.as_ref());
				tracing::debug!(%message, "scheduler.invoke_and_wait.task_panicked");
				Outcome::Panicked(message)
			}
		};
		slot.complete(outcome);
	}
}

impl<R> Drop for Completion<R> {
	fn drop(&mut self) {
		if let Some(slot) = self.slot.take() {
			slot.complete(Outcome::Abandoned);
		}
	}
}

impl<R> Waiter<R> {
	/// Blocks until the relay completes or any of `cancel` fires, re-checking
	/// the tokens every `poll`.
	pub(crate) fn wait(self, cancel: &[&CancellationToken], poll: Duration) -> Result<R, InvokeError> {
		let mut guard = self.slot.outcome.lock();
		loop {
			if let Some(outcome) = guard.take() {
				return match outcome {
					Outcome::Done(value) => Ok(value),
					Outcome::Cancelled => Err(InvokeError::Cancelled),
					Outcome::Abandoned => Err(InvokeError::Abandoned),
					Outcome::Panicked(message) => Err(InvokeError::Panicked {
						message,
						caller_backtrace: CallerTrace::capture(),
					}),
				};
			}
			if cancel.iter().any(|token| token.is_cancelled()) {
				return Err(InvokeError::Cancelled);
			}
			self.slot.ready.wait_for(&mut guard, poll);
		}
	}
}
