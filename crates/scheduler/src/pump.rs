//! Host event-pump abstraction.
//!
//! The scheduler never runs tasks on its own; it asks the pump to call the
//! flush callback on the consumer thread at some later tick.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Callback posted to the consumer thread.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The host's single-consumer event loop.
pub trait Pump: Send + Sync + 'static {
	/// Runs `callback` on the consumer thread at a later tick, never inline.
	fn schedule(&self, callback: Callback);

	/// Returns true when the host has an input or paint event waiting that
	/// should preempt queued work.
	fn has_pending_priority_event(&self) -> bool {
		false
	}
}

/// Pump driven explicitly by the caller.
///
/// Used by tests and by hosts that own their loop and want to run scheduler
/// callbacks at a point of their choosing.
#[derive(Default)]
pub struct ManualPump {
	pending: Mutex<VecDeque<Callback>>,
	priority_event: AtomicBool,
}

impl ManualPump {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of callbacks posted and not yet run.
	pub fn pending(&self) -> usize {
		self.pending.lock().len()
	}

	/// Runs the callbacks posted so far and returns how many ran.
	///
	/// Callbacks posted while the batch runs wait for the next call. A
	/// panicking callback propagates after the rest of its batch is put back
	/// at the front of the pending list, ahead of anything posted meanwhile.
	pub fn run_pending(&self) -> usize {
		let mut batch = std::mem::take(&mut *self.pending.lock());
		let count = batch.len();
		while let Some(callback) = batch.pop_front() {
			if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
				let mut pending = self.pending.lock();
				batch.append(&mut pending);
				*pending = batch;
				drop(pending);
				panic::resume_unwind(payload);
			}
		}
		count
	}

	/// Runs batches until nothing is pending or `max_rounds` batches ran.
	/// Returns the number of batches that ran.
	pub fn run_until_idle(&self, max_rounds: usize) -> usize {
		let mut rounds = 0;
		while rounds < max_rounds && self.run_pending() > 0 {
			rounds += 1;
		}
		rounds
	}

	pub fn set_priority_event_pending(&self, pending: bool) {
		self.priority_event.store(pending, Ordering::SeqCst);
	}
}

impl Pump for ManualPump {
	fn schedule(&self, callback: Callback) {
		self.pending.lock().push_back(callback);
	}

	fn has_pending_priority_event(&self) -> bool {
		self.priority_event.load(Ordering::SeqCst)
	}
}

impl std::fmt::Debug for ManualPump {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ManualPump")
			.field("pending", &self.pending())
			.field("priority_event", &self.has_pending_priority_event())
			.finish()
	}
}
