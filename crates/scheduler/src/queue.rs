//! Admission-controlled FIFO of deferred tasks.
//!
//! Producers [`push`](TaskQueue::push) from any thread; the consumer thread
//! drains through [`flush`](TaskQueue::flush), which the queue schedules on the
//! host pump by itself. A record whose modality the gate does not admit is
//! parked in the skipped buffer until the modality changes, at which point
//! [`reinclude_skipped_items`](TaskQueue::reinclude_skipped_items) puts it back
//! at the head in its original order.
//!
//! The ring, the skipped buffer and the "flush scheduled" flag share one lock.
//! Tasks and expiration checks of dequeued records run outside it.

use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tarry_ring::RingBuffer;

use crate::config::{FlushBudget, SchedulerConfig, YieldReason};
use crate::gate::ModalityGate;
use crate::pump::Pump;
use crate::task::{TaskRecord, is_cancellation, panic_message};


struct QueueState {
	ring: RingBuffer<TaskRecord>,
	skipped: Vec<TaskRecord>,
	flush_scheduled: bool,
}

impl QueueState {
	/// Sets the flag and returns true if the caller must schedule a flush.
	fn arm_flush(&mut self) -> bool {
		!std::mem::replace(&mut self.flush_scheduled, true)
	}

	fn reinclude(&mut self, recycle_limit: usize) -> usize {
		let count = self.skipped.len();
		if count == 0 {
			return 0;
		}
		self.ring.bulk_prepend(self.skipped.drain(..));
		if self.skipped.capacity() > recycle_limit {
			self.skipped = Vec::new();
		}
		count
	}
}

#[derive(Default)]
struct Counters {
	executed: AtomicU64,
	skipped: AtomicU64,
	expired: AtomicU64,
	purged: AtomicU64,
	panicked: AtomicU64,
	cancelled: AtomicU64,
	yields: AtomicU64,
	max_wait_us: AtomicU64,
}

/// Cumulative queue counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
	/// Tasks that ran, including ones that panicked or cancelled themselves.
	pub executed: u64,
	/// Times a record was parked because its modality was not admitted.
	pub skipped: u64,
	/// Records dropped at dequeue because they had expired.
	pub expired: u64,
	/// Records dropped by `purge_expired_items`.
	pub purged: u64,
	/// Tasks that panicked.
	pub panicked: u64,
	/// Tasks that aborted through `cancel_task`.
	pub cancelled: u64,
	/// Flushes that stopped early to yield to the pump.
	pub yields: u64,
	/// Longest time an executed record spent queued.
	pub max_wait: Duration,
}

/// Outcome of one [`TaskQueue::flush`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
	pub executed: usize,
	pub skipped: usize,
	pub expired: usize,
	pub cancelled: usize,
	pub panicked: usize,
	/// Set when the flush stopped with admitted work still queued.
	pub yielded: Option<YieldReason>,
}

/// Deferred task queue drained on the consumer thread.
pub struct TaskQueue {
	weak_self: Weak<TaskQueue>,
	state: Mutex<QueueState>,
	gate: Arc<ModalityGate>,
	pump: Arc<dyn Pump>,
	budget: FlushBudget,
	slow_task_threshold: Duration,
	skipped_recycle_limit: usize,
	strict: bool,
	counters: Counters,
}

impl TaskQueue {
	pub fn new(config: &SchedulerConfig, gate: Arc<ModalityGate>, pump: Arc<dyn Pump>) -> Arc<Self> {
		Arc::new_cyclic(|weak_self| Self {
			weak_self: weak_self.clone(),
			state: Mutex::new(QueueState {
				ring: RingBuffer::with_capacity(config.initial_queue_capacity),
				skipped: Vec::new(),
				flush_scheduled: false,
			}),
			gate,
			pump,
			budget: config.flush_budget(),
			slow_task_threshold: config.slow_task_threshold(),
			skipped_recycle_limit: config.skipped_recycle_limit,
			strict: config.strict,
			counters: Counters::default(),
		})
	}

	/// Appends `record` and makes sure a flush is scheduled.
	///
	/// Callable from any thread. At most one flush is pending on the pump at a
	/// time, however many records are pushed before it runs.
	pub fn push(&self, record: TaskRecord) {
		let schedule = {
			let mut state = self.state.lock();
			let depth = state.ring.len();
			state.ring.enqueue(record.stamped(depth));
			state.arm_flush()
		};
		if schedule {
			self.schedule_flush();
		}
	}

	/// Schedules a flush unless one is already pending.
	pub fn request_flush(&self) {
		if self.state.lock().arm_flush() {
			self.schedule_flush();
		}
	}

	fn schedule_flush(&self) {
		let weak = self.weak_self.clone();
		tracing::trace!("queue.schedule_flush");
		self.pump.schedule(Box::new(move || {
			if let Some(queue) = weak.upgrade() {
				queue.flush();
			}
		}));
	}

	/// Runs admitted tasks in FIFO order until the queue is drained or the
	/// budget is spent. Consumer thread only.
	///
	/// # Panics
	///
	/// In strict mode, re-raises the first task panic after scheduling a
	/// follow-up flush for the remaining records.
	pub fn flush(&self) -> FlushReport {
		let _span = tracing::trace_span!("queue.flush").entered();
		self.state.lock().flush_scheduled = false;

		let started = Instant::now();
		let mut report = FlushReport::default();

		while let Some(record) = self.next_admitted(&mut report) {
			if record.expiration().is_expired() {
				tracing::trace!(label = record.label(), "queue.expired");
				report.expired += 1;
				self.counters.expired.fetch_add(1, Ordering::Relaxed);
				drop(record);
				self.request_flush();
				continue;
			}

			self.run(record, &mut report);

			let Some(reason) = self.budget.exhausted(started, report.executed, self.pump.as_ref()) else {
				continue;
			};
			if self.len() > 0 {
				report.yielded = Some(reason);
				self.counters.yields.fetch_add(1, Ordering::Relaxed);
				self.request_flush();
				break;
			}
		}

		tracing::trace!(
			executed = report.executed,
			skipped = report.skipped,
			expired = report.expired,
			yielded = report.yielded.map(YieldReason::as_str),
			elapsed_us = started.elapsed().as_micros() as u64,
			"queue.flush.done"
		);
		report
	}

	/// Pops records until one is admitted, parking the rest.
	fn next_admitted(&self, report: &mut FlushReport) -> Option<TaskRecord> {
		let mut state = self.state.lock();
		while let Some(record) = state.ring.dequeue() {
			if self.gate.admits(record.modality()) {
				return Some(record);
			}
			tracing::trace!(label = record.label(), modality = %record.modality(), "queue.skip");
			report.skipped += 1;
			self.counters.skipped.fetch_add(1, Ordering::Relaxed);
			state.skipped.push(record.into_skipped());
		}
		None
	}

	fn run(&self, record: TaskRecord, report: &mut FlushReport) {
		let label = record.label();
		let waited = record.waited();
		let depth_at_enqueue = record.depth_at_enqueue();
		let task = record.into_task();

		self.counters.max_wait_us.fetch_max(waited.as_micros() as u64, Ordering::Relaxed);
		let run_started = Instant::now();
		let outcome = std::panic::catch_unwind(AssertUnwindSafe(task));
		let ran_for = run_started.elapsed();

		report.executed += 1;
		self.counters.executed.fetch_add(1, Ordering::Relaxed);

		if ran_for > self.slow_task_threshold {
			tracing::warn!(
				label,
				waited_ms = waited.as_millis() as u64,
				ran_ms = ran_for.as_millis() as u64,
				depth_at_enqueue,
				"queue.slow_task"
			);
		}

		let Err(payload) = outcome else {
			return;
		};
		if is_cancellation(payload.as_ref()) {
			tracing::trace!(label, "queue.task_cancelled");
			report.cancelled += 1;
			self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
			return;
		}

		report.panicked += 1;
		self.counters.panicked.fetch_add(1, Ordering::Relaxed);
		tracing::error!(label, message = %panic_message(payload.as_ref()), "queue.task_panicked");
		if self.strict {
			self.request_flush();
			std::panic::resume_unwind(payload);
		}
	}

	/// Moves every skipped record back to the head of the queue, keeping
	/// their order, and schedules a flush if anything is queued.
	///
	/// Called on every modality change.
	pub fn reinclude_skipped_items(&self) {
		let (count, schedule) = {
			let mut state = self.state.lock();
			let count = state.reinclude(self.skipped_recycle_limit);
			let schedule = !state.ring.is_empty() && state.arm_flush();
			(count, schedule)
		};
		if count > 0 {
			tracing::trace!(count, "queue.reinclude");
		}
		if schedule {
			self.schedule_flush();
		}
	}

	/// Reincludes skipped records, then drops every queued record whose
	/// expiration has fired. Returns the number dropped.
	///
	/// Expirations are evaluated under the queue lock.
	pub fn purge_expired_items(&self) -> usize {
		let purged = {
			let mut state = self.state.lock();
			state.reinclude(self.skipped_recycle_limit);
			state.ring.remove_all(|record| record.expiration().is_expired())
		};
		if purged > 0 {
			self.counters.purged.fetch_add(purged as u64, Ordering::Relaxed);
			tracing::debug!(purged, "queue.purge");
		}
		self.reinclude_skipped_items();
		purged
	}

	/// Records waiting in the ring, excluding skipped ones.
	pub fn len(&self) -> usize {
		self.state.lock().ring.len()
	}

	pub fn skipped_len(&self) -> usize {
		self.state.lock().skipped.len()
	}

	pub fn is_empty(&self) -> bool {
		let state = self.state.lock();
		state.ring.is_empty() && state.skipped.is_empty()
	}

	pub fn stats(&self) -> QueueStats {
		let c = &self.counters;
		QueueStats {
			executed: c.executed.load(Ordering::Relaxed),
			skipped: c.skipped.load(Ordering::Relaxed),
			expired: c.expired.load(Ordering::Relaxed),
			purged: c.purged.load(Ordering::Relaxed),
			panicked: c.panicked.load(Ordering::Relaxed),
			cancelled: c.cancelled.load(Ordering::Relaxed),
			yields: c.yields.load(Ordering::Relaxed),
			max_wait: Duration::from_micros(c.max_wait_us.load(Ordering::Relaxed)),
		}
	}

	/// One line per pending record, queued ones first, then skipped ones.
	pub fn describe(&self) -> String {
		let state = self.state.lock();
		let mut out = String::new();
		for record in state.ring.iter() {
			let _ = writeln!(out, "{} @ {}", record.label(), record.modality());
		}
		for record in &state.skipped {
			let _ = writeln!(out, "{} @ {} (skipped)", record.label(), record.modality());
		}
		out
	}

	pub fn gate(&self) -> &Arc<ModalityGate> {
		&self.gate
	}

	pub fn pump(&self) -> &Arc<dyn Pump> {
		&self.pump
	}
}

impl std::fmt::Debug for TaskQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("TaskQueue")
			.field("len", &state.ring.len())
			.field("skipped", &state.skipped.len())
			.field("flush_scheduled", &state.flush_scheduled)
			.field("budget", &self.budget)
			.finish_non_exhaustive()
	}
}
