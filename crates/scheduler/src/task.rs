//! Deferred task records and expiration predicates.

use std::any::Any;
use std::fmt;
use std::panic::resume_unwind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tarry_modality::{ModalEntity, ModalityState};
use tokio_util::sync::CancellationToken;

/// Boxed unit of deferred work.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

type Predicate = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Predicate deciding whether a queued task is stale and should be dropped.
///
/// Evaluated on the consumer thread just before the task would run and during
/// purges. Predicates must not touch the queue.
#[derive(Clone, Default)]
pub struct Expiration(Option<Predicate>);

impl Expiration {
	/// Never expires.
	pub const fn never() -> Self {
		Self(None)
	}

	pub fn from_fn(predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
		Self(Some(Arc::new(predicate)))
	}

	/// Expires once `token` is cancelled.
	pub fn from_token(token: CancellationToken) -> Self {
		Self::from_fn(move || token.is_cancelled())
	}

	/// Expires once `entity` is cancelled or asked to close.
	pub fn when_cancelled(entity: ModalEntity) -> Self {
		Self::from_fn(move || entity.is_cancelled())
	}

	/// Expires as soon as any of `parts` does.
	pub fn any_of(parts: impl IntoIterator<Item = Expiration>) -> Self {
		let predicates: Vec<Predicate> = parts.into_iter().filter_map(|e| e.0).collect();
		match predicates.len() {
			0 => Self::never(),
			1 => Self(predicates.into_iter().next()),
			_ => Self::from_fn(move || predicates.iter().any(|p| p())),
		}
	}

	pub fn is_expired(&self) -> bool {
		self.0.as_ref().is_some_and(|p| p())
	}

	pub fn is_never(&self) -> bool {
		self.0.is_none()
	}
}

impl fmt::Debug for Expiration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.0.is_some() { f.write_str("Expiration(fn)") } else { f.write_str("Expiration(never)") }
	}
}

/// One queued task with its admission modality and expiration.
pub struct TaskRecord {
	task: TaskFn,
	modality: ModalityState,
	expiration: Expiration,
	label: &'static str,
	enqueued_at: Instant,
	depth_at_enqueue: usize,
	was_skipped: bool,
}

impl TaskRecord {
	pub fn new(modality: ModalityState, expiration: Expiration, task: impl FnOnce() + Send + 'static) -> Self {
		Self {
			task: Box::new(task),
			modality,
			expiration,
			label: "task",
			enqueued_at: Instant::now(),
			depth_at_enqueue: 0,
			was_skipped: false,
		}
	}

	/// Static label reported in traces and slow-task warnings.
	pub fn with_label(mut self, label: &'static str) -> Self {
		self.label = label;
		self
	}

	pub fn modality(&self) -> &ModalityState {
		&self.modality
	}

	pub fn expiration(&self) -> &Expiration {
		&self.expiration
	}

	pub fn label(&self) -> &'static str {
		self.label
	}

	/// Time spent queued so far.
	pub fn waited(&self) -> Duration {
		self.enqueued_at.elapsed()
	}

	/// Number of records already queued when this one was pushed.
	pub fn depth_at_enqueue(&self) -> usize {
		self.depth_at_enqueue
	}

	/// True if the record was parked at least once because its modality was not admitted.
	pub fn was_skipped(&self) -> bool {
		self.was_skipped
	}

	pub(crate) fn stamped(mut self, depth: usize) -> Self {
		self.depth_at_enqueue = depth;
		self.enqueued_at = Instant::now();
		self
	}

	pub(crate) fn into_skipped(mut self) -> Self {
		self.was_skipped = true;
		self
	}

	pub(crate) fn into_task(self) -> TaskFn {
		self.task
	}
}

impl fmt::Debug for TaskRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskRecord")
			.field("label", &self.label)
			.field("modality", &self.modality)
			.field("expiration", &self.expiration)
			.field("depth_at_enqueue", &self.depth_at_enqueue)
			.field("was_skipped", &self.was_skipped)
			.finish_non_exhaustive()
	}
}

/// Unwind payload raised by [`cancel_task`].
///
/// The flush loop swallows it; `invoke_and_wait` reports it as
/// [`InvokeError::Cancelled`](crate::InvokeError::Cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Aborts the running task as cancelled.
///
/// Only meaningful inside a task executed by the queue; anywhere else it
/// unwinds like an ordinary panic.
pub fn cancel_task() -> ! {
	resume_unwind(Box::new(Cancelled))
}

pub(crate) fn is_cancellation(payload: &(dyn Any + Send)) -> bool {
	payload.is::<Cancelled>()
}

/// Renders a panic payload for logs and errors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"<non-string panic payload>".to_string()
	}
}
