//! Scheduler façade.
//!
//! Owns the modality stack and the task queue. Modal transitions run on the
//! consumer thread; task submission works from any thread. Every transition
//! publishes the new global top to the admission gate and folds skipped tasks
//! back into the queue.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tarry_modality::{EntityId, ModalEntity, ModalityState};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{ConfigResult, InvokeError};
use crate::modal::{Left, ModalStack, OwnerId};
use crate::pump::Pump;
use crate::queue::TaskQueue;
use crate::task::{Expiration, TaskRecord, panic_message};
use crate::wait::oneshot;

#[cfg(test)]
mod tests;

/// Observer of modal transitions.
///
/// Called on the consumer thread before the stack changes, for global and
/// owner-scoped entities alike.
pub trait ModalityListener: Send + Sync + 'static {
	fn before_modality_changed(&self, entering: bool, entity: &ModalEntity);
}

impl<F> ModalityListener for F
where
	F: Fn(bool, &ModalEntity) + Send + Sync + 'static,
{
	fn before_modality_changed(&self, entering: bool, entity: &ModalEntity) {
		self(entering, entity)
	}
}

/// Registration handle returned by [`Scheduler::add_modality_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
	config: SchedulerConfig,
	consumer: ThreadId,
	queue: Arc<TaskQueue>,
	modal: Mutex<ModalStack>,
	listeners: Mutex<Vec<(ListenerId, Arc<dyn ModalityListener>)>>,
	next_listener: AtomicU64,
	shutdown: CancellationToken,
	force_leave_rounds: AtomicU32,
	/// Set while a round chain is posted and not yet finished.
	force_leave_active: AtomicBool,
}

/// Shared handle to one scheduler instance.
///
/// Cheap to clone. Construct one per event loop at start-up and pass it to
/// the code that submits work.
#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

impl Scheduler {
	/// Creates a scheduler whose tasks and modal transitions belong to `consumer`.
	pub fn new(config: SchedulerConfig, pump: Arc<dyn Pump>, consumer: ThreadId) -> ConfigResult<Self> {
		config.validate()?;
		let queue = TaskQueue::new(&config, Arc::default(), pump);
		tracing::debug!(?consumer, budget_ms = config.flush_budget_ms, strict = config.strict, "scheduler.start");
		Ok(Self {
			inner: Arc::new(Inner {
				config,
				consumer,
				queue,
				modal: Mutex::new(ModalStack::default()),
				listeners: Mutex::new(Vec::new()),
				next_listener: AtomicU64::new(1),
				shutdown: CancellationToken::new(),
				force_leave_rounds: AtomicU32::new(0),
				force_leave_active: AtomicBool::new(false),
			}),
		})
	}

	/// Creates a scheduler consumed by the calling thread.
	pub fn for_current_thread(config: SchedulerConfig, pump: Arc<dyn Pump>) -> ConfigResult<Self> {
		Self::new(config, pump, thread::current().id())
	}

	pub fn config(&self) -> &SchedulerConfig {
		&self.inner.config
	}

	pub fn queue(&self) -> &Arc<TaskQueue> {
		&self.inner.queue
	}

	pub fn is_consumer_thread(&self) -> bool {
		thread::current().id() == self.inner.consumer
	}

	fn check_consumer(&self, op: &'static str) {
		if !self.is_consumer_thread() {
			self.invariant_violation(op, "called off the consumer thread");
		}
	}

	/// Logs a broken invariant and carries on, or panics in strict mode.
	fn invariant_violation(&self, op: &'static str, detail: &str) {
		tracing::error!(op, detail, "modal.invariant_violation");
		if self.inner.config.strict {
			panic!("modality invariant violated in {op}: {detail}");
		}
	}

	/// Nests `entity` inside the current modality and returns the new state.
	///
	/// A dialog's window state is forced to the returned state.
	pub fn enter_modal(&self, entity: impl Into<ModalEntity>) -> ModalityState {
		let entity = entity.into();
		self.check_consumer("enter_modal");
		if self.inner.modal.lock().find(entity.id()).is_some() {
			self.invariant_violation("enter_modal", "entity is already modal");
			return self.inner.modal.lock().current().clone();
		}

		self.notify_listeners(true, &entity);
		let state = {
			let mut modal = self.inner.modal.lock();
			let state = modal.enter(entity.clone());
			self.inner.queue.gate().publish(state.clone());
			state
		};
		tracing::debug!(entity = %entity, depth = state.depth(), "modal.enter");
		self.inner.queue.reinclude_skipped_items();
		state
	}

	/// Removes the entity from the modality stack, in any stack position.
	///
	/// Owner-scoped entities are found too. Also unmarks the entity's
	/// transparency and evicts its window state.
	pub fn leave_modal(&self, id: EntityId) {
		self.check_consumer("leave_modal");
		let (found, owner) = {
			let modal = self.inner.modal.lock();
			(modal.find(id).cloned(), modal.owner_of(id))
		};
		let Some(entity) = found else {
			self.invariant_violation("leave_modal", "entity is not modal");
			self.dispose_side_tables(id);
			return;
		};
		if let Some(owner) = owner {
			self.leave_owner_entity(owner, &entity);
			return;
		}

		self.notify_listeners(false, &entity);
		let left = {
			let mut modal = self.inner.modal.lock();
			let left = modal.leave(id);
			let gate = self.inner.queue.gate();
			gate.publish(modal.current().clone());
			gate.publish_transparent(modal.transparent().clone());
			left
		};
		if let Left::At { index, was_top } = left {
			tracing::debug!(entity = %entity, index, was_top, "modal.leave");
		}
		self.inner.queue.reinclude_skipped_items();
	}

	/// Nests `entity` on `owner`'s stack. The global modality is unchanged.
	pub fn enter_modal_for(&self, owner: OwnerId, entity: impl Into<ModalEntity>) -> ModalityState {
		let entity = entity.into();
		self.check_consumer("enter_modal_for");
		if self.inner.modal.lock().find(entity.id()).is_some() {
			self.invariant_violation("enter_modal_for", "entity is already modal");
			return self.inner.modal.lock().current_for(owner).clone();
		}

		self.notify_listeners(true, &entity);
		let state = self.inner.modal.lock().enter_for(owner, entity.clone());
		tracing::debug!(owner = owner.get(), entity = %entity, depth = state.depth(), "modal.enter");
		self.inner.queue.reinclude_skipped_items();
		state
	}

	/// Removes the entity from `owner`'s stack. A global entity is left
	/// through [`Self::leave_modal`].
	pub fn leave_modal_for(&self, owner: OwnerId, id: EntityId) {
		self.check_consumer("leave_modal_for");
		let (found, global) = {
			let modal = self.inner.modal.lock();
			let found = modal.entities_for(owner).iter().find(|e| e.id() == id).cloned();
			(found, modal.is_global(id))
		};
		if global {
			self.leave_modal(id);
			return;
		}
		let Some(entity) = found else {
			self.invariant_violation("leave_modal_for", "entity is not modal for this owner");
			self.dispose_side_tables(id);
			return;
		};
		self.leave_owner_entity(owner, &entity);
	}

	fn leave_owner_entity(&self, owner: OwnerId, entity: &ModalEntity) {
		self.notify_listeners(false, entity);
		let left = {
			let mut modal = self.inner.modal.lock();
			let left = modal.leave_for(owner, entity.id());
			self.inner.queue.gate().publish_transparent(modal.transparent().clone());
			left
		};
		if let Left::At { index, was_top } = left {
			tracing::debug!(owner = owner.get(), entity = %entity, index, was_top, "modal.leave");
		}
		self.inner.queue.reinclude_skipped_items();
	}

	/// Top of the global modality stack. Consumer thread only.
	pub fn current_modality_state(&self) -> ModalityState {
		self.check_consumer("current_modality_state");
		self.inner.modal.lock().current().clone()
	}

	/// Last published global modality, readable from any thread.
	pub fn snapshot_modality(&self) -> Arc<ModalityState> {
		self.inner.queue.gate().current()
	}

	/// Top of `owner`'s stack, or the global top if the owner has no entities.
	pub fn current_modality_state_for(&self, owner: OwnerId) -> ModalityState {
		self.check_consumer("current_modality_state_for");
		self.inner.modal.lock().current_for(owner).clone()
	}

	/// Global modal entities, outermost first.
	pub fn current_modal_entities(&self) -> Vec<ModalEntity> {
		self.check_consumer("current_modal_entities");
		self.inner.modal.lock().entities().to_vec()
	}

	pub fn current_modal_entities_for(&self, owner: OwnerId) -> Vec<ModalEntity> {
		self.check_consumer("current_modal_entities_for");
		self.inner.modal.lock().entities_for(owner).to_vec()
	}

	pub fn is_in_modal_context(&self) -> bool {
		self.check_consumer("is_in_modal_context");
		self.inner.modal.lock().is_in_modal_context()
	}

	/// True if a global entity or one of `owner`'s entities is active.
	pub fn is_in_modal_context_for(&self, owner: OwnerId) -> bool {
		self.check_consumer("is_in_modal_context_for");
		self.inner.modal.lock().is_in_modal_context_for(owner)
	}

	/// Makes every entity of `state` invisible to admission checks until it
	/// leaves modality. Returns how many entities were newly marked.
	pub fn mark_transparent(&self, state: &ModalityState) -> usize {
		self.check_consumer("mark_transparent");
		let marked = {
			let mut modal = self.inner.modal.lock();
			let marked = modal.mark_transparent(state);
			self.inner.queue.gate().publish_transparent(modal.transparent().clone());
			marked
		};
		if marked > 0 {
			tracing::debug!(marked, modality = %state, "modal.mark_transparent");
			self.inner.queue.reinclude_skipped_items();
		}
		marked
	}

	/// State forced on a dialog when it entered modality.
	pub fn modality_for_window(&self, id: EntityId) -> Option<ModalityState> {
		self.inner.modal.lock().window_state(id).cloned()
	}

	/// Forgets the side-table entries of a destroyed entity.
	///
	/// The entity is expected to have left modality already; if it has not,
	/// it is left first.
	pub fn dispose_entity(&self, id: EntityId) -> bool {
		self.check_consumer("dispose_entity");
		let still_modal = self.inner.modal.lock().find(id).is_some();
		if still_modal {
			self.invariant_violation("dispose_entity", "entity disposed while modal");
			self.leave_modal(id);
			return true;
		}
		self.dispose_side_tables(id)
	}

	fn dispose_side_tables(&self, id: EntityId) -> bool {
		let mut modal = self.inner.modal.lock();
		let evicted = modal.evict(id);
		if evicted {
			self.inner.queue.gate().publish_transparent(modal.transparent().clone());
		}
		evicted
	}

	/// Queues `task` to run on the consumer thread once `modality` is
	/// admitted, unless `expiration` fires first.
	pub fn invoke_later(&self, modality: ModalityState, expiration: Expiration, task: impl FnOnce() + Send + 'static) {
		self.submit(TaskRecord::new(modality, expiration, task));
	}

	/// [`Self::invoke_later`] with a task that never expires.
	pub fn invoke_later_on(&self, modality: ModalityState, task: impl FnOnce() + Send + 'static) {
		self.invoke_later(modality, Expiration::never(), task);
	}

	/// Queues a prepared record. Returns false if it had already expired.
	pub fn submit(&self, record: TaskRecord) -> bool {
		if record.expiration().is_expired() {
			tracing::trace!(label = record.label(), "scheduler.submit_expired");
			return false;
		}
		self.inner.queue.push(record);
		true
	}

	/// Runs `task` on the consumer thread and blocks until it finishes.
	///
	/// Released early with [`InvokeError::Cancelled`] by [`Self::shutdown`].
	pub fn invoke_and_wait<R, F>(&self, modality: ModalityState, task: F) -> Result<R, InvokeError>
	where
		R: Send + 'static,
		F: FnOnce() -> R + Send + 'static,
	{
		self.wait_for(modality, None, task)
	}

	/// [`Self::invoke_and_wait`] that also gives up once `cancel` fires.
	///
	/// A task abandoned this way stays queued and may still run; its result
	/// is discarded.
	pub fn invoke_and_wait_with<R, F>(&self, modality: ModalityState, cancel: &CancellationToken, task: F) -> Result<R, InvokeError>
	where
		R: Send + 'static,
		F: FnOnce() -> R + Send + 'static,
	{
		self.wait_for(modality, Some(cancel), task)
	}

	fn wait_for<R, F>(&self, modality: ModalityState, cancel: Option<&CancellationToken>, task: F) -> Result<R, InvokeError>
	where
		R: Send + 'static,
		F: FnOnce() -> R + Send + 'static,
	{
		if self.is_consumer_thread() {
			tracing::error!("scheduler.invoke_and_wait.on_consumer_thread");
			return Err(InvokeError::OnConsumerThread);
		}
		let _span = tracing::debug_span!("scheduler.invoke_and_wait", modality = %modality).entered();

		let (completion, waiter) = oneshot();
		let record = TaskRecord::new(modality, Expiration::never(), move || completion.run(task)).with_label("invoke_and_wait");
		self.inner.queue.push(record);

		let shutdown = &self.inner.shutdown;
		let poll = self.inner.config.wait_poll_interval();
		let result = match cancel {
			Some(cancel) => waiter.wait(&[shutdown, cancel], poll),
			None => waiter.wait(&[shutdown], poll),
		};
		if let Err(err) = &result {
			tracing::debug!(error = %err, "scheduler.invoke_and_wait.failed");
		}
		result
	}

	/// Drops expired tasks, including skipped ones. Returns how many.
	pub fn purge_expired_items(&self) -> usize {
		self.inner.queue.purge_expired_items()
	}

	/// Best-effort unwind of every global modal scope.
	///
	/// Cancels the entities of the current top, then re-posts itself to the
	/// pump for the next tick, unconditionally admitted, until the host has
	/// left them all or the round limit is reached. Never blocks. A call made
	/// while a chain is still running is ignored.
	pub fn force_leave_all_modals(&self) {
		self.check_consumer("force_leave_all_modals");
		if self.inner.force_leave_active.swap(true, Ordering::SeqCst) {
			tracing::debug!(rounds = self.inner.force_leave_rounds.load(Ordering::SeqCst), "modal.force_leave.in_flight");
			return;
		}
		self.inner.force_leave_rounds.store(0, Ordering::SeqCst);
		self.force_leave_round();
	}

	fn force_leave_round(&self) {
		let top = self.inner.modal.lock().current().clone();
		if top.is_non_modal() {
			tracing::debug!(rounds = self.inner.force_leave_rounds.load(Ordering::SeqCst), "modal.force_leave.done");
			self.inner.force_leave_active.store(false, Ordering::SeqCst);
			return;
		}

		let round = self.inner.force_leave_rounds.fetch_add(1, Ordering::SeqCst) + 1;
		if round > self.inner.config.force_leave_max_rounds {
			tracing::warn!(rounds = round - 1, remaining = top.depth(), modality = %top, "modal.force_leave.gave_up");
			self.inner.force_leave_active.store(false, Ordering::SeqCst);
			return;
		}
		top.cancel_all_entities("force_leave_all_modals");

		// Posted to the pump, not the queue: each round needs its own tick.
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);
		self.inner.queue.pump().schedule(Box::new(move || {
			if let Some(inner) = weak.upgrade() {
				Scheduler { inner }.force_leave_round();
			}
		}));
	}

	/// Registers `listener` and returns its id.
	pub fn add_modality_listener(&self, listener: impl ModalityListener) -> ListenerId {
		let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
		let listener: Arc<dyn ModalityListener> = Arc::new(listener);
		self.inner.listeners.lock().push((id, listener));
		id
	}

	/// Unregisters a listener. Returns false if it was not registered.
	pub fn remove_modality_listener(&self, id: ListenerId) -> bool {
		let mut listeners = self.inner.listeners.lock();
		let before = listeners.len();
		listeners.retain(|(lid, _)| *lid != id);
		listeners.len() != before
	}

	fn notify_listeners(&self, entering: bool, entity: &ModalEntity) {
		let listeners: Vec<_> = self.inner.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
		for listener in listeners {
			let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener.before_modality_changed(entering, entity)));
			if let Err(payload) = result {
				tracing::error!(entity = %entity, entering, message = %panic_message(payload.as_ref()), "modal.listener_panicked");
			}
		}
	}

	/// Renders the modality stacks for diagnostics.
	pub fn describe_modality(&self) -> String {
		self.inner.modal.lock().describe()
	}

	/// Releases every blocked `invoke_and_wait` caller with
	/// [`InvokeError::Cancelled`].
	///
	/// Queued tasks stay queued; they are dropped with the last handle.
	pub fn shutdown(&self) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}
		tracing::debug!(pending = self.inner.queue.len(), skipped = self.inner.queue.skipped_len(), "scheduler.shutdown");
		self.inner.shutdown.cancel();
	}

	pub fn is_shut_down(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}
}

impl std::fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scheduler")
			.field("consumer", &self.inner.consumer)
			.field("modality", &self.inner.queue.gate().current())
			.field("queue", &self.inner.queue)
			.finish_non_exhaustive()
	}
}
