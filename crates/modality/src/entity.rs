use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a modal entity.
///
/// Ids are process-unique and never reused, so side tables keyed by them
/// (transparency, window states) cannot alias a later entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
	fn next() -> Self {
		Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
	}

	/// Returns the raw id value.
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for EntityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Kind tag of a [`ModalEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
	/// Modal window; cancelling it requests close.
	Dialog,
	/// Blocking progress operation; cancelling it cancels the indicator.
	Progress,
	/// Handle of a cancellable background task.
	CancellableTask,
}

impl EntityKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Dialog => "dialog",
			Self::Progress => "progress",
			Self::CancellableTask => "cancellable_task",
		}
	}
}

#[derive(Debug)]
struct EntityCore {
	id: EntityId,
	label: String,
	token: CancellationToken,
}

impl EntityCore {
	fn new(label: impl Into<String>, token: CancellationToken) -> Arc<Self> {
		Arc::new(Self {
			id: EntityId::next(),
			label: label.into(),
			token,
		})
	}
}

/// Handle of a modal window.
///
/// The host owns the actual window. Closing through the handle only signals
/// the request; the host is expected to tear the window down and then call
/// `leave_modal`.
#[derive(Debug, Clone)]
pub struct DialogHandle(Arc<EntityCore>);

impl DialogHandle {
	pub fn new(title: impl Into<String>) -> Self {
		Self(EntityCore::new(title, CancellationToken::new()))
	}

	pub fn id(&self) -> EntityId {
		self.0.id
	}

	pub fn title(&self) -> &str {
		&self.0.label
	}

	/// Requests the window to close.
	pub fn close(&self) {
		self.0.token.cancel();
	}

	/// Returns true once [`Self::close`] has been called.
	pub fn is_close_requested(&self) -> bool {
		self.0.token.is_cancelled()
	}

	/// Token cancelled when close is requested, for hosts that await it.
	pub fn close_token(&self) -> CancellationToken {
		self.0.token.clone()
	}
}

/// Handle of a blocking progress operation.
#[derive(Debug, Clone)]
pub struct ProgressHandle(Arc<EntityCore>);

impl ProgressHandle {
	pub fn new(label: impl Into<String>) -> Self {
		Self(EntityCore::new(label, CancellationToken::new()))
	}

	pub fn id(&self) -> EntityId {
		self.0.id
	}

	pub fn label(&self) -> &str {
		&self.0.label
	}

	pub fn cancel(&self) {
		self.0.token.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.token.is_cancelled()
	}

	/// Token the running operation polls for cancellation.
	pub fn token(&self) -> CancellationToken {
		self.0.token.clone()
	}
}

/// Handle of a cancellable task that holds a modal scope while it runs.
#[derive(Debug, Clone)]
pub struct TaskHandle(Arc<EntityCore>);

impl TaskHandle {
	pub fn new(label: impl Into<String>) -> Self {
		Self::from_token(label, CancellationToken::new())
	}

	/// Wraps an existing cancellation token, e.g. one owned by a worker task.
	pub fn from_token(label: impl Into<String>, token: CancellationToken) -> Self {
		Self(EntityCore::new(label, token))
	}

	pub fn id(&self) -> EntityId {
		self.0.id
	}

	pub fn label(&self) -> &str {
		&self.0.label
	}

	pub fn cancel(&self) {
		self.0.token.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.token.is_cancelled()
	}
}

/// An object that restricts which deferred tasks may run while it is active.
///
/// Equality is identity: two entities are equal iff they share an [`EntityId`].
#[derive(Debug, Clone)]
pub enum ModalEntity {
	Dialog(DialogHandle),
	Progress(ProgressHandle),
	CancellableTask(TaskHandle),
}

impl ModalEntity {
	pub fn id(&self) -> EntityId {
		match self {
			Self::Dialog(h) => h.id(),
			Self::Progress(h) => h.id(),
			Self::CancellableTask(h) => h.id(),
		}
	}

	pub fn kind(&self) -> EntityKind {
		match self {
			Self::Dialog(_) => EntityKind::Dialog,
			Self::Progress(_) => EntityKind::Progress,
			Self::CancellableTask(_) => EntityKind::CancellableTask,
		}
	}

	pub fn label(&self) -> &str {
		match self {
			Self::Dialog(h) => h.title(),
			Self::Progress(h) => h.label(),
			Self::CancellableTask(h) => h.label(),
		}
	}

	/// Returns true for entities that are windows with their own tracked state.
	pub fn is_modal_window(&self) -> bool {
		matches!(self, Self::Dialog(_))
	}

	/// Closes, cancels, or aborts the entity depending on its kind.
	pub fn cancel(&self) {
		match self {
			Self::Dialog(h) => h.close(),
			Self::Progress(h) => h.cancel(),
			Self::CancellableTask(h) => h.cancel(),
		}
	}

	/// Returns true once [`Self::cancel`] (or the kind-specific equivalent) ran.
	pub fn is_cancelled(&self) -> bool {
		match self {
			Self::Dialog(h) => h.is_close_requested(),
			Self::Progress(h) => h.is_cancelled(),
			Self::CancellableTask(h) => h.is_cancelled(),
		}
	}
}

impl PartialEq for ModalEntity {
	fn eq(&self, other: &Self) -> bool {
		self.id() == other.id()
	}
}

impl Eq for ModalEntity {}

impl fmt::Display for ModalEntity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{} {:?}", self.kind().as_str(), self.id(), self.label())
	}
}

impl From<DialogHandle> for ModalEntity {
	fn from(handle: DialogHandle) -> Self {
		Self::Dialog(handle)
	}
}

impl From<ProgressHandle> for ModalEntity {
	fn from(handle: ProgressHandle) -> Self {
		Self::Progress(handle)
	}
}

impl From<TaskHandle> for ModalEntity {
	fn from(handle: TaskHandle) -> Self {
		Self::CancellableTask(handle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_unique_and_shared_by_clones() {
		let a = DialogHandle::new("a");
		let b = DialogHandle::new("a");
		assert_ne!(a.id(), b.id());
		assert_eq!(ModalEntity::from(a.clone()), ModalEntity::from(a));
	}

	#[test]
	fn cancel_dispatches_per_kind() {
		let dialog = DialogHandle::new("Settings");
		let progress = ProgressHandle::new("Indexing");
		let task = TaskHandle::new("Build");

		for entity in [ModalEntity::from(dialog.clone()), progress.clone().into(), task.clone().into()] {
			assert!(!entity.is_cancelled());
			entity.cancel();
			assert!(entity.is_cancelled());
		}

		assert!(dialog.is_close_requested());
		assert!(progress.token().is_cancelled());
		assert!(task.is_cancelled());
	}

	#[test]
	fn task_handle_shares_external_token() {
		let token = CancellationToken::new();
		let task = TaskHandle::from_token("job", token.clone());
		ModalEntity::from(task).cancel();
		assert!(token.is_cancelled());
	}

	#[test]
	fn display_names_kind_id_and_label() {
		let progress = ProgressHandle::new("Indexing");
		let rendered = ModalEntity::from(progress.clone()).to_string();
		assert_eq!(rendered, format!("progress#{} \"Indexing\"", progress.id().get()));
	}
}
