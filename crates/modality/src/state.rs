use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::entity::{EntityId, ModalEntity};


/// Modal entities accumulated along the current nesting path.
///
/// Values are immutable and cheap to clone; clones share the entity slice, so
/// identity ([`Self::is_same`]) survives cloning.
#[derive(Clone, Default)]
pub enum ModalityState {
	/// No modal scope is active.
	#[default]
	NonModal,
	/// Matches everything; used by tasks that do not care about nesting.
	Any,
	/// One or more entities, outermost first.
	Nested(Arc<[ModalEntity]>),
}

impl ModalityState {
	pub const fn non_modal() -> Self {
		Self::NonModal
	}

	pub const fn any() -> Self {
		Self::Any
	}

	pub fn is_any(&self) -> bool {
		matches!(self, Self::Any)
	}

	pub fn is_non_modal(&self) -> bool {
		matches!(self, Self::NonModal)
	}

	/// Entities of this state, outermost first. Empty for both sentinels.
	pub fn entities(&self) -> &[ModalEntity] {
		match self {
			Self::NonModal | Self::Any => &[],
			Self::Nested(entities) => entities,
		}
	}

	pub fn depth(&self) -> usize {
		self.entities().len()
	}

	pub fn contains(&self, id: EntityId) -> bool {
		self.entities().iter().any(|e| e.id() == id)
	}

	/// Identity check: same sentinel, or the same shared entity slice.
	pub fn is_same(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::NonModal, Self::NonModal) | (Self::Any, Self::Any) => true,
			(Self::Nested(a), Self::Nested(b)) => Arc::ptr_eq(a, b),
			_ => false,
		}
	}

	/// Returns a new state with `entity` nested inside this one.
	///
	/// `Any` carries no entities, so appending to it starts a fresh path.
	pub fn append_entity(&self, entity: ModalEntity) -> Self {
		let entities: Vec<ModalEntity> = self.entities().iter().cloned().chain(std::iter::once(entity)).collect();
		Self::Nested(entities.into())
	}

	/// Returns this state without `id`.
	///
	/// Returns a clone (keeping identity) when `id` is absent, and `NonModal`
	/// once the last entity is gone.
	pub fn without_entity(&self, id: EntityId) -> Self {
		if !self.contains(id) {
			return self.clone();
		}
		let entities: Vec<ModalEntity> = self.entities().iter().filter(|e| e.id() != id).cloned().collect();
		if entities.is_empty() {
			Self::NonModal
		} else {
			Self::Nested(entities.into())
		}
	}

	/// Returns true when a task declaring `requested` may run while `self` is
	/// the live modality.
	///
	/// Every non-transparent entity of `self` must be present in `requested`.
	/// `Any` and identical states are accepted without the containment check.
	pub fn accepts(&self, requested: &ModalityState, transparent: &TransparentSet) -> bool {
		if requested.is_any() || self.is_same(requested) {
			return true;
		}
		self.entities()
			.iter()
			.all(|entity| transparent.contains(entity.id()) || requested.contains(entity.id()))
	}

	/// Cancels every entity of this state, innermost first, and returns how
	/// many were cancelled.
	///
	/// Only for diagnostic and forced-unwind paths.
	pub fn cancel_all_entities(&self, reason: &str) -> usize {
		let entities = self.entities();
		for entity in entities.iter().rev() {
			tracing::warn!(entity = %entity, kind = entity.kind().as_str(), reason, "modality.cancel_entity");
			entity.cancel();
		}
		entities.len()
	}
}

impl PartialEq for ModalityState {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::NonModal, Self::NonModal) | (Self::Any, Self::Any) => true,
			(Self::Nested(a), Self::Nested(b)) => a == b,
			_ => false,
		}
	}
}

impl Eq for ModalityState {}

impl fmt::Display for ModalityState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NonModal => f.write_str("NonModal"),
			Self::Any => f.write_str("Any"),
			Self::Nested(entities) => {
				f.write_str("[")?;
				for (i, entity) in entities.iter().enumerate() {
					if i > 0 {
						f.write_str(", ")?;
					}
					write!(f, "{entity}")?;
				}
				f.write_str("]")
			}
		}
	}
}

impl fmt::Debug for ModalityState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ModalityState({self})")
	}
}

/// Entities excluded from the acceptance containment check.
///
/// Keyed by entity identity; the owner must unmark an entity when it leaves
/// modality or is disposed so the set does not grow without bound.
#[derive(Debug, Clone, Default)]
pub struct TransparentSet {
	ids: FxHashSet<EntityId>,
}

impl TransparentSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Marks `id` transparent. Returns false if it already was.
	pub fn mark(&mut self, id: EntityId) -> bool {
		self.ids.insert(id)
	}

	/// Marks every entity of `state`. Returns how many were newly marked.
	pub fn mark_state(&mut self, state: &ModalityState) -> usize {
		state.entities().iter().filter(|e| self.ids.insert(e.id())).count()
	}

	/// Unmarks `id`. Returns false if it was not marked.
	pub fn unmark(&mut self, id: EntityId) -> bool {
		self.ids.remove(&id)
	}

	pub fn contains(&self, id: EntityId) -> bool {
		self.ids.contains(&id)
	}

	pub fn len(&self) -> usize {
		self.ids.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ids.is_empty()
	}
}
