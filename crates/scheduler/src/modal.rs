//! Modality stack bookkeeping.
//!
//! Pure data: no locking, no queue, no logging of its own. The façade wraps it
//! in a lock, publishes the new top to the gate and reincludes skipped tasks.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tarry_modality::{EntityId, ModalEntity, ModalityState, TransparentSet};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Partition key for owner-scoped modal entities, e.g. one per open project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
	/// Allocates a fresh, process-unique owner id.
	pub fn new() -> Self {
		Self(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
	}

	pub const fn get(self) -> u64 {
		self.0
	}
}

impl Default for OwnerId {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug)]
struct OwnerModals {
	/// Global state when the owner first entered; its stack grows from here.
	root: ModalityState,
	entities: Vec<ModalEntity>,
	stack: Vec<ModalityState>,
}

impl OwnerModals {
	fn current(&self) -> &ModalityState {
		self.stack.last().unwrap_or(&self.root)
	}
}

/// Result of removing an entity from a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Left {
	/// The entity was found at this stack index (1-based, root is 0).
	At { index: usize, was_top: bool },
	/// No stack tracks the entity.
	Unknown,
}

/// Global and owner-scoped modality stacks plus their side tables.
#[derive(Debug)]
pub(crate) struct ModalStack {
	/// `stack[0]` is always `NonModal`.
	stack: Vec<ModalityState>,
	entities: Vec<ModalEntity>,
	owners: FxHashMap<OwnerId, OwnerModals>,
	transparent: TransparentSet,
	windows: FxHashMap<EntityId, ModalityState>,
}

impl Default for ModalStack {
	fn default() -> Self {
		Self {
			stack: vec![ModalityState::NonModal],
			entities: Vec::new(),
			owners: FxHashMap::default(),
			transparent: TransparentSet::new(),
			windows: FxHashMap::default(),
		}
	}
}

impl ModalStack {
	pub(crate) fn current(&self) -> &ModalityState {
		// The root is never popped.
		&self.stack[self.stack.len() - 1]
	}

	pub(crate) fn entities(&self) -> &[ModalEntity] {
		&self.entities
	}

	pub(crate) fn transparent(&self) -> &TransparentSet {
		&self.transparent
	}

	pub(crate) fn is_global(&self, id: EntityId) -> bool {
		self.entities.iter().any(|e| e.id() == id)
	}

	/// Finds a tracked entity by id, global or owner-scoped.
	pub(crate) fn find(&self, id: EntityId) -> Option<&ModalEntity> {
		self.entities
			.iter()
			.chain(self.owners.values().flat_map(|o| o.entities.iter()))
			.find(|e| e.id() == id)
	}

	/// Owner whose stack tracks `id`, if any.
	pub(crate) fn owner_of(&self, id: EntityId) -> Option<OwnerId> {
		self.owners
			.iter()
			.find_map(|(owner, modals)| modals.entities.iter().any(|e| e.id() == id).then_some(*owner))
	}

	/// Pushes `entity` on the global stack and returns the new top.
	pub(crate) fn enter(&mut self, entity: ModalEntity) -> ModalityState {
		let next = self.current().append_entity(entity.clone());
		if entity.is_modal_window() {
			self.windows.insert(entity.id(), next.clone());
		}
		self.entities.push(entity);
		self.stack.push(next.clone());
		next
	}

	/// Removes `id` from the global stack and from every state above it.
	pub(crate) fn leave(&mut self, id: EntityId) -> Left {
		let Some(pos) = self.entities.iter().position(|e| e.id() == id) else {
			return Left::Unknown;
		};
		let index = pos + 1;
		let was_top = index == self.stack.len() - 1;
		self.entities.remove(pos);
		self.stack.remove(index);
		for state in &mut self.stack[index..] {
			*state = state.without_entity(id);
		}
		for owner in self.owners.values_mut() {
			owner.root = owner.root.without_entity(id);
			for state in &mut owner.stack {
				*state = state.without_entity(id);
			}
		}
		self.strip_windows(id);
		self.evict(id);
		Left::At { index, was_top }
	}

	/// Pushes `entity` on `owner`'s stack and returns the owner's new top.
	pub(crate) fn enter_for(&mut self, owner: OwnerId, entity: ModalEntity) -> ModalityState {
		let root = self.current().clone();
		let modals = self.owners.entry(owner).or_insert_with(|| OwnerModals {
			root,
			entities: Vec::new(),
			stack: Vec::new(),
		});
		let next = modals.current().append_entity(entity.clone());
		if entity.is_modal_window() {
			self.windows.insert(entity.id(), next.clone());
		}
		modals.entities.push(entity);
		modals.stack.push(next.clone());
		next
	}

	/// Removes `id` from `owner`'s stack. Drops the owner entry once empty.
	pub(crate) fn leave_for(&mut self, owner: OwnerId, id: EntityId) -> Left {
		let Some(modals) = self.owners.get_mut(&owner) else {
			return Left::Unknown;
		};
		let Some(pos) = modals.entities.iter().position(|e| e.id() == id) else {
			return Left::Unknown;
		};
		let was_top = pos + 1 == modals.stack.len();
		modals.entities.remove(pos);
		modals.stack.remove(pos);
		for state in &mut modals.stack[pos..] {
			*state = state.without_entity(id);
		}
		if modals.entities.is_empty() {
			self.owners.remove(&owner);
		}
		self.strip_windows(id);
		self.evict(id);
		Left::At { index: pos + 1, was_top }
	}

	pub(crate) fn current_for(&self, owner: OwnerId) -> &ModalityState {
		self.owners.get(&owner).map_or_else(|| self.current(), OwnerModals::current)
	}

	pub(crate) fn entities_for(&self, owner: OwnerId) -> &[ModalEntity] {
		self.owners.get(&owner).map(|o| o.entities.as_slice()).unwrap_or_default()
	}

	pub(crate) fn is_in_modal_context(&self) -> bool {
		!self.entities.is_empty()
	}

	pub(crate) fn is_in_modal_context_for(&self, owner: OwnerId) -> bool {
		self.is_in_modal_context() || self.owners.get(&owner).is_some_and(|o| !o.entities.is_empty())
	}

	/// Marks every entity of `state` transparent. Returns how many were new.
	pub(crate) fn mark_transparent(&mut self, state: &ModalityState) -> usize {
		self.transparent.mark_state(state)
	}

	pub(crate) fn window_state(&self, id: EntityId) -> Option<&ModalityState> {
		self.windows.get(&id)
	}

	/// Cached window states entered above `id` must stop holding it.
	fn strip_windows(&mut self, id: EntityId) {
		for state in self.windows.values_mut() {
			*state = state.without_entity(id);
		}
	}

	/// Drops the side-table entries of `id`. Returns true if any existed.
	pub(crate) fn evict(&mut self, id: EntityId) -> bool {
		let unmarked = self.transparent.unmark(id);
		let window = self.windows.remove(&id).is_some();
		unmarked || window
	}

	pub(crate) fn describe(&self) -> String {
		let mut out = String::new();
		for (depth, state) in self.stack.iter().enumerate() {
			let _ = writeln!(out, "{depth}: {state}");
		}
		let mut owners: Vec<_> = self.owners.iter().collect();
		owners.sort_by_key(|(owner, _)| **owner);
		for (owner, modals) in owners {
			let _ = writeln!(out, "owner {}: {}", owner.get(), modals.current());
		}
		if !self.transparent.is_empty() {
			let _ = writeln!(out, "transparent: {}", self.transparent.len());
		}
		out
	}
}
