use std::sync::Arc;

use arc_swap::ArcSwap;
use tarry_modality::{ModalityState, TransparentSet};

/// Admission gate consulted by the flush loop.
///
/// Holds the published global modality and the transparent-entity set. Writers
/// are the modal stack operations; the queue only reads, so a flush never
/// takes the modal lock.
#[derive(Debug, Default)]
pub struct ModalityGate {
	current: ArcSwap<ModalityState>,
	transparent: ArcSwap<TransparentSet>,
}

impl ModalityGate {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of the published modality.
	pub fn current(&self) -> Arc<ModalityState> {
		self.current.load_full()
	}

	/// Returns true if a task declaring `requested` may run now.
	pub fn admits(&self, requested: &ModalityState) -> bool {
		let current = self.current.load();
		let transparent = self.transparent.load();
		current.accepts(requested, &transparent)
	}

	pub(crate) fn publish(&self, state: ModalityState) {
		tracing::trace!(modality = %state, "modal.publish");
		self.current.store(Arc::new(state));
	}

	pub(crate) fn publish_transparent(&self, transparent: TransparentSet) {
		self.transparent.store(Arc::new(transparent));
	}
}
