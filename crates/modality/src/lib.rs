//! Modal entities and the modality states built from them.
//!
//! A [`ModalityState`] records which modal entities (dialogs, progress
//! operations, cancellable task handles) were active along a nesting path. The
//! scheduler compares the live state with a task's declared state through
//! [`ModalityState::accepts`] to decide whether the task may run yet.

/// Modal entity kinds and their handles.
pub mod entity;
/// Modality states, the acceptance relation, and transparency.
pub mod state;

pub use entity::{DialogHandle, EntityId, EntityKind, ModalEntity, ProgressHandle, TaskHandle};
pub use state::{ModalityState, TransparentSet};
