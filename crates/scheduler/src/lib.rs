//! Modality-gated deferred task scheduler.
//!
//! Work submitted through [`Scheduler::invoke_later`] runs later, in FIFO
//! order, on the host's consumer thread. Each task declares the
//! [`ModalityState`] it was created under; while a modal dialog or blocking
//! progress operation the task does not know about is active, the task is
//! held back and resumes once that scope is left.
//!
//! The host drives execution through a [`Pump`]: the queue posts one flush
//! callback at a time and each flush yields back to the pump after a small
//! time budget or when the host reports a priority event.
//!
//! # Threading
//!
//! - Submission ([`Scheduler::invoke_later`], [`Scheduler::invoke_and_wait`])
//!   works from any thread.
//! - Modal transitions, queries of the live stack and flushes belong to the
//!   consumer thread given at construction.

mod config;
mod error;
mod gate;
mod modal;
mod pump;
mod queue;
mod scheduler;
mod task;
mod thread_pump;
mod wait;

pub use config::{FlushBudget, SchedulerConfig, YieldReason};
pub use error::{CallerTrace, ConfigError, ConfigResult, InvokeError};
pub use gate::ModalityGate;
pub use modal::OwnerId;
pub use pump::{Callback, ManualPump, Pump};
pub use queue::{FlushReport, QueueStats, TaskQueue};
pub use scheduler::{ListenerId, ModalityListener, Scheduler};
pub use tarry_modality::{DialogHandle, EntityId, EntityKind, ModalEntity, ModalityState, ProgressHandle, TaskHandle, TransparentSet};
pub use task::{Cancelled, Expiration, TaskFn, TaskRecord, cancel_task};
pub use thread_pump::ThreadPump;
