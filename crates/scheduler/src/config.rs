use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::pump::Pump;

/// Scheduler tuning.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
	/// Wall-clock budget of one flush before yielding to the host pump.
	pub flush_budget_ms: u64,
	/// Optional cap on tasks executed by one flush.
	pub flush_max_tasks: Option<usize>,
	/// Period at which `invoke_and_wait` re-checks cancellation.
	pub wait_poll_interval_ms: u64,
	/// Tasks running longer than this are reported at `warn`.
	pub slow_task_threshold_ms: u64,
	/// Ring capacity allocated up front.
	pub initial_queue_capacity: usize,
	/// Skipped-buffer capacity above which it is reallocated instead of cleared.
	pub skipped_recycle_limit: usize,
	/// Rounds after which `force_leave_all_modals` gives up.
	pub force_leave_max_rounds: u32,
	/// Re-raise task panics and invariant violations instead of logging them.
	pub strict: bool,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			flush_budget_ms: 5,
			flush_max_tasks: None,
			wait_poll_interval_ms: 10,
			slow_task_threshold_ms: 300,
			initial_queue_capacity: 16,
			skipped_recycle_limit: 1024,
			force_leave_max_rounds: 64,
			strict: false,
		}
	}
}

impl SchedulerConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(src: &str) -> ConfigResult<Self> {
		let config: Self = toml::from_str(src)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks values that parse but cannot work.
	pub fn validate(&self) -> ConfigResult<()> {
		if self.flush_budget_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "flush_budget_ms",
				reason: "must be at least 1",
			});
		}
		if self.flush_max_tasks == Some(0) {
			return Err(ConfigError::Invalid {
				field: "flush_max_tasks",
				reason: "must be at least 1 when set",
			});
		}
		if self.wait_poll_interval_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "wait_poll_interval_ms",
				reason: "must be at least 1",
			});
		}
		Ok(())
	}

	/// Returns the config with strict mode toggled.
	pub fn with_strict(mut self, strict: bool) -> Self {
		self.strict = strict;
		self
	}

	pub fn flush_budget(&self) -> FlushBudget {
		FlushBudget {
			duration: Duration::from_millis(self.flush_budget_ms),
			max_tasks: self.flush_max_tasks,
		}
	}

	pub fn wait_poll_interval(&self) -> Duration {
		Duration::from_millis(self.wait_poll_interval_ms)
	}

	pub fn slow_task_threshold(&self) -> Duration {
		Duration::from_millis(self.slow_task_threshold_ms)
	}
}

/// Per-flush execution budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushBudget {
	pub duration: Duration,
	pub max_tasks: Option<usize>,
}

impl FlushBudget {
	/// Returns why the flush must yield after `executed` tasks, if it must.
	///
	/// A pending priority event wins over the time budget, which wins over the
	/// task cap; only the first reason is reported.
	pub fn exhausted(&self, started: Instant, executed: usize, pump: &dyn Pump) -> Option<YieldReason> {
		if pump.has_pending_priority_event() {
			return Some(YieldReason::PriorityEvent);
		}
		if started.elapsed() > self.duration {
			return Some(YieldReason::TimeBudget);
		}
		match self.max_tasks {
			Some(max) if executed >= max => Some(YieldReason::TaskBudget),
			_ => None,
		}
	}
}

/// Why a flush stopped before draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldReason {
	/// The host has a higher-priority event waiting.
	PriorityEvent,
	/// The wall-clock budget ran out.
	TimeBudget,
	/// The task cap was reached.
	TaskBudget,
}

impl YieldReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::PriorityEvent => "priority_event",
			Self::TimeBudget => "time_budget",
			Self::TaskBudget => "task_budget",
		}
	}
}
