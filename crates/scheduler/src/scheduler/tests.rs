use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tarry_modality::{DialogHandle, ProgressHandle, TaskHandle};

use super::*;
use crate::pump::ManualPump;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn scheduler_with(config: SchedulerConfig) -> (Scheduler, Arc<ManualPump>) {
	let _ = tracing_subscriber::fmt::try_init();
	let pump = Arc::new(ManualPump::new());
	let scheduler = Scheduler::for_current_thread(config, pump.clone()).unwrap();
	(scheduler, pump)
}

fn scheduler() -> (Scheduler, Arc<ManualPump>) {
	scheduler_with(SchedulerConfig {
		flush_budget_ms: 60_000,
		..SchedulerConfig::default()
	})
}

fn strict() -> (Scheduler, Arc<ManualPump>) {
	scheduler_with(SchedulerConfig {
		flush_budget_ms: 60_000,
		strict: true,
		..SchedulerConfig::default()
	})
}

fn record(log: &Log, name: &'static str) -> impl FnOnce() + Send + 'static {
	let log = Arc::clone(log);
	move || log.lock().push(name)
}

/// Must publish every stack change to the admission gate.
///
/// * Enforced in: `Scheduler::enter_modal`, `Scheduler::leave_modal`
/// * Failure symptom: producers read a stale modality and tasks run inside dialogs.
#[test]
fn test_enter_and_leave_publish_to_gate() {
	let (scheduler, _pump) = scheduler();
	let dialog = DialogHandle::new("Preferences");

	let state = scheduler.enter_modal(dialog.clone());
	assert!(scheduler.snapshot_modality().is_same(&state));
	assert!(scheduler.current_modality_state().is_same(&state));
	assert!(scheduler.is_in_modal_context());
	assert!(scheduler.modality_for_window(dialog.id()).is_some_and(|s| s.is_same(&state)));

	scheduler.leave_modal(dialog.id());
	assert!(scheduler.snapshot_modality().is_non_modal());
	assert!(!scheduler.is_in_modal_context());
	assert!(scheduler.modality_for_window(dialog.id()).is_none());
}

#[test]
fn test_out_of_order_leave() {
	let (scheduler, _pump) = scheduler();
	let outer = DialogHandle::new("Outer");
	let progress = ProgressHandle::new("Indexing");

	scheduler.enter_modal(outer.clone());
	scheduler.enter_modal(progress.clone());
	scheduler.leave_modal(outer.id());

	let entities = scheduler.current_modal_entities();
	assert_eq!(entities, vec![ModalEntity::from(progress.clone())]);
	assert_eq!(scheduler.current_modality_state().entities(), entities.as_slice());
	assert_eq!(*scheduler.snapshot_modality(), scheduler.current_modality_state());
}

#[test]
fn test_task_waits_for_dialog_to_close() {
	let (scheduler, pump) = scheduler();
	let log = Log::default();
	scheduler.invoke_later_on(ModalityState::NonModal, record(&log, "outside"));
	let dialog = DialogHandle::new("Confirm");
	let inside = scheduler.enter_modal(dialog.clone());
	scheduler.invoke_later_on(inside, record(&log, "inside"));

	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["inside"]);
	assert_eq!(scheduler.queue().skipped_len(), 1);

	scheduler.leave_modal(dialog.id());
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["inside", "outside"]);
}

#[test]
fn test_mark_transparent_releases_held_tasks() {
	let (scheduler, pump) = scheduler();
	let log = Log::default();
	let dialog = DialogHandle::new("Find");
	let inside = scheduler.enter_modal(dialog.clone());
	scheduler.invoke_later_on(ModalityState::NonModal, record(&log, "outside"));
	pump.run_until_idle(10);
	assert!(log.lock().is_empty());

	assert_eq!(scheduler.mark_transparent(&inside), 1);
	assert_eq!(scheduler.mark_transparent(&inside), 0);
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["outside"]);

	scheduler.leave_modal(dialog.id());
	assert!(!scheduler.dispose_entity(dialog.id()));
}

#[test]
fn test_expired_submission_is_not_queued() {
	let (scheduler, pump) = scheduler();
	let handle = TaskHandle::new("job");
	handle.cancel();
	let queued = scheduler.submit(TaskRecord::new(ModalityState::NonModal, Expiration::when_cancelled(handle.into()), || {}));
	assert!(!queued);
	assert!(scheduler.queue().is_empty());
	assert_eq!(pump.pending(), 0);
}

#[test]
fn test_unknown_leave_is_tolerated() {
	let (scheduler, _pump) = scheduler();
	let dialog = DialogHandle::new("Open");
	scheduler.enter_modal(dialog.clone());
	scheduler.leave_modal(DialogHandle::new("Never entered").id());
	assert_eq!(scheduler.current_modal_entities().len(), 1);
}

#[test]
#[should_panic(expected = "entity is not modal")]
fn test_unknown_leave_panics_in_strict_mode() {
	let (scheduler, _pump) = strict();
	scheduler.leave_modal(DialogHandle::new("Never entered").id());
}

#[test]
fn test_double_enter_keeps_stack() {
	let (scheduler, _pump) = scheduler();
	let dialog = DialogHandle::new("Twice");
	let first = scheduler.enter_modal(dialog.clone());
	let second = scheduler.enter_modal(dialog);
	assert!(second.is_same(&first));
	assert_eq!(scheduler.current_modal_entities().len(), 1);
}

/// Must confine modal transitions to the consumer thread.
///
/// * Enforced in: `Scheduler::check_consumer`
/// * Failure symptom: a worker mutates the stack while a flush reads it.
#[test]
fn test_off_thread_transition_panics_in_strict_mode() {
	let (scheduler, _pump) = strict();
	let remote = scheduler.clone();
	let joined = thread::spawn(move || {
		remote.enter_modal(DialogHandle::new("Remote"));
	})
	.join();
	assert!(joined.is_err());
	assert!(!scheduler.is_in_modal_context());
}

#[test]
fn test_owner_scope_leaves_global_state_alone() {
	let (scheduler, _pump) = scheduler();
	let project = OwnerId::new();
	let other = OwnerId::new();
	let dialog = DialogHandle::new("Project settings");

	let owner_state = scheduler.enter_modal_for(project, dialog.clone());
	assert_eq!(owner_state.depth(), 1);
	assert!(scheduler.current_modality_state().is_non_modal());
	assert!(scheduler.snapshot_modality().is_non_modal());
	assert!(scheduler.current_modality_state_for(project).is_same(&owner_state));
	assert_eq!(scheduler.current_modal_entities_for(project).len(), 1);
	assert!(!scheduler.is_in_modal_context());
	assert!(scheduler.is_in_modal_context_for(project));
	assert!(!scheduler.is_in_modal_context_for(other));

	scheduler.leave_modal_for(project, dialog.id());
	assert!(!scheduler.is_in_modal_context_for(project));
	assert!(scheduler.modality_for_window(dialog.id()).is_none());
}

#[test]
fn test_leave_modal_for_delegates_global_entity() {
	let (scheduler, _pump) = scheduler();
	let project = OwnerId::new();
	let dialog = DialogHandle::new("Global");
	scheduler.enter_modal(dialog.clone());
	scheduler.leave_modal_for(project, dialog.id());
	assert!(!scheduler.is_in_modal_context());
}

fn failing_listener(_entering: bool, _entity: &ModalEntity) {
	panic!("listener failure");
}

#[test]
fn test_listeners_see_transitions_in_order() {
	let (scheduler, _pump) = scheduler();
	let events: Arc<Mutex<Vec<(bool, String)>>> = Arc::default();
	let sink = Arc::clone(&events);
	let id = scheduler.add_modality_listener(move |entering: bool, entity: &ModalEntity| {
		sink.lock().push((entering, entity.label().to_owned()));
	});
	scheduler.add_modality_listener(failing_listener);

	let a = DialogHandle::new("A");
	let project = OwnerId::new();
	let b = ProgressHandle::new("B");
	scheduler.enter_modal(a.clone());
	scheduler.enter_modal_for(project, b.clone());
	scheduler.leave_modal(a.id());
	scheduler.leave_modal_for(project, b.id());

	assert!(scheduler.remove_modality_listener(id));
	assert!(!scheduler.remove_modality_listener(id));
	scheduler.enter_modal(DialogHandle::new("C"));

	let expected = vec![(true, "A".to_owned()), (true, "B".to_owned()), (false, "A".to_owned()), (false, "B".to_owned())];
	assert_eq!(*events.lock(), expected);
}

#[test]
fn test_force_leave_unwinds_with_cooperating_host() {
	let (scheduler, pump) = scheduler();
	let dialog = DialogHandle::new("Modal");
	let progress = ProgressHandle::new("Blocking");
	scheduler.enter_modal(dialog.clone());
	scheduler.enter_modal(progress.clone());

	scheduler.force_leave_all_modals();
	assert!(dialog.is_close_requested());
	assert!(progress.is_cancelled());

	// The host reacts to the requests before the next tick.
	for entity in scheduler.current_modal_entities() {
		if entity.is_cancelled() {
			scheduler.leave_modal(entity.id());
		}
	}
	assert_eq!(pump.run_until_idle(10), 1);
	assert!(!scheduler.is_in_modal_context());
}

#[test]
fn test_force_leave_gives_up_after_max_rounds() {
	let (scheduler, pump) = scheduler_with(SchedulerConfig {
		force_leave_max_rounds: 3,
		..SchedulerConfig::default()
	});
	let dialog = DialogHandle::new("Stuck");
	scheduler.enter_modal(dialog.clone());

	scheduler.force_leave_all_modals();
	assert_eq!(pump.run_until_idle(100), 3);
	assert!(dialog.is_close_requested());
	assert!(scheduler.is_in_modal_context());
}

/// Must bound the total number of force-leave rounds, however often it is requested.
///
/// * Enforced in: `Scheduler::force_leave_all_modals`
/// * Failure symptom: repeated requests start parallel round chains that never give up.
#[test]
fn test_force_leave_while_in_flight_is_ignored() {
	let (scheduler, pump) = scheduler_with(SchedulerConfig {
		force_leave_max_rounds: 3,
		..SchedulerConfig::default()
	});
	scheduler.enter_modal(DialogHandle::new("Stuck"));

	scheduler.force_leave_all_modals();
	assert_eq!(pump.pending(), 1);
	scheduler.force_leave_all_modals();
	assert_eq!(pump.pending(), 1);
	assert_eq!(pump.run_until_idle(100), 3);

	// A finished chain does not block the next request.
	scheduler.force_leave_all_modals();
	assert_eq!(pump.pending(), 1);
	assert_eq!(pump.run_until_idle(100), 3);
}

#[test]
fn test_invoke_and_wait_on_consumer_thread_is_rejected() {
	let (scheduler, pump) = scheduler();
	let result = scheduler.invoke_and_wait(ModalityState::NonModal, || 1);
	assert!(matches!(result, Err(InvokeError::OnConsumerThread)));
	assert_eq!(pump.pending(), 0);
}

#[test]
fn test_invoke_and_wait_from_worker() {
	let (scheduler, pump) = scheduler();
	let remote = scheduler.clone();
	let worker = thread::spawn(move || remote.invoke_and_wait(ModalityState::NonModal, || thread::current().id()));

	while !worker.is_finished() {
		pump.run_pending();
		thread::sleep(Duration::from_millis(1));
	}
	let ran_on = worker.join().unwrap().unwrap();
	assert_eq!(ran_on, thread::current().id());
}

#[test]
fn test_shutdown_releases_waiters() {
	let (scheduler, _pump) = scheduler();
	let remote = scheduler.clone();
	let worker = thread::spawn(move || remote.invoke_and_wait(ModalityState::NonModal, || ()));

	while scheduler.queue().len() == 0 {
		thread::sleep(Duration::from_millis(1));
	}
	scheduler.shutdown();
	assert!(scheduler.is_shut_down());
	assert!(matches!(worker.join().unwrap(), Err(InvokeError::Cancelled)));
}

#[test]
fn test_dispose_while_modal_leaves_first() {
	let (scheduler, _pump) = scheduler();
	let dialog = DialogHandle::new("Disposed");
	scheduler.enter_modal(dialog.clone());
	assert!(scheduler.dispose_entity(dialog.id()));
	assert!(!scheduler.is_in_modal_context());
}

#[test]
fn test_describe_modality_lists_stack() {
	let (scheduler, _pump) = scheduler();
	let dialog = DialogHandle::new("Described");
	scheduler.enter_modal(dialog.clone());
	scheduler.enter_modal_for(OwnerId::new(), ProgressHandle::new("Owned"));

	let described = scheduler.describe_modality();
	assert!(described.starts_with("0: NonModal\n1: [dialog#"), "{described}");
	assert!(described.contains("\"Described\""), "{described}");
	assert!(described.contains("\"Owned\""), "{described}");
}
