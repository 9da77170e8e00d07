//! End-to-end scenarios driven by a deterministic host pump.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tarry_scheduler::{DialogHandle, Expiration, ManualPump, ModalityState, ProgressHandle, Scheduler, SchedulerConfig};
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

fn host(config: SchedulerConfig) -> (Scheduler, Arc<ManualPump>) {
	let _ = tracing_subscriber::fmt::try_init();
	let pump = Arc::new(ManualPump::new());
	let scheduler = Scheduler::for_current_thread(config, pump.clone()).unwrap();
	(scheduler, pump)
}

fn relaxed() -> SchedulerConfig {
	SchedulerConfig {
		flush_budget_ms: 60_000,
		..SchedulerConfig::default()
	}
}

fn push(scheduler: &Scheduler, log: &Log, modality: ModalityState, name: impl Into<String>) {
	let log = Arc::clone(log);
	let name = name.into();
	scheduler.invoke_later_on(modality, move || log.lock().push(name));
}

#[test]
fn scenario_a_nesting_defers_outer_task() {
	let (scheduler, pump) = host(relaxed());
	let log = Log::default();

	push(&scheduler, &log, ModalityState::NonModal, "task1");
	let dialog = DialogHandle::new("M1");
	let inside = scheduler.enter_modal(dialog.clone());
	push(&scheduler, &log, inside, "task2");

	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["task2"]);
	assert_eq!(scheduler.queue().skipped_len(), 1);

	scheduler.leave_modal(dialog.id());
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["task2", "task1"]);
	assert!(scheduler.queue().is_empty());
}

#[test]
fn scenario_a_deeper_nesting_releases_level_by_level() {
	let (scheduler, pump) = host(relaxed());
	let log = Log::default();

	let dialog = DialogHandle::new("Outer");
	let outer = scheduler.enter_modal(dialog.clone());
	push(&scheduler, &log, outer.clone(), "outer-1");
	let progress = ProgressHandle::new("Inner");
	let inner = scheduler.enter_modal(progress.clone());
	push(&scheduler, &log, ModalityState::NonModal, "root");
	push(&scheduler, &log, outer, "outer-2");
	push(&scheduler, &log, inner, "inner");

	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["inner"]);

	scheduler.leave_modal(progress.id());
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["inner", "outer-1", "outer-2"]);

	scheduler.leave_modal(dialog.id());
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["inner", "outer-1", "outer-2", "root"]);
}

#[test]
fn scenario_b_invoke_and_wait_blocks_until_consumer_runs() {
	let (scheduler, pump) = host(relaxed());
	let flag = Arc::new(AtomicBool::new(false));

	let remote = scheduler.clone();
	let task_flag = Arc::clone(&flag);
	let observed = Arc::clone(&flag);
	let worker = thread::spawn(move || {
		remote
			.invoke_and_wait(ModalityState::NonModal, move || task_flag.store(true, Ordering::SeqCst))
			.unwrap();
		observed.load(Ordering::SeqCst)
	});

	while scheduler.queue().len() == 0 {
		thread::sleep(Duration::from_millis(1));
	}
	thread::sleep(Duration::from_millis(20));
	assert!(!worker.is_finished(), "worker returned before the consumer ran the task");
	assert!(!flag.load(Ordering::SeqCst));

	while !worker.is_finished() {
		pump.run_pending();
		thread::sleep(Duration::from_millis(1));
	}
	assert!(worker.join().unwrap());
}

#[test]
fn scenario_c_expired_task_never_runs() {
	let (scheduler, pump) = host(relaxed());
	let log = Log::default();
	let token = CancellationToken::new();

	let sink = Arc::clone(&log);
	scheduler.invoke_later(ModalityState::NonModal, Expiration::from_token(token.clone()), move || {
		sink.lock().push("expired".to_owned());
	});
	push(&scheduler, &log, ModalityState::NonModal, "live");
	token.cancel();

	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["live"]);
	assert_eq!(scheduler.queue().stats().expired, 1);
	assert_eq!(scheduler.queue().stats().panicked, 0);
}

#[test]
fn scenario_d_budget_yield_keeps_order() {
	let (scheduler, pump) = host(SchedulerConfig::default());
	let log = Log::default();

	for i in 0..20 {
		let log = Arc::clone(&log);
		scheduler.invoke_later_on(ModalityState::NonModal, move || {
			thread::sleep(Duration::from_millis(2));
			log.lock().push(i.to_string());
		});
	}

	assert_eq!(pump.run_pending(), 1);
	let first = log.lock().len();
	assert!(first >= 1 && first < 20, "first flush ran {first} tasks");
	assert_eq!(pump.pending(), 1);

	pump.run_until_idle(100);
	let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
	assert_eq!(*log.lock(), expected);
	assert!(scheduler.queue().stats().yields >= 1);
}

#[test]
fn purge_drops_expired_work_held_by_a_dialog() {
	let (scheduler, pump) = host(relaxed());
	let log = Log::default();
	let dialog = DialogHandle::new("Blocking");
	scheduler.enter_modal(dialog.clone());

	let sink = Arc::clone(&log);
	scheduler.invoke_later(ModalityState::NonModal, Expiration::when_cancelled(dialog.clone().into()), move || {
		sink.lock().push("tied to dialog".to_owned());
	});
	push(&scheduler, &log, ModalityState::NonModal, "independent");
	pump.run_until_idle(10);
	assert_eq!(scheduler.queue().skipped_len(), 2);

	dialog.close();
	assert_eq!(scheduler.purge_expired_items(), 1);
	scheduler.leave_modal(dialog.id());
	pump.run_until_idle(10);
	assert_eq!(*log.lock(), vec!["independent"]);
}
