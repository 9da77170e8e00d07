//! Dedicated consumer thread acting as a host event pump.
//!
//! Callbacks are delivered in post order over a channel to one named thread.
//! The caller's tracing span travels with each callback so logs emitted by
//! flushes nest under the span that scheduled them.
//!
//! Shutdown is explicit: [`ThreadPump::shutdown`] (or drop) sends a stop
//! message behind everything already posted and joins the thread. Callbacks
//! posted afterwards are dropped, which resolves any `invoke_and_wait` waiter
//! attached to them as abandoned.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

use crate::pump::{Callback, Pump};
use crate::task::panic_message;

enum Message {
	Run { callback: Callback, span: tracing::Span },
	Priority { callback: Callback, span: tracing::Span },
	Shutdown,
}

/// Event pump backed by a dedicated thread.
pub struct ThreadPump {
	tx: Sender<Message>,
	thread_id: ThreadId,
	handle: Mutex<Option<JoinHandle<()>>>,
	priority_pending: Arc<AtomicUsize>,
}

impl ThreadPump {
	/// Spawns the consumer thread.
	pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
		let (tx, rx) = mpsc::channel::<Message>();
		let priority_pending = Arc::new(AtomicUsize::new(0));
		let pending = Arc::clone(&priority_pending);

		let handle = thread::Builder::new().name(name.into()).spawn(move || {
			while let Ok(message) = rx.recv() {
				let (callback, span) = match message {
					Message::Run { callback, span } => (callback, span),
					Message::Priority { callback, span } => {
						pending.fetch_sub(1, Ordering::SeqCst);
						(callback, span)
					}
					Message::Shutdown => break,
				};
				let _guard = span.enter();
				if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(callback)) {
					tracing::error!(message = %panic_message(payload.as_ref()), "pump.callback_panicked");
				}
			}
			tracing::debug!("pump.stopped");
		})?;

		Ok(Self {
			tx,
			thread_id: handle.thread().id(),
			handle: Mutex::new(Some(handle)),
			priority_pending,
		})
	}

	/// Posts `callback` behind everything already queued.
	pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
		self.send(Message::Run {
			callback: Box::new(callback),
			span: tracing::Span::current(),
		});
	}

	/// Posts a callback standing for a host input event.
	///
	/// Until it is dequeued, [`Pump::has_pending_priority_event`] reports true
	/// so a running flush yields to it.
	pub fn post_priority(&self, callback: impl FnOnce() + Send + 'static) {
		self.priority_pending.fetch_add(1, Ordering::SeqCst);
		let sent = self.send(Message::Priority {
			callback: Box::new(callback),
			span: tracing::Span::current(),
		});
		if !sent {
			self.priority_pending.fetch_sub(1, Ordering::SeqCst);
		}
	}

	/// Id of the consumer thread.
	pub fn consumer_thread(&self) -> ThreadId {
		self.thread_id
	}

	/// Stops the thread after it drains what was posted before this call.
	///
	/// Joins unless called from the consumer thread itself.
	pub fn shutdown(&self) {
		let Some(handle) = self.handle.lock().take() else {
			return;
		};
		let _ = self.tx.send(Message::Shutdown);
		if thread::current().id() == self.thread_id {
			return;
		}
		if handle.join().is_err() {
			tracing::error!("pump.join_failed");
		}
	}

	fn send(&self, message: Message) -> bool {
		match self.tx.send(message) {
			Ok(()) => true,
			Err(_) => {
				tracing::debug!("pump.closed");
				false
			}
		}
	}
}

impl Pump for ThreadPump {
	fn schedule(&self, callback: Callback) {
		self.send(Message::Run {
			callback,
			span: tracing::Span::current(),
		});
	}

	fn has_pending_priority_event(&self) -> bool {
		self.priority_pending.load(Ordering::SeqCst) > 0
	}
}

impl Drop for ThreadPump {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl std::fmt::Debug for ThreadPump {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ThreadPump")
			.field("thread_id", &self.thread_id)
			.field("priority_pending", &self.priority_pending.load(Ordering::SeqCst))
			.finish_non_exhaustive()
	}
}
