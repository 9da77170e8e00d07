//! Growable circular queue used as the backing store of the deferred task queue.
//!
//! Besides the usual tail enqueue and head dequeue, [`RingBuffer`] supports
//! re-inserting a batch of items *before* the current head ([`RingBuffer::bulk_prepend`])
//! and dropping items in place by predicate ([`RingBuffer::remove_all`]).
//!
//! # Invariants
//!
//! - One slot is always left empty, so `head == tail` means empty and
//!   `len() <= capacity() - 1`.
//! - `len() == (tail - head) mod capacity()`.
//! - Slots in the logical range `[head, head + len)` (wrapping) are occupied;
//!   every other slot is `None`.
//! - Growth always unwraps the contents into the contiguous range
//!   `[reserved, reserved + len)` of the new array.
//!
//! # Threading
//!
//! Not synchronized. The scheduler guards it with the queue lock.

mod error;

use std::fmt;

pub use error::{CapacityError, Result};

/// Slot count of a ring created with [`RingBuffer::new`].
pub const DEFAULT_CAPACITY: usize = 16;

/// Capacity below which growth doubles; above it, growth adds half.
pub const DOUBLING_LIMIT: usize = 64;

/// Returns the capacity a ring of `capacity` slots grows to, before any
/// reserved prefix is added.
///
/// `None` when the arithmetic overflows.
pub fn growth(capacity: usize) -> Option<usize> {
	if capacity < DOUBLING_LIMIT {
		capacity.checked_mul(2)
	} else {
		capacity.checked_add(capacity / 2)
	}
}

/// Growable FIFO ring of `T`.
pub struct RingBuffer<T> {
	slots: Vec<Option<T>>,
	head: usize,
	tail: usize,
}

impl<T> Default for RingBuffer<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> RingBuffer<T> {
	/// Creates an empty ring with [`DEFAULT_CAPACITY`] slots.
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY - 1)
	}

	/// Creates an empty ring able to hold `items` elements before growing.
	///
	/// # Panics
	///
	/// Panics when the backing array cannot be allocated.
	pub fn with_capacity(items: usize) -> Self {
		Self::try_with_capacity(items).unwrap_or_else(|err| capacity_failure(err))
	}

	/// Fallible form of [`Self::with_capacity`].
	pub fn try_with_capacity(items: usize) -> Result<Self> {
		let slots = items.checked_add(1).ok_or(CapacityError::Overflow { requested: items })?.max(2);
		Ok(Self {
			slots: allocate_slots(slots)?,
			head: 0,
			tail: 0,
		})
	}

	/// Number of physical slots, including the one that always stays empty.
	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Number of queued items.
	pub fn len(&self) -> usize {
		let cap = self.slots.len();
		(self.tail + cap - self.head) % cap
	}

	/// Returns true when nothing is queued.
	pub fn is_empty(&self) -> bool {
		self.head == self.tail
	}

	/// Returns the head item without removing it.
	pub fn front(&self) -> Option<&T> {
		if self.is_empty() {
			return None;
		}
		self.slots[self.head].as_ref()
	}

	/// Appends `item` at the tail, growing first if the write would fill the ring.
	///
	/// # Panics
	///
	/// Panics when growth overflows or cannot be allocated.
	pub fn enqueue(&mut self, item: T) {
		if self.len() + 2 > self.slots.len()
			&& let Err(err) = self.grow(0, 1)
		{
			capacity_failure(err);
		}
		debug_assert!(self.slots[self.tail].is_none(), "ring tail slot occupied");
		self.slots[self.tail] = Some(item);
		self.tail = self.wrap(self.tail + 1);
	}

	/// Removes and returns the head item.
	pub fn dequeue(&mut self) -> Option<T> {
		if self.is_empty() {
			return None;
		}
		let item = self.slots[self.head].take();
		debug_assert!(item.is_some(), "ring head slot empty");
		self.head = self.wrap(self.head + 1);
		item
	}

	/// Ensures `additional` more items fit without growing.
	pub fn try_reserve(&mut self, additional: usize) -> Result<()> {
		let room = self.slots.len() - 1 - self.len();
		if additional > room {
			self.grow(0, additional)?;
		}
		Ok(())
	}

	/// Inserts `items` immediately before the head, keeping their order.
	///
	/// A following run of dequeues yields `items` in order, then the previous
	/// contents.
	///
	/// # Panics
	///
	/// Panics when growth overflows or cannot be allocated.
	pub fn bulk_prepend<I>(&mut self, items: I)
	where
		I: IntoIterator<Item = T>,
		I::IntoIter: DoubleEndedIterator + ExactSizeIterator,
	{
		if let Err(err) = self.try_bulk_prepend(items) {
			capacity_failure(err);
		}
	}

	/// Fallible form of [`Self::bulk_prepend`]. On error the ring is unchanged
	/// and `items` is dropped.
	pub fn try_bulk_prepend<I>(&mut self, items: I) -> Result<()>
	where
		I: IntoIterator<Item = T>,
		I::IntoIter: DoubleEndedIterator + ExactSizeIterator,
	{
		let items = items.into_iter();
		let count = items.len();
		if count == 0 {
			return Ok(());
		}

		let room = self.slots.len() - 1 - self.len();
		if count > room {
			self.grow(count, 0)?;
		}

		// Walk backwards from the head so a wrapped start needs no special case.
		for item in items.rev() {
			let slot = self.wrap(self.head + self.slots.len() - 1);
			debug_assert!(slot != self.tail, "bulk prepend iterator reported a short length");
			debug_assert!(self.slots[slot].is_none(), "ring slot before head occupied");
			self.slots[slot] = Some(item);
			self.head = slot;
		}
		Ok(())
	}

	/// Drops every item matching `predicate`, compacting survivors towards the
	/// head in their original order. Returns the number of dropped items.
	///
	/// Runs in place without allocating. If `predicate` panics, the item being
	/// tested is lost and later items are dropped with the ring.
	pub fn remove_all<F>(&mut self, mut predicate: F) -> usize
	where
		F: FnMut(&T) -> bool,
	{
		let len = self.len();
		let mut kept = 0;
		for offset in 0..len {
			let from = self.wrap(self.head + offset);
			let Some(item) = self.slots[from].take() else {
				continue;
			};
			if predicate(&item) {
				continue;
			}
			let to = self.wrap(self.head + kept);
			self.slots[to] = Some(item);
			kept += 1;
		}
		self.tail = self.wrap(self.head + kept);
		len - kept
	}

	/// Drops every item, keeping the allocation.
	pub fn clear(&mut self) {
		while self.dequeue().is_some() {}
		self.head = 0;
		self.tail = 0;
	}

	/// Iterates items from head to tail.
	pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
		(0..self.len()).filter_map(move |offset| self.slots[self.wrap(self.head + offset)].as_ref())
	}

	fn wrap(&self, index: usize) -> usize {
		index % self.slots.len()
	}

	/// Reallocates to `reserved + growth(capacity)` slots (at least enough for
	/// the request) and moves the contents to `[reserved, reserved + len)`.
	fn grow(&mut self, reserved: usize, additional: usize) -> Result<()> {
		let len = self.len();
		let old = self.slots.len();
		let requested = len.saturating_add(additional).saturating_add(reserved);
		let needed = len
			.checked_add(additional)
			.and_then(|n| n.checked_add(reserved))
			.and_then(|n| n.checked_add(1))
			.ok_or(CapacityError::Overflow { requested })?;
		let grown = growth(old)
			.and_then(|n| n.checked_add(reserved))
			.ok_or(CapacityError::Overflow { requested })?;

		let mut slots = allocate_slots(grown.max(needed))?;
		let mut write = reserved;
		while let Some(item) = self.dequeue() {
			slots[write] = Some(item);
			write += 1;
		}

		tracing::trace!(from = old, to = slots.len(), reserved, len, "ring.grow");
		self.slots = slots;
		self.head = reserved;
		self.tail = write;
		Ok(())
	}
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.iter()).finish()
	}
}

fn allocate_slots<T>(len: usize) -> Result<Vec<Option<T>>> {
	let mut slots = Vec::new();
	slots.try_reserve_exact(len)?;
	slots.resize_with(len, || None);
	Ok(slots)
}

#[cold]
#[track_caller]
fn capacity_failure(err: CapacityError) -> ! {
	tracing::error!(error = %err, "ring.capacity_failure");
	panic!("{err}");
}
