//! Per-cache accumulator in front of the [`EpochReclaimer`].

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::reclaim::{EpochReclaimer, Garbage};

/// Collects values a cache no longer references and forwards them to the
/// reclaimer in batches, so the reclaimer lock is taken once per batch
/// rather than once per value.
pub(crate) struct Retirer {
	reclaimer: Arc<EpochReclaimer>,
	/// Lock-free bounded bin (MPMC).
	bin: ArrayQueue<Garbage>,
}

impl Retirer {
	pub(crate) fn new(reclaimer: Arc<EpochReclaimer>, batch_size: usize) -> Self {
		Self {
			reclaimer,
			bin: ArrayQueue::new(batch_size.max(1)),
		}
	}

	pub(crate) fn reclaimer(&self) -> &Arc<EpochReclaimer> {
		&self.reclaimer
	}

	/// Queue one value; once the bin fills up it is flushed as a single batch.
	pub(crate) fn retire(&self, value: Garbage) {
		match self.bin.push(value) {
			Ok(()) if self.bin.is_full() => self.flush(),
			Ok(()) => {}
			// another thread filled the bin first
			Err(value) => {
				let mut batch = self.drain();
				batch.push(value);
				self.reclaimer.retire(batch);
			}
		}
	}

	/// Hand everything queued so far to the reclaimer.
	pub(crate) fn flush(&self) {
		let batch = self.drain();
		if !batch.is_empty() {
			self.reclaimer.retire(batch);
		}
	}

	/// Number of values waiting in the bin.
	pub(crate) fn queued(&self) -> usize {
		self.bin.len()
	}

	fn drain(&self) -> Vec<Garbage> {
		// Bounded by the capacity so concurrent producers cannot keep this
		// thread draining forever.
		let mut batch = Vec::with_capacity(self.bin.capacity() + 1);
		for _ in 0..self.bin.capacity() {
			match self.bin.pop() {
				Some(value) => batch.push(value),
				None => break,
			}
		}
		batch
	}
}

impl Drop for Retirer {
	fn drop(&mut self) {
		self.flush();
	}
}
