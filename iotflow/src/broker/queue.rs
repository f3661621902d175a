//! A bounded, head-drop-oldest-on-overflow queue (spec.md §4.6). `mpsc`
//! has no native head-drop primitive, so the broker dispatcher's per-kind
//! inboxes are built on this small ring buffer instead.

use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicU64, Ordering},
		Mutex,
	},
};
use tokio::sync::Notify;

pub struct OverflowQueue<T> {
	inner: Mutex<VecDeque<T>>,
	capacity: usize,
	notify: Notify,
	dropped: AtomicU64,
}

impl<T> OverflowQueue<T> {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
			notify: Notify::new(),
			dropped: AtomicU64::new(0),
		}
	}

	/// Pushes `item`, dropping the oldest queued item if already at
	/// capacity (spec.md §4.6 overflow policy).
	pub fn push(&self, item: T) {
		{
			let mut queue = self.inner.lock().expect("overflow queue poisoned");
			if queue.len() >= self.capacity {
				queue.pop_front();
				self.dropped.fetch_add(1, Ordering::Relaxed);
			}
			queue.push_back(item);
		}
		self.notify.notify_one();
	}

	/// Waits for and pops the oldest queued item.
	pub async fn pop(&self) -> T {
		loop {
			{
				let mut queue = self.inner.lock().expect("overflow queue poisoned");
				if let Some(item) = queue.pop_front() {
					return item;
				}
			}
			self.notify.notified().await;
		}
	}

	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn push_past_capacity_drops_oldest() {
		let queue: OverflowQueue<i32> = OverflowQueue::new(2);
		queue.push(1);
		queue.push(2);
		queue.push(3);
		assert_eq!(queue.dropped_count(), 1);
	}

	#[tokio::test]
	async fn pop_returns_items_in_fifo_order() {
		let queue: OverflowQueue<i32> = OverflowQueue::new(4);
		queue.push(1);
		queue.push(2);
		assert_eq!(queue.pop().await, 1);
		assert_eq!(queue.pop().await, 2);
	}
}
