use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use vqp_domain::{Timestamp, tso};
use vqp_search::{BoxFuture, Result, Tso};

/// Timestamp oracle backed by the local clock; never hands out the same value twice.
#[derive(Debug, Default)]
pub struct MonotonicTso {
	last: Mutex<Timestamp>,
	allocations: AtomicUsize,
}
impl MonotonicTso {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next(&self) -> Timestamp {
		let mut last = self.last.lock();
		let ts = tso::now().max(*last + 1);

		*last = ts;

		ts
	}

	/// Allocations served through [`Tso::allocate`].
	pub fn allocations(&self) -> usize {
		self.allocations.load(Ordering::SeqCst)
	}
}

impl Tso for MonotonicTso {
	fn allocate(&self) -> BoxFuture<'_, Result<Timestamp>> {
		self.allocations.fetch_add(1, Ordering::SeqCst);

		let ts = self.next();

		Box::pin(async move { Ok(ts) })
	}
}
