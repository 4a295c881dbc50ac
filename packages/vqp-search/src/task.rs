//! Four-phase task protocol driven by the scheduler.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::Instrument;

use vqp_domain::{Timestamp, tso};

use crate::{BoxFuture, Result, Tso, handoff::{self, TaskContext}};

/// Hands out task ids unique within one process.
#[derive(Debug)]
pub struct IdAllocator(AtomicI64);
impl IdAllocator {
	pub fn next(&self) -> i64 {
		self.0.fetch_add(1, Ordering::Relaxed)
	}
}
impl Default for IdAllocator {
	fn default() -> Self {
		Self(AtomicI64::new(1))
	}
}

pub trait Task
where
	Self: Send,
{
	fn name(&self) -> &'static str;

	fn context(&self) -> &TaskContext;

	fn id(&self) -> i64;

	fn set_id(&mut self, id: i64);

	fn begin_ts(&self) -> Timestamp;

	fn end_ts(&self) -> Timestamp {
		self.begin_ts()
	}

	fn set_ts(&mut self, ts: Timestamp);

	/// Initializes request bookkeeping when the task enters the queue.
	fn on_enqueue(&mut self) -> Result<()>;

	/// True when the task may be stamped from the local clock instead of the oracle.
	fn can_skip_alloc_timestamp(&self) -> BoxFuture<'_, bool>;

	fn pre_execute(&mut self) -> BoxFuture<'_, Result<()>>;

	fn execute(&mut self) -> BoxFuture<'_, Result<()>>;

	fn post_execute(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Drives `task` through enqueue, timestamping and its three execution phases.
pub async fn run<T>(task: &mut T, tso: &dyn Tso, ids: &IdAllocator) -> Result<()>
where
	T: Task + ?Sized,
{
	task.on_enqueue()?;
	task.set_id(ids.next());

	let ts = if task.can_skip_alloc_timestamp().await {
		tso::now()
	} else {
		handoff::wait(task.context(), "allocating a timestamp", tso.allocate()).await??
	};

	task.set_ts(ts);

	let id = task.id();
	let name = task.name();

	task.pre_execute().instrument(tracing::info_span!("search.pre_execute", task = name, id)).await?;
	task.execute().instrument(tracing::info_span!("search.execute", task = name, id)).await?;
	task.post_execute().instrument(tracing::info_span!("search.post_execute", task = name, id)).await?;

	tracing::debug!(task = name, id, begin_ts = task.begin_ts(), end_ts = task.end_ts(), "Task finished.");

	Ok(())
}
