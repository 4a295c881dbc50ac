//! Waiting with cancellation.
//!
//! Every blocking wait in a task selects over a fixed set of events. The order is fixed and
//! biased: interruption (cancellation, then deadline) is polled before completion, so a task
//! that has been cancelled never reports an empty success.

use std::{future::Future, time::Duration};

use tokio::{
	sync::mpsc,
	time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
	Cancelled,
	DeadlineExceeded,
}
impl Interrupt {
	pub fn into_error(self, waiting_for: &str) -> Error {
		match self {
			Self::Cancelled => Error::Cancelled { message: format!("{waiting_for} was cancelled.") },
			Self::DeadlineExceeded =>
				Error::Timeout { message: format!("{waiting_for} exceeded the task deadline.") },
		}
	}
}

/// Caller-scoped cancellation and deadline carried by one task.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
	cancel: CancellationToken,
	deadline: Option<Instant>,
}
impl TaskContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_timeout(timeout: Duration) -> Self {
		Self { cancel: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
	}

	/// Tightens the deadline; an earlier existing deadline wins.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));

		self
	}

	/// A context cancelled together with `self` that can also be cancelled on its own.
	pub fn child(&self) -> Self {
		Self { cancel: self.cancel.child_token(), deadline: self.deadline }
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub fn cancellation_token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	pub fn remaining(&self) -> Option<Duration> {
		self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
	}

	/// Non-blocking check.
	pub fn interrupt(&self) -> Option<Interrupt> {
		if self.cancel.is_cancelled() {
			return Some(Interrupt::Cancelled);
		}
		if self.deadline.map(|deadline| Instant::now() >= deadline).unwrap_or(false) {
			return Some(Interrupt::DeadlineExceeded);
		}

		None
	}

	/// Resolves once the context is cancelled or its deadline passes.
	pub async fn interrupted(&self) -> Interrupt {
		match self.deadline {
			Some(deadline) => tokio::select! {
				biased;
				_ = self.cancel.cancelled() => Interrupt::Cancelled,
				_ = time::sleep_until(deadline) => Interrupt::DeadlineExceeded,
			},
			None => {
				self.cancel.cancelled().await;

				Interrupt::Cancelled
			},
		}
	}
}

/// Awaits `work` unless the context is interrupted first.
pub async fn wait<F>(ctx: &TaskContext, waiting_for: &str, work: F) -> Result<F::Output>
where
	F: Future,
{
	if let Some(interrupt) = ctx.interrupt() {
		return Err(interrupt.into_error(waiting_for));
	}

	tokio::select! {
		biased;
		interrupt = ctx.interrupted() => Err(interrupt.into_error(waiting_for)),
		output = work => Ok(output),
	}
}

/// Sends `item` downstream unless the context is interrupted first. A closed receiver counts as
/// cancellation by the consumer.
pub async fn deliver<T>(ctx: &TaskContext, downstream: &mpsc::Sender<T>, item: T) -> Result<()> {
	if let Some(interrupt) = ctx.interrupt() {
		return Err(interrupt.into_error("delivering to downstream"));
	}

	tokio::select! {
		biased;
		interrupt = ctx.interrupted() => Err(interrupt.into_error("delivering to downstream")),
		sent = downstream.send(item) => sent.map_err(|_| Error::Cancelled {
			message: "downstream receiver closed.".to_string(),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn cancellation_wins_over_ready_work() {
		let ctx = TaskContext::new();

		ctx.cancel();

		let err = wait(&ctx, "ready work", async { 7 }).await.expect_err("Expected cancellation.");

		assert!(matches!(err, Error::Cancelled { .. }), "Unexpected error: {err}");
	}

	#[tokio::test]
	async fn deadline_surfaces_as_timeout() {
		let ctx = TaskContext::with_timeout(Duration::from_millis(10));
		let err = wait(&ctx, "slow work", time::sleep(Duration::from_secs(5)))
			.await
			.expect_err("Expected timeout.");

		assert!(matches!(err, Error::Timeout { .. }), "Unexpected error: {err}");
	}

	#[tokio::test]
	async fn completed_work_passes_through() {
		let ctx = TaskContext::with_timeout(Duration::from_secs(5));

		assert_eq!(wait(&ctx, "work", async { 3 }).await.expect("work failed"), 3);
	}

	#[tokio::test]
	async fn child_follows_parent_cancellation() {
		let parent = TaskContext::new();
		let child = parent.child();

		parent.cancel();

		assert_eq!(child.interrupt(), Some(Interrupt::Cancelled));
	}

	#[tokio::test]
	async fn deliver_reports_closed_receiver_as_cancelled() {
		let ctx = TaskContext::new();
		let (tx, rx) = mpsc::channel::<u8>(1);

		drop(rx);

		let err = deliver(&ctx, &tx, 1).await.expect_err("Expected closed receiver.");

		assert!(matches!(err, Error::Cancelled { .. }));
	}

	#[tokio::test]
	async fn deliver_blocked_on_full_channel_yields_to_cancellation() {
		let ctx = TaskContext::new();
		let (tx, _rx) = mpsc::channel::<u8>(1);

		tx.send(0).await.expect("first send failed");

		let canceller = ctx.clone();
		let handle = tokio::spawn(async move {
			time::sleep(Duration::from_millis(10)).await;
			canceller.cancel();
		});
		let err = deliver(&ctx, &tx, 1).await.expect_err("Expected cancellation.");

		handle.await.expect("canceller panicked");

		assert!(matches!(err, Error::Cancelled { .. }));
	}
}
