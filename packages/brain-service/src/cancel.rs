use std::{
	future::Future,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use tokio::sync::Notify;

use crate::{Error, Result};

/// Cooperative cancellation shared between a caller and one in-flight retrieval.
///
/// Clones observe the same flag. Waiters parked in [`CancellationToken::cancelled`] are woken when
/// [`CancellationToken::cancel`] runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	cancelled: AtomicBool,
	notify: Notify,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.inner.cancelled.store(true, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::SeqCst)
	}

	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() {
			return Err(Error::Cancelled);
		}

		Ok(())
	}

	pub async fn cancelled(&self) {
		loop {
			// Register before re-checking the flag so a concurrent `cancel` cannot be missed.
			let notified = self.inner.notify.notified();

			if self.is_cancelled() {
				return;
			}

			notified.await;
		}
	}
}

/// Runs one external call under its own timeout while racing it against cancellation.
pub(crate) async fn guard<T, F>(
	cancel: &CancellationToken,
	stage: &'static str,
	timeout: Duration,
	fut: F,
) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	cancel.check()?;

	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(Error::Cancelled),
		res = tokio::time::timeout(timeout, fut) => match res {
			Ok(inner) => inner,
			Err(_) => Err(Error::Timeout { stage, timeout_ms: timeout.as_millis() as u64 }),
		},
	}
}
