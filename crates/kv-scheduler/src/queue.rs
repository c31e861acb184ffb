use std::{future, sync::Arc};

use async_channel as chan;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	error::Error,
	scheduler::Shared,
	txn::{RetryTxn, Transaction, TxnKind},
};

/// Resolves once the optional token is cancelled, never without one.
pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
	match token {
		Some(token) => token.cancelled().await,
		None => future::pending().await,
	}
}

impl Shared {
	/// Enqueues without waiting, fails when the queue is full.
	pub(crate) fn try_enqueue(&self, txn: Transaction) -> Result<(), Error> {
		if self.shutdown.is_cancelled() {
			return Err(Error::ClosedScheduler);
		}

		self.txn_tx.try_send(txn).map_err(|e| match e {
			chan::TrySendError::Full(_) => Error::TxnQueueFull,
			chan::TrySendError::Closed(_) => Error::ClosedScheduler,
		})
	}

	/// Waits for a free slot in the queue, unless the scheduler is closed or the caller gives up.
	pub(crate) async fn enqueue(&self, txn: Transaction, cancel: Option<&CancellationToken>) -> Result<(), Error> {
		if self.shutdown.is_cancelled() {
			return Err(Error::ClosedScheduler);
		}

		tokio::select! {
			() = self.shutdown.cancelled() => Err(Error::ClosedScheduler),
			() = cancelled(cancel) => Err(Error::TxnWaitCanceled),
			res = self.txn_tx.send(txn) => res.map_err(|_| Error::ClosedScheduler),
		}
	}
}

/// Schedules a retry of failed values once the delay elapses.
pub(crate) fn enqueue_retry(shared: &Arc<Shared>, retry: RetryTxn) {
	let delay = retry.meta.delay;
	debug!(
		txn_seq_num = retry.meta.txn_seq_num,
		attempt = retry.meta.attempt,
		?delay,
		keys = ?retry.keys.keys().collect::<Vec<_>>(),
		"Scheduling retry of failed operations"
	);

	let task_shared = Arc::clone(shared);
	shared.tasks.spawn_on(
		async move {
			tokio::select! {
				() = task_shared.shutdown.cancelled() => {}
				() = tokio::time::sleep(delay) => {
					let txn = Transaction {
						seq_num: 0,
						kind: TxnKind::Retry(retry),
						values: Vec::new(),
					};
					if let Err(e) = task_shared.try_enqueue(txn) {
						warn!(?e, "Failed to enqueue retry of failed operations");
					}
				}
			}
		},
		&shared.runtime,
	);
}
