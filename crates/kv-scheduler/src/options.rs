use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_COUNT: u32 = 3;

/// Kind of resynchronization requested by a northbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncType {
	#[default]
	NotResync,
	/// Refresh the southbound and apply the complete desired state carried by the transaction.
	Full,
	/// Apply the complete desired state without refreshing the southbound first.
	Upstream,
	/// Refresh the southbound and re-apply the desired state already known to the scheduler.
	Downstream,
}

impl fmt::Display for ResyncType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::NotResync => "not resync",
			Self::Full => "full resync",
			Self::Upstream => "upstream resync",
			Self::Downstream => "downstream resync",
		})
	}
}

/// Retry policy for values failing with a retriable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
	/// Delay before the first retry.
	pub period: Duration,
	/// Maximum number of retries, `0` means unlimited.
	pub max_count: u32,
	/// Double the delay with every repeated retry.
	pub exp_backoff: bool,
	/// Report values scheduled for a retry as failures of the committed transaction right
	/// away. When disabled, a blocking commit only reports errors that will not be retried.
	pub immediate_fail: bool,
}

impl Default for RetryOptions {
	fn default() -> Self {
		Self {
			period: DEFAULT_RETRY_PERIOD,
			max_count: DEFAULT_RETRY_MAX_COUNT,
			exp_backoff: true,
			immediate_fail: true,
		}
	}
}

/// Options a northbound transaction is committed with.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
	pub(crate) resync: ResyncType,
	pub(crate) verbose_resync: bool,
	pub(crate) revert_on_failure: bool,
	pub(crate) retry: Option<RetryOptions>,
	pub(crate) description: String,
	pub(crate) non_blocking: bool,
	pub(crate) cancel: Option<CancellationToken>,
}

impl CommitOptions {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub const fn with_resync(mut self, resync: ResyncType, verbose: bool) -> Self {
		self.resync = resync;
		self.verbose_resync = verbose;
		self
	}

	#[must_use]
	pub const fn with_revert(mut self) -> Self {
		self.revert_on_failure = true;
		self
	}

	#[must_use]
	pub const fn with_retry(mut self, retry: RetryOptions) -> Self {
		self.retry = Some(retry);
		self
	}

	#[must_use]
	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.description = description.into();
		self
	}

	/// The commit returns as soon as the transaction is enqueued, errors are only logged.
	#[must_use]
	pub const fn non_blocking(mut self) -> Self {
		self.non_blocking = true;
		self
	}

	/// Lets the caller stop waiting for the result of a blocking commit.
	#[must_use]
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = Some(cancel);
		self
	}
}
