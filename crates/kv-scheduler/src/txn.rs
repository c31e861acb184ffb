use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
	error::TransactionError,
	options::{ResyncType, RetryOptions},
	value::{Metadata, Value, ValueOrigin},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnType {
	/// Change reported by the southbound.
	SbNotification,
	/// Change requested by the northbound.
	NbTransaction,
	/// Follow-up attempt for values which failed with a retriable error.
	RetryFailedOps,
}

impl fmt::Display for TxnType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::SbNotification => "SB Notification",
			Self::NbTransaction => "NB Transaction",
			Self::RetryFailedOps => "Retry Failed Operations",
		})
	}
}

/// Value to apply within a transaction.
#[derive(Debug, Clone)]
pub(crate) struct KvForTxn {
	pub(crate) key: String,
	pub(crate) value: Option<Value>,
	pub(crate) metadata: Option<Metadata>,
	pub(crate) origin: ValueOrigin,
	pub(crate) is_revert: bool,
}

impl KvForTxn {
	pub(crate) const fn new(key: String, value: Option<Value>, origin: ValueOrigin) -> Self {
		Self {
			key,
			value,
			metadata: None,
			origin,
			is_revert: false,
		}
	}
}

pub(crate) type TxnResult = Result<u64, TransactionError>;

/// Parameters of a northbound transaction.
#[derive(Debug)]
pub(crate) struct NbTxn {
	pub(crate) resync_type: ResyncType,
	pub(crate) verbose_refresh: bool,
	pub(crate) revert_on_failure: bool,
	pub(crate) retry: Option<RetryOptions>,
	pub(crate) description: String,
	/// Present for blocking commits, consumed once the result is delivered.
	pub(crate) result_tx: Option<oneshot::Sender<TxnResult>>,
}

/// Identifies one retry: values of the same transaction, retried after the same delay, for
/// the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RetryTxnMeta {
	pub(crate) txn_seq_num: u64,
	pub(crate) delay: Duration,
	pub(crate) attempt: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryTxn {
	pub(crate) meta: RetryTxnMeta,
	/// Keys to retry, mapped to the sequence number of the transaction which last updated them
	/// at the time the retry was scheduled.
	pub(crate) keys: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub(crate) enum TxnKind {
	SbNotification,
	Nb(NbTxn),
	Retry(RetryTxn),
}

#[derive(Debug)]
pub(crate) struct Transaction {
	pub(crate) seq_num: u64,
	pub(crate) kind: TxnKind,
	pub(crate) values: Vec<KvForTxn>,
}

impl Transaction {
	pub(crate) const fn txn_type(&self) -> TxnType {
		match self.kind {
			TxnKind::SbNotification => TxnType::SbNotification,
			TxnKind::Nb(_) => TxnType::NbTransaction,
			TxnKind::Retry(_) => TxnType::RetryFailedOps,
		}
	}

	pub(crate) const fn nb(&self) -> Option<&NbTxn> {
		match &self.kind {
			TxnKind::Nb(nb) => Some(nb),
			_ => None,
		}
	}

	pub(crate) const fn retry(&self) -> Option<&RetryTxn> {
		match &self.kind {
			TxnKind::Retry(retry) => Some(retry),
			_ => None,
		}
	}

	pub(crate) fn resync_type(&self) -> ResyncType {
		self.nb().map_or(ResyncType::NotResync, |nb| nb.resync_type)
	}

	pub(crate) fn revert_on_failure(&self) -> bool {
		self.nb().is_some_and(|nb| nb.revert_on_failure)
	}

	pub(crate) const fn is_blocking(&self) -> bool {
		matches!(
			&self.kind,
			TxnKind::Nb(NbTxn {
				result_tx: Some(_),
				..
			})
		)
	}
}
