use std::{error::Error as StdError, fmt, io, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use super::value::TxnOperation;

/// Errors from setting up transactions, from the scheduler infrastructure and from the
/// introspection API.
#[derive(Debug, Clone, Error)]
pub enum Error {
	#[error("downstream resync combined with data changes in one transaction")]
	CombinedDownstreamResyncWithChange,
	#[error("it is not supported to combine resync with revert")]
	RevertNotSupportedWithResync,
	#[error("scheduler was closed")]
	ClosedScheduler,
	#[error("waiting for result of blocking transaction was canceled")]
	TxnWaitCanceled,
	#[error("transaction queue is full")]
	TxnQueueFull,
	#[error("scheduler has to be created within a tokio runtime")]
	NoRuntime,
	#[error("failed to spawn transaction worker: {0}")]
	WorkerSpawn(Arc<io::Error>),

	#[error("descriptor already registered <name='{0}'>")]
	DuplicateDescriptor(String),
	#[error("descriptor not found <name='{0}'>")]
	UnknownDescriptor(String),
	#[error("no descriptor registered for key prefix <prefix='{0}'>")]
	UnknownKeyPrefix(String),
	#[error("descriptor does not support dump <name='{0}'>")]
	DumpNotSupported(String),
	#[error("dump failed for descriptor <name='{descriptor}'>: {source}")]
	Dump {
		descriptor: String,
		#[source]
		source: OperationError,
	},
}

/// Errors returned for individual values, either by the descriptors or by the scheduler
/// while executing an operation.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
	#[error("Add operation is not implemented")]
	UnimplementedAdd,
	#[error("Modify operation is not implemented")]
	UnimplementedModify,
	#[error("Delete operation is not implemented")]
	UnimplementedDelete,
	#[error(transparent)]
	InvalidValue(#[from] InvalidValueError),
	#[error(transparent)]
	Verification(#[from] VerificationError),
	#[error("cascade of dependent updates exceeded {limit} levels <key='{key}'>")]
	CascadeTooDeep { key: String, limit: usize },
	#[error(transparent)]
	Southbound(Arc<dyn StdError + Send + Sync>),
}

impl OperationError {
	/// Wraps any error returned by a southbound binding.
	pub fn southbound(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
		Self::Southbound(Arc::from(error.into()))
	}

	#[must_use]
	pub const fn is_unimplemented(&self) -> bool {
		matches!(
			self,
			Self::UnimplementedAdd | Self::UnimplementedModify | Self::UnimplementedDelete
		)
	}
}

/// Returned by descriptors from validation, to tell which fields of the value are invalid.
#[derive(Debug, Clone, Error)]
#[error("{}", describe_invalid(.reason, .invalid_fields))]
pub struct InvalidValueError {
	pub reason: String,
	pub invalid_fields: Vec<String>,
}

impl InvalidValueError {
	pub fn new(reason: impl Into<String>, invalid_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			reason: reason.into(),
			invalid_fields: invalid_fields.into_iter().map(Into::into).collect(),
		}
	}
}

fn describe_invalid(reason: &str, invalid_fields: &[String]) -> String {
	if invalid_fields.is_empty() {
		return reason.to_string();
	}

	format!("field(s) {} are invalid: {reason}", invalid_fields.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationErrorKind {
	ExpectedToExist,
	ExpectedToNotExist,
	NotEquivalent,
}

impl VerificationErrorKind {
	const fn describe(self) -> &'static str {
		match self {
			Self::ExpectedToExist => "value is not actually configured",
			Self::ExpectedToNotExist => "value is not actually removed",
			Self::NotEquivalent => "applied value is not equivalent with the retrieved one",
		}
	}
}

/// Reported in verify mode when the southbound disagrees with what was just applied.
#[derive(Debug, Clone, Error)]
#[error("{} <key='{key}'>", .kind.describe())]
pub struct VerificationError {
	pub key: String,
	pub kind: VerificationErrorKind,
}

/// Error of a single value within a transaction.
#[derive(Debug, Clone)]
pub struct KeyWithError {
	pub key: String,
	pub operation: TxnOperation,
	pub error: OperationError,
}

impl fmt::Display for KeyWithError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({}): {}", self.key, self.operation, self.error)
	}
}

/// Result of a failed transaction: either it could not be started at all, or some values
/// failed to be applied.
#[derive(Debug, Clone, Default)]
pub struct TransactionError {
	pub seq_num: Option<u64>,
	pub init_error: Option<Error>,
	pub kv_errors: Vec<KeyWithError>,
}

impl TransactionError {
	pub(crate) const fn from_init(init_error: Error) -> Self {
		Self {
			seq_num: None,
			init_error: Some(init_error),
			kv_errors: Vec::new(),
		}
	}

	#[must_use]
	pub fn error_for_key(&self, key: &str) -> Option<&OperationError> {
		self.kv_errors
			.iter()
			.find(|kv_error| kv_error.key == key)
			.map(|kv_error| &kv_error.error)
	}
}

impl From<Error> for TransactionError {
	fn from(init_error: Error) -> Self {
		Self::from_init(init_error)
	}
}

impl fmt::Display for TransactionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(init_error) = &self.init_error {
			return write!(f, "transaction initialization failed: {init_error}");
		}

		if self.kv_errors.len() == 1 {
			return write!(f, "failed to apply: {}", self.kv_errors[0]);
		}

		write!(f, "{} values failed to be applied:", self.kv_errors.len())?;
		for kv_error in &self.kv_errors {
			write!(f, "\n  - {kv_error}")?;
		}

		Ok(())
	}
}

impl StdError for TransactionError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		self.init_error
			.as_ref()
			.map(|e| e as &(dyn StdError + 'static))
	}
}
