use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Payload of a configured value. The scheduler never looks inside, it only compares and
/// passes it along to the descriptors.
pub type Value = serde_json::Value;

/// Opaque data a descriptor may attach to a value after it was created in the southbound.
pub type Metadata = serde_json::Value;

/// Predicate over keys, used for descriptor key spaces, "any-of" dependencies and
/// subscriptions.
#[derive(Clone)]
pub struct KeySelector(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl KeySelector {
	pub fn new(selector: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
		Self(Arc::new(selector))
	}

	/// Selects every key starting with `prefix`.
	pub fn prefix(prefix: impl Into<String>) -> Self {
		let prefix = prefix.into();
		Self::new(move |key| key.starts_with(&prefix))
	}

	/// Selects exactly the given keys.
	pub fn keys(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
		let keys = keys.into_iter().map(Into::into).collect::<Vec<String>>();
		Self::new(move |key| keys.iter().any(|k| k == key))
	}

	#[must_use]
	pub fn matches(&self, key: &str) -> bool {
		(self.0)(key)
	}
}

impl fmt::Debug for KeySelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("KeySelector(..)")
	}
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueOrigin {
	#[default]
	Unknown,
	/// Requested through a northbound transaction.
	FromNb,
	/// Discovered in the southbound, either by a dump or a notification.
	FromSb,
}

impl fmt::Display for ValueOrigin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Unknown => "UNKNOWN",
			Self::FromNb => "NB",
			Self::FromSb => "SB",
		})
	}
}

/// Lifecycle state of a value as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueState {
	/// Value is not known to the scheduler.
	#[default]
	NonExistent,
	/// Value was requested but cannot be applied until its dependencies are satisfied.
	Pending,
	/// Value was successfully applied by the scheduler.
	Configured,
	/// Last operation failed and will not be retried.
	Failed,
	/// Last operation failed and a retry was scheduled.
	Retrying,
	/// Value was removed on request.
	Removed,
	/// Value was configured but the southbound no longer reports it.
	Missing,
	/// Value was created outside the scheduler and discovered by refresh or notification.
	Retrieved,
	/// Value was requested, but found already present in the southbound.
	Found,
	/// Validation of the requested value failed.
	Invalid,
	/// Value is not handled by any descriptor.
	Unimplemented,
}

impl ValueState {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::NonExistent => "NONEXISTENT",
			Self::Pending => "PENDING",
			Self::Configured => "CONFIGURED",
			Self::Failed => "FAILED",
			Self::Retrying => "RETRYING",
			Self::Removed => "REMOVED",
			Self::Missing => "MISSING",
			Self::Retrieved => "RETRIEVED",
			Self::Found => "FOUND",
			Self::Invalid => "INVALID",
			Self::Unimplemented => "UNIMPLEMENTED",
		}
	}

	/// Values in these states carry an error that makes them candidates for a refresh.
	#[must_use]
	pub const fn is_failure(self) -> bool {
		matches!(self, Self::Failed | Self::Retrying)
	}

	/// Origin implied by a value state.
	#[must_use]
	pub const fn origin(self) -> ValueOrigin {
		match self {
			Self::NonExistent => ValueOrigin::Unknown,
			Self::Retrieved => ValueOrigin::FromSb,
			_ => ValueOrigin::FromNb,
		}
	}
}

impl fmt::Display for ValueState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Southbound operation executed (or planned) for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnOperation {
	#[default]
	Undefined,
	Add,
	Modify,
	Delete,
}

impl fmt::Display for TxnOperation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Undefined => "UNDEFINED",
			Self::Add => "ADD",
			Self::Modify => "MODIFY",
			Self::Delete => "DELETE",
		})
	}
}

/// Which state a dump should reflect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum View {
	/// Desired state, as last requested by northbound transactions.
	NorthBound,
	/// Actual state, obtained by calling the descriptor's dump.
	SouthBound,
	/// State as currently held by the scheduler's graph.
	Internal,
}

impl fmt::Display for View {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::NorthBound => "NB",
			Self::SouthBound => "SB",
			Self::Internal => "internal",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValuePair {
	pub key: String,
	pub value: Option<Value>,
}

/// Key-value pair as returned by dumps, with the metadata and origin the southbound reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvWithMetadata {
	pub key: String,
	pub value: Option<Value>,
	pub metadata: Option<Metadata>,
	pub origin: ValueOrigin,
}

impl KvWithMetadata {
	pub fn new(key: impl Into<String>, value: Value, origin: ValueOrigin) -> Self {
		Self {
			key: key.into(),
			value: Some(value),
			metadata: None,
			origin,
		}
	}

	#[must_use]
	pub fn with_metadata(mut self, metadata: Metadata) -> Self {
		self.metadata = Some(metadata);
		self
	}
}

pub(crate) fn format_value(value: Option<&Value>) -> String {
	value.map_or_else(|| "<NIL>".to_string(), ToString::to_string)
}
