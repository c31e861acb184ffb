use std::{fmt, sync::Arc};

use crate::{
	error::{InvalidValueError, OperationError},
	value::{KeySelector, KeyValuePair, KvWithMetadata, Metadata, Value},
};

/// Named dependency of a value: satisfied once the target key, or any key matching the
/// selector, is available.
#[derive(Debug, Clone)]
pub struct Dependency {
	pub label: String,
	pub target: DependencyTarget,
}

#[derive(Debug, Clone)]
pub enum DependencyTarget {
	Key(String),
	AnyOf(KeySelector),
}

impl Dependency {
	pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
		Self {
			label: label.into(),
			target: DependencyTarget::Key(key.into()),
		}
	}

	pub fn any_of(label: impl Into<String>, selector: KeySelector) -> Self {
		Self {
			label: label.into(),
			target: DependencyTarget::AnyOf(selector),
		}
	}
}

/// Strategy for one kind of values, implemented by the southbound bindings.
///
/// Only the key space is mandatory. Every other capability returns `None` when it is not
/// implemented, and the scheduler falls back to a default behavior:
/// - `key_label` uses the key itself;
/// - `value_comparator` compares payloads structurally;
/// - `validate` accepts every value;
/// - `add`, `modify` and `delete` fail with a non-retriable "unimplemented" error;
/// - `modify_with_recreate` never recreates;
/// - `is_retriable_failure` considers every error retriable;
/// - `dependencies` and `derived_values` are empty;
/// - `dump` reports that the southbound state cannot be read.
#[allow(unused_variables)]
pub trait Descriptor: Send + Sync + 'static {
	/// Unique name of the descriptor.
	fn name(&self) -> &str;

	/// Tells whether the key belongs to this descriptor.
	fn key_selector(&self, key: &str) -> bool;

	/// Prefix of the keys this descriptor serves northbound.
	fn nb_key_prefix(&self) -> Option<&str> {
		None
	}

	/// Publish metadata of the values in a metadata map named after the descriptor.
	fn with_metadata(&self) -> bool {
		false
	}

	/// Names of descriptors whose values have to be dumped before the values of this one.
	fn dump_dependencies(&self) -> Vec<String> {
		Vec::new()
	}

	fn key_label(&self, key: &str) -> Option<String> {
		None
	}

	fn value_comparator(&self, key: &str, old_value: &Value, new_value: &Value) -> Option<bool> {
		None
	}

	fn validate(&self, key: &str, value: &Value) -> Option<Result<(), OperationError>> {
		None
	}

	fn add(&self, key: &str, value: &Value) -> Option<Result<Option<Metadata>, OperationError>> {
		None
	}

	fn modify(
		&self,
		key: &str,
		old_value: &Value,
		new_value: &Value,
		old_metadata: Option<&Metadata>,
	) -> Option<Result<Option<Metadata>, OperationError>> {
		None
	}

	fn modify_with_recreate(
		&self,
		key: &str,
		old_value: &Value,
		new_value: &Value,
		metadata: Option<&Metadata>,
	) -> Option<bool> {
		None
	}

	fn delete(
		&self,
		key: &str,
		value: &Value,
		metadata: Option<&Metadata>,
	) -> Option<Result<(), OperationError>> {
		None
	}

	fn is_retriable_failure(&self, error: &OperationError) -> Option<bool> {
		None
	}

	fn dependencies(&self, key: &str, value: &Value) -> Option<Vec<Dependency>> {
		None
	}

	fn derived_values(&self, key: &str, value: &Value) -> Option<Vec<KeyValuePair>> {
		None
	}

	/// Reads the values currently present in the southbound. `correlate` holds the values
	/// the scheduler expects, to help matching southbound objects with their keys.
	fn dump(&self, correlate: &[KvWithMetadata]) -> Option<Result<Vec<KvWithMetadata>, OperationError>> {
		None
	}
}

/// Calls a descriptor, falling back to the default behavior for missing capabilities.
/// Wraps no descriptor at all for derived values without one (properties).
#[derive(Clone)]
pub(crate) struct DescriptorHandler(Option<Arc<dyn Descriptor>>);

impl fmt::Debug for DescriptorHandler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("DescriptorHandler")
			.field(&self.0.as_ref().map(|descriptor| descriptor.name()))
			.finish()
	}
}

impl DescriptorHandler {
	pub(crate) const fn new(descriptor: Option<Arc<dyn Descriptor>>) -> Self {
		Self(descriptor)
	}

	pub(crate) fn descriptor(&self) -> Option<&Arc<dyn Descriptor>> {
		self.0.as_ref()
	}

	pub(crate) fn name(&self) -> Option<&str> {
		self.0.as_ref().map(|descriptor| descriptor.name())
	}

	pub(crate) fn key_label(&self, key: &str) -> String {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.key_label(key))
			.unwrap_or_else(|| key.to_string())
	}

	pub(crate) fn with_metadata(&self) -> bool {
		self.0
			.as_ref()
			.is_some_and(|descriptor| descriptor.with_metadata())
	}

	pub(crate) fn equivalent(&self, key: &str, old_value: Option<&Value>, new_value: Option<&Value>) -> bool {
		match (old_value, new_value) {
			(Some(old_value), Some(new_value)) => self
				.0
				.as_ref()
				.and_then(|descriptor| descriptor.value_comparator(key, old_value, new_value))
				.unwrap_or_else(|| old_value == new_value),
			(None, None) => true,
			_ => false,
		}
	}

	/// Any validation failure is reported as an invalid value.
	pub(crate) fn validate(&self, key: &str, value: &Value) -> Result<(), OperationError> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.validate(key, value))
			.unwrap_or(Ok(()))
			.map_err(|error| match error {
				OperationError::InvalidValue(_) => error,
				other => InvalidValueError::new(other.to_string(), Vec::<String>::new()).into(),
			})
	}

	pub(crate) fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, OperationError> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.add(key, value))
			.unwrap_or(Err(OperationError::UnimplementedAdd))
	}

	pub(crate) fn modify(
		&self,
		key: &str,
		old_value: &Value,
		new_value: &Value,
		old_metadata: Option<&Metadata>,
	) -> Result<Option<Metadata>, OperationError> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.modify(key, old_value, new_value, old_metadata))
			.unwrap_or(Err(OperationError::UnimplementedModify))
	}

	pub(crate) fn modify_with_recreate(
		&self,
		key: &str,
		old_value: &Value,
		new_value: &Value,
		metadata: Option<&Metadata>,
	) -> bool {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.modify_with_recreate(key, old_value, new_value, metadata))
			.unwrap_or(false)
	}

	pub(crate) fn delete(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> Result<(), OperationError> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.delete(key, value, metadata))
			.unwrap_or(Err(OperationError::UnimplementedDelete))
	}

	pub(crate) fn is_retriable_failure(&self, error: &OperationError) -> bool {
		if error.is_unimplemented() || matches!(error, OperationError::InvalidValue(_)) {
			return false;
		}

		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.is_retriable_failure(error))
			.unwrap_or(true)
	}

	pub(crate) fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.dependencies(key, value))
			.unwrap_or_default()
	}

	pub(crate) fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
		self.0
			.as_ref()
			.and_then(|descriptor| descriptor.derived_values(key, value))
			.unwrap_or_default()
	}

	/// `None` when the southbound state cannot be dumped.
	pub(crate) fn dump(
		&self,
		correlate: &[KvWithMetadata],
	) -> Option<Result<Vec<KvWithMetadata>, OperationError>> {
		self.0.as_ref().and_then(|descriptor| descriptor.dump(correlate))
	}
}
