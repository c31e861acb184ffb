use std::fmt;

use crate::{
	error::OperationError,
	options::RetryOptions,
	value::{TxnOperation, Value, ValueState},
};

/// Names of the flags a node may carry, used to select nodes and to compute statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagName {
	LastUpdate,
	Error,
	ValueState,
	Unavailable,
	Descriptor,
	Derived,
}

impl fmt::Display for FlagName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::LastUpdate => "last-update",
			Self::Error => "error",
			Self::ValueState => "value-state",
			Self::Unavailable => "unavailable",
			Self::Descriptor => "descriptor",
			Self::Derived => "derived",
		})
	}
}

/// Last change requested for a value, by the transaction that touched it last.
#[derive(Debug, Clone, PartialEq)]
pub struct LastUpdate {
	pub txn_seq_num: u64,
	pub txn_op: TxnOperation,
	/// Requested value, `None` for removal.
	pub value: Option<Value>,
	pub revert: bool,
	/// Retry policy in effect for the value, `None` when retry is disabled.
	pub retry: Option<RetryOptions>,
}

/// Error returned by the last operation executed for a value.
#[derive(Debug, Clone)]
pub struct ErrorFlag {
	pub error: OperationError,
	pub retriable: bool,
}

/// Tags attached to graph nodes.
#[derive(Debug, Clone)]
pub enum Flag {
	LastUpdate(LastUpdate),
	Error(ErrorFlag),
	ValueState(ValueState),
	/// The value is not applied in the southbound (pending, failed, removed, ...).
	Unavailable,
	/// Name of the descriptor owning the value.
	Descriptor(String),
	/// The value is derived from the given base value.
	Derived(String),
}

impl Flag {
	#[must_use]
	pub const fn name(&self) -> FlagName {
		match self {
			Self::LastUpdate(_) => FlagName::LastUpdate,
			Self::Error(_) => FlagName::Error,
			Self::ValueState(_) => FlagName::ValueState,
			Self::Unavailable => FlagName::Unavailable,
			Self::Descriptor(_) => FlagName::Descriptor,
			Self::Derived(_) => FlagName::Derived,
		}
	}

	/// Value of the flag rendered for selectors and statistics.
	#[must_use]
	pub fn value_string(&self) -> String {
		match self {
			Self::LastUpdate(last_update) => {
				format!("{} #{}", last_update.txn_op, last_update.txn_seq_num)
			}
			Self::Error(error) => error.error.to_string(),
			Self::ValueState(state) => state.to_string(),
			Self::Unavailable => String::new(),
			Self::Descriptor(descriptor) => descriptor.clone(),
			Self::Derived(base_key) => base_key.clone(),
		}
	}
}

/// Set of flags of one node, at most one flag per name.
#[derive(Debug, Clone, Default)]
pub struct Flags(Vec<Flag>);

impl Flags {
	pub fn set(&mut self, flag: Flag) {
		let name = flag.name();
		if let Some(existing) = self.0.iter_mut().find(|f| f.name() == name) {
			*existing = flag;
		} else {
			self.0.push(flag);
		}
	}

	pub fn remove(&mut self, name: FlagName) {
		self.0.retain(|f| f.name() != name);
	}

	#[must_use]
	pub fn get(&self, name: FlagName) -> Option<&Flag> {
		self.0.iter().find(|f| f.name() == name)
	}

	#[must_use]
	pub fn has(&self, name: FlagName) -> bool {
		self.get(name).is_some()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Flag> {
		self.0.iter()
	}

	#[must_use]
	pub fn last_update(&self) -> Option<&LastUpdate> {
		match self.get(FlagName::LastUpdate) {
			Some(Flag::LastUpdate(last_update)) => Some(last_update),
			_ => None,
		}
	}

	#[must_use]
	pub fn error(&self) -> Option<&ErrorFlag> {
		match self.get(FlagName::Error) {
			Some(Flag::Error(error)) => Some(error),
			_ => None,
		}
	}

	#[must_use]
	pub fn value_state(&self) -> Option<ValueState> {
		match self.get(FlagName::ValueState) {
			Some(Flag::ValueState(state)) => Some(*state),
			_ => None,
		}
	}

	#[must_use]
	pub fn descriptor(&self) -> Option<&str> {
		match self.get(FlagName::Descriptor) {
			Some(Flag::Descriptor(descriptor)) => Some(descriptor),
			_ => None,
		}
	}

	#[must_use]
	pub fn derived_from(&self) -> Option<&str> {
		match self.get(FlagName::Derived) {
			Some(Flag::Derived(base_key)) => Some(base_key),
			_ => None,
		}
	}
}

/// Condition on one flag: present with any value, or present with the given rendered value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagFilter {
	pub name: FlagName,
	pub value: Option<String>,
}

impl FlagFilter {
	#[must_use]
	pub const fn any(name: FlagName) -> Self {
		Self { name, value: None }
	}

	#[must_use]
	pub fn value_state(state: ValueState) -> Self {
		Self {
			name: FlagName::ValueState,
			value: Some(state.to_string()),
		}
	}

	pub fn descriptor(descriptor: impl Into<String>) -> Self {
		Self {
			name: FlagName::Descriptor,
			value: Some(descriptor.into()),
		}
	}

	fn matches(&self, flags: &Flags) -> bool {
		flags.get(self.name).is_some_and(|flag| {
			self.value
				.as_ref()
				.map_or(true, |value| *value == flag.value_string())
		})
	}
}

/// Selects nodes either carrying at least one (`with`) or none (`without`) of the filters.
#[derive(Debug, Clone)]
pub enum FlagSelector {
	With(Vec<FlagFilter>),
	Without(Vec<FlagFilter>),
}

impl FlagSelector {
	#[must_use]
	pub fn with(filter: FlagFilter) -> Self {
		Self::With(vec![filter])
	}

	#[must_use]
	pub fn without(filter: FlagFilter) -> Self {
		Self::Without(vec![filter])
	}

	#[must_use]
	pub fn matches(&self, flags: &Flags) -> bool {
		match self {
			Self::With(filters) => filters.iter().any(|filter| filter.matches(flags)),
			Self::Without(filters) => !filters.iter().any(|filter| filter.matches(flags)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_are_unique_per_name() {
		let mut flags = Flags::default();
		flags.set(Flag::ValueState(ValueState::Pending));
		flags.set(Flag::ValueState(ValueState::Configured));
		flags.set(Flag::Unavailable);

		assert_eq!(flags.iter().count(), 2);
		assert_eq!(flags.value_state(), Some(ValueState::Configured));

		flags.remove(FlagName::Unavailable);
		assert!(!flags.has(FlagName::Unavailable));
	}

	#[test]
	fn selectors() {
		let mut flags = Flags::default();
		flags.set(Flag::Descriptor("interface".to_string()));
		flags.set(Flag::ValueState(ValueState::Retrieved));

		assert!(FlagSelector::with(FlagFilter::descriptor("interface")).matches(&flags));
		assert!(!FlagSelector::with(FlagFilter::descriptor("route")).matches(&flags));
		assert!(FlagSelector::without(FlagFilter::any(FlagName::Derived)).matches(&flags));
		assert!(!FlagSelector::without(FlagFilter::value_state(ValueState::Retrieved)).matches(&flags));
	}
}
