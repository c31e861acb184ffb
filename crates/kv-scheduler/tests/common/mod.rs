#![allow(dead_code, clippy::unwrap_used)]

use kv_scheduler::{
	BaseValueStatus, Config, Dependency, Descriptor, InvalidValueError, KeyValuePair, KvWithMetadata, Metadata,
	OperationError, Scheduler, Value, ValueOrigin, ValueState,
};

use std::{
	collections::BTreeMap,
	sync::{Arc, Condvar, Mutex},
	time::Duration,
};

use async_channel as chan;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
	Add(String),
	Modify(String),
	Delete(String),
}

/// In-memory southbound recording every successful operation.
#[derive(Default)]
pub struct MockSouthbound {
	values: Mutex<BTreeMap<String, (Value, Option<Metadata>)>>,
	ops: Mutex<Vec<Op>>,
	failures: Mutex<BTreeMap<String, usize>>,
	lossy: Mutex<bool>,
	paused: (Mutex<bool>, Condvar),
	waiting: Mutex<usize>,
	next_index: Mutex<u64>,
}

impl MockSouthbound {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn ops(&self) -> Vec<Op> {
		self.ops.lock().unwrap().clone()
	}

	pub fn clear_ops(&self) {
		self.ops.lock().unwrap().clear();
	}

	pub fn value(&self, key: &str) -> Option<Value> {
		self.values.lock().unwrap().get(key).map(|(value, _)| value.clone())
	}

	pub fn keys(&self) -> Vec<String> {
		self.values.lock().unwrap().keys().cloned().collect()
	}

	/// Creates a value behind the scheduler's back.
	pub fn inject(&self, key: &str, value: Value) {
		self.values.lock().unwrap().insert(key.to_string(), (value, None));
	}

	/// Removes a value behind the scheduler's back.
	pub fn remove(&self, key: &str) {
		self.values.lock().unwrap().remove(key);
	}

	/// The next `times` operations on the key fail with a southbound error.
	pub fn fail(&self, key: &str, times: usize) {
		self.failures.lock().unwrap().insert(key.to_string(), times);
	}

	/// Adds report success without storing anything.
	pub fn set_lossy(&self, lossy: bool) {
		*self.lossy.lock().unwrap() = lossy;
	}

	/// Operations block until [`MockSouthbound::resume`] is called.
	pub fn pause(&self) {
		*self.paused.0.lock().unwrap() = true;
	}

	pub fn resume(&self) {
		*self.paused.0.lock().unwrap() = false;
		self.paused.1.notify_all();
	}

	/// Number of operations currently blocked by [`MockSouthbound::pause`].
	pub fn waiting(&self) -> usize {
		*self.waiting.lock().unwrap()
	}

	fn wait_if_paused(&self) {
		let mut paused = self.paused.0.lock().unwrap();
		if *paused {
			*self.waiting.lock().unwrap() += 1;
			while *paused {
				paused = self.paused.1.wait(paused).unwrap();
			}
			*self.waiting.lock().unwrap() -= 1;
		}
	}

	fn check_failure(&self, key: &str) -> Result<(), OperationError> {
		let mut failures = self.failures.lock().unwrap();
		match failures.get_mut(key) {
			Some(remaining) if *remaining > 0 => {
				*remaining -= 1;
				Err(OperationError::southbound(format!("injected failure for {key}")))
			}
			_ => Ok(()),
		}
	}

	fn add(&self, key: &str, value: &Value, with_metadata: bool) -> Result<Option<Metadata>, OperationError> {
		self.wait_if_paused();
		self.check_failure(key)?;

		let metadata = with_metadata.then(|| {
			let mut next_index = self.next_index.lock().unwrap();
			*next_index += 1;
			json!({ "index": *next_index })
		});
		if !*self.lossy.lock().unwrap() {
			self.values
				.lock()
				.unwrap()
				.insert(key.to_string(), (value.clone(), metadata.clone()));
		}
		self.ops.lock().unwrap().push(Op::Add(key.to_string()));
		Ok(metadata)
	}

	fn modify(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> Result<Option<Metadata>, OperationError> {
		self.wait_if_paused();
		self.check_failure(key)?;

		self.values
			.lock()
			.unwrap()
			.insert(key.to_string(), (value.clone(), metadata.cloned()));
		self.ops.lock().unwrap().push(Op::Modify(key.to_string()));
		Ok(metadata.cloned())
	}

	fn delete(&self, key: &str) -> Result<(), OperationError> {
		self.wait_if_paused();
		self.check_failure(key)?;

		self.values.lock().unwrap().remove(key);
		self.ops.lock().unwrap().push(Op::Delete(key.to_string()));
		Ok(())
	}

	fn dump(&self, prefix: &str) -> Vec<KvWithMetadata> {
		self.values
			.lock()
			.unwrap()
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(key, (value, metadata))| KvWithMetadata {
				key: key.clone(),
				value: Some(value.clone()),
				metadata: metadata.clone(),
				origin: ValueOrigin::Unknown,
			})
			.collect()
	}
}

type DepsFn = dyn Fn(&str, &Value) -> Vec<Dependency> + Send + Sync;
type DerivesFn = dyn Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync;
type RecreateFn = dyn Fn(&Value, &Value) -> bool + Send + Sync;

/// Descriptor for all the keys under a prefix, backed by a [`MockSouthbound`].
pub struct MockDescriptor {
	name: String,
	prefix: String,
	sb: Arc<MockSouthbound>,
	with_metadata: bool,
	retriable: bool,
	max_mtu: Option<u64>,
	dump_deps: Vec<String>,
	dependencies: Option<Box<DepsFn>>,
	derived: Option<Box<DerivesFn>>,
	recreate: Option<Box<RecreateFn>>,
}

impl MockDescriptor {
	pub fn new(name: &str, prefix: &str, sb: &Arc<MockSouthbound>) -> Self {
		Self {
			name: name.to_string(),
			prefix: prefix.to_string(),
			sb: Arc::clone(sb),
			with_metadata: false,
			retriable: true,
			max_mtu: None,
			dump_deps: Vec::new(),
			dependencies: None,
			derived: None,
			recreate: None,
		}
	}

	/// Every value depends on the keys listed in its `deps` field.
	pub fn with_deps_field(mut self) -> Self {
		self.dependencies = Some(Box::new(|_key, value| {
			value["deps"]
				.as_array()
				.map(|deps| {
					deps.iter()
						.filter_map(Value::as_str)
						.map(|dep| Dependency::on_key(dep, dep))
						.collect()
				})
				.unwrap_or_default()
		}));
		self
	}

	pub fn with_derived(mut self, derived: impl Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync + 'static) -> Self {
		self.derived = Some(Box::new(derived));
		self
	}

	pub fn with_recreate(mut self, recreate: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static) -> Self {
		self.recreate = Some(Box::new(recreate));
		self
	}

	/// Values with `mtu` above the limit are invalid.
	pub const fn with_max_mtu(mut self, max_mtu: u64) -> Self {
		self.max_mtu = Some(max_mtu);
		self
	}

	pub const fn with_metadata(mut self) -> Self {
		self.with_metadata = true;
		self
	}

	pub const fn non_retriable(mut self) -> Self {
		self.retriable = false;
		self
	}

	pub fn dump_after(mut self, descriptor: &str) -> Self {
		self.dump_deps.push(descriptor.to_string());
		self
	}

	pub fn arc(self) -> Arc<dyn Descriptor> {
		Arc::new(self)
	}
}

impl Descriptor for MockDescriptor {
	fn name(&self) -> &str {
		&self.name
	}

	fn key_selector(&self, key: &str) -> bool {
		key.starts_with(&self.prefix)
	}

	fn nb_key_prefix(&self) -> Option<&str> {
		Some(&self.prefix)
	}

	fn with_metadata(&self) -> bool {
		self.with_metadata
	}

	fn dump_dependencies(&self) -> Vec<String> {
		self.dump_deps.clone()
	}

	fn validate(&self, _key: &str, value: &Value) -> Option<Result<(), OperationError>> {
		let max_mtu = self.max_mtu?;
		let too_big = value["mtu"].as_u64().is_some_and(|mtu| mtu > max_mtu);
		Some(if too_big {
			Err(InvalidValueError::new(format!("mtu over {max_mtu}"), ["mtu"]).into())
		} else {
			Ok(())
		})
	}

	fn add(&self, key: &str, value: &Value) -> Option<Result<Option<Metadata>, OperationError>> {
		Some(self.sb.add(key, value, self.with_metadata))
	}

	fn modify(
		&self,
		key: &str,
		_old_value: &Value,
		new_value: &Value,
		old_metadata: Option<&Metadata>,
	) -> Option<Result<Option<Metadata>, OperationError>> {
		Some(self.sb.modify(key, new_value, old_metadata))
	}

	fn modify_with_recreate(
		&self,
		_key: &str,
		old_value: &Value,
		new_value: &Value,
		_metadata: Option<&Metadata>,
	) -> Option<bool> {
		self.recreate
			.as_ref()
			.map(|recreate| recreate(old_value, new_value))
	}

	fn delete(&self, key: &str, _value: &Value, _metadata: Option<&Metadata>) -> Option<Result<(), OperationError>> {
		Some(self.sb.delete(key))
	}

	fn is_retriable_failure(&self, _error: &OperationError) -> Option<bool> {
		Some(self.retriable)
	}

	fn dependencies(&self, key: &str, value: &Value) -> Option<Vec<Dependency>> {
		self.dependencies.as_ref().map(|deps| deps(key, value))
	}

	fn derived_values(&self, key: &str, value: &Value) -> Option<Vec<KeyValuePair>> {
		self.derived.as_ref().map(|derived| derived(key, value))
	}

	fn dump(&self, _correlate: &[KvWithMetadata]) -> Option<Result<Vec<KvWithMetadata>, OperationError>> {
		Some(Ok(self.sb.dump(&self.prefix)))
	}
}

pub fn new_scheduler(config: Config) -> Scheduler {
	Scheduler::new(config).unwrap()
}

pub fn state_of(scheduler: &Scheduler, key: &str) -> ValueState {
	scheduler.get_value_status(key).value.state
}

/// Waits for a status update of the key with the given state.
pub async fn wait_for_state(rx: &chan::Receiver<BaseValueStatus>, key: &str, state: ValueState) {
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			let status = rx.recv().await.unwrap();
			if status.value.key == key && status.value.state == state {
				break;
			}
		}
	})
	.await
	.unwrap_or_else(|_| panic!("timed out waiting for {key} to become {state}"));
}
