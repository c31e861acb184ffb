//! The scheduler front-end: descriptor registration, transactions, notifications and
//! introspection of the graph and of the transaction history.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex, PoisonError},
	thread,
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use tokio::{runtime::Handle, sync::oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

use crate::{
	config::Config,
	descriptor::{Descriptor, DescriptorHandler},
	error::{Error, KeyWithError, TransactionError},
	graph::{FlagFilter, FlagName, FlagSelector, FlagStats, Graph, ReadAccess, RecordedNode},
	history::TxnHistory,
	node_utils::{
		base_value_status, correlate_values_selectors, nb_base_values_selectors, nodes_to_kvs_with_last_applied,
		nodes_to_kvs_with_metadata,
	},
	options::{CommitOptions, ResyncType},
	process::TxnProcessor,
	queue,
	record::RecordedTxn,
	registry::Registry,
	status::{BaseValueStatus, Subscribers},
	txn::{KvForTxn, NbTxn, Transaction, TxnKind},
	value::{KeySelector, KvWithMetadata, Metadata, Value, ValueOrigin, View},
};

/// The graph walk recurses along dependencies and derived values.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// State shared between the front-end, the transaction worker and the background tasks.
pub(crate) struct Shared {
	pub(crate) config: Config,
	pub(crate) graph: Graph,
	pub(crate) registry: Registry,
	pub(crate) history: TxnHistory,
	pub(crate) subscribers: Subscribers,
	/// Held while a transaction is processed.
	pub(crate) txn_lock: tokio::sync::Mutex<()>,
	pub(crate) txn_tx: chan::Sender<Transaction>,
	pub(crate) shutdown: CancellationToken,
	pub(crate) tasks: TaskTracker,
	pub(crate) runtime: Handle,
}

/// Transaction scheduler over a graph of key-value pairs.
///
/// Values are applied to the southbound through registered [`Descriptor`]s, in the order
/// given by their dependencies. Transactions are processed one at a time by a dedicated
/// worker thread.
pub struct Scheduler {
	shared: Arc<Shared>,
	worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
	/// Starts the scheduler. Has to be called from within a tokio runtime, which then runs
	/// the background tasks (retries and history trimming).
	pub fn new(config: Config) -> Result<Self, Error> {
		let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
		let (txn_tx, txn_rx) = chan::bounded(config.txn_queue_capacity.max(1));

		info!(
			verify_mode = config.verify_mode,
			record_history = config.record_transaction_history,
			queue_capacity = config.txn_queue_capacity,
			"Starting KV scheduler"
		);

		let shared = Arc::new(Shared {
			history: TxnHistory::new(Utc::now()),
			config,
			graph: Graph::new(),
			registry: Registry::default(),
			subscribers: Subscribers::default(),
			txn_lock: tokio::sync::Mutex::new(()),
			txn_tx,
			shutdown: CancellationToken::new(),
			tasks: TaskTracker::new(),
			runtime,
		});

		let processor = TxnProcessor::new(Arc::clone(&shared));
		let worker = thread::Builder::new()
			.name("kv-scheduler-worker".to_string())
			.stack_size(WORKER_STACK_SIZE)
			.spawn(move || processor.run(&txn_rx))
			.map_err(|e| Error::WorkerSpawn(Arc::new(e)))?;

		if shared.config.record_transaction_history {
			let trimming_shared = Arc::clone(&shared);
			shared
				.tasks
				.spawn_on(trim_history(trimming_shared), &shared.runtime);
		}

		Ok(Self {
			shared,
			worker: Mutex::new(Some(worker)),
		})
	}

	#[must_use]
	pub fn config(&self) -> &Config {
		&self.shared.config
	}

	pub fn register_descriptor(&self, descriptor: Arc<dyn Descriptor>) -> Result<(), Error> {
		let name = descriptor.name().to_string();
		let with_metadata = descriptor.with_metadata();
		self.shared.registry.register(descriptor)?;
		if with_metadata {
			self.shared.graph.register_metadata_map(&name);
		}
		debug!(descriptor = %name, "Registered descriptor");
		Ok(())
	}

	/// Key prefixes of the descriptors serving northbound values.
	#[must_use]
	pub fn get_registered_nb_key_prefixes(&self) -> Vec<String> {
		self.shared.registry.nb_key_prefixes()
	}

	/// Starts building a northbound transaction.
	#[must_use]
	pub fn start_transaction(&self) -> Txn<'_> {
		Txn {
			scheduler: self,
			values: BTreeMap::new(),
		}
	}

	/// Reports a change of a value in the southbound made outside of the scheduler.
	/// `None` value means the value was removed.
	pub fn push_notification(
		&self,
		key: impl Into<String>,
		value: Option<Value>,
		metadata: Option<Metadata>,
	) -> Result<(), Error> {
		let txn = Transaction {
			seq_num: 0,
			kind: TxnKind::SbNotification,
			values: vec![KvForTxn {
				metadata,
				..KvForTxn::new(key.into(), value, ValueOrigin::FromSb)
			}],
		};
		self.shared.try_enqueue(txn)
	}

	#[must_use]
	pub fn get_value_status(&self, key: &str) -> BaseValueStatus {
		base_value_status(&self.shared.graph.read(), key)
	}

	/// Status updates of base values matching the selector (all when `None`) are sent to `tx`.
	pub fn watch_value_status(&self, tx: chan::Sender<BaseValueStatus>, selector: Option<KeySelector>) {
		self.shared.subscribers.watch_status(tx, selector);
	}

	/// Errors of values matching the selector (all when `None`) are sent to `tx`.
	pub fn subscribe_for_errors(&self, tx: chan::Sender<KeyWithError>, selector: Option<KeySelector>) {
		self.shared.subscribers.watch_errors(tx, selector);
	}

	/// Recorded transactions started within the window, bounds are inclusive and optional.
	#[must_use]
	pub fn get_transaction_history(
		&self,
		since: Option<DateTime<Utc>>,
		until: Option<DateTime<Utc>>,
	) -> Vec<Arc<RecordedTxn>> {
		self.shared.history.window(since, until)
	}

	#[must_use]
	pub fn get_recorded_transaction(&self, seq_num: u64) -> Option<Arc<RecordedTxn>> {
		self.shared.history.get(seq_num)
	}

	/// Dumps values of the descriptor as seen from the given view.
	pub async fn dump_values_by_descriptor(&self, descriptor: &str, view: View) -> Result<Vec<KvWithMetadata>, Error> {
		let Some(found) = self.shared.registry.get(descriptor) else {
			return Err(Error::UnknownDescriptor(descriptor.to_string()));
		};

		if view != View::SouthBound {
			let graph_r = self.shared.graph.read();
			return Ok(match view {
				View::NorthBound => {
					let mut selectors = nb_base_values_selectors();
					selectors.push(FlagSelector::with(FlagFilter::descriptor(descriptor)));
					nodes_to_kvs_with_last_applied(&graph_r.get_nodes(None, &selectors))
				}
				_ => nodes_to_kvs_with_metadata(&graph_r.get_nodes(None, &correlate_values_selectors(descriptor))),
			});
		}

		// no transaction may run while the southbound is being dumped
		let _txn_guard = self.shared.txn_lock.lock().await;
		let correlate = {
			let graph_r = self.shared.graph.read();
			nodes_to_kvs_with_metadata(&graph_r.get_nodes(None, &correlate_values_selectors(descriptor)))
		};

		match DescriptorHandler::new(Some(found)).dump(&correlate) {
			None => Err(Error::DumpNotSupported(descriptor.to_string())),
			Some(Err(source)) => Err(Error::Dump {
				descriptor: descriptor.to_string(),
				source,
			}),
			Some(Ok(values)) => Ok(values),
		}
	}

	/// Like [`Scheduler::dump_values_by_descriptor`], with the descriptor selected by its
	/// northbound key prefix.
	pub async fn dump_values_by_key_prefix(&self, key_prefix: &str, view: View) -> Result<Vec<KvWithMetadata>, Error> {
		let Some(descriptor) = self.shared.registry.get_for_nb_key_prefix(key_prefix) else {
			return Err(Error::UnknownKeyPrefix(key_prefix.to_string()));
		};
		self.dump_values_by_descriptor(descriptor.name(), view).await
	}

	/// Metadata of the values of a descriptor registered with metadata, keyed by value label.
	#[must_use]
	pub fn get_metadata_map(&self, descriptor: &str) -> Option<BTreeMap<String, Metadata>> {
		self.shared.graph.read().get_metadata_map(descriptor).cloned()
	}

	/// Waits until the transaction being processed, if any, is finalized.
	pub async fn transaction_barrier(&self) {
		drop(self.shared.txn_lock.lock().await);
	}

	/// Revisions of all the values valid at the given time.
	#[must_use]
	pub fn graph_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
		self.shared
			.graph
			.read()
			.get_snapshot(time)
			.into_iter()
			.cloned()
			.collect()
	}

	#[must_use]
	pub fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
		self.shared.graph.read().get_node_timeline(key).to_vec()
	}

	/// Counts of the recorded revisions carrying the flag, per flag value.
	#[must_use]
	pub fn flag_stats(&self, flag: FlagName, selector: Option<&KeySelector>) -> FlagStats {
		self.shared.graph.read().get_flag_stats(flag, selector)
	}

	/// Human-readable dump of the current graph.
	#[must_use]
	pub fn dump_graph(&self) -> String {
		self.shared.graph.read().dump()
	}

	/// Stops the worker and the background tasks. Transactions still in the queue are
	/// dropped, their callers get [`Error::ClosedScheduler`].
	pub async fn shutdown(&self) {
		info!("Stopping KV scheduler");
		self.shared.shutdown.cancel();
		self.shared.txn_tx.close();
		self.shared.tasks.close();
		self.shared.tasks.wait().await;

		let worker = self
			.worker
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(worker) = worker {
			match tokio::task::spawn_blocking(move || worker.join()).await {
				Ok(Ok(())) => debug!("Transaction worker joined"),
				Ok(Err(_)) => error!("Transaction worker panicked"),
				Err(e) => error!(?e, "Failed to join transaction worker"),
			}
		}
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		self.shared.shutdown.cancel();
		self.shared.txn_tx.close();
	}
}

/// Periodically removes old records from the transaction history and the graph timeline.
async fn trim_history(shared: Arc<Shared>) {
	let period = shared.config.trimming_period();
	let age_limit = shared.config.history_age_limit();
	let permanent_until = shared.history.start_time() + shared.config.permanent_init_period();

	loop {
		tokio::select! {
			() = shared.shutdown.cancelled() => break,
			() = tokio::time::sleep(period) => {
				let older_than = Utc::now() - age_limit;
				let removed = shared.history.trim(older_than, permanent_until);
				shared.graph.trim_timeline(older_than, permanent_until);
				if removed > 0 {
					debug!(removed, "Trimmed transaction history");
				}
			}
		}
	}
}

/// Northbound transaction under construction.
pub struct Txn<'s> {
	scheduler: &'s Scheduler,
	values: BTreeMap<String, Option<Value>>,
}

impl Txn<'_> {
	/// Requests the value to be configured. Setting the same key again replaces the value.
	pub fn set_value(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
		self.values.insert(key.into(), Some(value));
		self
	}

	/// Requests the value to be removed.
	pub fn delete_value(&mut self, key: impl Into<String>) -> &mut Self {
		self.values.insert(key.into(), None);
		self
	}

	/// Submits the transaction.
	///
	/// A blocking commit waits until the transaction is processed and returns its sequence
	/// number. A non-blocking one returns `None` once it is queued.
	pub async fn commit(self, options: CommitOptions) -> Result<Option<u64>, TransactionError> {
		let CommitOptions {
			resync,
			verbose_resync,
			revert_on_failure,
			retry,
			description,
			non_blocking,
			cancel,
		} = options;

		if resync == ResyncType::Downstream && !self.values.is_empty() {
			return Err(Error::CombinedDownstreamResyncWithChange.into());
		}
		if revert_on_failure && resync != ResyncType::NotResync {
			return Err(Error::RevertNotSupportedWithResync.into());
		}

		let (result_tx, result_rx) = if non_blocking {
			(None, None)
		} else {
			let (tx, rx) = oneshot::channel();
			(Some(tx), Some(rx))
		};

		let txn = Transaction {
			seq_num: 0,
			kind: TxnKind::Nb(NbTxn {
				resync_type: resync,
				verbose_refresh: verbose_resync,
				revert_on_failure,
				retry,
				description,
				result_tx,
			}),
			values: self
				.values
				.into_iter()
				.map(|(key, value)| KvForTxn::new(key, value, ValueOrigin::FromNb))
				.collect(),
		};

		let shared = &self.scheduler.shared;
		let Some(result_rx) = result_rx else {
			shared.try_enqueue(txn)?;
			return Ok(None);
		};

		shared.enqueue(txn, cancel.as_ref()).await?;

		tokio::select! {
			() = shared.shutdown.cancelled() => Err(Error::ClosedScheduler.into()),
			() = queue::cancelled(cancel.as_ref()) => Err(Error::TxnWaitCanceled.into()),
			result = result_rx => match result {
				Ok(Ok(seq_num)) => Ok(Some(seq_num)),
				Ok(Err(e)) => Err(e),
				Err(_) => Err(Error::ClosedScheduler.into()),
			},
		}
	}
}
