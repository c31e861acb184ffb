//! Processing of queued transactions: preprocessing, planning, execution, recording and
//! postprocessing.

use std::{
	collections::{BTreeMap, BTreeSet},
	mem,
	sync::Arc,
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
	descriptor::DescriptorHandler,
	error::{KeyWithError, TransactionError, VerificationError, VerificationErrorKind},
	graph::ReadAccess,
	node_utils::{
		base_value_status, is_node_available, nb_base_values_selectors, node_base_key,
		node_last_applied_value, node_last_operation, node_last_update, node_origin, node_state,
		sb_base_values_selectors,
	},
	options::ResyncType,
	ordering::order_values_by_op,
	queue,
	record::{RecordedKvPair, RecordedTxn, RecordedTxnOp},
	refresh::ResyncData,
	scheduler::Shared,
	txn::{KvForTxn, RetryTxn, RetryTxnMeta, Transaction, TxnKind, TxnType},
	value::{ValueOrigin, ValueState},
};

/// Single consumer of the transaction queue. All the graph mutations happen here.
pub(crate) struct TxnProcessor {
	pub(crate) shared: Arc<Shared>,
	/// Base values whose state changed during the current transaction.
	pub(crate) updated_states: BTreeSet<String>,
	txn_seq_num: u64,
	resync_count: u64,
}

impl TxnProcessor {
	pub(crate) fn new(shared: Arc<Shared>) -> Self {
		Self {
			shared,
			updated_states: BTreeSet::new(),
			txn_seq_num: 0,
			resync_count: 0,
		}
	}

	/// Consumes the queue until the scheduler is closed.
	pub(crate) fn run(mut self, rx: &chan::Receiver<Transaction>) {
		while let Ok(txn) = rx.recv_blocking() {
			if self.shared.shutdown.is_cancelled() {
				break;
			}

			let shared = Arc::clone(&self.shared);
			let _txn_guard = shared.txn_lock.blocking_lock();
			self.process_transaction(txn);
		}
		debug!("Transaction processing stopped");
	}

	#[instrument(skip_all, fields(seq_num = self.txn_seq_num, txn_type = %txn.txn_type()))]
	fn process_transaction(&mut self, mut txn: Transaction) {
		let start = Utc::now();

		let skip_exec = self.preprocess_transaction(&mut txn);
		let mut planned = Vec::new();
		if skip_exec {
			debug!("Nothing to execute");
		} else {
			let values = mem::take(&mut txn.values);
			let graph_r = self.shared.graph.read();
			txn.values = order_values_by_op(values, &graph_r, &self.shared.registry);
			graph_r.release();

			planned = self.execute_transaction(&txn, true);
		}

		let record = self.pre_record_transaction(&txn, planned, start);

		let executed = if skip_exec {
			Vec::new()
		} else {
			self.execute_transaction(&txn, false)
		};
		let stop = Utc::now();

		self.record_transaction(record, &executed, start, stop);
		self.postprocess_transaction(txn, &executed);
	}

	/// Assigns the sequence number and fills in the values to apply. Returns `true` when
	/// there is nothing to execute.
	fn preprocess_transaction(&mut self, txn: &mut Transaction) -> bool {
		txn.seq_num = self.txn_seq_num;
		self.txn_seq_num += 1;

		match txn.txn_type() {
			TxnType::SbNotification => self.preprocess_notification(txn),
			TxnType::NbTransaction => self.preprocess_nb_transaction(txn),
			TxnType::RetryFailedOps => self.preprocess_retry_txn(txn),
		}
	}

	fn preprocess_notification(&self, txn: &Transaction) -> bool {
		let graph_r = self.shared.graph.read();
		txn.values
			.first()
			.map_or(true, |kv| self.filter_notification(&graph_r, &kv.key, txn.seq_num))
	}

	/// Notifications for keys without a descriptor, or for values owned by the northbound,
	/// are ignored.
	fn filter_notification(&self, graph: &impl ReadAccess, key: &str, seq_num: u64) -> bool {
		if self.shared.registry.get_for_key(key).is_none() {
			debug!(seq_num, %key, "Ignoring unimplemented notification");
			return true;
		}
		if node_origin(graph.get_node(key)) == ValueOrigin::FromNb {
			debug!(seq_num, %key, "Ignoring notification for a NB-managed value");
			return true;
		}
		false
	}

	fn preprocess_nb_transaction(&mut self, txn: &mut Transaction) -> bool {
		let Some(nb) = txn.nb() else {
			return false;
		};
		let (resync_type, verbose) = (nb.resync_type, nb.verbose_refresh);
		if resync_type == ResyncType::NotResync {
			return false;
		}

		let shared = Arc::clone(&self.shared);
		let mut graph_w = shared.graph.write(false);
		self.resync_count += 1;

		if resync_type == ResyncType::Downstream {
			// re-apply everything the northbound asked for so far
			for node in graph_w.get_nodes(None, &nb_base_values_selectors()) {
				let Some(update) = node_last_update(Some(node)) else {
					continue;
				};
				txn.values.push(KvForTxn {
					is_revert: update.revert,
					..KvForTxn::new(node.key().to_string(), update.value.clone(), ValueOrigin::FromNb)
				});
			}
		}

		let nb_keys = txn
			.values
			.iter()
			.map(|kv| kv.key.clone())
			.collect::<BTreeSet<_>>();

		if resync_type != ResyncType::Upstream {
			let resync_data = ResyncData {
				first: self.resync_count == 1,
				values: &txn.values,
			};
			self.refresh_graph(&mut graph_w, None, Some(&resync_data), verbose);
		}

		let mut extra = Vec::new();
		for node in graph_w.get_nodes(None, &nb_base_values_selectors()) {
			if !nb_keys.contains(node.key()) {
				extra.push(KvForTxn::new(node.key().to_string(), None, ValueOrigin::FromNb));
			}
		}
		for node in graph_w.get_nodes(None, &sb_base_values_selectors()) {
			if !nb_keys.contains(node.key()) {
				extra.push(KvForTxn::new(
					node.key().to_string(),
					node.value().cloned(),
					ValueOrigin::FromSb,
				));
			}
		}
		txn.values.extend(extra);

		graph_w.save();
		txn.values.is_empty()
	}

	/// Retries only values which were not updated since the retry was scheduled.
	fn preprocess_retry_txn(&self, txn: &mut Transaction) -> bool {
		let Some(retry) = txn.retry() else {
			return true;
		};

		let graph_r = self.shared.graph.read();
		let values = retry
			.keys
			.iter()
			.filter_map(|(key, revision)| {
				let update = node_last_update(graph_r.get_node(key))?;
				if update.txn_seq_num > *revision {
					trace!(%key, "Value was updated since the retry was scheduled");
					return None;
				}
				Some(KvForTxn {
					is_revert: update.revert,
					..KvForTxn::new(key.clone(), update.value.clone(), ValueOrigin::FromNb)
				})
			})
			.collect::<Vec<_>>();
		graph_r.release();

		txn.values = values;
		txn.values.is_empty()
	}

	fn pre_record_transaction(
		&self,
		txn: &Transaction,
		planned: Vec<RecordedTxnOp>,
		start: DateTime<Utc>,
	) -> RecordedTxn {
		let resync_type = txn.resync_type();

		// values of a downstream resync are not worth listing
		let mut values = if resync_type == ResyncType::Downstream {
			Vec::new()
		} else {
			txn.values
				.iter()
				.map(|kv| RecordedKvPair {
					key: kv.key.clone(),
					value: kv.value.clone(),
					origin: kv.origin,
				})
				.collect::<Vec<_>>()
		};
		values.sort_by(|a, b| a.key.cmp(&b.key));

		let record = RecordedTxn {
			pre_record: true,
			start,
			stop: start,
			seq_num: txn.seq_num,
			txn_type: txn.txn_type(),
			resync_type,
			description: txn.nb().map(|nb| nb.description.clone()).unwrap_or_default(),
			retry_for_txn: txn.retry().map(|retry| retry.meta.txn_seq_num),
			retry_attempt: txn.retry().map_or(0, |retry| retry.meta.attempt),
			values,
			planned,
			executed: Vec::new(),
		};

		info!(
			seq_num = record.seq_num,
			txn_type = %record.type_info(),
			"Processing transaction\n{}",
			record.to_string_with_opts(false, 2)
		);

		record
	}

	fn record_transaction(
		&self,
		mut record: RecordedTxn,
		executed: &[RecordedTxnOp],
		start: DateTime<Utc>,
		stop: DateTime<Utc>,
	) {
		record.pre_record = false;
		record.start = start;
		record.stop = stop;
		record.executed = executed.to_vec();

		info!(
			seq_num = record.seq_num,
			duration_ms = (stop - start).num_milliseconds(),
			"Transaction executed\n{}",
			record.to_string_with_opts(true, 2)
		);

		if self.shared.config.record_transaction_history {
			self.shared.history.push(record);
		}
	}

	fn postprocess_transaction(&mut self, mut txn: Transaction, executed: &[RecordedTxnOp]) {
		let shared = Arc::clone(&self.shared);
		let verify_mode = shared.config.verify_mode;

		// refresh base values which failed, or all of them in the verify mode
		let mut to_refresh = BTreeSet::new();
		let mut to_retry = BTreeSet::new();
		let mut verbose_refresh = false;
		{
			let graph_r = shared.graph.read();
			for op in executed {
				let Some(node) = graph_r.get_node(&op.key) else {
					continue;
				};
				let state = node_state(Some(node));
				if state == ValueState::Unimplemented {
					continue;
				}
				let base_key = node_base_key(node);
				if state.is_failure() {
					to_refresh.insert(base_key.clone());
					verbose_refresh = true;
				}
				if state == ValueState::Retrying {
					to_retry.insert(base_key.clone());
				}
				if verify_mode {
					to_refresh.insert(base_key);
				}
			}
		}

		if !to_refresh.is_empty() {
			let mut graph_w = shared.graph.write(false);
			self.refresh_graph(&mut graph_w, Some(&to_refresh), None, verbose_refresh);
			graph_w.save();

			let retries = self.plan_retries(&graph_w, &txn, &to_retry);
			graph_w.release();
			for retry in retries {
				queue::enqueue_retry(&shared, retry);
			}
		}

		// collect status updates
		let mut removed = Vec::new();
		let state_updates = {
			let graph_r = shared.graph.read();
			mem::take(&mut self.updated_states)
				.into_iter()
				.map(|key| {
					let status = base_value_status(&graph_r, &key);
					if status.value.state == ValueState::Removed {
						removed.push(key);
					}
					status
				})
				.collect::<Vec<_>>()
		};

		let mut kv_errors = if verify_mode {
			self.verify_executed(executed)
		} else {
			Vec::new()
		};
		kv_errors.extend(executed.iter().filter_map(|op| {
			op.new_error.clone().map(|error| KeyWithError {
				key: op.key.clone(),
				operation: op.operation,
				error,
			})
		}));

		self.deliver_result(&mut txn, &kv_errors);

		for kv_error in &kv_errors {
			shared.subscribers.notify_error(kv_error);
		}
		for status in &state_updates {
			shared.subscribers.notify_status(status);
		}

		if !removed.is_empty() {
			let mut graph_w = shared.graph.write(false);
			for key in &removed {
				graph_w.delete_node(key);
			}
			graph_w.save();
		}
	}

	/// Groups values to retry by the original transaction, the delay and the attempt.
	fn plan_retries(
		&self,
		graph: &impl ReadAccess,
		txn: &Transaction,
		to_retry: &BTreeSet<String>,
	) -> Vec<RetryTxn> {
		let mut retries = BTreeMap::<RetryTxnMeta, RetryTxn>::new();

		for key in to_retry {
			let Some(update) = node_last_update(graph.get_node(key)) else {
				continue;
			};
			let Some(retry_opts) = update.retry else {
				continue;
			};

			let prev_retry = txn.retry().filter(|retry| retry.keys.contains_key(key));
			let meta = match prev_retry {
				Some(prev_retry) => RetryTxnMeta {
					txn_seq_num: prev_retry.meta.txn_seq_num,
					delay: if retry_opts.exp_backoff {
						prev_retry.meta.delay * 2
					} else {
						retry_opts.period
					},
					attempt: prev_retry.meta.attempt + 1,
				},
				None => RetryTxnMeta {
					txn_seq_num: txn.seq_num,
					delay: retry_opts.period,
					attempt: 1,
				},
			};

			retries
				.entry(meta)
				.or_insert_with(|| RetryTxn {
					meta,
					keys: BTreeMap::new(),
				})
				.keys
				.insert(key.clone(), update.txn_seq_num);
		}

		retries.into_values().collect()
	}

	/// Compares what was applied with what the refresh found in the southbound.
	fn verify_executed(&self, executed: &[RecordedTxnOp]) -> Vec<KeyWithError> {
		let graph_r = self.shared.graph.read();
		let mut kv_errors = Vec::new();

		for op in executed {
			let key = &op.key;
			let Some(node) = graph_r.get_node(key) else {
				continue;
			};
			let state = node_state(Some(node));
			if state.is_failure() {
				// not expected to be in sync
				continue;
			}

			let expected = node_last_applied_value(Some(node));
			let expect_absent = expected.is_none() || matches!(state, ValueState::Pending | ValueState::Invalid);
			let available = is_node_available(Some(node));

			let kind = if expect_absent && available {
				Some(VerificationErrorKind::ExpectedToNotExist)
			} else if expected.is_none() {
				None
			} else if !expect_absent && !available {
				Some(VerificationErrorKind::ExpectedToExist)
			} else {
				let handler = DescriptorHandler::new(self.shared.registry.get_for_key(key));
				if handler.equivalent(key, node.value(), expected) {
					None
				} else {
					warn!(
						%key,
						applied = ?expected,
						retrieved = ?node.value(),
						"Verification failed, values are not equivalent"
					);
					Some(VerificationErrorKind::NotEquivalent)
				}
			};

			if let Some(kind) = kind {
				kv_errors.push(KeyWithError {
					key: key.clone(),
					operation: node_last_operation(Some(node)),
					error: VerificationError {
						key: key.clone(),
						kind,
					}
					.into(),
				});
			}
		}

		kv_errors
	}

	/// Sends the result to the waiting caller, asynchronous transactions only get logged.
	fn deliver_result(&self, txn: &mut Transaction, kv_errors: &[KeyWithError]) {
		let seq_num = txn.seq_num;
		let hide_retrying = txn
			.nb()
			.and_then(|nb| nb.retry)
			.is_some_and(|retry| !retry.immediate_fail);
		let result_tx = match &mut txn.kind {
			TxnKind::Nb(nb) => nb.result_tx.take(),
			_ => None,
		};

		let Some(result_tx) = result_tx else {
			if kv_errors.is_empty() {
				debug!(seq_num, "Transaction succeeded");
			} else {
				let error = TransactionError {
					seq_num: Some(seq_num),
					init_error: None,
					kv_errors: kv_errors.to_vec(),
				};
				error!(seq_num, %error, "Transaction failed");
			}
			return;
		};

		let kv_errors = if hide_retrying {
			let graph_r = self.shared.graph.read();
			kv_errors
				.iter()
				.filter(|kv_error| node_state(graph_r.get_node(&kv_error.key)) != ValueState::Retrying)
				.cloned()
				.collect::<Vec<_>>()
		} else {
			kv_errors.to_vec()
		};

		let result = if kv_errors.is_empty() {
			Ok(seq_num)
		} else {
			Err(TransactionError {
				seq_num: Some(seq_num),
				init_error: None,
				kv_errors,
			})
		};
		if result_tx.send(result).is_err() {
			warn!(seq_num, "Caller stopped waiting for the transaction result");
		}
	}
}
