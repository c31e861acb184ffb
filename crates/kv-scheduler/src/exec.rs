//! Execution of transactions over the graph.
//!
//! Every value is applied by a recursive walk: an applied value triggers updates of the values
//! depending on it and (re-)applies the values derived from it. Values already on the current
//! branch of the walk are skipped, which breaks dependency cycles.

use std::{
	collections::{BTreeSet, HashSet},
	sync::Arc,
};

use tracing::{trace, warn};

use crate::{
	descriptor::DescriptorHandler,
	error::OperationError,
	graph::{ErrorFlag, Flag, FlagName, LastUpdate, Node, ReadAccess, Relation, WriteHandle},
	node_utils::{
		construct_targets, derived_keys, is_node_available, is_node_derived, is_node_ready, node_base_key,
		node_error, node_last_update, node_origin, node_state, value_status,
	},
	options::ResyncType,
	process::TxnProcessor,
	record::RecordedTxnOp,
	txn::{KvForTxn, Transaction},
	value::{KeyValuePair, TxnOperation, Value, ValueOrigin, ValueState},
};

/// Limit for the length of a chain of dependent updates and derived values.
pub(crate) const MAX_CASCADE_DEPTH: usize = 1024;

struct ApplyArgs<'t> {
	txn: &'t Transaction,
	kv: KvForTxn,
	base_key: String,
	is_retry: bool,
	dry_run: bool,
	is_update: bool,
	is_derived: bool,
}

impl<'t> ApplyArgs<'t> {
	fn base(txn: &'t Transaction, kv: KvForTxn, is_retry: bool, dry_run: bool) -> Self {
		Self {
			txn,
			base_key: kv.key.clone(),
			kv,
			is_retry,
			dry_run,
			is_update: false,
			is_derived: false,
		}
	}

	fn derived(&self, kv: KvForTxn) -> Self {
		Self {
			txn: self.txn,
			kv,
			base_key: self.base_key.clone(),
			is_retry: self.is_retry,
			dry_run: self.dry_run,
			is_update: false,
			is_derived: true,
		}
	}

	fn update(&self, kv: KvForTxn, base_key: String, is_derived: bool) -> Self {
		Self {
			txn: self.txn,
			kv,
			base_key,
			is_retry: self.is_retry,
			dry_run: self.dry_run,
			is_update: true,
			is_derived,
		}
	}

	/// Value to apply as part of this one, inheriting origin and the revert mark.
	fn related_kv(&self, key: String, value: Option<Value>) -> KvForTxn {
		KvForTxn {
			is_revert: self.kv.is_revert,
			..KvForTxn::new(key, value, self.kv.origin)
		}
	}
}

#[derive(Default)]
struct Applied {
	executed: Vec<RecordedTxnOp>,
	prev_value: Option<Value>,
	error: Option<OperationError>,
}

type Executed = (Vec<RecordedTxnOp>, Option<OperationError>);

/// Traces entering and leaving one step of the graph walk.
struct WalkStep {
	step: &'static str,
	key: String,
	depth: usize,
}

impl WalkStep {
	fn begin(enabled: bool, step: &'static str, args: &ApplyArgs<'_>, depth: usize) -> Option<Self> {
		enabled.then(|| {
			trace!(
				depth,
				key = %args.kv.key,
				is_update = args.is_update,
				is_derived = args.is_derived,
				"[BEGIN] {step}"
			);
			Self {
				step,
				key: args.kv.key.clone(),
				depth,
			}
		})
	}
}

impl Drop for WalkStep {
	fn drop(&mut self) {
		trace!(depth = self.depth, key = %self.key, "[END] {}", self.step);
	}
}

fn save(graph_w: &mut WriteHandle<'_>, args: &ApplyArgs<'_>) {
	if !args.dry_run {
		graph_w.save();
	}
}

fn node_ready(graph: &impl ReadAccess, key: &str) -> bool {
	graph.get_node(key).is_some_and(|node| is_node_ready(graph, node))
}

/// Operation needed to bring a dependent value in line with the state of its dependencies.
fn determine_update_operation(graph: &impl ReadAccess, node: &Node) -> TxnOperation {
	match (is_node_available(Some(node)), is_node_ready(graph, node)) {
		(false, true) => TxnOperation::Add,
		(true, false) => TxnOperation::Delete,
		_ => TxnOperation::Undefined,
	}
}

fn valid_derived_kv(graph: &impl ReadAccess, kv: &KvForTxn, txn_seq_num: u64) -> bool {
	if kv.value.is_none() {
		warn!(txn_seq_num, key = %kv.key, "Derived nil value");
		return false;
	}
	if graph
		.get_node(&kv.key)
		.is_some_and(|node| !is_node_derived(node))
	{
		warn!(txn_seq_num, key = %kv.key, "Skipping derived value colliding with a base value");
		return false;
	}
	true
}

/// Removes uninteresting intermediate operations: a pending Add followed by another Add of the
/// same value, and a Delete of a pending value preceded by another Delete of the same value.
pub(crate) fn compress_txn_ops(mut executed: Vec<RecordedTxnOp>) -> Vec<RecordedTxnOp> {
	let mut keep = vec![true; executed.len()];
	for idx in 0..executed.len() {
		if executed[idx].operation != TxnOperation::Add || executed[idx].new_state != ValueState::Pending {
			continue;
		}
		let Some(next) = (idx + 1..executed.len()).find(|&next| executed[next].key == executed[idx].key) else {
			continue;
		};
		if executed[next].operation == TxnOperation::Add {
			let prev_value = executed[idx].prev_value.take();
			let prev_error = executed[idx].prev_error.take();
			let prev_state = executed[idx].prev_state;
			let later = &mut executed[next];
			later.prev_value = prev_value;
			later.prev_error = prev_error;
			later.prev_state = prev_state;
			keep[idx] = false;
		}
	}
	let mut compressed = executed
		.into_iter()
		.zip(keep)
		.filter_map(|(op, keep)| keep.then_some(op))
		.collect::<Vec<_>>();

	let mut keep = vec![true; compressed.len()];
	for idx in (0..compressed.len()).rev() {
		if compressed[idx].operation != TxnOperation::Delete || compressed[idx].prev_state != ValueState::Pending {
			continue;
		}
		let Some(prev) = (0..idx).rev().find(|&prev| compressed[prev].key == compressed[idx].key) else {
			continue;
		};
		if compressed[prev].operation == TxnOperation::Delete {
			let new_value = compressed[idx].new_value.take();
			let new_error = compressed[idx].new_error.take();
			let new_state = compressed[idx].new_state;
			let earlier = &mut compressed[prev];
			earlier.new_value = new_value;
			earlier.new_error = new_error;
			earlier.new_state = new_state;
			keep[idx] = false;
		}
	}

	compressed
		.into_iter()
		.zip(keep)
		.filter_map(|(op, keep)| keep.then_some(op))
		.collect()
}

impl TxnProcessor {
	/// Applies values of the transaction in the given order and returns the executed
	/// operations. A dry run only simulates the transaction: no descriptor is called and the
	/// graph is left untouched.
	pub(crate) fn execute_transaction(&mut self, txn: &Transaction, dry_run: bool) -> Vec<RecordedTxnOp> {
		let shared = Arc::clone(&self.shared);
		let log_walk = shared.config.log_graph_walk;
		if log_walk {
			trace!(seq_num = txn.seq_num, dry_run, "[BEGIN] execute transaction");
		}

		let downstream_resync = txn.resync_type() == ResyncType::Downstream;
		let mut graph_w = shared.graph.write(!downstream_resync);
		let mut branch = HashSet::new();
		let is_retry = txn.retry().is_some();

		let mut executed = Vec::new();
		let mut prev_values = Vec::with_capacity(txn.values.len());
		let mut revert = false;

		for kv in &txn.values {
			let args = ApplyArgs::base(txn, kv.clone(), is_retry, dry_run);
			let applied = self.apply_value(&mut graph_w, &args, &mut branch);
			executed.extend(applied.executed);
			prev_values.push(KeyValuePair {
				key: kv.key.clone(),
				value: applied.prev_value,
			});

			if applied.error.is_some() && txn.revert_on_failure() {
				if !dry_run {
					let failed = BTreeSet::from([kv.key.clone()]);
					self.refresh_graph(&mut graph_w, Some(&failed), None, false);
					graph_w.save();
				}
				revert = true;
				break;
			}
		}

		if revert {
			// the state in-between the failure and the revert gets recorded
			graph_w.release();
			graph_w = shared.graph.write(true);

			for prev in prev_values {
				let kv = KvForTxn {
					is_revert: true,
					..KvForTxn::new(prev.key, prev.value, ValueOrigin::FromNb)
				};
				let args = ApplyArgs::base(txn, kv, false, dry_run);
				executed.extend(self.apply_value(&mut graph_w, &args, &mut branch).executed);
			}
		}

		graph_w.release();
		if log_walk {
			trace!(seq_num = txn.seq_num, dry_run, "[END] execute transaction");
		}

		compress_txn_ops(executed)
	}

	fn handler_for(&self, key: &str) -> DescriptorHandler {
		DescriptorHandler::new(self.shared.registry.get_for_key(key))
	}

	fn walk_step(&self, step: &'static str, args: &ApplyArgs<'_>, depth: usize) -> Option<WalkStep> {
		WalkStep::begin(self.shared.config.log_graph_walk, step, args, depth)
	}

	fn apply_value(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> Applied {
		let _step = self.walk_step("apply_value", args, branch.len());
		let key = args.kv.key.as_str();

		if branch.contains(key) {
			return Applied::default();
		}
		if branch.len() >= MAX_CASCADE_DEPTH {
			warn!(%key, limit = MAX_CASCADE_DEPTH, "Cascade of updates is too deep, giving up");
			return Applied {
				error: Some(OperationError::CascadeTooDeep {
					key: key.to_string(),
					limit: MAX_CASCADE_DEPTH,
				}),
				..Default::default()
			};
		}

		branch.insert(key.to_string());
		let applied = self.apply_value_in_branch(graph_w, args, branch);
		branch.remove(key);
		applied
	}

	fn apply_value_in_branch(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> Applied {
		let key = args.kv.key.as_str();
		if graph_w.get_node(key).is_none() {
			graph_w.set_node(key);
		}

		let node = graph_w.get_node(key);
		let prev_value = node.and_then(Node::value).cloned();
		let prev_status = value_status(&*graph_w, node, key);
		let prev_update = node_last_update(node).cloned();
		let mut txn_op = self.pre_record_txn_op(args, node);

		let operation = match node {
			Some(node) if args.is_update => determine_update_operation(&*graph_w, node),
			_ if args.kv.value.is_none() => TxnOperation::Delete,
			Some(node) if node.value().is_some() && is_node_available(Some(node)) => TxnOperation::Modify,
			_ => TxnOperation::Add,
		};
		if operation == TxnOperation::Undefined {
			return Applied {
				prev_value,
				..Default::default()
			};
		}
		txn_op.operation = operation;

		let retry = match args.txn.nb() {
			Some(nb) => nb.retry,
			// inherited from the last northbound transaction of the value
			None => prev_update.as_ref().and_then(|update| update.retry),
		};
		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().set(Flag::LastUpdate(LastUpdate {
				txn_seq_num: args.txn.seq_num,
				txn_op: operation,
				value: args.kv.value.clone(),
				revert: args.kv.is_revert,
				retry,
			}));
		}

		// a value broken by this transaction is left for the refresh, unless reverted
		if prev_status.state.is_failure()
			&& !args.kv.is_revert
			&& prev_update
				.as_ref()
				.is_some_and(|update| update.txn_seq_num == args.txn.seq_num)
		{
			return Applied {
				prev_value,
				error: node_error(graph_w.get_node(key)).map(|(error, _)| error.clone()),
				..Default::default()
			};
		}

		let (executed, error) = match operation {
			TxnOperation::Delete => self.apply_delete(graph_w, txn_op, args, args.is_update, branch),
			TxnOperation::Add => self.apply_add(graph_w, txn_op, args, branch),
			TxnOperation::Modify => self.apply_modify(graph_w, txn_op, args, branch),
			TxnOperation::Undefined => (Vec::new(), None),
		};

		if !args.dry_run {
			let status = value_status(&*graph_w, graph_w.get_node(key), key);
			if prev_update.is_none() || status != prev_status {
				self.updated_states.insert(args.base_key.clone());
			}
		}

		Applied {
			executed,
			prev_value,
			error,
		}
	}

	fn apply_delete(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		mut txn_op: RecordedTxnOp,
		args: &ApplyArgs<'_>,
		pending: bool,
		branch: &mut HashSet<String>,
	) -> Executed {
		let _step = self.walk_step("apply_delete", args, branch.len());
		let key = args.kv.key.as_str();
		let mut executed = Vec::new();

		let Some(node) = graph_w.get_node(key) else {
			return (executed, None);
		};
		if node.value().is_none() {
			// removing a value which never existed, not even recorded
			graph_w.delete_node(key);
			save(graph_w, args);
			return (executed, None);
		}

		let available = is_node_available(Some(node));
		let derived = derived_keys(node);
		let mut error = None;
		let mut retriable = false;

		if available {
			// dependents must not see the value as satisfied during the removal
			if let Some(node) = graph_w.node_mut(key) {
				node.flags_mut().set(Flag::Unavailable);
			}

			if !args.is_derived {
				let derived = derived
					.into_iter()
					.map(|derived_key| args.related_kv(derived_key, None))
					.collect();
				let (ops, derived_error) = self.apply_derived(graph_w, derived, args, false, branch);
				executed.extend(ops);
				error = derived_error;
			}

			if error.is_none() {
				executed.extend(self.run_updates(graph_w, key, args, branch));

				let handler = self.handler_for(key);
				if !args.dry_run && handler.descriptor().is_some() {
					if args.kv.origin != ValueOrigin::FromSb {
						let result = graph_w.get_node(key).and_then(|node| {
							node.value()
								.map(|value| handler.delete(key, value, node.metadata()))
						});
						if let Some(Err(delete_error)) = result {
							retriable = handler.is_retriable_failure(&delete_error);
							error = Some(delete_error);
						}
					}
					if !args.is_derived && handler.with_metadata() {
						if let Some(node) = graph_w.node_mut(key) {
							node.set_metadata(None);
						}
					}
				}
			}
		} else {
			// pending value, only the state changes
			txn_op.noop = true;
		}

		let depth = branch.len();
		match &error {
			None => {
				if let Some(node) = graph_w.node_mut(key) {
					node.flags_mut().remove(FlagName::Error);
				}
				if pending {
					txn_op.new_state = ValueState::Pending;
					self.update_node_state(graph_w, key, ValueState::Pending, depth);
				} else {
					txn_op.new_state = ValueState::Removed;
					if args.is_derived {
						graph_w.delete_node(key);
					} else {
						self.update_node_state(graph_w, key, ValueState::Removed, depth);
					}
				}
			}
			Some(error) => {
				txn_op.new_error = Some(error.clone());
				txn_op.new_state = self.mark_failed_value(graph_w, key, args, error.clone(), retriable, depth);
			}
		}

		executed.push(txn_op);
		save(graph_w, args);
		(executed, error)
	}

	fn apply_add(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		mut txn_op: RecordedTxnOp,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> Executed {
		let _step = self.walk_step("apply_add", args, branch.len());
		let key = args.kv.key.as_str();
		let depth = branch.len();
		let mut executed = Vec::new();
		let Some(value) = args.kv.value.as_ref() else {
			return (executed, None);
		};

		let handler = self.handler_for(key);
		let node = graph_w.set_node(key);
		node.set_value(Some(value.clone()));
		if let Some(name) = handler.name() {
			node.flags_mut().set(Flag::Descriptor(name.to_string()));
			node.set_label(handler.key_label(key));
		}

		let unimplemented =
			args.kv.origin == ValueOrigin::FromNb && !args.is_derived && handler.descriptor().is_none();
		if unimplemented {
			if node_state(Some(&*node)) == ValueState::Unimplemented {
				save(graph_w, args);
				return (executed, None);
			}
			node.flags_mut().set(Flag::Unavailable);
			node.flags_mut().remove(FlagName::Error);
			txn_op.noop = true;
			txn_op.new_state = ValueState::Unimplemented;
			self.update_node_state(graph_w, key, ValueState::Unimplemented, depth);
			save(graph_w, args);
			return (vec![txn_op], None);
		}

		if args.is_derived {
			node.flags_mut().set(Flag::Derived(args.base_key.clone()));
		}

		if !args.dry_run && args.kv.origin == ValueOrigin::FromNb {
			if let Err(error) = handler.validate(key, value) {
				return self.mark_invalid_value(graph_w, txn_op, args, error, depth);
			}
		}

		let (derives, ops, error) = self.apply_new_relations(graph_w, &handler, args, branch);
		executed.extend(ops);
		if error.is_some() {
			save(graph_w, args);
			return (executed, error);
		}

		if !node_ready(&*graph_w, key) {
			if let Some(node) = graph_w.node_mut(key) {
				node.flags_mut().set(Flag::Unavailable);
				node.flags_mut().remove(FlagName::Error);
			}
			txn_op.new_state = ValueState::Pending;
			txn_op.noop = true;
			self.update_node_state(graph_w, key, ValueState::Pending, depth);
			executed.push(txn_op);
			save(graph_w, args);
			return (executed, None);
		}

		if !args.dry_run && handler.descriptor().is_some() {
			let result = if args.kv.origin == ValueOrigin::FromSb {
				// already present in the southbound
				Ok(args.kv.metadata.clone())
			} else {
				handler.add(key, value)
			};

			match result {
				Err(error) => {
					if let Some(node) = graph_w.node_mut(key) {
						node.flags_mut().set(Flag::Unavailable);
					}
					let retriable = handler.is_retriable_failure(&error);
					txn_op.new_error = Some(error.clone());
					txn_op.new_state = self.mark_failed_value(graph_w, key, args, error.clone(), retriable, depth);
					executed.push(txn_op);
					save(graph_w, args);
					return (executed, Some(error));
				}
				Ok(metadata) if !args.is_derived && handler.with_metadata() => {
					if let (Some(name), Some(node)) = (handler.name(), graph_w.node_mut(key)) {
						node.set_metadata_map(name);
						node.set_metadata(metadata);
					}
				}
				Ok(_) => {}
			}
		}

		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().remove(FlagName::Error);
			node.flags_mut().remove(FlagName::Unavailable);
		}
		let new_state = if args.kv.origin == ValueOrigin::FromSb {
			ValueState::Retrieved
		} else {
			ValueState::Configured
		};
		txn_op.new_state = new_state;
		self.update_node_state(graph_w, key, new_state, depth);
		executed.push(txn_op);
		save(graph_w, args);

		executed.extend(self.run_updates(graph_w, key, args, branch));

		let mut error = None;
		if !args.is_derived {
			let derived = derives
				.into_iter()
				.map(|kv| args.related_kv(kv.key, kv.value))
				.collect();
			let (ops, derived_error) = self.apply_derived(graph_w, derived, args, true, branch);
			executed.extend(ops);
			error = derived_error;
		}

		save(graph_w, args);
		(executed, error)
	}

	fn apply_modify(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		mut txn_op: RecordedTxnOp,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> Executed {
		let _step = self.walk_step("apply_modify", args, branch.len());
		let key = args.kv.key.as_str();
		let depth = branch.len();
		let mut executed = Vec::new();
		let Some(new_value) = args.kv.value.as_ref() else {
			return (executed, None);
		};
		let Some(node) = graph_w.node_mut(key) else {
			return (executed, None);
		};
		let prev_value = node.value().cloned();
		node.set_value(Some(new_value.clone()));

		let handler = self.handler_for(key);
		if !args.dry_run && args.kv.origin == ValueOrigin::FromNb {
			if let Err(error) = handler.validate(key, new_value) {
				return self.mark_invalid_value(graph_w, txn_op, args, error, depth);
			}
		}

		let equivalent = handler.equivalent(key, prev_value.as_ref(), Some(new_value));
		let recreate = !equivalent
			&& args.kv.origin != ValueOrigin::FromSb
			&& prev_value.as_ref().is_some_and(|old_value| {
				handler.modify_with_recreate(
					key,
					old_value,
					new_value,
					graph_w.get_node(key).and_then(Node::metadata),
				)
			});

		if recreate {
			// the descriptor removes the old revision of the value
			if let Some(node) = graph_w.node_mut(key) {
				node.set_value(prev_value);
			}
			let node = graph_w.get_node(key);
			let mut del_op = self.pre_record_txn_op(args, node);
			del_op.operation = TxnOperation::Delete;
			del_op.new_value = None;
			del_op.is_recreate = true;
			let mut add_op = self.pre_record_txn_op(args, node);
			add_op.operation = TxnOperation::Add;
			add_op.prev_value = None;
			add_op.is_recreate = true;

			let (ops, error) = self.apply_delete(graph_w, del_op, args, false, branch);
			executed.extend(ops);
			if error.is_some() {
				save(graph_w, args);
				return (executed, error);
			}
			let (ops, error) = self.apply_add(graph_w, add_op, args, branch);
			executed.extend(ops);
			return (executed, error);
		}

		let (derives, ops, error) = self.apply_new_relations(graph_w, &handler, args, branch);
		executed.extend(ops);
		if error.is_some() {
			save(graph_w, args);
			return (executed, error);
		}

		// new dependencies are not satisfied, the value goes back to pending
		if !node_ready(&*graph_w, key) {
			let (ops, error) = self.apply_delete(graph_w, txn_op, args, true, branch);
			executed.extend(ops);
			return (executed, error);
		}

		if !args.dry_run && !equivalent && handler.descriptor().is_some() {
			let result = if args.kv.origin == ValueOrigin::FromSb {
				// already modified in the southbound
				Ok(args.kv.metadata.clone())
			} else {
				let old_metadata = graph_w.get_node(key).and_then(Node::metadata).cloned();
				prev_value.as_ref().map_or(Ok(None), |old_value| {
					handler.modify(key, old_value, new_value, old_metadata.as_ref())
				})
			};

			match result {
				Err(error) => {
					let retriable = handler.is_retriable_failure(&error);
					txn_op.new_error = Some(error.clone());
					txn_op.new_state = self.mark_failed_value(graph_w, key, args, error.clone(), retriable, depth);
					executed.push(txn_op);
					save(graph_w, args);
					return (executed, Some(error));
				}
				Ok(metadata) => {
					if !args.is_derived && handler.with_metadata() {
						if let Some(node) = graph_w.node_mut(key) {
							node.set_metadata(metadata);
						}
					}
				}
			}
		}

		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().remove(FlagName::Error);
			node.flags_mut().remove(FlagName::Unavailable);
		}
		let new_state = if args.kv.origin == ValueOrigin::FromSb {
			ValueState::Retrieved
		} else {
			ValueState::Configured
		};
		txn_op.new_state = new_state;
		self.update_node_state(graph_w, key, new_state, depth);

		if !equivalent || txn_op.prev_state != new_state {
			// a transition which only confirms that the value is in sync is not recorded
			let confirms_in_sync =
				equivalent && txn_op.prev_state == ValueState::Found && new_state == ValueState::Configured;
			if !confirms_in_sync {
				txn_op.noop = equivalent;
				executed.push(txn_op);
			}
		}
		save(graph_w, args);

		let mut error = None;
		if !args.is_derived {
			let derived = derives
				.into_iter()
				.map(|kv| args.related_kv(kv.key, kv.value))
				.collect();
			let (ops, derived_error) = self.apply_derived(graph_w, derived, args, true, branch);
			executed.extend(ops);
			error = derived_error;
		}

		save(graph_w, args);
		(executed, error)
	}

	fn mark_invalid_value(
		&self,
		graph_w: &mut WriteHandle<'_>,
		mut txn_op: RecordedTxnOp,
		args: &ApplyArgs<'_>,
		error: OperationError,
		depth: usize,
	) -> Executed {
		let key = args.kv.key.as_str();
		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().set(Flag::Unavailable);
		}
		txn_op.new_error = Some(error.clone());
		txn_op.new_state = ValueState::Invalid;
		txn_op.noop = true;
		self.update_node_state(graph_w, key, ValueState::Invalid, depth);
		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().set(Flag::Error(ErrorFlag {
				error: error.clone(),
				retriable: false,
			}));
		}
		save(graph_w, args);
		(vec![txn_op], Some(error))
	}

	/// Updates relations of the node and removes derived values which are no longer derived.
	/// Returns the new derived values.
	fn apply_new_relations(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		handler: &DescriptorHandler,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> (Vec<KeyValuePair>, Vec<RecordedTxnOp>, Option<OperationError>) {
		let key = args.kv.key.as_str();
		let Some(node) = graph_w.get_node(key) else {
			return (Vec::new(), Vec::new(), None);
		};

		let prev_derived = derived_keys(node);
		let (derives, dependencies) = node.value().map_or_else(Default::default, |value| {
			let derives = if args.is_derived {
				Vec::new()
			} else {
				handler.derived_values(key, value)
			};
			(derives, handler.dependencies(key, value))
		});
		graph_w.set_targets(key, construct_targets(&dependencies, &derives));

		if args.is_derived {
			return (derives, Vec::new(), None);
		}

		let current = graph_w.get_node(key).map(derived_keys).unwrap_or_default();
		let obsolete = prev_derived
			.difference(&current)
			.map(|obsolete_key| args.related_kv(obsolete_key.clone(), None))
			.collect();
		let (executed, error) = self.apply_derived(graph_w, obsolete, args, false, branch);
		(derives, executed, error)
	}

	/// (Re-)applies derived values in the order of their keys. With `check` set, derived values
	/// without a payload or colliding with base values are skipped.
	fn apply_derived(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		mut derived: Vec<KvForTxn>,
		args: &ApplyArgs<'_>,
		check: bool,
		branch: &mut HashSet<String>,
	) -> Executed {
		derived.sort_by(|a, b| a.key.cmp(&b.key));

		let mut executed = Vec::new();
		let mut error = None;
		for kv in derived {
			if check && !valid_derived_kv(&*graph_w, &kv, args.txn.seq_num) {
				continue;
			}
			let applied = self.apply_value(graph_w, &args.derived(kv), branch);
			if applied.error.is_some() {
				error = applied.error;
			}
			executed.extend(applied.executed);
		}
		(executed, error)
	}

	/// Re-evaluates every northbound value depending on the given one.
	fn run_updates(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		key: &str,
		args: &ApplyArgs<'_>,
		branch: &mut HashSet<String>,
	) -> Vec<RecordedTxnOp> {
		let Some(node) = graph_w.get_node(key) else {
			return Vec::new();
		};

		let mut executed = Vec::new();
		for dependent_key in node.sources(Relation::DependsOn) {
			let Some(dependent) = graph_w.get_node(&dependent_key) else {
				continue;
			};
			if node_origin(Some(dependent)) != ValueOrigin::FromNb {
				continue;
			}

			let value = node_last_update(Some(dependent))
				.map_or_else(|| dependent.value().cloned(), |update| update.value.clone());
			let kv = KvForTxn {
				is_revert: args.kv.is_revert,
				..KvForTxn::new(dependent_key, value, ValueOrigin::FromNb)
			};
			let update = args.update(kv, node_base_key(dependent), is_node_derived(dependent));
			executed.extend(self.apply_value(graph_w, &update, branch).executed);
		}
		executed
	}

	fn update_node_state(&self, graph_w: &mut WriteHandle<'_>, key: &str, new_state: ValueState, depth: usize) {
		let prev_state = node_state(graph_w.get_node(key));
		if prev_state == new_state {
			return;
		}
		if self.shared.config.log_graph_walk {
			trace!(depth, %key, %prev_state, %new_state, "Value state changed");
		}
		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().set(Flag::ValueState(new_state));
		}
	}

	/// Marks the value as failed, or as retrying when a retry is allowed.
	fn mark_failed_value(
		&self,
		graph_w: &mut WriteHandle<'_>,
		key: &str,
		args: &ApplyArgs<'_>,
		error: OperationError,
		retriable: bool,
		depth: usize,
	) -> ValueState {
		let to_be_reverted = args.txn.revert_on_failure() && !args.kv.is_revert;
		let mut new_state = ValueState::Failed;

		if retriable && !to_be_reverted {
			let node = graph_w.get_node(key);
			let attempt = args
				.txn
				.retry()
				.filter(|retry| node.is_some_and(|node| retry.keys.contains_key(&node_base_key(node))))
				.map_or(1, |retry| retry.meta.attempt + 1);
			let retry_allowed = node_last_update(node)
				.and_then(|update| update.retry)
				.is_some_and(|retry| retry.max_count == 0 || attempt <= retry.max_count);
			if retry_allowed {
				new_state = ValueState::Retrying;
			}
		}

		self.update_node_state(graph_w, key, new_state, depth);
		if let Some(node) = graph_w.node_mut(key) {
			node.flags_mut().set(Flag::Error(ErrorFlag { error, retriable }));
		}
		new_state
	}

	fn pre_record_txn_op(&self, args: &ApplyArgs<'_>, node: Option<&Node>) -> RecordedTxnOp {
		RecordedTxnOp {
			key: args.kv.key.clone(),
			prev_value: node.and_then(Node::value).cloned(),
			new_value: args.kv.value.clone(),
			prev_state: node_state(node),
			prev_error: node_error(node).map(|(error, _)| error.clone()),
			is_derived: args.is_derived,
			is_property: args.is_derived && self.shared.registry.get_for_key(&args.kv.key).is_none(),
			is_revert: args.kv.is_revert,
			is_retry: args.is_retry,
			..Default::default()
		}
	}
}
