use std::collections::{BTreeSet, HashMap};

use crate::{
	descriptor::{Dependency, DependencyTarget},
	error::OperationError,
	graph::{FlagFilter, FlagName, FlagSelector, LastUpdate, Node, ReadAccess, Relation, RelationTargetDef, TargetDef},
	status::{BaseValueStatus, ValueStatus},
	value::{KeyValuePair, KvWithMetadata, TxnOperation, Value, ValueOrigin, ValueState},
};

pub(crate) fn node_state(node: Option<&Node>) -> ValueState {
	node.and_then(|node| node.flags().value_state())
		.unwrap_or(ValueState::NonExistent)
}

pub(crate) fn node_origin(node: Option<&Node>) -> ValueOrigin {
	node_state(node).origin()
}

pub(crate) fn node_error(node: Option<&Node>) -> Option<(&OperationError, bool)> {
	node.and_then(|node| node.flags().error())
		.map(|flag| (&flag.error, flag.retriable))
}

pub(crate) fn node_last_update(node: Option<&Node>) -> Option<&LastUpdate> {
	node.and_then(|node| node.flags().last_update())
}

pub(crate) fn node_last_applied_value(node: Option<&Node>) -> Option<&Value> {
	node_last_update(node).and_then(|last_update| last_update.value.as_ref())
}

pub(crate) fn node_last_operation(node: Option<&Node>) -> TxnOperation {
	let Some(node) = node else {
		return TxnOperation::Undefined;
	};
	if node_state(Some(node)) == ValueState::Retrieved {
		return TxnOperation::Undefined;
	}
	node.flags()
		.last_update()
		.map_or(TxnOperation::Undefined, |last_update| last_update.txn_op)
}

pub(crate) fn is_node_derived(node: &Node) -> bool {
	node.flags().has(FlagName::Derived)
}

pub(crate) fn node_base_key(node: &Node) -> String {
	node.flags()
		.derived_from()
		.map_or_else(|| node.key().to_string(), ToString::to_string)
}

pub(crate) fn is_node_available(node: Option<&Node>) -> bool {
	node.is_some_and(|node| !node.flags().has(FlagName::Unavailable))
}

/// Keys of the values derived from the node.
pub(crate) fn derived_keys(node: &Node) -> BTreeSet<String> {
	node.targets(Relation::Derives)
		.flat_map(|targets| targets.matching_keys.iter().cloned())
		.collect()
}

/// Labels of dependencies of the node which are not satisfied.
pub(crate) fn missing_dependencies(graph: &impl ReadAccess, node: &Node) -> Vec<String> {
	node.targets(Relation::DependsOn)
		.filter(|targets| {
			!targets
				.matching_keys
				.iter()
				.any(|key| is_node_available(graph.get_node(key)))
		})
		.map(|targets| {
			targets
				.expected_key
				.clone()
				.unwrap_or_else(|| targets.label.clone())
		})
		.collect()
}

/// Tells whether all dependencies of the node are satisfied.
///
/// Nodes forming a cycle of dependencies are ready together once every dependency leading
/// outside of the cycle is satisfied.
pub(crate) fn is_node_ready(graph: &impl ReadAccess, node: &Node) -> bool {
	if node_origin(Some(node)) == ValueOrigin::FromSb {
		return true;
	}
	let mut visited = HashMap::new();
	let mut resolved = HashMap::new();
	is_node_ready_rec(graph, node, 0, &mut visited, &mut resolved).0
}

/// Returns readiness assuming that nodes already on the path are ready, together with the
/// lowest depth of a node on the path that this node can reach through its dependencies.
///
/// Results which do not rely on the path are kept in `resolved`: any "not ready", and
/// "ready" of nodes not reaching back above themselves.
fn is_node_ready_rec<'a>(
	graph: &'a impl ReadAccess,
	node: &'a Node,
	depth: usize,
	visited: &mut HashMap<&'a str, usize>,
	resolved: &mut HashMap<&'a str, bool>,
) -> (bool, usize) {
	if let Some(target_depth) = visited.get(node.key()) {
		return (true, *target_depth);
	}
	if let Some(ready) = resolved.get(node.key()) {
		return (*ready, depth);
	}

	visited.insert(node.key(), depth);
	let mut cycle_depth = depth;
	let mut ready = true;

	for targets in node.targets(Relation::DependsOn) {
		let mut satisfied = false;
		for target in targets
			.matching_keys
			.iter()
			.filter_map(|target_key| graph.get_node(target_key))
		{
			if is_node_available(Some(target)) {
				satisfied = true;
			}

			// a strongly connected component is treated as a single node
			let (target_ready, target_cycle_depth) = is_node_ready_rec(graph, target, depth + 1, visited, resolved);
			if target_ready && target_cycle_depth <= depth {
				satisfied = true;
				cycle_depth = cycle_depth.min(target_cycle_depth);
			}
		}
		if !satisfied {
			ready = false;
			break;
		}
	}

	visited.remove(node.key());
	if !ready || cycle_depth == depth {
		resolved.insert(node.key(), ready);
	}
	(ready, cycle_depth)
}

pub(crate) fn construct_targets(deps: &[Dependency], derives: &[KeyValuePair]) -> Vec<RelationTargetDef> {
	let mut defs = deps
		.iter()
		.map(|dep| RelationTargetDef {
			relation: Relation::DependsOn,
			label: dep.label.clone(),
			target: match &dep.target {
				DependencyTarget::Key(key) => TargetDef::Key(key.clone()),
				DependencyTarget::AnyOf(selector) => TargetDef::Selector(selector.clone()),
			},
		})
		.collect::<Vec<_>>();

	defs.extend(derives.iter().map(|kv| RelationTargetDef {
		relation: Relation::Derives,
		label: kv.key.clone(),
		target: TargetDef::Key(kv.key.clone()),
	}));

	defs
}

pub(crate) fn nb_base_values_selectors() -> Vec<FlagSelector> {
	vec![
		FlagSelector::without(FlagFilter::any(FlagName::Derived)),
		FlagSelector::without(FlagFilter::value_state(ValueState::Retrieved)),
	]
}

pub(crate) fn sb_base_values_selectors() -> Vec<FlagSelector> {
	vec![
		FlagSelector::without(FlagFilter::any(FlagName::Derived)),
		FlagSelector::with(FlagFilter::value_state(ValueState::Retrieved)),
	]
}

/// Available non-derived values of the descriptor, as expected to be found in the southbound.
pub(crate) fn correlate_values_selectors(descriptor: &str) -> Vec<FlagSelector> {
	vec![
		FlagSelector::with(FlagFilter::descriptor(descriptor)),
		FlagSelector::without(FlagFilter::any(FlagName::Unavailable)),
		FlagSelector::without(FlagFilter::any(FlagName::Derived)),
	]
}

pub(crate) fn nodes_to_kvs_with_metadata(nodes: &[&Node]) -> Vec<KvWithMetadata> {
	nodes
		.iter()
		.map(|node| KvWithMetadata {
			key: node.key().to_string(),
			value: node.value().cloned(),
			metadata: node.metadata().cloned(),
			origin: node_origin(Some(node)),
		})
		.collect()
}

/// Like [`nodes_to_kvs_with_metadata`], but with the last requested value of every node.
pub(crate) fn nodes_to_kvs_with_last_applied(nodes: &[&Node]) -> Vec<KvWithMetadata> {
	nodes
		.iter()
		.filter_map(|node| {
			node_last_applied_value(Some(node)).map(|value| KvWithMetadata {
				key: node.key().to_string(),
				value: Some(value.clone()),
				metadata: node.metadata().cloned(),
				origin: ValueOrigin::FromNb,
			})
		})
		.collect()
}

pub(crate) fn value_status(graph: &impl ReadAccess, node: Option<&Node>, key: &str) -> ValueStatus {
	let state = node_state(node);
	let mut details = Vec::new();

	match (state, node_error(node)) {
		(ValueState::Invalid, Some((OperationError::InvalidValue(invalid), _))) => {
			details.clone_from(&invalid.invalid_fields);
		}
		(ValueState::Pending, _) => {
			if let Some(node) = node {
				details = missing_dependencies(graph, node);
			}
		}
		_ => {}
	}

	ValueStatus {
		key: key.to_string(),
		state,
		error: node_error(node).map(|(error, _)| error.to_string()),
		last_operation: node_last_operation(node),
		details,
	}
}

/// Status of a base value together with the statuses of its derived values.
pub(crate) fn base_value_status(graph: &impl ReadAccess, key: &str) -> BaseValueStatus {
	let node = graph.get_node(key);
	let derived_values = node
		.map(|node| {
			derived_keys(node)
				.into_iter()
				.filter_map(|derived_key| {
					let derived = graph.get_node(&derived_key)?;
					// properties have no state
					derived
						.flags()
						.descriptor()
						.is_some()
						.then(|| value_status(graph, Some(derived), &derived_key))
				})
				.collect()
		})
		.unwrap_or_default();

	BaseValueStatus {
		value: value_status(graph, node, key),
		derived_values,
	}
}
