use crate::{
	descriptor::DescriptorHandler,
	graph::ReadAccess,
	node_utils::is_node_available,
	registry::Registry,
	txn::KvForTxn,
};

/// Orders values of a transaction to execute deletes first, then modifications requiring
/// re-creation, then additions, and plain modifications last. Each group is sorted by key.
pub(crate) fn order_values_by_op(
	mut values: Vec<KvForTxn>,
	graph: &impl ReadAccess,
	registry: &Registry,
) -> Vec<KvForTxn> {
	values.sort_by(|a, b| a.key.cmp(&b.key));

	let mut delete = Vec::new();
	let mut recreate = Vec::new();
	let mut add = Vec::new();
	let mut modify = Vec::new();

	for kv in values {
		let node = graph.get_node(&kv.key);
		let (Some(new_value), Some(node)) = (kv.value.as_ref(), node) else {
			if kv.value.is_none() {
				delete.push(kv);
			} else {
				add.push(kv);
			}
			continue;
		};

		if !is_node_available(Some(node)) {
			add.push(kv);
			continue;
		}

		let handler = DescriptorHandler::new(registry.get_for_key(&kv.key));
		let recreated = node.value().is_some_and(|old_value| {
			handler.modify_with_recreate(&kv.key, old_value, new_value, node.metadata())
		});
		if recreated {
			recreate.push(kv);
		} else {
			modify.push(kv);
		}
	}

	delete.extend(recreate);
	delete.extend(add);
	delete.extend(modify);
	delete
}
