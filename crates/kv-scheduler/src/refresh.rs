//! Refresh of the graph with the actual state of the southbound, as reported by the
//! descriptors' dumps.

use std::{collections::BTreeSet, sync::Arc};

use tracing::{debug, error, trace, warn};

use crate::{
	descriptor::{Descriptor, DescriptorHandler},
	graph::{Flag, FlagFilter, FlagName, FlagSelector, Node, ReadAccess, WriteHandle},
	node_utils::{
		construct_targets, correlate_values_selectors, derived_keys, is_node_available, node_base_key,
		node_last_update, node_origin, node_state, nodes_to_kvs_with_metadata,
	},
	process::TxnProcessor,
	txn::KvForTxn,
	value::{KeyValuePair, KvWithMetadata, ValueOrigin, ValueState},
};

/// Desired values of a resync transaction, used to correlate dumped values on the first resync.
pub(crate) struct ResyncData<'a> {
	pub(crate) first: bool,
	pub(crate) values: &'a [KvForTxn],
}

/// Marks non-derived values of the descriptor, together with their derived values, as refreshed
/// without touching them.
fn skip_refresh(
	graph: &impl ReadAccess,
	descriptor: &str,
	except: Option<&BTreeSet<String>>,
	refreshed: &mut BTreeSet<String>,
) {
	let selectors = [
		FlagSelector::with(FlagFilter::descriptor(descriptor)),
		FlagSelector::without(FlagFilter::any(FlagName::Derived)),
	];
	for node in graph.get_nodes(None, &selectors) {
		if except.is_some_and(|except| except.contains(node.key())) {
			continue;
		}
		refreshed.insert(node.key().to_string());
		refreshed.extend(derived_keys(node));
	}
}

fn valid_dumped_kv(kv: &KvWithMetadata, descriptor: &dyn Descriptor, refreshed: &BTreeSet<String>) -> bool {
	let name = descriptor.name();
	if kv.key.is_empty() {
		warn!(descriptor = name, "Descriptor dumped value with empty key");
		return false;
	}
	if refreshed.contains(&kv.key) {
		warn!(descriptor = name, key = %kv.key, "The same value was dumped more than once");
		return false;
	}
	if kv.value.is_none() {
		warn!(descriptor = name, key = %kv.key, "Descriptor dumped nil value");
		return false;
	}
	if !descriptor.key_selector(&kv.key) {
		warn!(descriptor = name, key = %kv.key, "Descriptor dumped value outside of its key space");
		return false;
	}
	true
}

fn valid_dumped_derived_kv(node: &Node, descriptor: Option<&str>, refreshed: &BTreeSet<String>) -> bool {
	let descriptor = descriptor.unwrap_or("<NONE>");
	if node.value().is_none() {
		warn!(descriptor, key = %node.key(), "Derived nil value");
		return false;
	}
	if refreshed.contains(node.key()) {
		// overwritten with the later one
		warn!(descriptor, key = %node.key(), "The same value was dumped more than once");
	}
	true
}

impl TxnProcessor {
	/// Updates the given values (all values when `keys` is `None` or empty) to their actual
	/// state in the southbound.
	pub(crate) fn refresh_graph(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		keys: Option<&BTreeSet<String>>,
		resync_data: Option<&ResyncData<'_>>,
		verbose: bool,
	) {
		let shared = Arc::clone(&self.shared);
		let log_walk = shared.config.log_graph_walk;
		let keys = keys.filter(|keys| !keys.is_empty());
		if log_walk {
			trace!(?keys, "[BEGIN] refresh graph");
		}

		let mut refreshed = BTreeSet::new();

		for descriptor in shared.registry.get_all() {
			let name = descriptor.name().to_string();
			let handler = DescriptorHandler::new(Some(Arc::clone(&descriptor)));

			if keys.is_some_and(|keys| !keys.iter().any(|key| descriptor.key_selector(key))) {
				skip_refresh(&*graph_w, &name, None, &mut refreshed);
				continue;
			}

			let prev_available_nodes = graph_w.get_nodes(None, &correlate_values_selectors(&name));
			let prev_available = prev_available_nodes
				.iter()
				.map(|node| (node.key().to_string(), node_origin(Some(node))))
				.collect::<Vec<_>>();
			let correlate = match resync_data {
				Some(resync) if resync.first => resync
					.values
					.iter()
					.filter(|kv| descriptor.key_selector(&kv.key))
					.map(|kv| KvWithMetadata {
						key: kv.key.clone(),
						value: kv.value.clone(),
						metadata: None,
						origin: kv.origin,
					})
					.collect(),
				_ => nodes_to_kvs_with_metadata(&prev_available_nodes),
			};

			let dump = match handler.dump(&correlate) {
				Some(Ok(dump)) => dump,
				Some(Err(e)) => {
					error!(descriptor = %name, ?e, "Failed to dump values, refresh for the descriptor will be skipped");
					skip_refresh(&*graph_w, &name, None, &mut refreshed);
					continue;
				}
				None => {
					skip_refresh(&*graph_w, &name, None, &mut refreshed);
					continue;
				}
			};
			if verbose {
				debug!(descriptor = %name, count = dump.len(), ?dump, "Descriptor dumped values");
			}

			if let Some(keys) = keys {
				skip_refresh(&*graph_w, &name, Some(keys), &mut refreshed);
			}

			for mut dumped in dump {
				if keys.is_some_and(|keys| !keys.contains(&dumped.key)) {
					continue;
				}
				if !valid_dumped_kv(&dumped, &*descriptor, &refreshed) {
					continue;
				}

				if dumped.origin == ValueOrigin::Unknown {
					if let Some(kv) = correlate.iter().find(|kv| kv.key == dumped.key) {
						dumped.origin = kv.origin;
					}
				}
				if dumped.origin == ValueOrigin::Unknown {
					dumped.origin = graph_w
						.get_node_timeline(&dumped.key)
						.last()
						.and_then(|revision| revision.flags.value_state())
						.map_or(ValueOrigin::Unknown, ValueState::origin);
				}
				if dumped.origin == ValueOrigin::Unknown {
					dumped.origin = ValueOrigin::FromSb;
				}

				self.refresh_value(graph_w, dumped, &handler, &mut refreshed);
			}

			// NB values which do not actually exist lose their metadata
			for (key, origin) in prev_available {
				if refreshed.contains(&key) || origin != ValueOrigin::FromNb {
					continue;
				}
				if log_walk {
					trace!(%key, "Unset metadata");
				}
				if let Some(node) = graph_w.node_mut(&key) {
					node.set_metadata(None);
				}
			}

			// metadata changes become visible to dumps of the following descriptors
			graph_w.save();
		}

		let unrefreshed = graph_w
			.get_keys()
			.into_iter()
			.filter(|key| !refreshed.contains(key))
			.collect::<Vec<_>>();
		for key in unrefreshed {
			if !refreshed.contains(&key) {
				self.refresh_unavail_node(graph_w, &key, &mut refreshed);
			}
		}

		if verbose {
			debug!("Refreshed graph:\n{}", graph_w.dump());
		}
		if log_walk {
			trace!(?keys, "[END] refresh graph");
		}
	}

	/// Refreshes the node of a dumped value together with its relations and derived values.
	fn refresh_value(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		dumped: KvWithMetadata,
		handler: &DescriptorHandler,
		refreshed: &mut BTreeSet<String>,
	) {
		if self.shared.config.log_graph_walk {
			trace!(key = %dumped.key, "refresh value");
		}
		let key = dumped.key.as_str();

		let node = graph_w.set_node(key);
		node.set_label(handler.key_label(key));
		node.set_value(dumped.value.clone());
		if let (true, Some(name)) = (handler.with_metadata(), handler.name()) {
			node.set_metadata_map(name);
			node.set_metadata(dumped.metadata.clone());
		}
		self.refresh_avail_node(graph_w, key, dumped.origin, false, key, refreshed);

		let Some(node) = graph_w.get_node(key) else {
			return;
		};
		let mut obsolete = derived_keys(node);
		let (mut derives, dependencies) = node.value().map_or_else(Default::default, |value| {
			(handler.derived_values(key, value), handler.dependencies(key, value))
		});
		for kv in &derives {
			obsolete.remove(&kv.key);
		}

		// obsolete derived values are kept in the relation until swept
		derives.extend(obsolete.iter().map(|obsolete_key| KeyValuePair {
			key: obsolete_key.clone(),
			value: None,
		}));
		graph_w.set_targets(key, construct_targets(&dependencies, &derives));

		for derived in derives {
			graph_w.set_node(&derived.key);
			if obsolete.contains(&derived.key) {
				self.refresh_unavail_node(graph_w, &derived.key, refreshed);
				continue;
			}

			let derived_handler = DescriptorHandler::new(self.shared.registry.get_for_key(&derived.key));
			let dependencies = derived
				.value
				.as_ref()
				.map(|value| derived_handler.dependencies(&derived.key, value))
				.unwrap_or_default();
			if let Some(node) = graph_w.node_mut(&derived.key) {
				node.set_value(derived.value);
			}
			graph_w.set_targets(&derived.key, construct_targets(&dependencies, &[]));
			self.refresh_avail_node(graph_w, &derived.key, dumped.origin, true, key, refreshed);
		}
	}

	/// Refreshes the state of a node whose value was dumped.
	fn refresh_avail_node(
		&mut self,
		graph_w: &mut WriteHandle<'_>,
		key: &str,
		origin: ValueOrigin,
		derived: bool,
		base_key: &str,
		refreshed: &mut BTreeSet<String>,
	) {
		let descriptor = self.shared.registry.get_for_key(key);
		let Some(node) = graph_w.get_node(key) else {
			return;
		};
		if derived && !valid_dumped_derived_kv(node, descriptor.as_ref().map(|d| d.name()), refreshed) {
			graph_w.delete_node(key);
			return;
		}

		let available = is_node_available(Some(node));
		let mut state = node_state(Some(node));
		if !available {
			self.updated_states.insert(base_key.to_string());
		}
		refreshed.insert(key.to_string());

		if state == ValueState::NonExistent {
			// newly found
			state = if origin == ValueOrigin::FromSb {
				ValueState::Retrieved
			} else {
				ValueState::Found
			};
		}
		if state == ValueState::Pending {
			state = ValueState::Configured;
		}

		let log_walk = self.shared.config.log_graph_walk;
		let Some(node) = graph_w.node_mut(key) else {
			return;
		};
		if !available {
			node.flags_mut().remove(FlagName::Unavailable);
		}
		refresh_node_state(node, state, log_walk);

		match &descriptor {
			Some(descriptor) => node.flags_mut().set(Flag::Descriptor(descriptor.name().to_string())),
			None => node.flags_mut().remove(FlagName::Descriptor),
		}
		if derived {
			node.flags_mut().set(Flag::Derived(base_key.to_string()));
		} else {
			node.flags_mut().remove(FlagName::Derived);
		}
	}

	/// Refreshes the state of a node whose value was not found in the southbound.
	fn refresh_unavail_node(&mut self, graph_w: &mut WriteHandle<'_>, key: &str, refreshed: &mut BTreeSet<String>) {
		let Some(node) = graph_w.get_node(key) else {
			return;
		};
		refreshed.insert(key.to_string());

		let available = is_node_available(Some(node));
		if available {
			self.updated_states.insert(node_base_key(node));
		}
		let state = node_state(Some(node));
		if node_origin(Some(node)) == ValueOrigin::FromSb || state == ValueState::Found {
			graph_w.delete_node(key);
			return;
		}
		let removed = node_last_update(Some(node)).map_or(true, |update| update.value.is_none());

		let log_walk = self.shared.config.log_graph_walk;
		let Some(node) = graph_w.node_mut(key) else {
			return;
		};
		if available {
			node.flags_mut().set(Flag::Unavailable);
		}
		if state == ValueState::Configured {
			let new_state = if removed {
				ValueState::Removed
			} else {
				ValueState::Missing
			};
			refresh_node_state(node, new_state, log_walk);
		}
	}
}

fn refresh_node_state(node: &mut Node, new_state: ValueState, log_walk: bool) {
	let prev_state = node_state(Some(&*node));
	if prev_state == new_state {
		return;
	}
	if log_walk {
		trace!(key = %node.key(), %prev_state, %new_state, "Value state changed");
	}
	node.flags_mut().set(Flag::ValueState(new_state));
}
