//! In-memory graph of values, their relations and flags.
//!
//! Any number of read handles may be open at once. There is at most one write handle, which
//! works on its own copy of the nodes: changes become visible to readers only once saved, and
//! are discarded when the handle is dropped without saving (used for dry runs).
//! Every saved change of a node may be recorded as a new revision in the node's timeline.

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	fmt::Write as _,
	sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard},
};

use chrono::{DateTime, Utc};

use crate::value::{format_value, KeySelector, Metadata, Value};

mod flag;
mod node;

pub use flag::{ErrorFlag, Flag, FlagFilter, FlagName, FlagSelector, Flags, LastUpdate};
pub use node::{Node, Relation, RelationTargetDef, TargetDef, Targets};

/// One revision of a node, valid from `since` until `until` (open-ended for the latest).
#[derive(Debug, Clone)]
pub struct RecordedNode {
	pub since: DateTime<Utc>,
	pub until: Option<DateTime<Utc>>,
	pub key: String,
	pub label: String,
	pub value: Option<Value>,
	pub metadata: Option<Metadata>,
	pub flags: Flags,
	pub targets: Vec<Targets>,
	/// Only the resolved targets changed since the previous revision.
	pub target_update_only: bool,
}

impl RecordedNode {
	fn new(node: &Node, since: DateTime<Utc>, target_update_only: bool) -> Self {
		Self {
			since,
			until: None,
			key: node.key.clone(),
			label: node.label.clone(),
			value: node.value.clone(),
			metadata: node.metadata.clone(),
			flags: node.flags.clone(),
			targets: node.targets.clone(),
			target_update_only,
		}
	}

	fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
		self.since <= time && self.until.map_or(true, |until| until > time)
	}
}

/// Occurrences of a flag across all recorded revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagStats {
	pub total_count: usize,
	pub per_value_count: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct GraphState {
	nodes: BTreeMap<String, Node>,
	timeline: HashMap<String, Vec<RecordedNode>>,
	metadata_maps: BTreeMap<String, BTreeMap<String, Metadata>>,
}

#[derive(Debug, Default)]
pub struct Graph {
	state: RwLock<GraphState>,
	writer: Mutex<()>,
}

impl Graph {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens a read handle. The graph cannot be saved until the handle is released.
	pub fn read(&self) -> ReadHandle<'_> {
		ReadHandle {
			state: self.state.read().unwrap_or_else(PoisonError::into_inner),
		}
	}

	/// Opens the write handle, waiting for the previous one to be released.
	/// With `record` enabled, saved changes are appended to the node timelines.
	pub fn write(&self, record: bool) -> WriteHandle<'_> {
		let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
		let nodes = self
			.state
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.nodes
			.clone();

		WriteHandle {
			graph: self,
			_writer: writer,
			nodes,
			record,
			changed: BTreeMap::new(),
			relinked: BTreeSet::new(),
		}
	}

	/// Creates an empty metadata map, so that it is reported even before the first value.
	pub fn register_metadata_map(&self, name: &str) {
		self.state
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.metadata_maps
			.entry(name.to_string())
			.or_default();
	}

	/// Drops revisions that ended before `older_than`, except those which started before
	/// `permanent_until`.
	pub fn trim_timeline(&self, older_than: DateTime<Utc>, permanent_until: DateTime<Utc>) {
		let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
		state.timeline.retain(|_, revisions| {
			revisions.retain(|revision| {
				revision.since < permanent_until
					|| revision.until.map_or(true, |until| until >= older_than)
			});
			!revisions.is_empty()
		});
	}
}

/// Queries available on both read and write handles.
pub trait ReadAccess {
	fn nodes(&self) -> &BTreeMap<String, Node>;

	fn get_node(&self, key: &str) -> Option<&Node> {
		self.nodes().get(key)
	}

	fn get_keys(&self) -> BTreeSet<String> {
		self.nodes().keys().cloned().collect()
	}

	/// Nodes matching the key selector (if any) and every flag selector, ordered by key.
	fn get_nodes(
		&self,
		key_selector: Option<&KeySelector>,
		flag_selectors: &[FlagSelector],
	) -> Vec<&Node> {
		self.nodes()
			.values()
			.filter(|node| key_selector.map_or(true, |selector| selector.matches(&node.key)))
			.filter(|node| {
				flag_selectors
					.iter()
					.all(|selector| selector.matches(&node.flags))
			})
			.collect()
	}

	/// Human readable listing of all nodes.
	fn dump(&self) -> String {
		let mut out = String::new();
		for node in self.nodes().values() {
			let _ = writeln!(out, "- key: {}", node.key);
			if node.label != node.key {
				let _ = writeln!(out, "  label: {}", node.label);
			}
			let _ = writeln!(out, "  value: {}", format_value(node.value.as_ref()));
			if let Some(metadata) = &node.metadata {
				let _ = writeln!(out, "  metadata: {metadata}");
			}
			for flag in node.flags.iter() {
				let _ = writeln!(out, "  flag {}: {}", flag.name(), flag.value_string());
			}
			for targets in &node.targets {
				let _ = writeln!(
					out,
					"  {} {}: {:?}",
					targets.relation, targets.label, targets.matching_keys
				);
			}
		}
		out
	}
}

pub struct ReadHandle<'a> {
	state: RwLockReadGuard<'a, GraphState>,
}

impl ReadHandle<'_> {
	/// Releases the shared lock. Dropping the handle has the same effect.
	pub fn release(self) {}

	#[must_use]
	pub fn get_node_timeline(&self, key: &str) -> &[RecordedNode] {
		self.state.timeline.get(key).map(Vec::as_slice).unwrap_or_default()
	}

	/// Revisions valid at the given time, ordered by key.
	#[must_use]
	pub fn get_snapshot(&self, time: DateTime<Utc>) -> Vec<&RecordedNode> {
		let mut snapshot = self
			.state
			.timeline
			.values()
			.filter_map(|revisions| {
				let idx = revisions.partition_point(|revision| revision.since <= time);
				idx.checked_sub(1)
					.map(|idx| &revisions[idx])
					.filter(|revision| revision.is_valid_at(time))
			})
			.collect::<Vec<_>>();
		snapshot.sort_by(|a, b| a.key.cmp(&b.key));
		snapshot
	}

	#[must_use]
	pub fn get_flag_stats(&self, name: FlagName, key_selector: Option<&KeySelector>) -> FlagStats {
		let mut stats = FlagStats::default();
		for (key, revisions) in &self.state.timeline {
			if !key_selector.map_or(true, |selector| selector.matches(key)) {
				continue;
			}
			for revision in revisions.iter().filter(|r| !r.target_update_only) {
				if let Some(flag) = revision.flags.get(name) {
					stats.total_count += 1;
					*stats
						.per_value_count
						.entry(flag.value_string())
						.or_default() += 1;
				}
			}
		}
		stats
	}

	#[must_use]
	pub fn get_metadata_map(&self, name: &str) -> Option<&BTreeMap<String, Metadata>> {
		self.state.metadata_maps.get(name)
	}
}

impl ReadAccess for ReadHandle<'_> {
	fn nodes(&self) -> &BTreeMap<String, Node> {
		&self.state.nodes
	}
}

pub struct WriteHandle<'a> {
	graph: &'a Graph,
	_writer: MutexGuard<'a, ()>,
	nodes: BTreeMap<String, Node>,
	record: bool,
	/// Keys changed since the last save, mapped to whether more than targets changed.
	changed: BTreeMap<String, bool>,
	/// Nodes whose incoming edges changed since the last save. Published without a revision.
	relinked: BTreeSet<String>,
}

impl WriteHandle<'_> {
	fn mark_changed(&mut self, key: &str, data: bool) {
		let entry = self.changed.entry(key.to_string()).or_insert(false);
		*entry |= data;
	}

	fn relink(&mut self, relation: Relation, target_key: &str, source_key: &str, add: bool) {
		let Some(target) = self.nodes.get_mut(target_key) else {
			return;
		};
		if add {
			target.add_source(relation, source_key);
		} else {
			target.remove_source(relation, source_key);
		}
		self.relinked.insert(target_key.to_string());
	}

	/// Returns the node under `key`, creating an empty one if needed.
	pub fn set_node(&mut self, key: &str) -> &mut Node {
		if !self.nodes.contains_key(key) {
			let mut node = Node::new(key);
			let mut targeted_by = Vec::new();
			for (other_key, other) in &mut self.nodes {
				for relation in other.check_potential_target(key) {
					node.add_source(relation, other_key);
					targeted_by.push(other_key.clone());
				}
			}
			for other_key in targeted_by {
				self.mark_changed(&other_key, false);
			}
			self.nodes.insert(key.to_string(), node);
		}

		self.mark_changed(key, true);
		self.nodes
			.entry(key.to_string())
			.or_insert_with(|| Node::new(key))
	}

	/// Mutable access to an existing node.
	pub fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
		if self.nodes.contains_key(key) {
			self.mark_changed(key, true);
		}
		self.nodes.get_mut(key)
	}

	/// Replaces the relations going out of the node and resolves them against existing nodes.
	pub fn set_targets(&mut self, key: &str, defs: Vec<RelationTargetDef>) {
		let Some(node) = self.nodes.get(key) else {
			return;
		};

		let previous = node.targets.clone();
		for targets in &previous {
			for target_key in &targets.matching_keys {
				self.relink(targets.relation, target_key, key, false);
			}
		}

		let resolved = defs
			.iter()
			.map(|def| Targets {
				relation: def.relation,
				label: def.label.clone(),
				expected_key: match &def.target {
					TargetDef::Key(target_key) => Some(target_key.clone()),
					TargetDef::Selector(_) => None,
				},
				matching_keys: match &def.target {
					TargetDef::Key(target_key) => self
						.nodes
						.contains_key(target_key)
						.then(|| BTreeSet::from([target_key.clone()]))
						.unwrap_or_default(),
					TargetDef::Selector(selector) => self
						.nodes
						.keys()
						.filter(|other| *other != key && selector.matches(other))
						.cloned()
						.collect(),
				},
			})
			.collect::<Vec<_>>();

		for targets in &resolved {
			for target_key in &targets.matching_keys {
				self.relink(targets.relation, target_key, key, true);
			}
		}

		let targets_changed = resolved != previous;
		if let Some(node) = self.nodes.get_mut(key) {
			node.targets_def = defs;
			node.targets = resolved;
		}
		if targets_changed {
			self.mark_changed(key, false);
		}
	}

	/// Removes the node together with every edge pointing to or from it.
	pub fn delete_node(&mut self, key: &str) -> bool {
		let Some(node) = self.nodes.remove(key) else {
			return false;
		};

		for targets in &node.targets {
			for target_key in &targets.matching_keys {
				self.relink(targets.relation, target_key, key, false);
			}
		}

		let mut untargeted = Vec::new();
		for (other_key, other) in &mut self.nodes {
			if other.remove_from_targets(key) {
				untargeted.push(other_key.clone());
			}
		}
		for other_key in untargeted {
			self.mark_changed(&other_key, false);
		}

		self.mark_changed(key, true);
		true
	}

	/// Publishes the changes made so far to readers.
	pub fn save(&mut self) {
		if self.changed.is_empty() && self.relinked.is_empty() {
			return;
		}

		let now = Utc::now();
		let mut state = self.graph.state.write().unwrap_or_else(PoisonError::into_inner);
		let GraphState {
			nodes,
			timeline,
			metadata_maps,
		} = &mut *state;

		for (key, data_changed) in std::mem::take(&mut self.changed) {
			if let Some(previous) = nodes.remove(&key) {
				if let Some(map) = previous
					.metadata_map
					.as_ref()
					.and_then(|name| metadata_maps.get_mut(name))
				{
					map.remove(&previous.label);
				}
			}

			let node = self.nodes.get(&key);

			if self.record {
				let revisions = timeline.entry(key.clone()).or_default();
				if let Some(last) = revisions.last_mut() {
					if last.until.is_none() {
						last.until = Some(now);
					}
				}
				if let Some(node) = node {
					revisions.push(RecordedNode::new(node, now, !data_changed));
				}
			}

			if let Some(node) = node {
				if let (Some(name), Some(metadata)) = (&node.metadata_map, &node.metadata) {
					metadata_maps
						.entry(name.clone())
						.or_default()
						.insert(node.label.clone(), metadata.clone());
				}
				nodes.insert(key, node.clone());
			}
		}

		for key in std::mem::take(&mut self.relinked) {
			if let (Some(node), Some(published)) = (self.nodes.get(&key), nodes.get_mut(&key)) {
				published.sources.clone_from(&node.sources);
			}
		}
	}

	/// Releases the handle, dropping any unsaved changes.
	pub fn release(self) {}

	/// Recorded revisions of a node, as published so far.
	#[must_use]
	pub fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
		self.graph
			.state
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.timeline
			.get(key)
			.cloned()
			.unwrap_or_default()
	}
}

impl ReadAccess for WriteHandle<'_> {
	fn nodes(&self) -> &BTreeMap<String, Node> {
		&self.nodes
	}
}
