use std::{collections::BTreeSet, fmt};

use crate::value::{KeySelector, Metadata, Value};

use super::flag::Flags;

/// Directed relations between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Relation {
	DependsOn,
	Derives,
}

impl fmt::Display for Relation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::DependsOn => "depends-on",
			Self::Derives => "derives",
		})
	}
}

/// Declaration of an edge: either to one concrete key or to every key a selector matches.
#[derive(Debug, Clone)]
pub struct RelationTargetDef {
	pub relation: Relation,
	pub label: String,
	pub target: TargetDef,
}

#[derive(Debug, Clone)]
pub enum TargetDef {
	Key(String),
	Selector(KeySelector),
}

impl RelationTargetDef {
	pub(crate) fn matches(&self, key: &str) -> bool {
		match &self.target {
			TargetDef::Key(target) => target == key,
			TargetDef::Selector(selector) => selector.matches(key),
		}
	}
}

/// Resolved edge: keys of existing nodes matching one target definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
	pub relation: Relation,
	pub label: String,
	pub expected_key: Option<String>,
	pub matching_keys: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Node {
	pub(super) key: String,
	pub(super) label: String,
	pub(super) value: Option<Value>,
	pub(super) metadata: Option<Metadata>,
	pub(super) metadata_map: Option<String>,
	pub(super) flags: Flags,
	pub(super) targets_def: Vec<RelationTargetDef>,
	pub(super) targets: Vec<Targets>,
	pub(super) sources: Vec<(Relation, BTreeSet<String>)>,
}

impl Node {
	pub(super) fn new(key: &str) -> Self {
		Self {
			key: key.to_string(),
			label: key.to_string(),
			value: None,
			metadata: None,
			metadata_map: None,
			flags: Flags::default(),
			targets_def: Vec::new(),
			targets: Vec::new(),
			sources: Vec::new(),
		}
	}

	#[must_use]
	pub fn key(&self) -> &str {
		&self.key
	}

	#[must_use]
	pub fn label(&self) -> &str {
		&self.label
	}

	#[must_use]
	pub const fn value(&self) -> Option<&Value> {
		self.value.as_ref()
	}

	#[must_use]
	pub const fn metadata(&self) -> Option<&Metadata> {
		self.metadata.as_ref()
	}

	#[must_use]
	pub const fn flags(&self) -> &Flags {
		&self.flags
	}

	/// Resolved targets of the given relation, one entry per target definition.
	pub fn targets(&self, relation: Relation) -> impl Iterator<Item = &Targets> {
		self.targets.iter().filter(move |t| t.relation == relation)
	}

	/// Keys of nodes pointing to this node with the given relation.
	#[must_use]
	pub fn sources(&self, relation: Relation) -> BTreeSet<String> {
		self.sources
			.iter()
			.find(|(r, _)| *r == relation)
			.map(|(_, keys)| keys.clone())
			.unwrap_or_default()
	}

	pub fn set_label(&mut self, label: impl Into<String>) {
		self.label = label.into();
	}

	pub fn set_value(&mut self, value: Option<Value>) {
		self.value = value;
	}

	pub fn set_metadata(&mut self, metadata: Option<Metadata>) {
		self.metadata = metadata;
	}

	/// Publishes the metadata of this node, under its label, in the named metadata map.
	pub fn set_metadata_map(&mut self, map: impl Into<String>) {
		self.metadata_map = Some(map.into());
	}

	pub fn flags_mut(&mut self) -> &mut Flags {
		&mut self.flags
	}

	pub(super) fn add_source(&mut self, relation: Relation, key: &str) {
		if let Some((_, keys)) = self.sources.iter_mut().find(|(r, _)| *r == relation) {
			keys.insert(key.to_string());
		} else {
			self.sources
				.push((relation, BTreeSet::from([key.to_string()])));
		}
	}

	pub(super) fn remove_source(&mut self, relation: Relation, key: &str) {
		if let Some((_, keys)) = self.sources.iter_mut().find(|(r, _)| *r == relation) {
			keys.remove(key);
		}
	}

	/// Adds `key` to the targets whose definition matches it, returns the affected relations.
	pub(super) fn check_potential_target(&mut self, key: &str) -> Vec<Relation> {
		let mut relations = Vec::new();
		for (def, targets) in self.targets_def.iter().zip(self.targets.iter_mut()) {
			if def.matches(key) && targets.matching_keys.insert(key.to_string()) {
				relations.push(def.relation);
			}
		}
		relations
	}

	pub(super) fn remove_from_targets(&mut self, key: &str) -> bool {
		let mut removed = false;
		for targets in &mut self.targets {
			removed |= targets.matching_keys.remove(key);
		}
		removed
	}
}
