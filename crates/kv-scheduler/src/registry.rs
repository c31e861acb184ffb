use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, PoisonError, RwLock},
};

use tracing::warn;

use crate::{descriptor::Descriptor, error::Error};

/// Registered descriptors, with a cache of key to descriptor lookups.
#[derive(Default)]
pub(crate) struct Registry {
	descriptors: RwLock<Vec<Arc<dyn Descriptor>>>,
	key_cache: Mutex<HashMap<String, Option<Arc<dyn Descriptor>>>>,
}

impl Registry {
	pub(crate) fn register(&self, descriptor: Arc<dyn Descriptor>) -> Result<(), Error> {
		let mut descriptors = self
			.descriptors
			.write()
			.unwrap_or_else(PoisonError::into_inner);

		if descriptors.iter().any(|d| d.name() == descriptor.name()) {
			return Err(Error::DuplicateDescriptor(descriptor.name().to_string()));
		}
		descriptors.push(descriptor);

		self.key_cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clear();

		Ok(())
	}

	pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Descriptor>> {
		self.descriptors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.find(|d| d.name() == name)
			.cloned()
	}

	/// Descriptor owning the key, if any.
	pub(crate) fn get_for_key(&self, key: &str) -> Option<Arc<dyn Descriptor>> {
		let mut cache = self.key_cache.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(descriptor) = cache.get(key) {
			return descriptor.clone();
		}

		let descriptor = self
			.descriptors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.find(|d| d.key_selector(key))
			.cloned();
		cache.insert(key.to_string(), descriptor.clone());

		descriptor
	}

	pub(crate) fn get_for_nb_key_prefix(&self, prefix: &str) -> Option<Arc<dyn Descriptor>> {
		self.descriptors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.find(|d| d.nb_key_prefix() == Some(prefix))
			.cloned()
	}

	pub(crate) fn nb_key_prefixes(&self) -> Vec<String> {
		self.descriptors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.filter_map(|d| d.nb_key_prefix().map(ToString::to_string))
			.collect()
	}

	/// All descriptors, each placed after the descriptors it dump-depends on. Ties keep the
	/// registration order.
	pub(crate) fn get_all(&self) -> Vec<Arc<dyn Descriptor>> {
		let descriptors = self
			.descriptors
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();

		let mut ordered = Vec::with_capacity(descriptors.len());
		let mut placed = HashSet::new();

		while ordered.len() < descriptors.len() {
			let next = descriptors.iter().find(|d| {
				!placed.contains(d.name())
					&& d.dump_dependencies().iter().all(|dep| {
						placed.contains(dep.as_str())
							|| !descriptors.iter().any(|other| other.name() == dep)
					})
			});

			let Some(next) = next.or_else(|| {
				let stuck = descriptors.iter().find(|d| !placed.contains(d.name()));
				if let Some(stuck) = stuck {
					warn!(
						descriptor = stuck.name(),
						"Dump dependencies form a cycle, ignoring them for this descriptor"
					);
				}
				stuck
			}) else {
				break;
			};

			placed.insert(next.name().to_string());
			ordered.push(Arc::clone(next));
		}

		ordered
	}
}
