//! Process-wide state (spec §9): descriptor id allocation/liveness and the
//! system-default configuration table, both shared across every executor
//! thread behind one mutex.
//!
//! Grounded on `net::tcp::mod`'s own `HashMap<Key, TCB>` for connection
//! bookkeeping: the teacher's custom `collections::map::Map`/`sparse` types
//! are sized by a const-generic capacity that doesn't fit an id space as
//! large and sparsely populated as this one, so a plain `slab::Slab` (already
//! a dependency) stands in, the same way the teacher reaches for a plain
//! `HashMap` when its fixed-capacity collections don't fit.

use std::sync::{Mutex, OnceLock};

use slab::Slab;

use crate::config::ConfigTable;

/// Upper bound on live descriptors (spec §9).
pub const MAX_DESCRIPTORS: usize = 1 << 20;

/// Which executor thread owns a descriptor, and whether it is still alive.
/// The `Slab` key itself doubles as the descriptor id handed to applications.
#[derive(Clone, Copy)]
pub struct Entry {
	pub executor: usize,
	pub alive: bool,
}

struct Inner {
	descriptors: Slab<Entry>,
	system_config: ConfigTable,
}

/// The single process-wide registry. Initialized lazily on first use so that
/// a process that never touches the transport pays nothing for it.
pub struct Registry {
	inner: Mutex<Inner>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn global() -> &'static Registry {
	REGISTRY.get_or_init(|| Registry {
		inner: Mutex::new(Inner { descriptors: Slab::new(), system_config: ConfigTable::defaults() }),
	})
}

impl Registry {
	/// Allocate a new descriptor id bound to `executor`. Returns `None` once
	/// [MAX_DESCRIPTORS] live descriptors are outstanding.
	pub fn allocate(&self, executor: usize) -> Option<u32> {
		let mut inner = self.inner.lock().unwrap();

		if inner.descriptors.len() >= MAX_DESCRIPTORS {
			return None;
		}

		let id = inner.descriptors.insert(Entry { executor, alive: true });
		Some(id as u32)
	}

	/// Mark a descriptor as destroyed, freeing its id for reuse.
	pub fn release(&self, id: u32) {
		let mut inner = self.inner.lock().unwrap();

		if inner.descriptors.contains(id as usize) {
			inner.descriptors.remove(id as usize);
		}
	}

	/// Look up which executor owns a live descriptor.
	pub fn owner(&self, id: u32) -> Option<usize> {
		let inner = self.inner.lock().unwrap();
		inner.descriptors.get(id as usize).filter(|e| e.alive).map(|e| e.executor)
	}

	/// Re-home a descriptor to a different executor (spec §4.5's accept-side
	/// migration), leaving its id unchanged.
	pub fn rehome(&self, id: u32, executor: usize) {
		let mut inner = self.inner.lock().unwrap();

		if let Some(entry) = inner.descriptors.get_mut(id as usize) {
			entry.executor = executor;
		}
	}

	pub fn system_config(&self) -> ConfigTable {
		self.inner.lock().unwrap().system_config
	}

	pub fn set_system_config(&self, config: ConfigTable) {
		self.inner.lock().unwrap().system_config = config;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocate_and_release_recycles_ids() {
		let registry = Registry { inner: Mutex::new(Inner { descriptors: Slab::new(), system_config: ConfigTable::defaults() }) };

		let a = registry.allocate(0).unwrap();
		registry.release(a);
		let b = registry.allocate(0).unwrap();

		assert_eq!(a, b);
	}

	#[test]
	fn owner_reflects_rehoming() {
		let registry = Registry { inner: Mutex::new(Inner { descriptors: Slab::new(), system_config: ConfigTable::defaults() }) };

		let id = registry.allocate(0).unwrap();
		assert_eq!(registry.owner(id), Some(0));

		registry.rehome(id, 3);
		assert_eq!(registry.owner(id), Some(3));
	}

	#[test]
	fn released_descriptor_has_no_owner() {
		let registry = Registry { inner: Mutex::new(Inner { descriptors: Slab::new(), system_config: ConfigTable::defaults() }) };

		let id = registry.allocate(0).unwrap();
		registry.release(id);

		assert_eq!(registry.owner(id), None);
	}
}
