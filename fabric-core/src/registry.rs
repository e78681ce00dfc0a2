//! Generic by-route registry (§4.1).
//!
//! Every policy engine below is a thin wrapper over a `Registry<T>`: a
//! concurrent `route_id -> T` map with a short-held read/write lock (§5
//! "every by-route map uses a single reader-writer lock held briefly"),
//! following the shape of the teacher's `store::Stores` maps but
//! generalised to any engine state rather than one bespoke struct per
//! concern.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::strng::RouteId;

/// Add/remove notification, mirroring the teacher's `store::Event<T>`.
#[derive(Clone, Debug)]
pub enum Event<T> {
	Add(RouteId, T),
	Remove(RouteId),
}

/// A concurrent `route_id -> T` map. Reads take a shared lock and clone the
/// `Arc`; writes (insert/remove/clear) take an exclusive lock briefly and
/// never hold it across an engine call.
#[derive(Debug)]
pub struct Registry<T> {
	inner: RwLock<HashMap<RouteId, Arc<T>>>,
}

use std::sync::Arc;

impl<T> Default for Registry<T> {
	fn default() -> Self {
		Registry {
			inner: RwLock::new(HashMap::new()),
		}
	}
}

impl<T> Registry<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, route_id: RouteId, value: T) -> Option<Arc<T>> {
		self
			.inner
			.write()
			.expect("registry lock poisoned")
			.insert(route_id, Arc::new(value))
	}

	pub fn get(&self, route_id: &RouteId) -> Option<Arc<T>> {
		self
			.inner
			.read()
			.expect("registry lock poisoned")
			.get(route_id)
			.cloned()
	}

	pub fn remove(&self, route_id: &RouteId) -> Option<Arc<T>> {
		self
			.inner
			.write()
			.expect("registry lock poisoned")
			.remove(route_id)
	}

	pub fn contains(&self, route_id: &RouteId) -> bool {
		self
			.inner
			.read()
			.expect("registry lock poisoned")
			.contains_key(route_id)
	}

	pub fn clear(&self) {
		self.inner.write().expect("registry lock poisoned").clear();
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("registry lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Apply `f` to every `(route_id, value)` pair. Used by every engine's
	/// `Snapshot`-dumping admin hook (§6); takes the read lock for the
	/// duration of the callback, so `f` must not call back into this
	/// registry.
	pub fn stats(&self, mut f: impl FnMut(&RouteId, &T)) {
		let guard = self.inner.read().expect("registry lock poisoned");
		for (id, v) in guard.iter() {
			f(id, v);
		}
	}

	pub fn route_ids(&self) -> Vec<RouteId> {
		self
			.inner
			.read()
			.expect("registry lock poisoned")
			.keys()
			.cloned()
			.collect()
	}
}

/// Error produced by a [`Factory`] constructor, e.g. an invalid regex in a
/// route's mirror config. Always a [`crate::error::GatewayError::Configuration`]
/// once it escapes `AddRoute`.
pub type FactoryError = crate::error::GatewayError;

/// A [`Registry`] paired with the constructor/destructor boilerplate every
/// engine otherwise repeats: build `T` from a route's config, register it,
/// and run an optional teardown when the route (or the whole table) is
/// dropped on reconfigure.
pub struct Factory<Cfg, T> {
	registry: Registry<T>,
	build: Box<dyn Fn(&Cfg) -> Result<T, FactoryError> + Send + Sync>,
	destroy: Option<Box<dyn Fn(&T) + Send + Sync>>,
}

impl<Cfg, T> Factory<Cfg, T> {
	pub fn new(build: impl Fn(&Cfg) -> Result<T, FactoryError> + Send + Sync + 'static) -> Self {
		Factory {
			registry: Registry::new(),
			build: Box::new(build),
			destroy: None,
		}
	}

	pub fn with_destructor(
		mut self,
		destroy: impl Fn(&T) + Send + Sync + 'static,
	) -> Self {
		self.destroy = Some(Box::new(destroy));
		self
	}

	/// `AddRoute(id, cfg)` from §4.1: build `T` from `cfg` and install it,
	/// running the destructor on whatever it replaces.
	pub fn add_route(&self, route_id: RouteId, cfg: &Cfg) -> Result<(), FactoryError> {
		let value = (self.build)(cfg)?;
		if let Some(old) = self.registry.insert(route_id, value) {
			if let Some(destroy) = &self.destroy {
				destroy(&old);
			}
		}
		Ok(())
	}

	pub fn get(&self, route_id: &RouteId) -> Option<Arc<T>> {
		self.registry.get(route_id)
	}

	pub fn remove_route(&self, route_id: &RouteId) {
		if let Some(old) = self.registry.remove(route_id) {
			if let Some(destroy) = &self.destroy {
				destroy(&old);
			}
		}
	}

	/// `CloseAll()` from §4.1: run the destructor over every entry, then
	/// drop the table. Used on full reconfigure.
	pub fn close_all(&self) {
		if let Some(destroy) = &self.destroy {
			self.registry.stats(|_, v| destroy(v));
		}
		self.registry.clear();
	}

	pub fn registry(&self) -> &Registry<T> {
		&self.registry
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_and_get_round_trips() {
		let reg: Registry<u32> = Registry::new();
		reg.insert(RouteId::new("r1"), 42);
		assert_eq!(*reg.get(&RouteId::new("r1")).unwrap(), 42);
		assert!(reg.get(&RouteId::new("missing")).is_none());
	}

	#[test]
	fn stats_visits_every_entry() {
		let reg: Registry<u32> = Registry::new();
		reg.insert(RouteId::new("a"), 1);
		reg.insert(RouteId::new("b"), 2);
		let mut sum = 0;
		reg.stats(|_, v| sum += v);
		assert_eq!(sum, 3);
	}

	#[test]
	fn factory_runs_destructor_on_replace_and_close_all() {
		let destroyed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let d = destroyed.clone();
		let factory: Factory<u32, u32> = Factory::new(|cfg| Ok(*cfg)).with_destructor(move |_| {
			d.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		});
		factory.add_route(RouteId::new("r1"), &1).unwrap();
		factory.add_route(RouteId::new("r1"), &2).unwrap(); // replaces, destroys old
		assert_eq!(destroyed.load(std::sync::atomic::Ordering::SeqCst), 1);
		factory.close_all();
		assert_eq!(destroyed.load(std::sync::atomic::Ordering::SeqCst), 2);
		assert!(factory.registry().is_empty());
	}
}
