//! Reference-counted handle registry (§9 "Singletons with refcounts").
//!
//! Backend and queue handlers may be cached per-process as singletons keyed
//! by their connection parameters. `close()` decrements the refcount; only
//! the last close releases the underlying connection, and a handle obtained
//! outside the registry never affects a singleton's refcount.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

struct Slot<V> {
    value: Arc<V>,
    refcount: usize,
}

/// Explicit, per-process registry of shared resources keyed by `K`
/// (typically a connection string). There is no implicit global instance:
/// callers construct and pass around a `Registry` the way the executor and
/// cache factories take explicit config (§9 "Global mutable state").
pub struct Registry<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing singleton for `key`, or builds one with `build`
    /// and registers it with a refcount of 1.
    pub fn get_or_create<F, E>(&self, key: K, build: F) -> Result<Handle<K, V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut slots = self.slots.lock().expect("singleton registry poisoned");
        if let Some(slot) = slots.get_mut(&key) {
            slot.refcount += 1;
            return Ok(Handle {
                key: Some(key),
                value: slot.value.clone(),
                refcount: None,
            });
        }
        let value = Arc::new(build()?);
        slots.insert(
            key.clone(),
            Slot {
                value: value.clone(),
                refcount: 1,
            },
        );
        Ok(Handle {
            key: Some(key),
            value,
            refcount: None,
        })
    }

    fn release(&self, key: &K) {
        let mut slots = self.slots.lock().expect("singleton registry poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.refcount -= 1;
            if slot.refcount == 0 {
                slots.remove(key);
            }
        }
    }
}

/// A handle into a [`Registry`]. Dropping it (or calling [`Handle::close`]
/// explicitly) decrements the refcount of the underlying singleton; the
/// connection itself is only released when the last handle is dropped.
///
/// A handle built outside a registry (via [`Handle::standalone`]) has no
/// `key` and its drop is a no-op on any registry — closing it can never
/// clobber a singleton with the same connection parameters.
pub struct Handle<K: Eq + Hash + Clone, V> {
    key: Option<K>,
    value: Arc<V>,
    refcount: Option<Arc<Registry<K, V>>>,
}

impl<K: Eq + Hash + Clone, V> Handle<K, V> {
    pub fn standalone(value: V) -> Self {
        Self {
            key: None,
            value: Arc::new(value),
            refcount: None,
        }
    }

    pub fn get(&self) -> &V {
        &self.value
    }
}

impl<K: Eq + Hash + Clone, V> Handle<K, V> {
    pub fn bind(mut self, registry: Arc<Registry<K, V>>) -> Self {
        self.refcount = Some(registry);
        self
    }

    pub fn close(mut self) {
        if let (Some(key), Some(registry)) = (self.key.take(), self.refcount.take()) {
            registry.release(&key);
        }
    }
}

impl<K: Eq + Hash + Clone, V> Drop for Handle<K, V> {
    fn drop(&mut self) {
        if let (Some(key), Some(registry)) = (self.key.take(), self.refcount.take()) {
            registry.release(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_last_close_releases() {
        let registry = Arc::new(Registry::<String, u32>::new());
        let a: Result<Handle<String, u32>, ()> =
            registry.get_or_create("db".to_string(), || Ok(42));
        let a = a.unwrap().bind(registry.clone());
        let b: Result<Handle<String, u32>, ()> =
            registry.get_or_create("db".to_string(), || Ok(0));
        let b = b.unwrap().bind(registry.clone());
        assert_eq!(*a.get(), 42);
        assert_eq!(registry.slots.lock().unwrap().get("db").unwrap().refcount, 2);
        drop(a);
        assert_eq!(registry.slots.lock().unwrap().get("db").unwrap().refcount, 1);
        drop(b);
        assert!(registry.slots.lock().unwrap().get("db").is_none());
    }

    #[test]
    fn standalone_close_never_touches_registry() {
        let registry = Arc::new(Registry::<String, u32>::new());
        let a: Handle<String, u32> = registry
            .get_or_create::<_, ()>("db".to_string(), || Ok(1))
            .unwrap()
            .bind(registry.clone());
        let standalone: Handle<String, u32> = Handle::standalone(1);
        standalone.close();
        assert_eq!(registry.slots.lock().unwrap().get("db").unwrap().refcount, 1);
        drop(a);
    }
}
