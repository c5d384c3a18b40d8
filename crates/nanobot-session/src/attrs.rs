//! Typed session attributes.
//!
//! Components register typed slots instead of stuffing loosely typed values
//! under ad-hoc string keys. A slot is ephemeral unless stored through
//! [`AttrBag::set_persistable`], which captures a serializer so the store
//! can round-trip it; on load, persisted values sit in a restored pool until
//! their owning component claims them with the matching deserializer.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// A typed key. Declare one `const` per slot.
pub struct AttrKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttrKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

type AnyValue = Arc<dyn Any + Send + Sync>;
type SerializeFn = Arc<dyn Fn(&AnyValue) -> Option<Value> + Send + Sync>;

struct Slot {
    value: AnyValue,
    serialize: Option<SerializeFn>,
}

/// The session attribute bag.
#[derive(Default)]
pub struct AttrBag {
    slots: HashMap<&'static str, Slot>,
    /// Persisted values loaded from the store, not yet claimed by a typed
    /// slot. Kept verbatim so unclaimed entries still round-trip.
    restored: HashMap<String, Value>,
}

impl AttrBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the value out of a slot.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &AttrKey<T>) -> Option<T> {
        self.slots
            .get(key.name)
            .and_then(|slot| slot.value.downcast_ref::<T>())
            .cloned()
    }

    /// Set an ephemeral slot; never survives a store round-trip.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &AttrKey<T>, value: T) {
        self.slots.insert(
            key.name,
            Slot {
                value: Arc::new(value),
                serialize: None,
            },
        );
    }

    /// Set a slot that survives the store round-trip as JSON.
    pub fn set_persistable<T>(&mut self, key: &AttrKey<T>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let name = key.name;
        let serialize: SerializeFn = Arc::new(move |any: &AnyValue| {
            let typed = any.downcast_ref::<T>()?;
            match serde_json::to_value(typed) {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(slot = name, error = %err, "attribute failed to serialize");
                    None
                }
            }
        });
        self.restored.remove(name);
        self.slots.insert(
            name,
            Slot {
                value: Arc::new(value),
                serialize: Some(serialize),
            },
        );
    }

    /// Claim a restored value for a typed slot. The value becomes a live
    /// persistable slot and is returned; absent or undecodable values yield
    /// `None`.
    pub fn restore<T>(&mut self, key: &AttrKey<T>) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(live) = self.get(key) {
            return Some(live);
        }
        let raw = self.restored.remove(key.name)?;
        match serde_json::from_value::<T>(raw) {
            Ok(value) => {
                self.set_persistable(key, value.clone());
                Some(value)
            }
            Err(err) => {
                warn!(slot = key.name, error = %err, "persisted attribute undecodable");
                None
            }
        }
    }

    pub fn remove<T>(&mut self, key: &AttrKey<T>) {
        self.slots.remove(key.name);
        self.restored.remove(key.name);
    }

    /// The persistable subset as a JSON map, including restored entries no
    /// component has claimed yet.
    pub fn persistable_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, value) in &self.restored {
            out.insert(name.clone(), value.clone());
        }
        for (name, slot) in &self.slots {
            if let Some(serialize) = &slot.serialize {
                if let Some(value) = serialize(&slot.value) {
                    out.insert((*name).to_string(), value);
                }
            }
        }
        out
    }

    /// Install the persisted map loaded from the store.
    pub fn load_persisted(&mut self, map: Map<String, Value>) {
        for (name, value) in map {
            self.restored.insert(name, value);
        }
    }
}
