use std::any::{Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Application values attached to a server or a connection, at most one per type. Handlers
///  reach them through their [crate::dispatch::correlation::RequestScope] or connection.
#[derive(Default)]
pub struct Extensions {
    values: RwLock<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Debug for Extensions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Extensions{{{} values}}", self.len())
    }
}

impl Extensions {
    pub fn new() -> Extensions {
        Extensions::default()
    }

    /// returns the value of the same type that was replaced, if any
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.insert_arc(Arc::new(value))
    }

    pub fn insert_arc<T: Any + Send + Sync>(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.values.write()
            .insert(TypeId::of::<T>(), value)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values.read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values.write()
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.read().contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}
