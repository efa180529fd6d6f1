//! Object registry: every live data object by uid.
//!
//! Objects are shared (`Arc`) among their holders. The producer is the first
//! holder; the entry is dropped when the producer withdraws it or the last
//! holder releases it. Observers (the resolver) hear about both transitions.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ConfigurationError, SvcError};

/// Signal every object exposes; emitted by producers after a change.
pub const MODIFIED_SIG: &str = "modified";

/// Opaque data holder with a JSON payload.
#[derive(Debug)]
pub struct Object {
    type_name: String,
    value: RwLock<serde_json::Value>,
    version: AtomicU64,
}

pub type ObjectRef = Arc<Object>;

impl Object {
    pub fn new(type_name: impl Into<String>, value: serde_json::Value) -> ObjectRef {
        Arc::new(Self {
            type_name: type_name.into(),
            value: RwLock::new(value),
            version: AtomicU64::new(0),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Clone of the current payload.
    pub fn get(&self) -> serde_json::Value {
        self.value.read().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&serde_json::Value) -> R) -> R {
        f(&self.value.read())
    }

    pub fn set(&self, value: serde_json::Value) {
        *self.value.write() = value;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Bumped on every [`set`](Self::set).
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Notified when an object appears in or disappears from the registry.
#[async_trait]
pub trait ObjectObserver: Send + Sync {
    async fn object_added(&self, uid: &str, object: &ObjectRef);
    async fn object_removed(&self, uid: &str);
}

struct Entry {
    object: ObjectRef,
    producer: String,
    holders: BTreeSet<String>,
}

#[derive(Default)]
pub struct ObjectRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    observers: RwLock<Vec<Weak<dyn ObjectObserver>>>,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.entries.read().len())
            .finish()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Weak<dyn ObjectObserver>) {
        self.observers.write().push(observer);
    }

    fn live_observers(&self) -> Vec<Arc<dyn ObjectObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Registers `object` under `uid` on behalf of `producer`.
    ///
    /// Re-publishing the same instance is a no-op; publishing a different
    /// instance replaces (withdraws, then adds) the previous one.
    pub async fn publish(&self, uid: &str, object: ObjectRef, producer: &str) -> Result<(), SvcError> {
        let replaced = {
            let entries = self.entries.read();
            match entries.get(uid) {
                Some(e) if e.producer != producer => {
                    return Err(ConfigurationError::DuplicateProducer {
                        object: uid.to_string(),
                        first: e.producer.clone(),
                        second: producer.to_string(),
                    }
                    .into())
                }
                Some(e) if Arc::ptr_eq(&e.object, &object) => return Ok(()),
                Some(_) => true,
                None => false,
            }
        };
        if replaced {
            self.withdraw(uid, producer).await?;
        }

        {
            let mut entries = self.entries.write();
            if let Some(e) = entries.get(uid) {
                return Err(ConfigurationError::DuplicateProducer {
                    object: uid.to_string(),
                    first: e.producer.clone(),
                    second: producer.to_string(),
                }
                .into());
            }
            entries.insert(
                uid.to_string(),
                Entry {
                    object: Arc::clone(&object),
                    producer: producer.to_string(),
                    holders: BTreeSet::from([producer.to_string()]),
                },
            );
        }
        tracing::debug!(object = %uid, producer, "Object published");

        for observer in self.live_observers() {
            observer.object_added(uid, &object).await;
        }
        Ok(())
    }

    /// Revokes `uid`. Only its producer may withdraw it. Returns false if the
    /// object was not registered.
    pub async fn withdraw(&self, uid: &str, producer: &str) -> Result<bool, SvcError> {
        {
            let mut entries = self.entries.write();
            match entries.get(uid) {
                None => return Ok(false),
                Some(e) if e.producer != producer => {
                    return Err(ConfigurationError::DuplicateProducer {
                        object: uid.to_string(),
                        first: e.producer.clone(),
                        second: producer.to_string(),
                    }
                    .into())
                }
                Some(_) => {
                    entries.remove(uid);
                }
            }
        }
        tracing::debug!(object = %uid, producer, "Object withdrawn");
        self.notify_removed(uid).await;
        Ok(true)
    }

    async fn notify_removed(&self, uid: &str) {
        for observer in self.live_observers() {
            observer.object_removed(uid).await;
        }
    }

    /// Takes a share of `uid` for `holder`.
    pub fn acquire(&self, uid: &str, holder: &str) -> Option<ObjectRef> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(uid)?;
        entry.holders.insert(holder.to_string());
        Some(Arc::clone(&entry.object))
    }

    /// Gives back `holder`'s share. The entry is dropped once no holder is
    /// left. Returns true if that happened.
    pub async fn release(&self, uid: &str, holder: &str) -> bool {
        let dropped = {
            let mut entries = self.entries.write();
            match entries.get_mut(uid) {
                Some(entry) => {
                    entry.holders.remove(holder);
                    if entry.holders.is_empty() {
                        entries.remove(uid);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if dropped {
            tracing::debug!(object = %uid, "Last holder released object");
            self.notify_removed(uid).await;
        }
        dropped
    }

    pub fn get(&self, uid: &str) -> Option<ObjectRef> {
        self.entries.read().get(uid).map(|e| Arc::clone(&e.object))
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.read().contains_key(uid)
    }

    pub fn producer_of(&self, uid: &str) -> Option<String> {
        self.entries.read().get(uid).map(|e| e.producer.clone())
    }

    pub fn holders(&self, uid: &str) -> Vec<String> {
        self.entries
            .read()
            .get(uid)
            .map(|e| e.holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
