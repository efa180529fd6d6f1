//! Service Manager - tracks every live service handle by uid

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{ConfigurationError, SvcError};
use crate::lifecycle::{ServiceHandle, ServiceState};

#[derive(Default)]
pub struct ServiceManager {
    services: DashMap<String, Arc<ServiceHandle>>,
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.uids())
            .finish()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle; the uid must not be live.
    pub fn register(&self, handle: Arc<ServiceHandle>) -> Result<(), SvcError> {
        use dashmap::mapref::entry::Entry;
        match self.services.entry(handle.uid().to_string()) {
            Entry::Occupied(e) => Err(ConfigurationError::DuplicateUid(e.key().clone()).into()),
            Entry::Vacant(v) => {
                v.insert(handle);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, uid: &str) -> Option<Arc<ServiceHandle>> {
        self.services.remove(uid).map(|(_, h)| h)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<ServiceHandle>> {
        self.services.get(uid).map(|e| e.value().clone())
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.services.contains_key(uid)
    }

    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        uids.sort();
        uids
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn of_type(&self, type_name: &str) -> Vec<Arc<ServiceHandle>> {
        self.services
            .iter()
            .filter(|e| e.value().type_name() == type_name)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn in_state(&self, state: ServiceState) -> Vec<String> {
        let mut uids: Vec<String> = self
            .services
            .iter()
            .filter(|e| e.value().state() == state)
            .map(|e| e.key().clone())
            .collect();
        uids.sort();
        uids
    }
}
