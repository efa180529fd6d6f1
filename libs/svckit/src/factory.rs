//! Service factory: type name -> constructor.
//!
//! Service crates submit a [`ServiceRegistrator`] through `inventory`; the
//! host calls [`ServiceFactory::discover`] once at startup. Tests build a
//! factory directly with [`FactoryBuilder`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::PARALLEL_UPDATER;
use crate::error::ConfigurationError;
use crate::service::Service;
use crate::updater::ParallelUpdater;

pub type Constructor = Arc<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// The function type submitted via `inventory::submit!`.
pub struct ServiceRegistrator(pub fn(&mut FactoryBuilder));

inventory::collect!(ServiceRegistrator);

fn register_builtins(b: &mut FactoryBuilder) {
    b.register_default::<ParallelUpdater>(PARALLEL_UPDATER);
}

inventory::submit! {
    ServiceRegistrator(register_builtins)
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid factory configuration:\n{errors:#?}")]
    InvalidFactoryConfiguration { errors: Vec<String> },
}

#[derive(Default)]
pub struct FactoryBuilder {
    ctors: HashMap<String, Constructor>,
    errors: Vec<String>,
}

impl FactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-filled with the built-in service types, for hosts and tests
    /// that do not use discovery.
    pub fn with_builtins() -> Self {
        let mut b = Self::default();
        register_builtins(&mut b);
        b
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        ctor: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) -> &mut Self {
        let type_name = type_name.into();
        if self.ctors.contains_key(&type_name) {
            self.errors
                .push(format!("service type '{type_name}' is already registered"));
            return self;
        }
        self.ctors.insert(type_name, Arc::new(ctor));
        self
    }

    pub fn register_default<S: Service + Default>(&mut self, type_name: impl Into<String>) -> &mut Self {
        self.register(type_name, || Arc::new(S::default()) as Arc<dyn Service>)
    }

    pub fn build(self) -> Result<ServiceFactory, FactoryError> {
        if !self.errors.is_empty() {
            return Err(FactoryError::InvalidFactoryConfiguration {
                errors: self.errors,
            });
        }
        Ok(ServiceFactory { ctors: self.ctors })
    }
}

pub struct ServiceFactory {
    ctors: HashMap<String, Constructor>,
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("types", &self.type_names())
            .finish()
    }
}

impl ServiceFactory {
    /// Every `inventory`-submitted registrator, built-ins included.
    pub fn discover() -> Result<Self, FactoryError> {
        let mut b = FactoryBuilder::new();
        for r in ::inventory::iter::<ServiceRegistrator> {
            r.0(&mut b);
        }
        b.build()
    }

    pub fn create(&self, type_name: &str) -> Result<Arc<dyn Service>, ConfigurationError> {
        self.ctors
            .get(type_name)
            .map(|ctor| ctor())
            .ok_or_else(|| ConfigurationError::UnknownServiceType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.ctors.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
