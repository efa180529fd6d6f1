//! The service contract and the context handed to its hooks.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::config::{Access, BindingDecl, ConfigNode};
use crate::error::{ConfigurationError, SvcError};
use crate::lifecycle::{ServiceHandle, ServiceState};
use crate::object::{ObjectRef, MODIFIED_SIG};
use crate::proxy::{Blocker, PendingEmission, SignalRef, SlotArgs, SlotRef};
use crate::runtime::AppContext;

/// How many objects a key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Group { min: usize, max: usize },
}

/// A binding a service type declares; configured bindings are checked
/// against these in `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub key: String,
    pub access: Access,
    pub cardinality: Cardinality,
    pub optional: bool,
}

impl BindingSpec {
    fn new(key: impl Into<String>, access: Access) -> Self {
        Self {
            key: key.into(),
            access,
            cardinality: Cardinality::Single,
            optional: false,
        }
    }

    pub fn input(key: impl Into<String>) -> Self {
        Self::new(key, Access::In)
    }

    pub fn inout(key: impl Into<String>) -> Self {
        Self::new(key, Access::InOut)
    }

    pub fn output(key: impl Into<String>) -> Self {
        Self::new(key, Access::Out)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn group(mut self, min: usize, max: usize) -> Self {
        self.cardinality = Cardinality::Group { min, max };
        self
    }
}

/// Handler behind a custom slot.
pub type SlotHandler =
    Arc<dyn Fn(ServiceCtx, SlotArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A behavior unit driven by the lifecycle controller.
///
/// Hooks run as jobs on the service's worker, never concurrently with each
/// other for the same service.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Declared bindings. An empty list disables the shape check.
    fn bindings(&self) -> Vec<BindingSpec> {
        Vec::new()
    }

    /// `(object signal, own slot)` pairs wired for every `autoConnect` binding.
    fn auto_connections(&self) -> Vec<(String, String)> {
        vec![(MODIFIED_SIG.to_string(), "update".to_string())]
    }

    async fn configuring(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn starting(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()>;

    async fn stopping(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// An optional binding under `key` was bound or unbound while running.
    async fn swapping(&self, _ctx: &ServiceCtx, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Per-service view handed to hooks and slot handlers.
#[derive(Clone)]
pub struct ServiceCtx {
    handle: Arc<ServiceHandle>,
}

impl std::fmt::Debug for ServiceCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCtx")
            .field("service", &self.handle.uid())
            .finish()
    }
}

impl ServiceCtx {
    pub(crate) fn new(handle: Arc<ServiceHandle>) -> Self {
        Self { handle }
    }

    pub fn uid(&self) -> &str {
        self.handle.uid()
    }

    pub fn type_name(&self) -> &str {
        self.handle.type_name()
    }

    pub fn state(&self) -> ServiceState {
        self.handle.state()
    }

    pub fn handle(&self) -> &Arc<ServiceHandle> {
        &self.handle
    }

    pub fn app(&self) -> &Arc<AppContext> {
        self.handle.app()
    }

    pub fn config_node(&self) -> &ConfigNode {
        self.handle.config()
    }

    /// Deserializes the service's `config` subtree. A missing subtree reads
    /// as an empty map, so configs with `#[serde(default)]` still load.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, SvcError> {
        let value = match self.handle.config().to_json() {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            v => v,
        };
        serde_json::from_value(value).map_err(|e| {
            ConfigurationError::InvalidValue {
                key: format!("{}.config", self.uid()),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn binding(&self, key: &str, index: usize) -> Option<&BindingDecl> {
        self.handle
            .bindings()
            .iter()
            .find(|b| b.key == key && b.index == index && b.access != Access::Out)
    }

    fn read(&self, key: &str, index: usize) -> Result<Option<ObjectRef>, SvcError> {
        let Some(binding) = self.binding(key, index) else {
            return Ok(None);
        };
        let state = self.state();
        if !binding.optional && !state.holds_inputs() {
            return Err(SvcError::LifecycleViolation {
                service: self.uid().to_string(),
                op: "read input",
                state,
            });
        }
        Ok(self.handle.resolved(key, index))
    }

    /// The object bound to `key`. Optional and unresolved reads yield `None`.
    pub fn input(&self, key: &str) -> Result<Option<ObjectRef>, SvcError> {
        self.read(key, 0)
    }

    pub fn inout(&self, key: &str) -> Result<Option<ObjectRef>, SvcError> {
        self.read(key, 0)
    }

    /// Member `index` of a group binding.
    pub fn input_at(&self, key: &str, index: usize) -> Result<Option<ObjectRef>, SvcError> {
        self.read(key, index)
    }

    pub fn group_len(&self, key: &str) -> usize {
        self.handle.bindings().iter().filter(|b| b.key == key).count()
    }

    /// Produces (or, with `None`, withdraws) the object bound to output `key`.
    pub async fn set_output(&self, key: &str, object: Option<ObjectRef>) -> Result<(), SvcError> {
        self.handle.set_output(key, object).await
    }

    pub fn output(&self, key: &str) -> Option<ObjectRef> {
        self.handle.output(key)
    }

    pub fn declare_signal(&self, name: &str, arity: usize) -> Result<(), SvcError> {
        self.handle.declare_signal(name, arity)
    }

    pub fn declare_slot(&self, name: &str, handler: SlotHandler) -> Result<(), SvcError> {
        self.handle.declare_slot(name, handler)
    }

    /// Synchronous emission of this service's signal `name`.
    pub async fn emit(&self, name: &str, args: SlotArgs) -> Result<(), SvcError> {
        self.app()
            .bus
            .emit(&SignalRef::new(self.uid(), name), args)
            .await
    }

    pub fn async_emit(&self, name: &str, args: SlotArgs) -> Result<PendingEmission, SvcError> {
        self.app()
            .bus
            .async_emit(&SignalRef::new(self.uid(), name), args)
    }

    /// `modified` signal of the object bound to `key`, if any.
    pub fn modified_signal(&self, key: &str) -> Option<SignalRef> {
        self.handle
            .bindings()
            .iter()
            .find(|b| b.key == key)
            .map(|b| SignalRef::modified(b.uid.clone()))
    }

    /// Emits `modified` on the object bound to `key`.
    pub async fn notify_modified(&self, key: &str) -> Result<(), SvcError> {
        let Some(signal) = self.modified_signal(key) else {
            return Err(ConfigurationError::MissingKey {
                service: self.uid().to_string(),
                key: key.to_string(),
            }
            .into());
        };
        self.app().bus.emit(&signal, Vec::new()).await
    }

    /// Suppresses `signal -> <this service>/slot_key` while the guard lives.
    pub fn block(&self, signal: &SignalRef, slot_key: &str) -> Option<Blocker> {
        self.app()
            .bus
            .blocker(signal, &SlotRef::new(self.uid(), slot_key))
    }

    /// Builds an owned sub-service. It is configured but not started; it is
    /// stopped and destroyed together with this service.
    pub async fn create_sub_service(
        &self,
        type_name: &str,
        uid: &str,
        bindings: Vec<BindingDecl>,
        config: Option<ConfigNode>,
    ) -> Result<Arc<ServiceHandle>, SvcError> {
        self.handle
            .create_sub_service(type_name, uid, bindings, config)
            .await
    }
}
