//! Lifecycle controller - per-service state machine.
//!
//! Every operation is posted as a job to the service's worker, so operations
//! on one service are serialized in FIFO order and `stop` waits for whatever
//! was queued before it. A failed hook leaves the service in the last state it
//! validly reached.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use futures::future::BoxFuture;
use tracing::{instrument, Instrument};

use crate::config::{Access, BindingDecl, ConfigNode, ServiceDecl};
use crate::error::{ConfigurationError, SvcError};
use crate::object::ObjectRef;
use crate::proxy::{SignalRef, SlotArgs, SlotRef, SlotTarget};
use crate::runtime::AppContext;
use crate::service::{BindingSpec, Cardinality, Service, ServiceCtx, SlotHandler};
use crate::worker::{self, Worker};

pub const STARTED_SIG: &str = "started";
pub const UPDATED_SIG: &str = "updated";
pub const SWAPPED_SIG: &str = "swapped";
pub const STOPPED_SIG: &str = "stopped";

const BUILTIN_SIGNALS: [(&str, usize); 4] = [
    (STARTED_SIG, 0),
    (UPDATED_SIG, 0),
    (SWAPPED_SIG, 1),
    (STOPPED_SIG, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Unconfigured,
    Configured,
    Starting,
    Started,
    Updating,
    Swapping,
    Stopping,
    Stopped,
    Destroyed,
}

impl ServiceState {
    /// States in which mandatory inputs are held.
    pub fn holds_inputs(self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Started
                | ServiceState::Updating
                | ServiceState::Swapping
                | ServiceState::Stopping
        )
    }

    fn is_idle(self) -> bool {
        matches!(
            self,
            ServiceState::Unconfigured | ServiceState::Configured | ServiceState::Stopped
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Unconfigured => "unconfigured",
            ServiceState::Configured => "configured",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Updating => "updating",
            ServiceState::Swapping => "swapping",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A channel endpoint from a `connect` block, connected while started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Signal { channel: String, key: String },
    Slot { channel: String, key: String },
}

/// A built service: the user's [`Service`] plus everything the runtime keeps
/// about it.
pub struct ServiceHandle {
    uid: String,
    type_name: String,
    owner: Option<String>,
    service: Arc<dyn Service>,
    app: Arc<AppContext>,
    worker: Arc<Worker>,
    config: ConfigNode,
    bindings: Vec<BindingDecl>,
    state: RwLock<ServiceState>,
    resolved: RwLock<HashMap<(String, usize), ObjectRef>>,
    outputs: RwLock<HashMap<String, ObjectRef>>,
    signals: RwLock<HashMap<String, usize>>,
    slots: RwLock<HashMap<String, SlotHandler>>,
    endpoints: Mutex<Vec<Endpoint>>,
    auto_channels: Mutex<Vec<String>>,
    subs: Mutex<Vec<Arc<ServiceHandle>>>,
    me: Weak<ServiceHandle>,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("uid", &self.uid)
            .field("type", &self.type_name)
            .field("state", &*self.state.read())
            .field("worker", &self.worker.name())
            .finish()
    }
}

impl ServiceHandle {
    /// Instantiates `decl` through the factory, registers it and configures it.
    ///
    /// The handle is deregistered again if configuration fails.
    pub async fn build(
        app: &Arc<AppContext>,
        decl: &ServiceDecl,
        owner: Option<&str>,
    ) -> Result<Arc<Self>, SvcError> {
        let service = app.factory.create(&decl.type_name)?;
        let worker = match &decl.worker {
            Some(name) => app.workers.named(name),
            None => Worker::spawn(decl.uid.clone()),
        };

        let handle = Arc::new_cyclic(|me| Self {
            uid: decl.uid.clone(),
            type_name: decl.type_name.clone(),
            owner: owner.map(str::to_string),
            service,
            app: Arc::clone(app),
            worker,
            config: decl.config.clone(),
            bindings: decl.bindings.clone(),
            state: RwLock::new(ServiceState::Unconfigured),
            resolved: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            endpoints: Mutex::new(Vec::new()),
            auto_channels: Mutex::new(Vec::new()),
            subs: Mutex::new(Vec::new()),
            me: me.clone(),
        });

        app.services.register(Arc::clone(&handle))?;
        for (name, arity) in BUILTIN_SIGNALS {
            app.bus.declare_signal(SignalRef::new(&decl.uid, name), arity);
        }

        if let Err(e) = handle.configure().await {
            app.services.deregister(&decl.uid);
            app.bus.forget_signals(&decl.uid);
            return Err(e);
        }
        tracing::debug!(service = %decl.uid, service_type = %decl.type_name, "Service built");
        Ok(handle)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Typed access to the user's service.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.service.as_any().downcast_ref::<T>()
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    pub fn bindings(&self) -> &[BindingDecl] {
        &self.bindings
    }

    pub fn sub_services(&self) -> Vec<Arc<ServiceHandle>> {
        self.subs.lock().clone()
    }

    pub(crate) fn resolved(&self, key: &str, index: usize) -> Option<ObjectRef> {
        self.resolved
            .read()
            .get(&(key.to_string(), index))
            .cloned()
    }

    pub fn output(&self, key: &str) -> Option<ObjectRef> {
        self.outputs.read().get(key).cloned()
    }

    /// Uids of objects this service needs before it can start.
    pub fn mandatory_objects(&self) -> impl Iterator<Item = &str> {
        self.bindings
            .iter()
            .filter(|b| b.is_mandatory_input())
            .map(|b| b.uid.as_str())
    }

    fn me(&self) -> Result<Arc<Self>, SvcError> {
        self.me
            .upgrade()
            .ok_or_else(|| SvcError::UnknownService(self.uid.clone()))
    }

    fn ctx(&self) -> Result<ServiceCtx, SvcError> {
        self.me().map(ServiceCtx::new)
    }

    fn set_state(&self, state: ServiceState) {
        let prev = std::mem::replace(&mut *self.state.write(), state);
        tracing::trace!(service = %self.uid, from = %prev, to = %state, "State changed");
    }

    fn violation(&self, op: &'static str) -> SvcError {
        SvcError::LifecycleViolation {
            service: self.uid.clone(),
            op,
            state: self.state(),
        }
    }

    fn hook_error(&self, op: &'static str, source: anyhow::Error) -> SvcError {
        SvcError::Hook {
            service: self.uid.clone(),
            op,
            source,
        }
    }

    /// Refuses an operation that would wait on a job already running for this
    /// service further up the call chain.
    fn guard_reentry(&self, slot: &str) -> Result<(), SvcError> {
        if worker::in_chain(&self.uid) {
            return Err(SvcError::ReentrancyDeadlock {
                service: self.uid.clone(),
                slot: slot.to_string(),
            });
        }
        Ok(())
    }

    // --- operations ---

    #[instrument(name = "svckit.service.configure", skip(self), fields(service = %self.uid))]
    pub async fn configure(&self) -> Result<(), SvcError> {
        self.guard_reentry("configure")?;
        let me = self.me()?;
        self.worker
            .run(&self.uid, async move { me.configure_job().await })
            .await
    }

    #[instrument(name = "svckit.service.start", skip(self), fields(service = %self.uid))]
    pub async fn start(&self) -> Result<(), SvcError> {
        self.guard_reentry("start")?;
        let me = self.me()?;
        self.worker
            .run(&self.uid, async move { me.start_job().await })
            .await
    }

    #[instrument(name = "svckit.service.update", skip(self), fields(service = %self.uid))]
    pub async fn update(&self) -> Result<(), SvcError> {
        self.guard_reentry("update")?;
        let me = self.me()?;
        self.worker
            .run(&self.uid, async move { me.update_job().await })
            .await
    }

    /// Boxed: stopping a service stops its sub-services through this same
    /// method.
    pub fn stop(&self) -> BoxFuture<'_, Result<(), SvcError>> {
        let span = tracing::info_span!("svckit.service.stop", service = %self.uid);
        Box::pin(
            async move {
                self.guard_reentry("stop")?;
                let me = self.me()?;
                self.worker
                    .run(&self.uid, async move { me.stop_job().await })
                    .await
            }
            .instrument(span),
        )
    }

    pub fn destroy(&self) -> BoxFuture<'_, Result<(), SvcError>> {
        let span = tracing::info_span!("svckit.service.destroy", service = %self.uid);
        Box::pin(
            async move {
                self.guard_reentry("destroy")?;
                let me = self.me()?;
                self.worker
                    .run(&self.uid, async move { me.destroy_job().await })
                    .await
            }
            .instrument(span),
        )
    }

    /// Runs `swapping(key)` on a started service and emits `swapped`.
    pub async fn swap_key(&self, key: &str) -> Result<(), SvcError> {
        self.guard_reentry("swap")?;
        let me = self.me()?;
        let key = key.to_string();
        self.worker
            .run(&self.uid, async move {
                if me.state() != ServiceState::Started {
                    return Err(me.violation("swap"));
                }
                me.swap_job(&key).await
            })
            .await
    }

    /// Binds (`Some`) or unbinds (`None`) the optional bindings that reference
    /// `object_uid`, then swaps each affected key. No-op unless started.
    pub(crate) async fn rebind(&self, object_uid: &str, object: Option<ObjectRef>) -> Result<(), SvcError> {
        self.guard_reentry("swap")?;
        let me = self.me()?;
        let object_uid = object_uid.to_string();
        self.worker
            .run(&self.uid, async move {
                if me.state() != ServiceState::Started {
                    return Ok(());
                }
                let mut keys: Vec<String> = Vec::new();
                for b in me.bindings.iter().filter(|b| b.uid == object_uid && b.optional && b.access != Access::Out) {
                    let slot = (b.key.clone(), b.index);
                    match &object {
                        Some(obj) => {
                            if me.app.objects.acquire(&b.uid, &me.uid).is_some() {
                                me.resolved.write().insert(slot, Arc::clone(obj));
                            }
                        }
                        None => {
                            me.resolved.write().remove(&slot);
                        }
                    }
                    if !keys.contains(&b.key) {
                        keys.push(b.key.clone());
                    }
                }
                if keys.is_empty() {
                    return Ok(());
                }
                me.refresh_auto_connections();
                for key in keys {
                    me.swap_job(&key).await?;
                }
                Ok(())
            })
            .await
    }

    /// Adds a `connect` endpoint; it is connected now if the service runs and
    /// on every later start.
    pub(crate) fn add_endpoint(&self, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.lock();
        if endpoints.contains(&endpoint) {
            return;
        }
        if self.state().holds_inputs() {
            self.connect_endpoint(&endpoint);
        }
        endpoints.push(endpoint);
    }

    // --- jobs (run on the worker) ---

    async fn configure_job(&self) -> Result<(), SvcError> {
        if !self.state().is_idle() {
            return Err(self.violation("configure"));
        }
        self.check_shape()?;
        let ctx = self.ctx()?;
        self.service
            .configuring(&ctx)
            .await
            .map_err(|e| self.hook_error("configure", e))?;
        self.set_state(ServiceState::Configured);
        Ok(())
    }

    async fn start_job(&self) -> Result<(), SvcError> {
        let prev = self.state();
        if !matches!(prev, ServiceState::Configured | ServiceState::Stopped) {
            return Err(self.violation("start"));
        }
        let ctx = self.ctx()?;
        self.acquire_inputs().await?;
        self.set_state(ServiceState::Starting);
        self.connect_all();

        if let Err(e) = self.service.starting(&ctx).await {
            tracing::error!(service = %self.uid, error = %e, "Service failed to start");
            self.disconnect_all();
            self.release_inputs().await;
            self.withdraw_outputs().await;
            self.set_state(prev);
            return Err(self.hook_error("start", e));
        }

        self.set_state(ServiceState::Started);
        tracing::info!(service = %self.uid, "Service started");
        self.emit_builtin(STARTED_SIG, Vec::new()).await;
        Ok(())
    }

    async fn update_job(&self) -> Result<(), SvcError> {
        if self.state() != ServiceState::Started {
            return Err(self.violation("update"));
        }
        self.set_state(ServiceState::Updating);
        let ctx = self.ctx()?;
        let res = self.service.updating(&ctx).await;
        self.set_state(ServiceState::Started);
        if let Err(e) = res {
            tracing::error!(service = %self.uid, error = %e, "Service update failed");
            return Err(self.hook_error("update", e));
        }
        self.emit_builtin(UPDATED_SIG, Vec::new()).await;
        Ok(())
    }

    async fn swap_job(&self, key: &str) -> Result<(), SvcError> {
        self.set_state(ServiceState::Swapping);
        let ctx = self.ctx()?;
        let res = self.service.swapping(&ctx, key).await;
        self.set_state(ServiceState::Started);
        if let Err(e) = res {
            tracing::error!(service = %self.uid, key, error = %e, "Service swap failed");
            return Err(self.hook_error("swap", e));
        }
        self.emit_builtin(SWAPPED_SIG, vec![serde_json::Value::from(key)])
            .await;
        Ok(())
    }

    async fn stop_job(&self) -> Result<(), SvcError> {
        if self.state() != ServiceState::Started {
            return Err(self.violation("stop"));
        }
        self.set_state(ServiceState::Stopping);

        let subs = self.sub_services();
        for sub in subs.iter().rev() {
            if sub.state() != ServiceState::Started {
                continue;
            }
            if let Err(e) = sub.stop().await {
                tracing::warn!(service = %self.uid, sub = %sub.uid, error = %e, "Failed to stop sub-service");
            }
        }

        let ctx = self.ctx()?;
        if let Err(e) = self.service.stopping(&ctx).await {
            tracing::error!(service = %self.uid, error = %e, "Service failed to stop");
            self.set_state(ServiceState::Started);
            return Err(self.hook_error("stop", e));
        }

        self.emit_builtin(STOPPED_SIG, Vec::new()).await;
        self.disconnect_all();
        self.release_inputs().await;
        self.withdraw_outputs().await;
        self.set_state(ServiceState::Stopped);
        tracing::info!(service = %self.uid, "Service stopped");
        Ok(())
    }

    async fn destroy_job(&self) -> Result<(), SvcError> {
        if !self.state().is_idle() {
            return Err(self.violation("destroy"));
        }
        let subs: Vec<_> = std::mem::take(&mut *self.subs.lock());
        for sub in subs.iter().rev() {
            if sub.state() == ServiceState::Started {
                if let Err(e) = sub.stop().await {
                    tracing::warn!(service = %self.uid, sub = %sub.uid, error = %e, "Failed to stop sub-service");
                }
            }
            if sub.state() == ServiceState::Destroyed {
                continue;
            }
            if let Err(e) = sub.destroy().await {
                tracing::warn!(service = %self.uid, sub = %sub.uid, error = %e, "Failed to destroy sub-service");
            }
        }

        self.set_state(ServiceState::Destroyed);
        self.endpoints.lock().clear();
        self.slots.write().clear();
        self.app.services.deregister(&self.uid);
        self.app.bus.forget_signals(&self.uid);
        tracing::debug!(service = %self.uid, "Service destroyed");
        Ok(())
    }

    // --- helpers ---

    fn check_shape(&self) -> Result<(), SvcError> {
        let specs = self.service.bindings();
        if specs.is_empty() {
            return Ok(());
        }
        for b in &self.bindings {
            if !specs.iter().any(|s| s.key == b.key) {
                return Err(ConfigurationError::UnexpectedKey {
                    service: self.uid.clone(),
                    key: b.key.clone(),
                }
                .into());
            }
        }
        for spec in &specs {
            self.check_spec(spec)?;
        }
        Ok(())
    }

    fn check_spec(&self, spec: &BindingSpec) -> Result<(), ConfigurationError> {
        let members: Vec<&BindingDecl> = self.bindings.iter().filter(|b| b.key == spec.key).collect();
        if members.is_empty() {
            if spec.optional {
                return Ok(());
            }
            return Err(ConfigurationError::MissingKey {
                service: self.uid.clone(),
                key: spec.key.clone(),
            });
        }
        if let Some(b) = members.iter().find(|b| b.access != spec.access) {
            return Err(ConfigurationError::AccessMismatch {
                service: self.uid.clone(),
                key: spec.key.clone(),
                expected: spec.access,
                found: b.access,
            });
        }
        let (min, max, fits) = match spec.cardinality {
            Cardinality::Single => (1, 1, members.len() == 1 && !members[0].grouped),
            Cardinality::Group { min, max } => (min, max, (min..=max).contains(&members.len())),
        };
        if !fits {
            return Err(ConfigurationError::GroupSize {
                service: self.uid.clone(),
                key: spec.key.clone(),
                count: members.len(),
                min,
                max,
            });
        }
        Ok(())
    }

    async fn acquire_inputs(&self) -> Result<(), SvcError> {
        let objects = &self.app.objects;
        let mut acquired = HashMap::new();
        let mut missing = Vec::new();
        for b in self.bindings.iter().filter(|b| b.access != Access::Out) {
            match objects.acquire(&b.uid, &self.uid) {
                Some(obj) => {
                    acquired.insert((b.key.clone(), b.index), obj);
                }
                None if b.optional => {}
                None => missing.push(b.uid.clone()),
            }
        }
        if !missing.is_empty() {
            for b in self.bindings.iter().filter(|b| acquired.contains_key(&(b.key.clone(), b.index))) {
                objects.release(&b.uid, &self.uid).await;
            }
            return Err(SvcError::UnresolvedDependency {
                service: self.uid.clone(),
                missing,
            });
        }
        *self.resolved.write() = acquired;
        Ok(())
    }

    async fn release_inputs(&self) {
        let held: Vec<(String, usize)> = self.resolved.write().drain().map(|(k, _)| k).collect();
        for (key, index) in held {
            if let Some(b) = self.bindings.iter().find(|b| b.key == key && b.index == index) {
                self.app.objects.release(&b.uid, &self.uid).await;
            }
        }
    }

    async fn withdraw_outputs(&self) {
        let produced: Vec<String> = self.outputs.write().drain().map(|(k, _)| k).collect();
        for key in produced {
            let Some(b) = self.output_binding(&key) else {
                continue;
            };
            if let Err(e) = self.app.objects.withdraw(&b.uid, &self.uid).await {
                tracing::warn!(service = %self.uid, object = %b.uid, error = %e, "Failed to withdraw output");
            }
        }
    }

    fn output_binding(&self, key: &str) -> Option<&BindingDecl> {
        self.bindings
            .iter()
            .find(|b| b.key == key && b.access == Access::Out)
    }

    pub(crate) async fn set_output(&self, key: &str, object: Option<ObjectRef>) -> Result<(), SvcError> {
        let Some(binding) = self.output_binding(key) else {
            tracing::trace!(service = %self.uid, key, "Output is not bound");
            return Ok(());
        };
        match object {
            Some(obj) => {
                self.app
                    .objects
                    .publish(&binding.uid, Arc::clone(&obj), &self.uid)
                    .await?;
                self.outputs.write().insert(key.to_string(), obj);
            }
            None => {
                self.outputs.write().remove(key);
                self.app.objects.withdraw(&binding.uid, &self.uid).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn declare_signal(&self, name: &str, arity: usize) -> Result<(), SvcError> {
        if !self.state().is_idle() {
            return Err(self.violation("declare a signal"));
        }
        self.signals.write().insert(name.to_string(), arity);
        self.app
            .bus
            .declare_signal(SignalRef::new(&self.uid, name), arity);
        Ok(())
    }

    pub(crate) fn declare_slot(&self, name: &str, handler: SlotHandler) -> Result<(), SvcError> {
        if !self.state().is_idle() {
            return Err(self.violation("declare a slot"));
        }
        self.slots.write().insert(name.to_string(), handler);
        Ok(())
    }

    pub fn signals(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_SIGNALS.iter().map(|(n, _)| n.to_string()).collect();
        names.extend(self.signals.read().keys().cloned());
        names
    }

    async fn emit_builtin(&self, name: &str, args: SlotArgs) {
        let signal = SignalRef::new(&self.uid, name);
        if let Err(e) = self.app.bus.emit(&signal, args).await {
            tracing::warn!(service = %self.uid, signal = name, error = %e, "Emission failed");
        }
    }

    fn slot_target(&self) -> Weak<dyn SlotTarget> {
        let weak: Weak<ServiceHandle> = self.me.clone();
        weak
    }

    fn connect_endpoint(&self, endpoint: &Endpoint) {
        match endpoint {
            Endpoint::Signal { channel, key } => {
                self.app
                    .bus
                    .connect_signal(channel, SignalRef::new(&self.uid, key));
            }
            Endpoint::Slot { channel, key } => {
                self.app
                    .bus
                    .connect_slot(channel, SlotRef::new(&self.uid, key), self.slot_target());
            }
        }
    }

    fn connect_all(&self) {
        for endpoint in self.endpoints.lock().iter() {
            self.connect_endpoint(endpoint);
        }
        self.refresh_auto_connections();
    }

    /// Wires `object signal -> own slot` for every resolved `autoConnect`
    /// binding and drops the wiring of unresolved ones.
    fn refresh_auto_connections(&self) {
        let pairs = self.service.auto_connections();
        let resolved = self.resolved.read();
        let mut channels = self.auto_channels.lock();
        for b in self.bindings.iter().filter(|b| b.auto_connect && b.access != Access::Out) {
            let present = resolved.contains_key(&(b.key.clone(), b.index));
            for (signal, slot) in &pairs {
                let channel = format!("{}/auto/{}#{}/{}", self.uid, b.key, b.index, signal);
                if present {
                    self.app
                        .bus
                        .connect_signal(&channel, SignalRef::new(&b.uid, signal));
                    self.app
                        .bus
                        .connect_slot(&channel, SlotRef::new(&self.uid, slot), self.slot_target());
                    if !channels.contains(&channel) {
                        channels.push(channel);
                    }
                } else if let Some(pos) = channels.iter().position(|c| *c == channel) {
                    self.app.bus.disconnect_channel(&channel);
                    channels.remove(pos);
                }
            }
        }
    }

    fn disconnect_all(&self) {
        for channel in self.auto_channels.lock().drain(..) {
            self.app.bus.disconnect_channel(&channel);
        }
        self.app.bus.disconnect_owner(&self.uid);
    }

    pub(crate) async fn create_sub_service(
        &self,
        type_name: &str,
        uid: &str,
        bindings: Vec<BindingDecl>,
        config: Option<ConfigNode>,
    ) -> Result<Arc<ServiceHandle>, SvcError> {
        if !matches!(
            self.state(),
            ServiceState::Starting | ServiceState::Started | ServiceState::Updating
        ) {
            return Err(self.violation("create a sub-service"));
        }
        let mut decl = ServiceDecl::new(uid, type_name);
        decl.bindings = bindings;
        if let Some(config) = config {
            decl.config = config;
        }
        let sub = ServiceHandle::build(&self.app, &decl, Some(&self.uid)).await?;
        self.subs.lock().push(Arc::clone(&sub));
        Ok(sub)
    }
}

#[async_trait]
impl SlotTarget for ServiceHandle {
    async fn invoke_slot(self: Arc<Self>, slot: &str, args: SlotArgs) -> Result<(), SvcError> {
        match slot {
            "start" => self.start().await,
            "stop" => self.stop().await,
            "update" => self.update().await,
            "swap" => {
                let key = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SvcError::ArityMismatch {
                        signal: format!("{}/swap", self.uid),
                        expected: 1,
                        got: args.len(),
                    })?
                    .to_string();
                self.swap_key(&key).await
            }
            custom => {
                let handler = self.slots.read().get(custom).cloned().ok_or_else(|| {
                    SvcError::UnknownSlot {
                        service: self.uid.clone(),
                        slot: custom.to_string(),
                    }
                })?;
                self.guard_reentry(custom)?;
                let ctx = ServiceCtx::new(Arc::clone(&self));
                let me = Arc::clone(&self);
                self.worker
                    .run(&self.uid, async move {
                        handler(ctx, args)
                            .await
                            .map_err(|e| me.hook_error("slot", e))
                    })
                    .await
            }
        }
    }
}
