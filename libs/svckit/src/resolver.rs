//! Dependency resolver.
//!
//! [`AppConfigManager`] turns a configuration tree into live objects and
//! services. Services whose mandatory objects do not exist yet are deferred;
//! the manager observes the object registry and builds, starts, swaps or
//! tears down services as objects appear and disappear.
//!
//! Waiting services are not tracked per missing object: readiness is
//! recomputed from the registry on every event, so an object that is
//! withdrawn and produced again simply counts as present again.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{Access, AppDecl, ConfigNode, UpdaterChild};
use crate::error::{ConfigurationError, SvcError};
use crate::lifecycle::{Endpoint, ServiceHandle, ServiceState};
use crate::object::{Object, ObjectObserver, ObjectRef};
use crate::runtime::AppContext;
use crate::worker::{self, Worker};

/// Outcome of [`AppConfigManager::create`].
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Services built, in build order.
    pub built: Vec<String>,
    /// Services waiting for objects, with the objects they miss.
    pub deferred: Vec<(String, Vec<String>)>,
    /// Services whose instantiation or configuration failed.
    pub failures: Vec<(String, SvcError)>,
}

#[derive(Debug, Clone)]
enum Slot {
    Waiting,
    Building,
    Built(Arc<ServiceHandle>),
    Failed(String),
}

struct ManagerState {
    phase: ServiceState,
    slots: Vec<Slot>,
    created: Vec<String>,
    started: Vec<String>,
    owned_objects: Vec<String>,
}

pub struct AppConfigManager {
    uid: String,
    app: Arc<AppContext>,
    decl: ArcSwapOption<AppDecl>,
    state: Mutex<ManagerState>,
    me: Weak<AppConfigManager>,
    /// Runs object additions raised outside a resolver pass, in order.
    events: Arc<Worker>,
}

impl std::fmt::Debug for AppConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("AppConfigManager")
            .field("uid", &self.uid)
            .field("phase", &st.phase)
            .field("created", &st.created)
            .field("started", &st.started)
            .finish()
    }
}

impl AppConfigManager {
    pub fn new(app: Arc<AppContext>) -> Arc<Self> {
        Self::with_uid(app, format!("app-{}", uuid::Uuid::new_v4()))
    }

    /// The uid is the producer/holder name of config-declared objects. Must be
    /// called inside a tokio runtime.
    pub fn with_uid(app: Arc<AppContext>, uid: impl Into<String>) -> Arc<Self> {
        let uid = uid.into();
        let events = Worker::spawn(format!("{uid}.events"));
        let manager = Arc::new_cyclic(|me| Self {
            uid,
            app,
            decl: ArcSwapOption::empty(),
            state: Mutex::new(ManagerState {
                phase: ServiceState::Unconfigured,
                slots: Vec::new(),
                created: Vec::new(),
                started: Vec::new(),
                owned_objects: Vec::new(),
            }),
            me: me.clone(),
            events,
        });
        let weak: Weak<AppConfigManager> = Arc::downgrade(&manager);
        manager.app.objects.subscribe(weak);
        manager
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn phase(&self) -> ServiceState {
        self.state.lock().phase
    }

    pub fn decl(&self) -> Option<Arc<AppDecl>> {
        self.decl.load_full()
    }

    fn violation(&self, op: &'static str, state: ServiceState) -> SvcError {
        SvcError::LifecycleViolation {
            service: self.uid.clone(),
            op,
            state,
        }
    }

    fn transition(&self, from: &[ServiceState], to: ServiceState, op: &'static str) -> Result<(), SvcError> {
        let mut st = self.state.lock();
        if !from.contains(&st.phase) {
            return Err(self.violation(op, st.phase));
        }
        st.phase = to;
        Ok(())
    }

    fn set_phase(&self, phase: ServiceState) {
        self.state.lock().phase = phase;
    }

    fn accepting(&self) -> bool {
        matches!(
            self.phase(),
            ServiceState::Configured | ServiceState::Starting | ServiceState::Started
        )
    }

    fn running(&self) -> bool {
        matches!(self.phase(), ServiceState::Starting | ServiceState::Started)
    }

    // --- composition lifecycle ---

    /// Parses and validates `tree`, creates config objects and builds every
    /// service that is ready. The others stay deferred.
    pub async fn create(&self, tree: &ConfigNode) -> Result<BuildReport, SvcError> {
        {
            let st = self.state.lock();
            if st.phase != ServiceState::Unconfigured {
                return Err(self.violation("create", st.phase));
            }
        }
        let decl = Arc::new(AppDecl::parse(tree)?);
        validate(&decl)?;

        self.state.lock().slots = vec![Slot::Waiting; decl.services.len()];
        self.decl.store(Some(Arc::clone(&decl)));
        tracing::info!(
            app = %self.uid,
            objects = decl.objects.len(),
            services = decl.services.len(),
            "Creating composition"
        );

        worker::resolving(async {
            for o in decl.objects.iter().filter(|o| !o.deferred) {
                let object = Object::new(o.type_name.clone(), o.value.clone());
                self.app.objects.publish(&o.uid, object, &self.uid).await?;
                self.state.lock().owned_objects.push(o.uid.clone());
            }
            self.set_phase(ServiceState::Configured);

            let (built, failures) = self.resolve_ready(&decl).await;
            let report = BuildReport {
                built,
                deferred: self.deferred_services(),
                failures,
            };
            for (uid, missing) in &report.deferred {
                tracing::info!(service = %uid, missing = ?missing, "Service deferred");
            }
            Ok(report)
        })
        .await
    }

    /// Starts every built service: the `start` list first, then declaration
    /// order.
    pub async fn start(&self) -> Result<(), SvcError> {
        self.transition(
            &[ServiceState::Configured, ServiceState::Stopped],
            ServiceState::Starting,
            "start",
        )?;
        let Some(decl) = self.decl() else {
            return Err(self.violation("start", ServiceState::Unconfigured));
        };

        worker::resolving(async {
            for uid in start_order(&decl) {
                let Some(handle) = self.built(&decl, &uid) else {
                    continue;
                };
                if matches!(handle.state(), ServiceState::Configured | ServiceState::Stopped) {
                    if let Err(e) = self.start_handle(&decl, &handle).await {
                        tracing::debug!(service = %uid, error = %e, "Service left stopped");
                    }
                }
            }
        })
        .await;

        self.set_phase(ServiceState::Started);
        tracing::info!(app = %self.uid, "Composition started");
        Ok(())
    }

    /// Updates the services of the `update` list, in order.
    pub async fn update(&self) -> Result<(), SvcError> {
        let phase = self.phase();
        if phase != ServiceState::Started {
            return Err(self.violation("update", phase));
        }
        let Some(decl) = self.decl() else {
            return Ok(());
        };

        let failures = worker::resolving(async {
            let mut failures = Vec::new();
            for uid in &decl.update {
                let Some(handle) = self.built(&decl, uid) else {
                    tracing::debug!(service = %uid, "Skipping update of deferred service");
                    continue;
                };
                if let Err(e) = handle.update().await {
                    failures.push(e);
                }
            }
            failures
        })
        .await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SvcError::UpdateFailed {
                group: self.uid.clone(),
                failures,
            })
        }
    }

    /// Stops started services in reverse start order.
    pub async fn stop(&self) -> Result<(), SvcError> {
        self.transition(
            &[ServiceState::Starting, ServiceState::Started],
            ServiceState::Stopping,
            "stop",
        )?;

        worker::resolving(async {
            if let Some(decl) = self.decl() {
                for c in &decl.connections {
                    for signal in c.signals.iter().filter(|s| decl.object(&s.owner).is_some()) {
                        self.app.bus.disconnect_signal(&c.channel, signal);
                    }
                }
            }
            loop {
                let next = self.state.lock().started.pop();
                let Some(uid) = next else {
                    break;
                };
                let Some(handle) = self.app.services.get(&uid) else {
                    continue;
                };
                if handle.state() != ServiceState::Started {
                    continue;
                }
                match handle.stop().await {
                    Ok(()) => {}
                    Err(e @ SvcError::LifecycleViolation { .. }) => {
                        tracing::warn!(service = %uid, error = %e, "Service was not running");
                    }
                    Err(e) => tracing::warn!(service = %uid, error = %e, "Failed to stop service"),
                }
            }
        })
        .await;

        self.set_phase(ServiceState::Stopped);
        tracing::info!(app = %self.uid, "Composition stopped");
        Ok(())
    }

    /// Destroys services in reverse creation order and withdraws the objects
    /// the manager produced.
    pub async fn destroy(&self) -> Result<(), SvcError> {
        self.transition(
            &[
                ServiceState::Unconfigured,
                ServiceState::Configured,
                ServiceState::Stopped,
            ],
            ServiceState::Stopping,
            "destroy",
        )?;

        worker::resolving(async {
            loop {
                let next = self.state.lock().created.pop();
                let Some(uid) = next else {
                    break;
                };
                self.reset_slot(&uid);
                if let Some(handle) = self.app.services.get(&uid) {
                    self.teardown(&handle).await;
                }
            }
            let owned: Vec<String> = std::mem::take(&mut self.state.lock().owned_objects);
            for uid in owned.iter().rev() {
                if let Err(e) = self.app.objects.withdraw(uid, &self.uid).await {
                    tracing::warn!(object = %uid, error = %e, "Failed to withdraw object");
                }
            }
        })
        .await;

        {
            let mut st = self.state.lock();
            st.phase = ServiceState::Destroyed;
            st.slots.clear();
            st.started.clear();
        }
        self.decl.store(None);
        tracing::info!(app = %self.uid, "Composition destroyed");
        Ok(())
    }

    /// `create`, `start`, then `update`. Update failures are logged.
    pub async fn launch(&self, tree: &ConfigNode) -> Result<BuildReport, SvcError> {
        let report = self.create(tree).await?;
        self.start().await?;
        if let Err(e) = self.update().await {
            tracing::warn!(app = %self.uid, error = %e, "Initial update failed");
        }
        Ok(report)
    }

    pub async fn stop_and_destroy(&self) -> Result<(), SvcError> {
        if self.running() {
            self.stop().await?;
        }
        self.destroy().await
    }

    // --- per-service access ---

    /// The live handle of `uid`, or `UnresolvedDependency` if it is deferred.
    pub fn service(&self, uid: &str) -> Result<Arc<ServiceHandle>, SvcError> {
        let decl = self.decl().ok_or_else(|| SvcError::UnknownService(uid.to_string()))?;
        let pos = decl
            .service_position(uid)
            .ok_or_else(|| SvcError::UnknownService(uid.to_string()))?;
        let slot = self.state.lock().slots.get(pos).cloned();
        match slot {
            Some(Slot::Built(handle)) => Ok(handle),
            Some(Slot::Waiting) | Some(Slot::Building) => Err(SvcError::UnresolvedDependency {
                service: uid.to_string(),
                missing: self.missing_objects(&decl, pos),
            }),
            _ => Err(SvcError::UnknownService(uid.to_string())),
        }
    }

    pub async fn start_service(&self, uid: &str) -> Result<(), SvcError> {
        let handle = self.service(uid)?;
        let decl = self.decl().ok_or_else(|| SvcError::UnknownService(uid.to_string()))?;
        worker::resolving(self.start_handle(&decl, &handle)).await
    }

    pub async fn update_service(&self, uid: &str) -> Result<(), SvcError> {
        let handle = self.service(uid)?;
        worker::resolving(handle.update()).await
    }

    pub async fn stop_service(&self, uid: &str) -> Result<(), SvcError> {
        let handle = self.service(uid)?;
        worker::resolving(handle.stop()).await?;
        self.state.lock().started.retain(|s| s != uid);
        Ok(())
    }

    /// Deferred services with the mandatory objects they still miss.
    pub fn deferred_services(&self) -> Vec<(String, Vec<String>)> {
        let Some(decl) = self.decl() else {
            return Vec::new();
        };
        let waiting: Vec<usize> = {
            let st = self.state.lock();
            st.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| matches!(s, Slot::Waiting))
                .map(|(i, _)| i)
                .collect()
        };
        waiting
            .into_iter()
            .map(|i| (decl.services[i].uid.clone(), self.missing_objects(&decl, i)))
            .collect()
    }

    /// Services whose build failed, with the error message.
    pub fn failed_services(&self) -> Vec<(String, String)> {
        let Some(decl) = self.decl() else {
            return Vec::new();
        };
        let st = self.state.lock();
        st.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Failed(msg) => Some((decl.services[i].uid.clone(), msg.clone())),
                _ => None,
            })
            .collect()
    }

    /// Provides a deferred object from outside the composition.
    pub async fn add_existing_deferred_object(&self, uid: &str, object: ObjectRef) -> Result<(), SvcError> {
        let decl = self.decl().ok_or_else(|| self.violation("add an object", self.phase()))?;
        if !decl.object(uid).is_some_and(|o| o.deferred) {
            return Err(ConfigurationError::UnknownObject {
                service: self.uid.clone(),
                object: uid.to_string(),
            }
            .into());
        }
        worker::resolving(self.app.objects.publish(uid, object, &self.uid)).await?;
        let mut st = self.state.lock();
        if !st.owned_objects.iter().any(|o| o == uid) {
            st.owned_objects.push(uid.to_string());
        }
        Ok(())
    }

    /// Withdraws an object provided with [`add_existing_deferred_object`](Self::add_existing_deferred_object).
    pub async fn remove_existing_deferred_object(&self, uid: &str) -> Result<bool, SvcError> {
        let removed = worker::resolving(self.app.objects.withdraw(uid, &self.uid)).await?;
        self.state.lock().owned_objects.retain(|o| o != uid);
        Ok(removed)
    }

    // --- resolution ---

    fn built(&self, decl: &AppDecl, uid: &str) -> Option<Arc<ServiceHandle>> {
        let pos = decl.service_position(uid)?;
        match self.state.lock().slots.get(pos) {
            Some(Slot::Built(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    fn reset_slot(&self, uid: &str) {
        let Some(pos) = self.decl().and_then(|d| d.service_position(uid)) else {
            return;
        };
        let mut st = self.state.lock();
        if let Some(slot) = st.slots.get_mut(pos) {
            *slot = Slot::Waiting;
        }
    }

    fn missing_objects(&self, decl: &AppDecl, pos: usize) -> Vec<String> {
        decl.services[pos]
            .bindings
            .iter()
            .filter(|b| b.is_mandatory_input() && !self.app.objects.contains(&b.uid))
            .map(|b| b.uid.clone())
            .collect()
    }

    /// Marks every waiting service whose mandatory objects are all present as
    /// building and returns their positions, in declaration order.
    fn claim_ready(&self, decl: &AppDecl) -> Vec<usize> {
        let mut st = self.state.lock();
        if !matches!(
            st.phase,
            ServiceState::Configured | ServiceState::Starting | ServiceState::Started
        ) {
            return Vec::new();
        }
        let mut ready = Vec::new();
        for (i, s) in decl.services.iter().enumerate() {
            if !matches!(st.slots.get(i), Some(Slot::Waiting)) {
                continue;
            }
            if s
                .bindings
                .iter()
                .filter(|b| b.is_mandatory_input())
                .all(|b| self.app.objects.contains(&b.uid))
            {
                st.slots[i] = Slot::Building;
                ready.push(i);
            }
        }
        ready
    }

    /// Builds every ready service and, while running, starts them and updates
    /// those on the `update` list.
    async fn resolve_ready(&self, decl: &Arc<AppDecl>) -> (Vec<String>, Vec<(String, SvcError)>) {
        let mut built = Vec::new();
        let mut failures = Vec::new();
        loop {
            let batch = self.claim_ready(decl);
            if batch.is_empty() {
                break;
            }
            let mut fresh = Vec::new();
            for i in batch {
                let sd = &decl.services[i];
                match ServiceHandle::build(&self.app, sd, None).await {
                    Ok(handle) => {
                        self.attach_endpoints(decl, &handle);
                        {
                            let mut st = self.state.lock();
                            st.slots[i] = Slot::Built(Arc::clone(&handle));
                            st.created.push(sd.uid.clone());
                        }
                        built.push(sd.uid.clone());
                        fresh.push(handle);
                    }
                    Err(e) => {
                        tracing::error!(service = %sd.uid, error = %e, "Failed to build service");
                        self.state.lock().slots[i] = Slot::Failed(e.to_string());
                        failures.push((sd.uid.clone(), e));
                    }
                }
            }
            if self.running() {
                self.start_fresh(decl, fresh).await;
            }
        }
        (built, failures)
    }

    async fn start_fresh(&self, decl: &Arc<AppDecl>, mut fresh: Vec<Arc<ServiceHandle>>) {
        fresh.sort_by_key(|h| start_rank(decl, h.uid()));
        for handle in &fresh {
            if let Err(e) = self.start_handle(decl, handle).await {
                tracing::debug!(service = %handle.uid(), error = %e, "Fresh service left stopped");
            }
        }
        for uid in &decl.update {
            let Some(handle) = fresh.iter().find(|h| h.uid() == uid) else {
                continue;
            };
            if handle.state() != ServiceState::Started {
                continue;
            }
            if let Err(e) = handle.update().await {
                tracing::warn!(service = %uid, error = %e, "Update after start failed");
            }
        }
    }

    async fn start_handle(&self, decl: &AppDecl, handle: &Arc<ServiceHandle>) -> Result<(), SvcError> {
        let uid = handle.uid().to_string();
        {
            let mut st = self.state.lock();
            if st.started.contains(&uid) {
                return Ok(());
            }
            st.started.push(uid.clone());
        }
        match handle.start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().started.retain(|s| *s != uid);
                if matches!(e, SvcError::UnresolvedDependency { .. }) {
                    // An object vanished between claim and start.
                    tracing::debug!(service = %uid, error = %e, "Service deferred again");
                    if let Err(de) = handle.destroy().await {
                        tracing::warn!(service = %uid, error = %de, "Failed to destroy service");
                    }
                    let mut st = self.state.lock();
                    st.created.retain(|s| *s != uid);
                    if let Some(pos) = decl.service_position(&uid) {
                        st.slots[pos] = Slot::Waiting;
                    }
                } else {
                    tracing::error!(service = %uid, error = %e, "Failed to start service");
                }
                Err(e)
            }
        }
    }

    /// Stops (if needed) and destroys `handle`.
    async fn teardown(&self, handle: &Arc<ServiceHandle>) {
        let uid = handle.uid().to_string();
        if handle.state() == ServiceState::Started {
            if let Err(e) = handle.stop().await {
                tracing::warn!(service = %uid, error = %e, "Failed to stop service");
            }
        }
        if matches!(handle.state(), ServiceState::Configured | ServiceState::Stopped) {
            if let Err(e) = handle.destroy().await {
                tracing::warn!(service = %uid, error = %e, "Failed to destroy service");
            }
        }
        let mut st = self.state.lock();
        st.created.retain(|s| *s != uid);
        st.started.retain(|s| *s != uid);
    }

    fn attach_endpoints(&self, decl: &AppDecl, handle: &ServiceHandle) {
        for c in &decl.connections {
            for s in c.signals.iter().filter(|s| s.owner == handle.uid()) {
                handle.add_endpoint(Endpoint::Signal {
                    channel: c.channel.clone(),
                    key: s.key.clone(),
                });
            }
            for s in c.slots.iter().filter(|s| s.owner == handle.uid()) {
                handle.add_endpoint(Endpoint::Slot {
                    channel: c.channel.clone(),
                    key: s.key.clone(),
                });
            }
        }
    }

    fn connect_object_endpoints(&self, decl: &AppDecl, uid: &str) {
        for c in &decl.connections {
            for s in c.signals.iter().filter(|s| s.owner == uid) {
                self.app.bus.connect_signal(&c.channel, s.clone());
            }
        }
    }

    /// Started services referencing `uid` through an optional binding.
    fn optional_users(&self, decl: &AppDecl, uid: &str) -> Vec<Arc<ServiceHandle>> {
        let st = self.state.lock();
        decl.services
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.bindings
                    .iter()
                    .any(|b| b.uid == uid && b.optional && b.access != Access::Out)
            })
            .filter_map(|(i, _)| match st.slots.get(i) {
                Some(Slot::Built(h)) => Some(Arc::clone(h)),
                _ => None,
            })
            .collect()
    }

    async fn on_object_added(&self, uid: &str, object: ObjectRef) {
        let Some(decl) = self.decl() else {
            return;
        };
        if !self.app.objects.get(uid).is_some_and(|o| Arc::ptr_eq(&o, &object)) {
            tracing::debug!(object = %uid, "Object replaced or withdrawn before its addition was handled");
            return;
        }
        self.connect_object_endpoints(&decl, uid);
        if !self.accepting() {
            return;
        }
        let (_, failures) = self.resolve_ready(&decl).await;
        if !failures.is_empty() {
            tracing::warn!(object = %uid, failed = failures.len(), "Some services failed to build");
        }
        for handle in self.optional_users(&decl, uid) {
            if let Err(e) = handle.rebind(uid, Some(Arc::clone(&object))).await {
                tracing::warn!(service = %handle.uid(), object = %uid, error = %e, "Failed to swap in object");
            }
        }
    }

    async fn on_object_removed(&self, uid: &str) {
        let Some(decl) = self.decl() else {
            return;
        };
        self.app.bus.disconnect_owner(uid);

        let victims: Vec<Arc<ServiceHandle>> = {
            let mut st = self.state.lock();
            let mut victims = Vec::new();
            for (i, s) in decl.services.iter().enumerate() {
                if !s.bindings.iter().any(|b| b.uid == uid && b.is_mandatory_input()) {
                    continue;
                }
                if let Some(Slot::Built(handle)) = st.slots.get(i).cloned() {
                    st.slots[i] = Slot::Waiting;
                    victims.push(handle);
                }
            }
            let created = &st.created;
            victims.sort_by_key(|h| Reverse(created.iter().position(|c| c == h.uid())));
            victims
        };
        for handle in victims {
            tracing::debug!(service = %handle.uid(), object = %uid, "Dependency withdrawn, tearing down");
            self.teardown(&handle).await;
        }

        for handle in self.optional_users(&decl, uid) {
            if let Err(e) = handle.rebind(uid, None).await {
                tracing::warn!(service = %handle.uid(), object = %uid, error = %e, "Failed to swap out object");
            }
        }
    }
}

#[async_trait]
impl ObjectObserver for AppConfigManager {
    /// Inside a resolver pass the addition is handled depth-first. Otherwise
    /// the publisher may be a slot running on a worker the resolver needs, so
    /// the addition is queued on the events worker and not awaited.
    async fn object_added(&self, uid: &str, object: &ObjectRef) {
        let object = Arc::clone(object);
        if worker::is_resolving() {
            self.on_object_added(uid, object).await;
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let owned = uid.to_string();
        let queued = self.events.post(&self.uid, async move {
            worker::resolving(me.on_object_added(&owned, object)).await;
        });
        if let Err(e) = queued {
            tracing::warn!(object = %uid, error = %e, "Failed to queue object addition");
        }
    }

    /// Consumers are torn down before the producer's withdrawal returns.
    async fn object_removed(&self, uid: &str) {
        worker::resolving(self.on_object_removed(uid)).await;
    }
}

fn start_rank(decl: &AppDecl, uid: &str) -> (usize, usize) {
    let listed = decl
        .start
        .iter()
        .position(|s| s == uid)
        .unwrap_or(usize::MAX);
    (listed, decl.service_position(uid).unwrap_or(usize::MAX))
}

fn start_order(decl: &AppDecl) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(decl.services.len());
    for uid in decl.start.iter().chain(decl.services.iter().map(|s| &s.uid)) {
        if !order.contains(uid) {
            order.push(uid.clone());
        }
    }
    order
}

/// Static checks run before anything is built.
fn validate(decl: &AppDecl) -> Result<(), ConfigurationError> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for s in &decl.services {
        for b in &s.bindings {
            let Some(object) = decl.object(&b.uid) else {
                return Err(ConfigurationError::UnknownObject {
                    service: s.uid.clone(),
                    object: b.uid.clone(),
                });
            };
            if b.access != Access::Out {
                continue;
            }
            if !object.deferred {
                return Err(ConfigurationError::OutputNotDeferred {
                    object: b.uid.clone(),
                    service: s.uid.clone(),
                });
            }
            if let Some(first) = producers.insert(&b.uid, &s.uid) {
                if first != s.uid {
                    return Err(ConfigurationError::DuplicateProducer {
                        object: b.uid.clone(),
                        first: first.to_string(),
                        second: s.uid.clone(),
                    });
                }
            }
        }
    }

    for c in &decl.connections {
        let context = format!("channel '{}'", c.channel);
        for s in &c.signals {
            if !decl.is_service(&s.owner) && decl.object(&s.owner).is_none() {
                return Err(ConfigurationError::InvalidReference {
                    context,
                    reference: s.to_string(),
                });
            }
        }
        for s in &c.slots {
            if !decl.is_service(&s.owner) {
                return Err(ConfigurationError::InvalidReference {
                    context,
                    reference: s.to_string(),
                });
            }
        }
    }

    for (list, uids) in [("start", &decl.start), ("update", &decl.update)] {
        if let Some(uid) = uids.iter().find(|u| !decl.is_service(u)) {
            return Err(ConfigurationError::InvalidReference {
                context: format!("{list} list"),
                reference: uid.clone(),
            });
        }
    }

    let updater_uids: HashSet<&str> = decl.updaters.iter().map(|u| u.uid.as_str()).collect();
    for u in &decl.updaters {
        for child in &u.children {
            let known = match child {
                UpdaterChild::Service(uid) => decl.is_service(uid),
                UpdaterChild::Updater(uid) => updater_uids.contains(uid.as_str()),
            };
            if !known {
                let (UpdaterChild::Service(uid) | UpdaterChild::Updater(uid)) = child;
                return Err(ConfigurationError::InvalidReference {
                    context: format!("updater '{}'", u.uid),
                    reference: uid.clone(),
                });
            }
        }
    }

    check_cycles(decl)
}

/// Simulates resolution with every in-configuration producer starting as
/// soon as it is built. Services left over are deferred; among them, a cycle
/// of producers waiting on each other can never resolve.
fn check_cycles(decl: &AppDecl) -> Result<(), ConfigurationError> {
    let producer: HashMap<&str, usize> = decl
        .services
        .iter()
        .enumerate()
        .flat_map(|(i, s)| s.outputs().map(move |b| (b.uid.as_str(), i)))
        .collect();
    let mut available: HashSet<&str> = decl
        .objects
        .iter()
        .filter(|o| !o.deferred)
        .map(|o| o.uid.as_str())
        .collect();

    let mut resolved = vec![false; decl.services.len()];
    loop {
        let mut progress = false;
        for (i, s) in decl.services.iter().enumerate() {
            if resolved[i] {
                continue;
            }
            if s
                .bindings
                .iter()
                .filter(|b| b.is_mandatory_input())
                .all(|b| available.contains(b.uid.as_str()))
            {
                resolved[i] = true;
                progress = true;
                available.extend(s.outputs().map(|b| b.uid.as_str()));
            }
        }
        if !progress {
            break;
        }
    }

    let remaining: Vec<usize> = (0..decl.services.len()).filter(|&i| !resolved[i]).collect();
    if remaining.is_empty() {
        return Ok(());
    }

    let names: Vec<&str> = remaining.iter().map(|&i| decl.services[i].uid.as_str()).collect();
    let local: HashMap<usize, usize> = remaining.iter().enumerate().map(|(l, &i)| (i, l)).collect();
    let adj: Vec<Vec<usize>> = remaining
        .iter()
        .map(|&i| {
            decl.services[i]
                .bindings
                .iter()
                .filter(|b| b.is_mandatory_input())
                .filter_map(|b| producer.get(b.uid.as_str()))
                .filter_map(|p| local.get(p).copied())
                .collect()
        })
        .collect();

    match detect_cycle_with_path(&names, &adj) {
        Some(path) => Err(ConfigurationError::DependencyCycle {
            remaining: remaining.len(),
            path,
        }),
        None => Ok(()),
    }
}

/// DFS with path tracking; returns the closed cycle path if one exists.
fn detect_cycle_with_path(names: &[&str], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs(
        node: usize,
        names: &[&str],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);
        for &next in &adj[node] {
            match colors[next] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].to_string()).collect();
                        cycle.push(names[next].to_string());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();
    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
