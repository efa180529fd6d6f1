//! Application context - the registries shared by one composition.

use std::sync::Arc;

use crate::factory::ServiceFactory;
use crate::object::ObjectRegistry;
use crate::proxy::ProxyBus;
use crate::runtime::ServiceManager;
use crate::updater::UpdaterRegistry;
use crate::worker::WorkerPool;

/// Everything services of one application share.
///
/// Nothing here is global: two contexts in one process never see each
/// other's objects, channels or services.
#[derive(Debug)]
pub struct AppContext {
    pub objects: ObjectRegistry,
    pub bus: ProxyBus,
    pub services: ServiceManager,
    pub updaters: UpdaterRegistry,
    pub workers: WorkerPool,
    pub factory: Arc<ServiceFactory>,
}

impl AppContext {
    pub fn new(factory: Arc<ServiceFactory>) -> Arc<Self> {
        Arc::new(Self {
            objects: ObjectRegistry::new(),
            bus: ProxyBus::new(),
            services: ServiceManager::new(),
            updaters: UpdaterRegistry::new(),
            workers: WorkerPool::new(),
            factory,
        })
    }
}
