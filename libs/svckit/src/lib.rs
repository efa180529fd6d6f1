//! # svckit - runtime composition engine
//!
//! Applications are assembled at runtime from a configuration tree describing
//! shared data objects, the services that consume and produce them, and the
//! signal/slot channels between them.
//!
//! ## Features
//!
//! - **Deferred resolution**: services wait until every mandatory object exists,
//!   and are torn down again when one disappears
//! - **Lifecycle**: `configure → start → update → stop → destroy`, each run as a
//!   job on the service's worker
//! - **Proxy bus**: named channels connecting signals to slots, with blockers
//!   to break feedback loops
//! - **Parallel updaters**: groups of services updated concurrently per tick
//!
//! ## Example
//!
//! ```rust,ignore
//! use svckit::{async_trait, AppConfigManager, AppContext, Service, ServiceCtx};
//!
//! #[derive(Default)]
//! struct Counter;
//!
//! #[async_trait]
//! impl Service for Counter {
//!     async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
//!         if let Some(obj) = ctx.inout("value")? {
//!             let n = obj.get().as_i64().unwrap_or(0);
//!             obj.set(serde_json::json!(n + 1));
//!             ctx.notify_modified("value").await?;
//!         }
//!         Ok(())
//!     }
//!
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! inventory::submit! {
//!     svckit::ServiceRegistrator(|b| { b.register_default::<Counter>("demo::Counter"); })
//! }
//!
//! let app = AppContext::new(std::sync::Arc::new(svckit::ServiceFactory::discover()?));
//! let manager = AppConfigManager::new(app);
//! manager.launch(&tree).await?;
//! ```

pub use async_trait::async_trait;

// Re-export inventory for user convenience
pub use inventory;

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod object;
pub mod proxy;
pub mod resolver;
pub mod runtime;
pub mod service;
pub mod updater;
pub mod worker;

pub use config::{
    Access, AppDecl, BindingDecl, ConfigNode, ConnectDecl, ObjectDecl, ServiceDecl, UpdaterChild,
    UpdaterDecl, PARALLEL_UPDATER,
};
pub use error::{ConfigurationError, SvcError};
pub use factory::{FactoryBuilder, FactoryError, ServiceFactory, ServiceRegistrator};
pub use lifecycle::{
    Endpoint, ServiceHandle, ServiceState, STARTED_SIG, STOPPED_SIG, SWAPPED_SIG, UPDATED_SIG,
};
pub use object::{Object, ObjectObserver, ObjectRef, ObjectRegistry, MODIFIED_SIG};
pub use proxy::{Blocker, PendingEmission, ProxyBus, SignalRef, SlotArgs, SlotRef};
pub use resolver::{AppConfigManager, BuildReport};
pub use runtime::{run, AppContext, HostRuntime, RunOptions, ServiceManager, ShutdownOptions};
pub use service::{BindingSpec, Cardinality, Service, ServiceCtx, SlotHandler};
pub use updater::{GroupState, ParallelUpdater, UpdaterGroup, UpdaterNode, UpdaterRegistry};
pub use worker::{Worker, WorkerPool};
