mod app_context;
mod host;
mod runner;
mod service_manager;

pub use app_context::AppContext;
pub use host::HostRuntime;
pub use runner::{run, RunOptions, ShutdownOptions};
pub use service_manager::ServiceManager;
