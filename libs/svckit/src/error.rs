//! Structured errors for the composition engine.

use thiserror::Error;

use crate::config::Access;
use crate::lifecycle::ServiceState;

/// Malformed or contradictory composition shape.
///
/// Raised while parsing and validating a configuration tree, and by the
/// static binding check in `configure`.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("node '{node}' is missing mandatory attribute '{attribute}'")]
    MissingAttribute { node: String, attribute: &'static str },
    #[error("identifier '{0}' is declared more than once")]
    DuplicateUid(String),
    #[error("object '{object}' has more than one producer: '{first}' and '{second}'")]
    DuplicateProducer {
        object: String,
        first: String,
        second: String,
    },
    #[error("service '{service}' references undeclared object '{object}'")]
    UnknownObject { service: String, object: String },
    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),
    #[error("service '{service}' is missing mandatory key '{key}'")]
    MissingKey { service: String, key: String },
    #[error("service '{service}' binds undeclared key '{key}'")]
    UnexpectedKey { service: String, key: String },
    #[error("service '{service}' binds key '{key}' as {found}, expected {expected}")]
    AccessMismatch {
        service: String,
        key: String,
        expected: Access,
        found: Access,
    },
    #[error("service '{service}' binds {count} object(s) to key '{key}', expected {min}..={max}")]
    GroupSize {
        service: String,
        key: String,
        count: usize,
        min: usize,
        max: usize,
    },
    #[error("object '{object}' is produced by '{service}' but is not declared deferred")]
    OutputNotDeferred { object: String, service: String },
    #[error(
        "no services can be resolved, {remaining} remain deferred (cycle: {})",
        path.join(" -> ")
    )]
    DependencyCycle { remaining: usize, path: Vec<String> },
    #[error("invalid reference '{reference}' in {context}")]
    InvalidReference { context: String, reference: String },
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors surfaced by the resolver, the lifecycle controller, the proxy bus
/// and the update scheduler.
#[derive(Debug, Error)]
pub enum SvcError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("service '{service}': cannot {op} while {state}")]
    LifecycleViolation {
        service: String,
        op: &'static str,
        state: ServiceState,
    },
    #[error("service '{service}' has unresolved dependencies: [{}]", missing.join(", "))]
    UnresolvedDependency {
        service: String,
        missing: Vec<String>,
    },
    #[error("'{slot}' would re-enter busy service '{service}'; wrap the emission in a blocker")]
    ReentrancyDeadlock { service: String, slot: String },

    // Hook failures with service context
    #[error("{op} failed for service '{service}'")]
    Hook {
        service: String,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("update of group '{group}' failed for {} child(ren)", failures.len())]
    UpdateFailed {
        group: String,
        failures: Vec<SvcError>,
    },
    #[error("updater cycle detected: {}", path.join(" -> "))]
    UpdaterCycle { path: Vec<String> },

    // Lookup errors
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("unknown updater '{0}'")]
    UnknownUpdater(String),
    #[error("service '{service}' has no slot '{slot}'")]
    UnknownSlot { service: String, slot: String },
    #[error("signal '{signal}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        signal: String,
        expected: usize,
        got: usize,
    },

    // Execution errors
    #[error("job on worker '{0}' was aborted")]
    JobAborted(String),
    #[error("task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SvcError {
    /// Flattens nested update failures into the leaf errors that caused them.
    pub fn leaf_failures(&self) -> Vec<&SvcError> {
        match self {
            SvcError::UpdateFailed { failures, .. } => {
                failures.iter().flat_map(|f| f.leaf_failures()).collect()
            }
            SvcError::Hook { source, .. } => match source.downcast_ref::<SvcError>() {
                Some(inner @ SvcError::UpdateFailed { .. }) => inner.leaf_failures(),
                _ => vec![self],
            },
            other => vec![other],
        }
    }
}
