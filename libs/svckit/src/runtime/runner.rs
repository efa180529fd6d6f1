//! svckit runtime runner.
//!
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::config::ConfigNode;
use crate::factory::ServiceFactory;
use crate::runtime::{AppContext, HostRuntime};

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Options for running one composition.
pub struct RunOptions {
    pub composition: ConfigNode,
    pub factory: Arc<ServiceFactory>,
    /// Drive interval for `root_updater`; no ticking when either is unset.
    pub tick: Option<Duration>,
    pub root_updater: Option<String>,
    pub stop_timeout: Duration,
    pub shutdown: ShutdownOptions,
}

/// Full cycle: create → start → update → drive → stop → destroy.
pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match svckit_bootstrap::signals::wait_for_shutdown().await {
                    Ok(signal) => {
                        tracing::info!(%signal, "shutdown: signal received");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    let app = AppContext::new(opts.factory);
    let mut host = HostRuntime::new(app, opts.composition, cancel).with_stop_timeout(opts.stop_timeout);
    if let (Some(tick), Some(root)) = (opts.tick, opts.root_updater) {
        host = host.with_tick(tick, root);
    }

    host.run_full_cycle().await
}
