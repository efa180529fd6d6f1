//! Host Runtime - drives one composition through its whole life
//!
//! Phases: create → start → update → drive → stop → destroy.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigNode;
use crate::error::SvcError;
use crate::resolver::{AppConfigManager, BuildReport};
use crate::runtime::AppContext;

/// HostRuntime owns an [`AppConfigManager`] and the cancellation token that
/// ends the drive phase.
pub struct HostRuntime {
    manager: Arc<AppConfigManager>,
    composition: ConfigNode,
    cancel: CancellationToken,
    tick: Option<Duration>,
    root_updater: Option<String>,
    stop_timeout: Duration,
}

impl HostRuntime {
    pub fn new(app: Arc<AppContext>, composition: ConfigNode, cancel: CancellationToken) -> Self {
        let manager = match composition.get("uid") {
            Some(uid) => AppConfigManager::with_uid(app, uid),
            None => AppConfigManager::new(app),
        };
        Self {
            manager,
            composition,
            cancel,
            tick: None,
            root_updater: None,
            stop_timeout: Duration::from_secs(30),
        }
    }

    /// Updates `root_updater` every `tick` while driving.
    pub fn with_tick(mut self, tick: Duration, root_updater: impl Into<String>) -> Self {
        self.tick = Some(tick);
        self.root_updater = Some(root_updater.into());
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<AppConfigManager> {
        &self.manager
    }

    /// CREATE phase: objects are created and ready services built.
    pub async fn run_create_phase(&self) -> Result<BuildReport, SvcError> {
        tracing::info!("Phase: create");
        let report = self.manager.create(&self.composition).await?;
        tracing::info!(
            built = report.built.len(),
            deferred = report.deferred.len(),
            failed = report.failures.len(),
            "Composition created"
        );
        Ok(report)
    }

    /// START phase: start list first, then declaration order.
    pub async fn run_start_phase(&self) -> Result<(), SvcError> {
        tracing::info!("Phase: start");
        self.manager.start().await
    }

    /// UPDATE phase: one pass over the update list. Failures are logged.
    pub async fn run_update_phase(&self) -> Result<(), SvcError> {
        tracing::info!("Phase: update");
        if let Err(e) = self.manager.update().await {
            for leaf in e.leaf_failures() {
                tracing::warn!(error = %leaf, "Initial update failed");
            }
        }
        Ok(())
    }

    /// DRIVE phase: ticks the root updater until cancellation.
    async fn run_drive_phase(&self) {
        tracing::info!("Phase: drive");
        let (Some(tick), Some(root)) = (self.tick, self.root_updater.as_deref()) else {
            self.cancel.cancelled().await;
            return;
        };

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.manager.update_service(root).await {
                        tracing::warn!(updater = %root, error = %e, "Tick update failed");
                    }
                }
            }
        }
    }

    /// STOP phase: bounded by the stop timeout; errors are logged.
    async fn run_stop_phase(&self) -> Result<(), SvcError> {
        tracing::info!("Phase: stop");
        match tokio::time::timeout(self.stop_timeout, self.manager.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to stop composition"),
            Err(_) => tracing::warn!(timeout = ?self.stop_timeout, "Stop timed out"),
        }
        Ok(())
    }

    /// DESTROY phase.
    async fn run_destroy_phase(&self) -> Result<(), SvcError> {
        tracing::info!("Phase: destroy");
        if let Err(e) = self.manager.destroy().await {
            tracing::warn!(error = %e, "Failed to destroy composition");
        }
        Ok(())
    }

    /// Run the full lifecycle: create → start → update → drive → stop → destroy.
    pub async fn run_full_cycle(self) -> anyhow::Result<()> {
        self.run_create_phase().await?;
        self.run_start_phase().await?;
        self.run_update_phase().await?;

        self.run_drive_phase().await;

        self.run_stop_phase().await?;
        self.run_destroy_phase().await?;
        Ok(())
    }
}
