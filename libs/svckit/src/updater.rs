//! Parallel update scheduler.
//!
//! An [`UpdaterGroup`] owns an ordered list of children, each either a service
//! (`Leaf`) or another group. Updating a group updates all of its direct
//! children concurrently and returns once every one of them has finished.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::config::{UpdaterChild, UpdaterDecl};
use crate::error::{ConfigurationError, SvcError};
use crate::runtime::AppContext;
use crate::service::{Service, ServiceCtx};
use crate::worker;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdaterNode {
    Leaf(String),
    Group(String),
}

impl From<&UpdaterChild> for UpdaterNode {
    fn from(child: &UpdaterChild) -> Self {
        match child {
            UpdaterChild::Service(uid) => UpdaterNode::Leaf(uid.clone()),
            UpdaterChild::Updater(uid) => UpdaterNode::Group(uid.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Updating,
    Done,
}

pub struct UpdaterGroup {
    uid: String,
    parent: Option<String>,
    children: RwLock<Vec<UpdaterNode>>,
    state: RwLock<GroupState>,
    gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for UpdaterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdaterGroup")
            .field("uid", &self.uid)
            .field("parent", &self.parent)
            .field("children", &*self.children.read())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl UpdaterGroup {
    pub fn new(uid: impl Into<String>, parent: Option<String>, children: Vec<UpdaterNode>) -> Arc<Self> {
        Arc::new(Self {
            uid: uid.into(),
            parent,
            children: RwLock::new(children),
            state: RwLock::new(GroupState::Idle),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn from_decl(decl: &UpdaterDecl) -> Arc<Self> {
        Self::new(
            decl.uid.clone(),
            decl.parent.clone(),
            decl.children.iter().map(UpdaterNode::from).collect(),
        )
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn state(&self) -> GroupState {
        *self.state.read()
    }

    pub fn children(&self) -> Vec<UpdaterNode> {
        self.children.read().clone()
    }

    /// Appends `node` unless it is already a child.
    pub fn attach(&self, node: UpdaterNode) {
        let mut children = self.children.write();
        if !children.contains(&node) {
            children.push(node);
        }
    }

    pub fn detach(&self, node: &UpdaterNode) {
        self.children.write().retain(|c| c != node);
    }

    /// Updates every direct child concurrently and joins them.
    pub fn update(self: Arc<Self>, app: Arc<AppContext>) -> BoxFuture<'static, Result<(), SvcError>> {
        self.update_along(app, Vec::new())
    }

    fn update_along(
        self: Arc<Self>,
        app: Arc<AppContext>,
        mut path: Vec<String>,
    ) -> BoxFuture<'static, Result<(), SvcError>> {
        async move {
            if path.contains(&self.uid) {
                path.push(self.uid.clone());
                return Err(SvcError::UpdaterCycle { path });
            }
            path.push(self.uid.clone());

            let _gate = self.gate.lock().await;
            *self.state.write() = GroupState::Updating;
            let children = self.children();
            tracing::trace!(updater = %self.uid, children = children.len(), "Updating group");

            let chain = worker::current_chain();
            let mut set = JoinSet::new();
            for child in children {
                let app = Arc::clone(&app);
                let path = path.clone();
                set.spawn(worker::with_chain(Arc::clone(&chain), async move {
                    update_child(child, app, path).await
                }));
            }

            let mut failures = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(e) => failures.push(SvcError::from(e)),
                }
            }

            *self.state.write() = GroupState::Done;
            if failures.is_empty() {
                Ok(())
            } else {
                tracing::warn!(updater = %self.uid, failed = failures.len(), "Group update failed");
                Err(SvcError::UpdateFailed {
                    group: self.uid.clone(),
                    failures,
                })
            }
        }
        .boxed()
    }
}

async fn update_child(child: UpdaterNode, app: Arc<AppContext>, path: Vec<String>) -> Result<(), SvcError> {
    match child {
        UpdaterNode::Leaf(uid) => {
            let Some(handle) = app.services.get(&uid) else {
                return Err(SvcError::UnresolvedDependency {
                    service: path.last().cloned().unwrap_or_default(),
                    missing: vec![uid],
                });
            };
            handle.update().await
        }
        UpdaterNode::Group(uid) => match app.updaters.get(&uid) {
            Some(group) => group.update_along(app, path).await,
            None => {
                tracing::debug!(updater = %uid, "Nested group not registered yet, skipped");
                Ok(())
            }
        },
    }
}

/// Registered groups by uid.
#[derive(Debug, Default)]
pub struct UpdaterRegistry {
    groups: RwLock<HashMap<String, Arc<UpdaterGroup>>>,
}

impl UpdaterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `group`, attaching it to its parent if that is registered
    /// and adopting registered groups that name it as their parent.
    pub fn register(&self, group: Arc<UpdaterGroup>) -> Result<(), SvcError> {
        let mut groups = self.groups.write();
        if groups.contains_key(&group.uid) {
            return Err(ConfigurationError::DuplicateUid(group.uid.clone()).into());
        }
        if let Some(parent) = group.parent.as_deref().and_then(|p| groups.get(p)) {
            parent.attach(UpdaterNode::Group(group.uid.clone()));
        }
        for other in groups.values() {
            if other.parent.as_deref() == Some(group.uid.as_str()) {
                group.attach(UpdaterNode::Group(other.uid.clone()));
            }
        }
        tracing::debug!(updater = %group.uid, parent = ?group.parent, "Updater registered");
        groups.insert(group.uid.clone(), group);
        Ok(())
    }

    pub fn unregister(&self, uid: &str) -> Option<Arc<UpdaterGroup>> {
        let mut groups = self.groups.write();
        let group = groups.remove(uid)?;
        if let Some(parent) = group.parent.as_deref().and_then(|p| groups.get(p)) {
            parent.detach(&UpdaterNode::Group(uid.to_string()));
        }
        Some(group)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<UpdaterGroup>> {
        self.groups.read().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

/// Built-in service owning one updater group for as long as it runs.
#[derive(Default)]
pub struct ParallelUpdater {
    group: Mutex<Option<Arc<UpdaterGroup>>>,
}

impl ParallelUpdater {
    pub fn group(&self) -> Option<Arc<UpdaterGroup>> {
        self.group.lock().clone()
    }
}

#[async_trait]
impl Service for ParallelUpdater {
    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let node = ctx.config_node();
        let decl = if node.get("uid").is_some() {
            UpdaterDecl::from_node(node)?
        } else {
            UpdaterDecl::from_node(&node.clone().attr("uid", ctx.uid()))?
        };
        let group = UpdaterGroup::from_decl(&decl);
        ctx.app().updaters.register(Arc::clone(&group))?;
        *self.group.lock() = Some(group);
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let Some(group) = self.group() else {
            return Err(SvcError::UnknownUpdater(ctx.uid().to_string()).into());
        };
        group.update(Arc::clone(ctx.app())).await?;
        Ok(())
    }

    async fn stopping(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        ctx.app().updaters.unregister(ctx.uid());
        self.group.lock().take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_parent_adopts_registered_children() {
        let registry = UpdaterRegistry::new();
        registry
            .register(UpdaterGroup::new("child", Some("root".into()), vec![]))
            .unwrap();
        let root = UpdaterGroup::new("root", None, vec![UpdaterNode::Leaf("s0".into())]);
        registry.register(Arc::clone(&root)).unwrap();

        assert_eq!(
            root.children(),
            vec![UpdaterNode::Leaf("s0".into()), UpdaterNode::Group("child".into())]
        );

        registry.unregister("child");
        assert_eq!(root.children(), vec![UpdaterNode::Leaf("s0".into())]);
    }

    #[test]
    fn explicit_and_parent_links_are_not_duplicated() {
        let registry = UpdaterRegistry::new();
        let root = UpdaterGroup::new("root", None, vec![UpdaterNode::Group("child".into())]);
        registry.register(Arc::clone(&root)).unwrap();
        registry
            .register(UpdaterGroup::new("child", Some("root".into()), vec![]))
            .unwrap();
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let registry = UpdaterRegistry::new();
        registry.register(UpdaterGroup::new("g", None, vec![])).unwrap();
        assert!(matches!(
            registry.register(UpdaterGroup::new("g", None, vec![])),
            Err(SvcError::Configuration(ConfigurationError::DuplicateUid(_)))
        ));
    }
}
