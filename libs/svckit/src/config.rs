//! Abstract configuration tree and the typed declarations parsed from it.
//!
//! The engine never parses a concrete syntax. Hosts build a [`ConfigNode`]
//! tree programmatically or deserialize it with serde, and
//! [`AppDecl::parse`] turns it into object, service, connection and updater
//! declarations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::proxy::{SignalRef, SlotRef};

/// Service type used for `updater` nodes.
pub const PARALLEL_UPDATER: &str = "svckit::ParallelUpdater";

/// One node of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn child(mut self, child: ConfigNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ConfigNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn first_child(&self, name: &str) -> Option<&ConfigNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, attribute: &'static str) -> Result<&str, ConfigurationError> {
        self.get(attribute)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                node: self.name.clone(),
                attribute,
            })
    }

    fn flag(&self, attribute: &str) -> Result<bool, ConfigurationError> {
        match self.get(attribute) {
            None => Ok(false),
            Some(v) => parse_bool(attribute, v),
        }
    }

    /// Converts the node to JSON so typed service configs can be deserialized.
    ///
    /// Attributes become fields (numbers and booleans are recognized), children
    /// are grouped by name and repeated names become arrays. A node that only
    /// carries a value collapses to that value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Map, Value};

        if self.attributes.is_empty() && self.children.is_empty() {
            return self.value.as_deref().map(scalar).unwrap_or(Value::Null);
        }

        let mut map = Map::new();
        for (k, v) in &self.attributes {
            map.insert(k.clone(), scalar(v));
        }
        if let Some(v) = &self.value {
            map.insert("value".to_string(), scalar(v));
        }

        let mut grouped: Vec<(&str, Vec<Value>)> = Vec::new();
        for child in &self.children {
            match grouped.iter_mut().find(|(n, _)| *n == child.name) {
                Some((_, items)) => items.push(child.to_json()),
                None => grouped.push((child.name.as_str(), vec![child.to_json()])),
            }
        }
        for (name, mut items) in grouped {
            let value = if items.len() == 1 {
                items.remove(0)
            } else {
                Value::Array(items)
            };
            map.insert(name.to_string(), value);
        }
        Value::Object(map)
    }
}

fn scalar(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

/// Direction of a binding between a service and an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    In,
    InOut,
    Out,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::In => "in",
            Access::InOut => "inout",
            Access::Out => "out",
        })
    }
}

impl Access {
    fn from_node_name(name: &str) -> Option<Self> {
        match name {
            "in" => Some(Access::In),
            "inout" => Some(Access::InOut),
            "out" => Some(Access::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDecl {
    pub uid: String,
    pub type_name: String,
    pub deferred: bool,
    pub value: serde_json::Value,
}

/// One configured binding. Group members share a key and are numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDecl {
    pub key: String,
    pub index: usize,
    pub grouped: bool,
    pub uid: String,
    pub access: Access,
    pub optional: bool,
    pub auto_connect: bool,
}

impl BindingDecl {
    pub fn new(key: impl Into<String>, uid: impl Into<String>, access: Access) -> Self {
        Self {
            key: key.into(),
            index: 0,
            grouped: false,
            uid: uid.into(),
            access,
            optional: false,
            auto_connect: false,
        }
    }

    pub fn input(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(key, uid, Access::In)
    }

    pub fn inout(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(key, uid, Access::InOut)
    }

    pub fn output(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(key, uid, Access::Out)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn auto_connect(mut self) -> Self {
        self.auto_connect = true;
        self
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = index;
        self.grouped = true;
        self
    }

    pub fn is_mandatory_input(&self) -> bool {
        self.access != Access::Out && !self.optional
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDecl {
    pub uid: String,
    pub type_name: String,
    pub worker: Option<String>,
    pub bindings: Vec<BindingDecl>,
    pub config: ConfigNode,
}

impl ServiceDecl {
    pub fn new(uid: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            type_name: type_name.into(),
            worker: None,
            bindings: Vec::new(),
            config: ConfigNode::new("config"),
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &BindingDecl> {
        self.bindings.iter().filter(|b| b.access != Access::Out)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &BindingDecl> {
        self.bindings.iter().filter(|b| b.access == Access::Out)
    }
}

/// A `connect` block: every listed signal is wired to every listed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDecl {
    pub channel: String,
    pub signals: Vec<SignalRef>,
    pub slots: Vec<SlotRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdaterChild {
    Service(String),
    Updater(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterDecl {
    pub uid: String,
    pub parent: Option<String>,
    pub children: Vec<UpdaterChild>,
}

impl UpdaterDecl {
    /// Parses an `updater` node: `uid`, optional `parent`, then ordered
    /// `service` / `updater` children referencing other uids.
    pub fn from_node(node: &ConfigNode) -> Result<Self, ConfigurationError> {
        let uid = node.require("uid")?.to_string();
        let parent = node.get("parent").map(str::to_string);
        let mut children = Vec::new();
        for child in &node.children {
            let target = child.require("uid")?.to_string();
            match child.name.as_str() {
                "service" => children.push(UpdaterChild::Service(target)),
                "updater" => children.push(UpdaterChild::Updater(target)),
                other => {
                    return Err(ConfigurationError::InvalidReference {
                        context: format!("updater '{uid}'"),
                        reference: other.to_string(),
                    })
                }
            }
        }
        Ok(Self {
            uid,
            parent,
            children,
        })
    }
}

/// The parsed composition.
#[derive(Debug, Clone, Default)]
pub struct AppDecl {
    pub objects: Vec<ObjectDecl>,
    pub services: Vec<ServiceDecl>,
    pub connections: Vec<ConnectDecl>,
    pub updaters: Vec<UpdaterDecl>,
    pub start: Vec<String>,
    pub update: Vec<String>,
    service_index: HashMap<String, usize>,
    object_index: HashMap<String, usize>,
}

impl AppDecl {
    /// Parse the children of `root` into declarations.
    ///
    /// Updater nodes become services of type [`PARALLEL_UPDATER`] whose
    /// config is the updater node itself.
    pub fn parse(root: &ConfigNode) -> Result<Self, ConfigurationError> {
        let mut decl = AppDecl::default();
        let mut anonymous_channels = 0usize;
        let prefix = root.get("uid").unwrap_or(root.name.as_str()).to_string();

        for node in &root.children {
            match node.name.as_str() {
                "object" => decl.objects.push(parse_object(node)?),
                "service" => decl.services.push(parse_service(node)?),
                "connect" => {
                    let channel = match node.get("channel") {
                        Some(c) => c.to_string(),
                        None => {
                            anonymous_channels += 1;
                            format!("{prefix}/connect#{anonymous_channels}")
                        }
                    };
                    decl.connections.push(parse_connect(node, channel)?);
                }
                "updater" => {
                    let updater = UpdaterDecl::from_node(node)?;
                    let mut svc = ServiceDecl::new(updater.uid.clone(), PARALLEL_UPDATER);
                    svc.worker = node.get("worker").map(str::to_string);
                    svc.config = node.clone();
                    decl.services.push(svc);
                    decl.updaters.push(updater);
                }
                "start" => decl.start.push(node.require("uid")?.to_string()),
                "update" => decl.update.push(node.require("uid")?.to_string()),
                other => {
                    return Err(ConfigurationError::InvalidReference {
                        context: "configuration root".to_string(),
                        reference: other.to_string(),
                    })
                }
            }
        }

        decl.reindex()?;
        Ok(decl)
    }

    fn reindex(&mut self) -> Result<(), ConfigurationError> {
        self.service_index.clear();
        self.object_index.clear();
        for (i, o) in self.objects.iter().enumerate() {
            if self.object_index.insert(o.uid.clone(), i).is_some() {
                return Err(ConfigurationError::DuplicateUid(o.uid.clone()));
            }
        }
        for (i, s) in self.services.iter().enumerate() {
            if self.object_index.contains_key(&s.uid)
                || self.service_index.insert(s.uid.clone(), i).is_some()
            {
                return Err(ConfigurationError::DuplicateUid(s.uid.clone()));
            }
        }
        Ok(())
    }

    pub fn service_position(&self, uid: &str) -> Option<usize> {
        self.service_index.get(uid).copied()
    }

    pub fn object(&self, uid: &str) -> Option<&ObjectDecl> {
        self.object_index.get(uid).map(|&i| &self.objects[i])
    }

    pub fn is_service(&self, uid: &str) -> bool {
        self.service_index.contains_key(uid)
    }
}

fn parse_object(node: &ConfigNode) -> Result<ObjectDecl, ConfigurationError> {
    let uid = node.require("uid")?.to_string();
    let type_name = node.require("type")?.to_string();
    let deferred = match node.get("src") {
        Some("deferred") => true,
        Some(other) if other != "new" => {
            return Err(ConfigurationError::InvalidValue {
                key: format!("{uid}.src"),
                reason: format!("expected 'new' or 'deferred', got '{other}'"),
            })
        }
        _ => node.flag("deferred")?,
    };

    let value = match node.first_child("value") {
        Some(v) => v.to_json(),
        None => node
            .get("value")
            .or(node.value.as_deref())
            .map(scalar)
            .unwrap_or(serde_json::Value::Null),
    };

    Ok(ObjectDecl {
        uid,
        type_name,
        deferred,
        value,
    })
}

fn parse_service(node: &ConfigNode) -> Result<ServiceDecl, ConfigurationError> {
    let uid = node.require("uid")?.to_string();
    let mut decl = ServiceDecl::new(uid.clone(), node.require("type")?);
    decl.worker = node.get("worker").map(str::to_string);

    for child in &node.children {
        if child.name == "config" {
            decl.config = child.clone();
            continue;
        }
        let Some(access) = Access::from_node_name(&child.name) else {
            return Err(ConfigurationError::InvalidReference {
                context: format!("service '{uid}'"),
                reference: child.name.clone(),
            });
        };
        let key = child.require("key")?.to_string();
        let optional = child.flag("optional")?;
        let auto_connect = child.flag("autoConnect")?;

        if child.flag("group")? {
            for (index, member) in child.children_named("key").enumerate() {
                let member_uid = member
                    .get("uid")
                    .or(member.value.as_deref())
                    .ok_or_else(|| ConfigurationError::MissingAttribute {
                        node: format!("{uid}.{key}"),
                        attribute: "uid",
                    })?;
                let mut b = BindingDecl::new(key.clone(), member_uid, access).at(index);
                b.optional = optional || member.flag("optional")?;
                b.auto_connect = auto_connect || member.flag("autoConnect")?;
                decl.bindings.push(b);
            }
        } else {
            let mut b = BindingDecl::new(key, child.require("uid")?, access);
            b.optional = optional;
            b.auto_connect = auto_connect;
            decl.bindings.push(b);
        }
    }

    Ok(decl)
}

fn parse_connect(node: &ConfigNode, channel: String) -> Result<ConnectDecl, ConfigurationError> {
    let mut decl = ConnectDecl {
        channel: channel.clone(),
        signals: Vec::new(),
        slots: Vec::new(),
    };
    for child in &node.children {
        let raw = child.value.as_deref().unwrap_or_default();
        let (owner, key) = raw
            .split_once('/')
            .filter(|(o, k)| !o.is_empty() && !k.is_empty())
            .ok_or_else(|| ConfigurationError::InvalidReference {
                context: format!("channel '{channel}'"),
                reference: raw.to_string(),
            })?;
        match child.name.as_str() {
            "signal" => decl.signals.push(SignalRef::new(owner, key)),
            "slot" => decl.slots.push(SlotRef::new(owner, key)),
            other => {
                return Err(ConfigurationError::InvalidReference {
                    context: format!("channel '{channel}'"),
                    reference: other.to_string(),
                })
            }
        }
    }
    Ok(decl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigNode {
        ConfigNode::new("config")
            .attr("uid", "app")
            .child(
                ConfigNode::new("object")
                    .attr("uid", "image")
                    .attr("type", "Image")
                    .attr("src", "deferred"),
            )
            .child(
                ConfigNode::new("object")
                    .attr("uid", "threshold")
                    .attr("type", "Scalar")
                    .attr("value", "0.5"),
            )
            .child(
                ConfigNode::new("service")
                    .attr("uid", "reader")
                    .attr("type", "test::Reader")
                    .child(ConfigNode::new("out").attr("key", "image").attr("uid", "image")),
            )
            .child(
                ConfigNode::new("service")
                    .attr("uid", "filter")
                    .attr("type", "test::Filter")
                    .attr("worker", "compute")
                    .child(
                        ConfigNode::new("in")
                            .attr("key", "source")
                            .attr("uid", "image")
                            .attr("autoConnect", "true"),
                    )
                    .child(
                        ConfigNode::new("in")
                            .attr("key", "layers")
                            .attr("group", "true")
                            .child(ConfigNode::new("key").attr("uid", "threshold"))
                            .child(ConfigNode::new("key").attr("uid", "image")),
                    )
                    .child(ConfigNode::new("config").attr("passes", "3")),
            )
            .child(
                ConfigNode::new("connect")
                    .child(ConfigNode::new("signal").with_value("reader/started"))
                    .child(ConfigNode::new("slot").with_value("filter/update")),
            )
            .child(
                ConfigNode::new("updater")
                    .attr("uid", "root")
                    .child(ConfigNode::new("service").attr("uid", "filter")),
            )
            .child(ConfigNode::new("start").attr("uid", "reader"))
            .child(ConfigNode::new("update").attr("uid", "filter"))
    }

    #[test]
    fn parses_full_composition() {
        let decl = AppDecl::parse(&sample()).unwrap();

        assert_eq!(decl.objects.len(), 2);
        assert!(decl.object("image").unwrap().deferred);
        assert_eq!(decl.object("threshold").unwrap().value, serde_json::json!(0.5));

        assert_eq!(decl.services.len(), 3);
        let filter = &decl.services[1];
        assert_eq!(filter.worker.as_deref(), Some("compute"));
        assert_eq!(filter.bindings.len(), 3);
        assert!(filter.bindings[0].auto_connect);
        assert_eq!(filter.bindings[2].index, 1);
        assert!(filter.bindings[2].grouped);
        assert_eq!(filter.config.to_json()["passes"], serde_json::json!(3));

        let updater = &decl.services[2];
        assert_eq!(updater.type_name, PARALLEL_UPDATER);
        assert_eq!(decl.updaters[0].children, vec![UpdaterChild::Service("filter".into())]);

        assert_eq!(decl.connections[0].channel, "app/connect#1");
        assert_eq!(decl.connections[0].signals[0], SignalRef::new("reader", "started"));
        assert_eq!(decl.start, vec!["reader"]);
        assert_eq!(decl.update, vec!["filter"]);
    }

    #[test]
    fn duplicate_uid_across_kinds_is_rejected() {
        let root = ConfigNode::new("config")
            .child(ConfigNode::new("object").attr("uid", "x").attr("type", "T"))
            .child(ConfigNode::new("service").attr("uid", "x").attr("type", "S"));

        match AppDecl::parse(&root).unwrap_err() {
            ConfigurationError::DuplicateUid(uid) => assert_eq!(uid, "x"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_attribute_names_the_node() {
        let root = ConfigNode::new("config").child(ConfigNode::new("service").attr("uid", "s"));
        match AppDecl::parse(&root).unwrap_err() {
            ConfigurationError::MissingAttribute { node, attribute } => {
                assert_eq!(node, "service");
                assert_eq!(attribute, "type");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_endpoint_is_rejected() {
        let root = ConfigNode::new("config").child(
            ConfigNode::new("connect")
                .attr("channel", "c")
                .child(ConfigNode::new("signal").with_value("no-separator")),
        );
        assert!(matches!(
            AppDecl::parse(&root).unwrap_err(),
            ConfigurationError::InvalidReference { .. }
        ));
    }

    #[test]
    fn to_json_groups_repeated_children() {
        let node = ConfigNode::new("config")
            .attr("enabled", "true")
            .child(ConfigNode::new("item").with_value("a"))
            .child(ConfigNode::new("item").with_value("b"));
        let json = node.to_json();
        assert_eq!(json["enabled"], serde_json::json!(true));
        assert_eq!(json["item"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
name: config
children:
  - name: object
    attributes: { uid: counter, type: Counter, src: deferred }
  - name: service
    attributes: { uid: ticker, type: demo::Ticker }
    children:
      - name: out
        attributes: { key: counter, uid: counter }
"#;
        let node: ConfigNode = serde_yaml::from_str(yaml).unwrap();
        let decl = AppDecl::parse(&node).unwrap();
        assert!(decl.object("counter").unwrap().deferred);
        assert_eq!(decl.services[0].outputs().count(), 1);
    }
}
