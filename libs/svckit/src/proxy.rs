//! Proxy Bus - named channels connecting signal sources to slot sinks.
//!
//! A channel aggregates signals and slots; every signal on a channel is
//! connected to every slot on it. Connections are kept in creation order and
//! emission walks a snapshot of them, so a concurrent connect/disconnect never
//! invalidates an in-flight fan-out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::error::SvcError;
use crate::worker;

/// Arguments carried by an emission.
pub type SlotArgs = Vec<serde_json::Value>;

/// `(owner uid, signal key)`. Owners are services or objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalRef {
    pub owner: String,
    pub key: String,
}

impl SignalRef {
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
        }
    }

    /// The `modified` signal every object exposes.
    pub fn modified(object: impl Into<String>) -> Self {
        Self::new(object, crate::object::MODIFIED_SIG)
    }
}

impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.key)
    }
}

/// `(owner uid, slot key)`. Owners are services.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    pub owner: String,
    pub key: String,
}

impl SlotRef {
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.key)
    }
}

/// Something whose slots can be invoked by the bus.
#[async_trait]
pub trait SlotTarget: Send + Sync {
    async fn invoke_slot(self: Arc<Self>, slot: &str, args: SlotArgs) -> Result<(), SvcError>;
}

struct Connection {
    channel: String,
    signal: SignalRef,
    slot: SlotRef,
    target: Weak<dyn SlotTarget>,
    blocked: AtomicUsize,
}

impl Connection {
    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) > 0
    }
}

#[derive(Default)]
struct Channel {
    signals: Vec<SignalRef>,
    slots: Vec<(SlotRef, Weak<dyn SlotTarget>)>,
}

impl Channel {
    fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.slots.is_empty()
    }
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, Channel>,
    connections: Vec<Arc<Connection>>,
    arity: HashMap<SignalRef, usize>,
}

impl BusState {
    fn collect_garbage(&mut self, channel: &str) {
        if self.channels.get(channel).is_some_and(Channel::is_empty) {
            self.channels.remove(channel);
            tracing::trace!(channel, "Removed empty channel");
        }
    }
}

/// Process-wide (per application context) table of named channels.
#[derive(Default)]
pub struct ProxyBus {
    state: RwLock<BusState>,
}

impl std::fmt::Debug for ProxyBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ProxyBus")
            .field("channels", &state.channels.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl ProxyBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a signal source to `channel`. Returns false if it was already there.
    pub fn connect_signal(&self, channel: &str, signal: SignalRef) -> bool {
        let mut state = self.state.write();
        let ch = state.channels.entry(channel.to_string()).or_default();
        if ch.signals.contains(&signal) {
            return false;
        }
        ch.signals.push(signal.clone());
        let new: Vec<Arc<Connection>> = ch
            .slots
            .iter()
            .map(|(slot, target)| {
                Arc::new(Connection {
                    channel: channel.to_string(),
                    signal: signal.clone(),
                    slot: slot.clone(),
                    target: target.clone(),
                    blocked: AtomicUsize::new(0),
                })
            })
            .collect();
        state.connections.extend(new);
        tracing::debug!(channel, signal = %signal, "Signal connected");
        true
    }

    /// Adds a slot sink to `channel`. Returns false if it was already there.
    pub fn connect_slot(&self, channel: &str, slot: SlotRef, target: Weak<dyn SlotTarget>) -> bool {
        let mut state = self.state.write();
        let ch = state.channels.entry(channel.to_string()).or_default();
        if ch.slots.iter().any(|(s, _)| *s == slot) {
            return false;
        }
        ch.slots.push((slot.clone(), target.clone()));
        let new: Vec<Arc<Connection>> = ch
            .signals
            .iter()
            .map(|signal| {
                Arc::new(Connection {
                    channel: channel.to_string(),
                    signal: signal.clone(),
                    slot: slot.clone(),
                    target: target.clone(),
                    blocked: AtomicUsize::new(0),
                })
            })
            .collect();
        state.connections.extend(new);
        tracing::debug!(channel, slot = %slot, "Slot connected");
        true
    }

    pub fn disconnect_signal(&self, channel: &str, signal: &SignalRef) -> bool {
        let mut state = self.state.write();
        let Some(ch) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = ch.signals.len();
        ch.signals.retain(|s| s != signal);
        if ch.signals.len() == before {
            return false;
        }
        state
            .connections
            .retain(|c| !(c.channel == channel && c.signal == *signal));
        state.collect_garbage(channel);
        true
    }

    pub fn disconnect_slot(&self, channel: &str, slot: &SlotRef) -> bool {
        let mut state = self.state.write();
        let Some(ch) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = ch.slots.len();
        ch.slots.retain(|(s, _)| s != slot);
        if ch.slots.len() == before {
            return false;
        }
        state
            .connections
            .retain(|c| !(c.channel == channel && c.slot == *slot));
        state.collect_garbage(channel);
        true
    }

    /// Removes every signal and slot owned by `owner` from every channel.
    /// Returns the number of endpoints removed.
    pub fn disconnect_owner(&self, owner: &str) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (name, ch) in state.channels.iter_mut() {
            let before = ch.signals.len() + ch.slots.len();
            ch.signals.retain(|s| s.owner != owner);
            ch.slots.retain(|(s, _)| s.owner != owner);
            removed += before - (ch.signals.len() + ch.slots.len());
            if ch.is_empty() {
                emptied.push(name.clone());
            }
        }
        state
            .connections
            .retain(|c| c.signal.owner != owner && c.slot.owner != owner);
        for name in emptied {
            state.channels.remove(&name);
        }
        if removed > 0 {
            tracing::debug!(owner, removed, "Disconnected owner endpoints");
        }
        removed
    }

    /// Drops a whole channel and its connections.
    pub fn disconnect_channel(&self, channel: &str) -> bool {
        let mut state = self.state.write();
        if state.channels.remove(channel).is_none() {
            return false;
        }
        state.connections.retain(|c| c.channel != channel);
        true
    }

    /// Records the arity of a signal; emissions are checked against it.
    pub fn declare_signal(&self, signal: SignalRef, arity: usize) {
        self.state.write().arity.insert(signal, arity);
    }

    /// Forgets every declared signal of `owner`.
    pub fn forget_signals(&self, owner: &str) {
        self.state.write().arity.retain(|s, _| s.owner != owner);
    }

    pub fn channel_count(&self) -> usize {
        self.state.read().channels.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.state.read().channels.contains_key(channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Suppresses every connection `signal -> slot` while the returned guard is alive.
    /// Returns `None` if no such connection exists.
    pub fn blocker(&self, signal: &SignalRef, slot: &SlotRef) -> Option<Blocker> {
        let conns: Vec<Arc<Connection>> = self
            .state
            .read()
            .connections
            .iter()
            .filter(|c| c.signal == *signal && c.slot == *slot)
            .cloned()
            .collect();
        if conns.is_empty() {
            return None;
        }
        for c in &conns {
            c.blocked.fetch_add(1, Ordering::AcqRel);
        }
        Some(Blocker { conns })
    }

    fn check_arity(&self, signal: &SignalRef, args: &SlotArgs) -> Result<(), SvcError> {
        match self.state.read().arity.get(signal) {
            Some(&expected) if expected != args.len() => Err(SvcError::ArityMismatch {
                signal: signal.to_string(),
                expected,
                got: args.len(),
            }),
            _ => Ok(()),
        }
    }

    fn snapshot(&self, signal: &SignalRef) -> Vec<Arc<Connection>> {
        self.state
            .read()
            .connections
            .iter()
            .filter(|c| c.signal == *signal)
            .cloned()
            .collect()
    }

    /// Synchronous emission: every connected slot runs, in connection order,
    /// before this returns. Remaining slots still run after a failure; the
    /// first error is returned.
    pub async fn emit(&self, signal: &SignalRef, args: SlotArgs) -> Result<(), SvcError> {
        self.check_arity(signal, &args)?;
        let mut first_err = None;
        for conn in self.snapshot(signal) {
            if conn.is_blocked() {
                tracing::trace!(signal = %signal, slot = %conn.slot, "Connection blocked");
                continue;
            }
            let Some(target) = conn.target.upgrade() else {
                continue;
            };
            if let Err(e) = target.invoke_slot(&conn.slot.key, args.clone()).await {
                tracing::warn!(signal = %signal, slot = %conn.slot, error = %e, "Slot invocation failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Asynchronous emission: each slot is posted to its target's own
    /// execution context. The caller may join the returned handle or drop it.
    pub fn async_emit(&self, signal: &SignalRef, args: SlotArgs) -> Result<PendingEmission, SvcError> {
        self.check_arity(signal, &args)?;
        let mut handles = Vec::new();
        for conn in self.snapshot(signal) {
            if conn.is_blocked() {
                continue;
            }
            let Some(target) = conn.target.upgrade() else {
                continue;
            };
            let slot = conn.slot.key.clone();
            let args = args.clone();
            handles.push(tokio::spawn(worker::detached(async move {
                target.invoke_slot(&slot, args).await
            })));
        }
        Ok(PendingEmission { handles })
    }
}

/// RAII guard returned by [`ProxyBus::blocker`].
pub struct Blocker {
    conns: Vec<Arc<Connection>>,
}

impl Drop for Blocker {
    fn drop(&mut self) {
        for c in &self.conns {
            c.blocked.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocker")
            .field("connections", &self.conns.len())
            .finish()
    }
}

/// Handle to the slot invocations of an asynchronous emission.
#[derive(Debug)]
pub struct PendingEmission {
    handles: Vec<JoinHandle<Result<(), SvcError>>>,
}

impl PendingEmission {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every posted slot. All are awaited; the first error wins.
    pub async fn join(self) -> Result<(), SvcError> {
        let mut first_err = None;
        for h in self.handles {
            let res = match h.await {
                Ok(r) => r,
                Err(e) => Err(SvcError::from(e)),
            };
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
