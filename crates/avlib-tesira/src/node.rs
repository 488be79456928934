//! Attribute nodes.
//!
//! An [`AttributeNode`] mirrors one addressable DSP block (or one channel of
//! a block) and keeps a cache of its attributes current:
//!
//! ```text
//! Uninitialized ──device initialized──▶ Initializing ──requests queued──▶ Initialized
//!        │                                    ▲                               │
//!        │                                    └──────device re-initialized────┘
//!        └──────────────────────────── dispose() ──────────────────────────▶ Disposed
//! ```
//!
//! Entering `Initializing` queues one Get per tracked attribute and one
//! Subscribe per subscribed attribute. Replies and publish lines arrive on
//! the device receive path and land in the cache through callbacks held in
//! the correlation registry. Children (channels) are created lazily, either
//! on first access or when the block's count attribute arrives.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use avlib_core::error::{Error, Result};

use crate::code::{Code, Verb};
use crate::descriptor::{AttributeDescriptor, NodeSpec};
use crate::device::{Dsp, InitializeListener};
use crate::key::correlation_key;
use crate::registry::{locked, FeedbackCallback};
use crate::value::Value;

/// Capacity of the per-tree change broadcast.
const CHANGE_CAPACITY: usize = 64;

/// Lifecycle of an [`AttributeNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Disposed = 3,
}

impl NodeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => NodeState::Uninitialized,
            1 => NodeState::Initializing,
            2 => NodeState::Initialized,
            _ => NodeState::Disposed,
        }
    }
}

/// A cached attribute took a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChanged {
    pub instance_tag: String,
    /// Address of the node that changed; empty for the block itself.
    pub indices: Vec<u32>,
    pub attribute: &'static str,
    pub value: Value,
}

/// Handle to one node of a block's attribute tree. Cheap to clone.
#[derive(Clone)]
pub struct AttributeNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    me: Weak<NodeInner>,
    dsp: Dsp,
    spec: &'static NodeSpec,
    instance_tag: String,
    indices: Vec<u32>,
    state: AtomicU8,
    cache: Mutex<HashMap<&'static str, Value>>,
    /// Keys this node registered callbacks under, with the latest callback
    /// for each. Also serializes registration against disposal.
    registered: Mutex<HashMap<String, FeedbackCallback>>,
    /// Attributes that should be subscribed while the node is live.
    subscriptions: Mutex<HashSet<&'static str>>,
    children: Mutex<BTreeMap<u32, AttributeNode>>,
    parent: Option<Weak<NodeInner>>,
    /// Shared by every node of one tree.
    changes: broadcast::Sender<AttributeChanged>,
}

impl std::fmt::Debug for AttributeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeNode")
            .field("spec", &self.inner.spec.name)
            .field("instance_tag", &self.inner.instance_tag)
            .field("indices", &self.inner.indices)
            .field("state", &self.state())
            .finish()
    }
}

impl AttributeNode {
    /// Create the root node of a block.
    ///
    /// If the device is already initialized the node initializes
    /// immediately, otherwise on the device's next initialization.
    pub fn new(dsp: &Dsp, spec: &'static NodeSpec, instance_tag: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let node = Self::build(dsp.clone(), spec, instance_tag.into(), Vec::new(), None, changes);
        node.start();
        node
    }

    fn build(
        dsp: Dsp,
        spec: &'static NodeSpec,
        instance_tag: String,
        indices: Vec<u32>,
        parent: Option<Weak<NodeInner>>,
        changes: broadcast::Sender<AttributeChanged>,
    ) -> Self {
        let subscriptions = spec
            .attributes
            .iter()
            .filter(|d| d.subscribe)
            .map(|d| d.name)
            .collect();
        let inner = Arc::new_cyclic(|me| NodeInner {
            me: me.clone(),
            dsp,
            spec,
            instance_tag,
            indices,
            state: AtomicU8::new(NodeState::Uninitialized as u8),
            cache: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(subscriptions),
            children: Mutex::new(BTreeMap::new()),
            parent,
            changes,
        });
        Self { inner }
    }

    /// Hook the node to the device initialization signal.
    fn start(&self) {
        let listener: Weak<dyn InitializeListener> = self.inner.me.clone();
        self.inner.dsp.add_listener(listener);
        if self.inner.dsp.is_initialized() {
            self.inner.initialize();
        }
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn instance_tag(&self) -> &str {
        &self.inner.instance_tag
    }

    pub fn indices(&self) -> &[u32] {
        &self.inner.indices
    }

    pub fn spec(&self) -> &'static NodeSpec {
        self.inner.spec
    }

    pub fn dsp(&self) -> &Dsp {
        &self.inner.dsp
    }

    /// The node this one is a child of, if it is still alive.
    pub fn parent(&self) -> Option<AttributeNode> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| AttributeNode { inner })
    }

    /// Cached value of `attribute`, if one has arrived.
    pub fn value(&self, attribute: &str) -> Option<Value> {
        locked(&self.inner.cache).get(attribute).cloned()
    }

    /// Changes anywhere in this node's tree.
    pub fn changes(&self) -> broadcast::Receiver<AttributeChanged> {
        self.inner.changes.subscribe()
    }

    /// Build a code for `attribute` of this block, register `callback` under
    /// its key and queue it.
    ///
    /// `indices` is the full address; pass [`AttributeNode::indices`] to
    /// address this node. Returns the correlation key.
    pub fn request_attribute(
        &self,
        callback: FeedbackCallback,
        verb: Verb,
        attribute: &str,
        value: Option<Value>,
        indices: &[u32],
    ) -> Result<String> {
        self.inner
            .request_attribute(callback, verb, attribute, value, indices)
    }

    /// Re-read `attribute` into the cache.
    pub fn get(&self, attribute: &str) -> Result<()> {
        let descriptor = self.inner.descriptor(attribute)?;
        self.inner.request(Verb::Get, descriptor, None)
    }

    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let descriptor = self.inner.descriptor(attribute)?;
        self.inner.request(Verb::Set, descriptor, Some(value.into()))
    }

    pub fn increment(&self, attribute: &str, amount: impl Into<Value>) -> Result<()> {
        let descriptor = self.inner.descriptor(attribute)?;
        self.inner
            .request(Verb::Increment, descriptor, Some(amount.into()))
    }

    pub fn decrement(&self, attribute: &str, amount: impl Into<Value>) -> Result<()> {
        let descriptor = self.inner.descriptor(attribute)?;
        self.inner
            .request(Verb::Decrement, descriptor, Some(amount.into()))
    }

    pub fn toggle(&self, attribute: &str) -> Result<()> {
        let descriptor = self.inner.descriptor(attribute)?;
        self.inner.request(Verb::Toggle, descriptor, None)
    }

    /// Turn the subscription for `attribute` on or off.
    ///
    /// On a live node the Subscribe/Unsubscribe is queued at once; otherwise
    /// the choice takes effect at the next initialization. The lifecycle
    /// state is not affected.
    pub fn set_subscribed(&self, attribute: &str, subscribed: bool) -> Result<()> {
        self.inner.set_subscribed(attribute, subscribed)
    }

    pub fn is_subscribed(&self, attribute: &str) -> bool {
        locked(&self.inner.subscriptions).contains(attribute)
    }

    /// The child at `index`, creating it if absent.
    ///
    /// Fails with `InvalidParameter` for index 0 or if this node type has
    /// no children.
    pub fn child(&self, index: u32) -> Result<AttributeNode> {
        self.inner.child(index)
    }

    /// Make sure children `1..=count` exist. Never removes children.
    pub fn rebuild_children(&self, count: u32) -> Result<()> {
        self.inner.rebuild_children(count)
    }

    /// Existing children in index order.
    pub fn children(&self) -> Vec<AttributeNode> {
        locked(&self.inner.children).values().cloned().collect()
    }

    /// Tear the node down.
    ///
    /// Queues an Unsubscribe for every subscribed attribute, unregisters
    /// every key the node registered, disposes all children and detaches
    /// from the parent. Feedback arriving afterwards is ignored.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn ptr_eq(&self, other: &AttributeNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl NodeInner {
    fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_disposed(&self) -> bool {
        self.state() == NodeState::Disposed
    }

    fn transition(&self, from: NodeState, to: NodeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn descriptor(&self, attribute: &str) -> Result<&'static AttributeDescriptor> {
        self.spec.descriptor(attribute).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "{} has no attribute `{attribute}`",
                self.spec.name
            ))
        })
    }

    fn key(&self, attribute: &str) -> String {
        correlation_key(&self.instance_tag, Some(attribute), &self.indices)
    }

    fn initialize(&self) {
        let current = self.state();
        if current == NodeState::Disposed || !self.transition(current, NodeState::Initializing) {
            return;
        }
        debug!(
            tag = %self.instance_tag,
            indices = ?self.indices,
            "initializing {}",
            self.spec.name
        );

        let subscriptions = locked(&self.subscriptions).clone();
        for descriptor in self.spec.attributes {
            if let Err(e) = self.request(Verb::Get, descriptor, None) {
                warn!(tag = %self.instance_tag, attribute = descriptor.name, error = %e, "get failed");
            }
            if subscriptions.contains(descriptor.name) {
                if let Err(e) = self.subscribe(descriptor) {
                    warn!(tag = %self.instance_tag, attribute = descriptor.name, error = %e, "subscribe failed");
                }
            }
        }

        self.transition(NodeState::Initializing, NodeState::Initialized);
    }

    fn request_attribute(
        &self,
        callback: FeedbackCallback,
        verb: Verb,
        attribute: &str,
        value: Option<Value>,
        indices: &[u32],
    ) -> Result<String> {
        let code = Code::attribute_code(&self.instance_tag, verb, attribute, value, indices);
        let key = code.key();
        {
            let mut registered = locked(&self.registered);
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            self.dsp
                .registry()
                .register(key.clone(), Arc::clone(&callback));
            registered.insert(key.clone(), callback);
        }
        self.dsp.send(&code)?;
        Ok(key)
    }

    /// Request on this node's own address with the cache-updating callback.
    fn request(
        &self,
        verb: Verb,
        descriptor: &'static AttributeDescriptor,
        value: Option<Value>,
    ) -> Result<()> {
        self.request_attribute(
            self.callback(descriptor),
            verb,
            descriptor.name,
            value,
            &self.indices,
        )
        .map(|_| ())
    }

    /// Subscribe with the correlation key as the publish token.
    fn subscribe(&self, descriptor: &'static AttributeDescriptor) -> Result<()> {
        let token = Value::from(self.key(descriptor.name));
        self.request(Verb::Subscribe, descriptor, Some(token))
    }

    fn unsubscribe(&self, descriptor: &'static AttributeDescriptor) -> Result<()> {
        let token = Value::from(self.key(descriptor.name));
        let code = Code::attribute_code(
            &self.instance_tag,
            Verb::Unsubscribe,
            descriptor.name,
            Some(token),
            &self.indices,
        );
        self.dsp.send(&code)
    }

    fn set_subscribed(&self, attribute: &str, subscribed: bool) -> Result<()> {
        let descriptor = self.descriptor(attribute)?;
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let changed = {
            let mut subscriptions = locked(&self.subscriptions);
            if subscribed {
                subscriptions.insert(descriptor.name)
            } else {
                subscriptions.remove(descriptor.name)
            }
        };
        if !changed {
            return Ok(());
        }
        match self.state() {
            NodeState::Initializing | NodeState::Initialized if subscribed => {
                self.subscribe(descriptor)
            }
            NodeState::Initializing | NodeState::Initialized => self.unsubscribe(descriptor),
            _ => Ok(()),
        }
    }

    fn callback(&self, descriptor: &'static AttributeDescriptor) -> FeedbackCallback {
        let node = self.me.clone();
        Arc::new(move |record: &Value| match node.upgrade() {
            Some(node) => node.accept(descriptor, record),
            None => Ok(()),
        })
    }

    /// Take one reply or publish record for `descriptor`.
    fn accept(&self, descriptor: &'static AttributeDescriptor, record: &Value) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let value = descriptor.kind.convert(record.get("value")?)?;
        self.update(descriptor.name, value);
        Ok(())
    }

    fn update(&self, attribute: &'static str, value: Value) {
        {
            let mut cache = locked(&self.cache);
            if self.is_disposed() || cache.get(attribute) == Some(&value) {
                return;
            }
            cache.insert(attribute, value.clone());
        }
        trace!(tag = %self.instance_tag, indices = ?self.indices, attribute, value = %value, "attribute changed");

        if self.spec.count_attribute == Some(attribute) {
            match value.as_i64().map(u32::try_from) {
                Ok(Ok(count)) => {
                    if let Err(e) = self.rebuild_children(count) {
                        warn!(tag = %self.instance_tag, error = %e, "could not build children");
                    }
                }
                _ => warn!(tag = %self.instance_tag, value = %value, "invalid child count"),
            }
        }

        let _ = self.changes.send(AttributeChanged {
            instance_tag: self.instance_tag.clone(),
            indices: self.indices.clone(),
            attribute,
            value,
        });
    }

    fn child_spec(&self) -> Result<&'static NodeSpec> {
        self.spec.children.ok_or_else(|| {
            Error::InvalidParameter(format!("{} has no children", self.spec.name))
        })
    }

    fn new_child(&self, spec: &'static NodeSpec, index: u32) -> AttributeNode {
        let mut indices = self.indices.clone();
        indices.push(index);
        AttributeNode::build(
            self.dsp.clone(),
            spec,
            self.instance_tag.clone(),
            indices,
            Some(self.me.clone()),
            self.changes.clone(),
        )
    }

    fn child(&self, index: u32) -> Result<AttributeNode> {
        let spec = self.child_spec()?;
        if index == 0 {
            return Err(Error::InvalidParameter(
                "channel indices start at 1".into(),
            ));
        }
        let (child, created) = {
            let mut children = locked(&self.children);
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            match children.get(&index) {
                Some(child) => (child.clone(), false),
                None => {
                    let child = self.new_child(spec, index);
                    children.insert(index, child.clone());
                    (child, true)
                }
            }
        };
        if created {
            child.start();
        }
        Ok(child)
    }

    fn rebuild_children(&self, count: u32) -> Result<()> {
        let spec = self.child_spec()?;
        let created: Vec<AttributeNode> = {
            let mut children = locked(&self.children);
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            (1..=count)
                .filter(|index| !children.contains_key(index))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|index| {
                    let child = self.new_child(spec, index);
                    children.insert(index, child.clone());
                    child
                })
                .collect()
        };
        debug!(tag = %self.instance_tag, count, created = created.len(), "children rebuilt");
        for child in &created {
            child.start();
        }
        Ok(())
    }

    fn dispose(&self) {
        let previous = NodeState::from_u8(
            self.state
                .swap(NodeState::Disposed as u8, Ordering::AcqRel),
        );
        if previous == NodeState::Disposed {
            return;
        }
        debug!(tag = %self.instance_tag, indices = ?self.indices, "disposing {}", self.spec.name);

        // A key another node has since registered under belongs to that
        // node, along with the device-side subscription behind it.
        let registered: Vec<(String, FeedbackCallback)> =
            locked(&self.registered).drain().collect();
        let owned: HashSet<String> = registered
            .into_iter()
            .filter(|(key, callback)| self.dsp.registry().unregister_if(key, callback))
            .map(|(key, _)| key)
            .collect();

        if previous != NodeState::Uninitialized {
            let subscriptions: Vec<&'static str> =
                locked(&self.subscriptions).iter().copied().collect();
            for name in subscriptions {
                let Some(descriptor) = self.spec.descriptor(name) else {
                    continue;
                };
                if !owned.contains(&self.key(name)) {
                    debug!(tag = %self.instance_tag, attribute = name, "subscription taken over, not unsubscribing");
                    continue;
                }
                if let Err(e) = self.unsubscribe(descriptor) {
                    debug!(tag = %self.instance_tag, attribute = name, error = %e, "unsubscribe not sent");
                }
            }
        }

        let children = std::mem::take(&mut *locked(&self.children));
        for child in children.into_values() {
            child.dispose();
        }

        if let (Some(parent), Some(&index)) = (
            self.parent.as_ref().and_then(Weak::upgrade),
            self.indices.last(),
        ) {
            let mut siblings = locked(&parent.children);
            if siblings
                .get(&index)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c.inner), self))
            {
                siblings.remove(&index);
            }
        }

        let listener: Weak<dyn InitializeListener> = self.me.clone();
        self.dsp.remove_listener(&listener);
    }
}

impl InitializeListener for NodeInner {
    fn device_initialized(&self) {
        self.initialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ValueKind;
    use crate::device::tests::{device, RecordingSink};
    use avlib_text_io::QueueEvent;

    static CHANNEL: NodeSpec = NodeSpec {
        name: "test channel",
        attributes: &[
            AttributeDescriptor::subscribed("level", ValueKind::Number),
            AttributeDescriptor::polled("label", ValueKind::Text),
        ],
        children: None,
        count_attribute: None,
    };

    static BLOCK: NodeSpec = NodeSpec {
        name: "test block",
        attributes: &[AttributeDescriptor::polled("numChannels", ValueKind::Integer)],
        children: Some(&CHANNEL),
        count_attribute: Some("numChannels"),
    };

    fn publish(dsp: &Dsp, token: &str, value: &str) {
        dsp.handle_queue_event(QueueEvent::Unsolicited(format!(
            "! \"publishToken\":\"{token}\" \"value\":{value}"
        )));
    }

    fn reply_to(dsp: &Dsp, sink: &RecordingSink, text: &str, line: &str) {
        let command = sink
            .commands()
            .into_iter()
            .find(|c| c.trimmed() == text)
            .unwrap_or_else(|| panic!("{text} was not sent"));
        dsp.handle_queue_event(QueueEvent::Response {
            command,
            line: line.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn waits_for_device_initialization() {
        let (dsp, sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        assert_eq!(block.state(), NodeState::Uninitialized);
        assert!(sink.lines().is_empty());

        dsp.set_initialized(true);
        assert_eq!(block.state(), NodeState::Initialized);
        assert_eq!(sink.lines(), vec!["Level1 get numChannels"]);
    }

    #[test]
    fn initializes_at_once_on_live_device() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        assert_eq!(channel.state(), NodeState::Initialized);
        assert_eq!(
            sink.lines(),
            vec![
                "Level1 get level",
                "Level1 subscribe level Level1-level-",
                "Level1 get label",
            ]
        );
    }

    #[test]
    fn device_reinitialization_reissues_requests() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        sink.clear();

        dsp.set_initialized(false);
        assert!(sink.lines().is_empty());
        dsp.set_initialized(true);
        assert_eq!(sink.lines(), vec!["Level1 get numChannels"]);
        assert_eq!(block.state(), NodeState::Initialized);
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    #[test]
    fn count_reply_builds_children() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");

        reply_to(&dsp, &sink, "Level1 get numChannels", "+OK \"value\":2");
        assert_eq!(block.value("numChannels"), Some(Value::from(2)));
        let children = block.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].indices(), &[2]);

        let lines = sink.lines();
        assert!(lines.contains(&"Level1 get level 1".to_string()));
        assert!(lines.contains(&"Level1 subscribe level 1 Level1-level-1".to_string()));
        assert!(lines.contains(&"Level1 get label 2".to_string()));
    }

    #[test]
    fn child_is_created_once() {
        let (dsp, _sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let a = block.child(3).unwrap();
        let b = block.child(3).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(block.children().len(), 1);
        assert!(a.parent().unwrap().ptr_eq(&block));
    }

    #[test]
    fn concurrent_child_access_yields_one_node() {
        let (dsp, _sink) = device();
        dsp.set_initialized(true);
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let block = block.clone();
                std::thread::spawn(move || block.child(3).unwrap())
            })
            .collect();
        let nodes: Vec<AttributeNode> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for node in &nodes {
            assert!(node.ptr_eq(&nodes[0]));
        }
        assert_eq!(block.children().len(), 1);
    }

    #[test]
    fn rebuild_never_removes() {
        let (dsp, _sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        block.rebuild_children(3).unwrap();
        block.rebuild_children(1).unwrap();
        assert_eq!(block.children().len(), 3);
    }

    #[test]
    fn rebuild_keeps_existing_children() {
        let (dsp, _sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        block.rebuild_children(3).unwrap();
        let before = block.children();

        block.rebuild_children(5).unwrap();
        let after = block.children();
        assert_eq!(after.len(), 5);
        for (old, new) in before.iter().zip(&after) {
            assert!(old.ptr_eq(new));
        }
        let indices: Vec<Vec<u32>> = after[3..].iter().map(|c| c.indices().to_vec()).collect();
        assert_eq!(indices, vec![vec![4], vec![5]]);
        assert!(block.child(2).unwrap().ptr_eq(&before[1]));
    }

    #[test]
    fn invalid_child_requests() {
        let (dsp, _sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        assert!(matches!(block.child(0), Err(Error::InvalidParameter(_))));
        let channel = block.child(1).unwrap();
        assert!(matches!(channel.child(1), Err(Error::InvalidParameter(_))));
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    #[test]
    fn publish_updates_cache_and_notifies_once() {
        let (dsp, _sink) = device();
        dsp.set_initialized(true);
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let channel = block.child(1).unwrap();
        let mut changes = block.changes();

        publish(&dsp, "Level1-level-1", "-10.000000");
        assert_eq!(channel.value("level"), Some(Value::from(-10.0)));
        let change = changes.try_recv().unwrap();
        assert_eq!(change.attribute, "level");
        assert_eq!(change.indices, vec![1]);
        assert_eq!(change.value, Value::from(-10.0));

        publish(&dsp, "Level1-level-1", "-10");
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn wrong_shape_leaves_cache_alone() {
        let (dsp, _sink) = device();
        dsp.set_initialized(true);
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");

        publish(&dsp, "Level1-level-", "-3");
        publish(&dsp, "Level1-level-", "loud");
        assert_eq!(channel.value("level"), Some(Value::from(-3.0)));

        let record = Value::record([("value", Value::from("loud"))]);
        assert!(matches!(
            dsp.registry().dispatch("Level1-level-", &record),
            crate::registry::Dispatch::Failed(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn setters_queue_codes() {
        let (dsp, sink) = device();
        let channel = AttributeNode::new(&dsp, &BLOCK, "Level1").child(2).unwrap();
        channel.set("level", -6.0).unwrap();
        channel.increment("level", 1.5).unwrap();
        channel.decrement("level", 3).unwrap();
        channel.set("label", "Podium").unwrap();
        channel.get("label").unwrap();
        assert_eq!(
            sink.lines(),
            vec![
                "Level1 set level 2 -6",
                "Level1 increment level 2 1.5",
                "Level1 decrement level 2 3",
                "Level1 set label 2 Podium",
                "Level1 get label 2",
            ]
        );
        assert!(matches!(channel.toggle("gain"), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn request_attribute_with_custom_callback() {
        let (dsp, sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Mixer1");
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let key = block
            .request_attribute(
                Arc::new(move |record: &Value| {
                    *slot.lock().unwrap() = Some(record.get("value")?.as_bool()?);
                    Ok(())
                }),
                Verb::Get,
                "crosspointLevelState",
                None,
                &[1, 3],
            )
            .unwrap();
        assert_eq!(key, "Mixer1-crosspointLevelState-1-3");

        reply_to(&dsp, &sink, "Mixer1 get crosspointLevelState 1 3", "+OK \"value\":true");
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    #[test]
    fn live_subscription_toggle() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        sink.clear();

        channel.set_subscribed("level", false).unwrap();
        channel.set_subscribed("level", false).unwrap();
        channel.set_subscribed("label", true).unwrap();
        assert_eq!(channel.state(), NodeState::Initialized);
        assert!(!channel.is_subscribed("level"));
        assert_eq!(
            sink.lines(),
            vec![
                "Level1 unsubscribe level Level1-level-",
                "Level1 subscribe label Level1-label-",
            ]
        );
    }

    #[test]
    fn subscription_choice_before_initialization() {
        let (dsp, sink) = device();
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        channel.set_subscribed("level", false).unwrap();
        assert!(sink.lines().is_empty());

        dsp.set_initialized(true);
        assert_eq!(sink.lines(), vec!["Level1 get level", "Level1 get label"]);
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    #[test]
    fn dispose_unsubscribes_and_unregisters() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let channel = block.child(1).unwrap();
        assert!(dsp.registry().contains("Level1-level-1"));
        assert!(dsp.registry().contains("Level1-numChannels-"));
        sink.clear();

        block.dispose();
        assert!(block.is_disposed());
        assert!(channel.is_disposed());
        assert!(block.children().is_empty());
        assert!(dsp.registry().is_empty());
        assert_eq!(sink.lines(), vec!["Level1 unsubscribe level 1 Level1-level-1"]);
    }

    #[test]
    fn disposing_replaced_block_keeps_replacement_live() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let old = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let _old_channel = old.child(1).unwrap();
        let new = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let new_channel = new.child(1).unwrap();
        sink.clear();

        old.dispose();
        assert!(dsp.registry().contains("Level1-level-1"));
        assert!(dsp.registry().contains("Level1-numChannels-"));
        assert!(sink.lines().is_empty());

        publish(&dsp, "Level1-level-1", "-3.000000");
        assert_eq!(new_channel.value("level"), Some(Value::from(-3.0)));

        new.dispose();
        assert!(dsp.registry().is_empty());
        assert_eq!(sink.lines(), vec!["Level1 unsubscribe level 1 Level1-level-1"]);
    }

    #[test]
    fn dispose_racing_requests_leaves_no_callbacks() {
        for _ in 0..200 {
            let (dsp, _sink) = device();
            dsp.set_initialized(true);
            let channel = AttributeNode::new(&dsp, &BLOCK, "Level1").child(1).unwrap();
            std::thread::scope(|scope| {
                let requester = channel.clone();
                scope.spawn(move || {
                    for _ in 0..20 {
                        if requester.get("label").is_err() {
                            break;
                        }
                    }
                });
                channel.dispose();
            });
            assert!(!dsp.registry().contains("Level1-label-1"));
        }
    }

    #[test]
    fn disposed_child_detaches_from_parent() {
        let (dsp, _sink) = device();
        let block = AttributeNode::new(&dsp, &BLOCK, "Level1");
        let channel = block.child(2).unwrap();
        channel.dispose();
        assert!(block.children().is_empty());

        let fresh = block.child(2).unwrap();
        assert!(!fresh.ptr_eq(&channel));
        assert_eq!(fresh.state(), NodeState::Uninitialized);
    }

    #[test]
    fn feedback_after_dispose_is_ignored() {
        let (dsp, _sink) = device();
        dsp.set_initialized(true);
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        let descriptor = CHANNEL.descriptor("level").unwrap();
        let callback = channel.inner.callback(descriptor);

        channel.dispose();
        let record = Value::record([("value", Value::from(-20.0))]);
        callback(&record).unwrap();
        assert_eq!(channel.value("level"), None);
    }

    #[test]
    fn disposed_node_rejects_requests() {
        let (dsp, sink) = device();
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        channel.dispose();
        channel.dispose();
        assert!(matches!(channel.set("level", 0.0), Err(Error::Disposed)));
        assert!(matches!(
            channel.set_subscribed("label", true),
            Err(Error::Disposed)
        ));

        dsp.set_initialized(true);
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn uninitialized_dispose_sends_nothing() {
        let (dsp, sink) = device();
        let channel = AttributeNode::new(&dsp, &CHANNEL, "Level1");
        channel.dispose();
        assert!(sink.lines().is_empty());
    }
}
