//! Connection and dispatch tree: the mapping between the flat wire protocol
//! and the in-memory object tree.
//!
//! A [`DispatcherConnection`] owns a registry of live [`Dispatcher`] nodes
//! keyed by guid. Nodes form a tree mirroring server-side ownership: each
//! node has exactly one parent, fixed at registration, and owns its children.
//! Inbound call envelopes are routed to the addressed node by a single map
//! lookup; each call runs under its own progress controller and writes back
//! exactly one completion envelope with the matching id. Events fan out to a
//! snapshot of the node's current subscribers and ride the same outbound
//! channel as completions, so per-node event order is preserved.
//!
//! Routing is driven by the transport's message arrival: inbound frames are
//! processed in delivery order, while completions for distinct calls may be
//! written in any order.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use downcast_rs::{DowncastSync, impl_downcast};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use enginelink_protocol::{Call, Event, Message, Response};

use crate::error::{Error, Result};
use crate::progress::{CallMetadata, Progress, ProgressController};


/// Best-effort teardown window after the connection enters its terminal
/// state, independent of any single call's deadline.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Domain state attached to a node. Collaborators downcast it back to their
/// concrete type when resolving guid references in call parameters.
pub trait DispatcherState: DowncastSync {}
impl_downcast!(sync DispatcherState);

impl DispatcherState for () {}

/// Handler for one method of a node type.
pub type MethodHandler =
    Arc<dyn Fn(Value, Progress) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Observer invoked with the frozen call metadata when a call settles.
pub type CallObserver = Box<dyn Fn(&CallMetadata) + Send + Sync>;

/// Explicit method-name-to-handler table for one node type, validated at
/// registration time. An unrecognized name at dispatch is a table miss that
/// fails the call, never a crash.
pub struct MethodTable {
    type_name: String,
    handlers: HashMap<String, MethodHandler>,
}

impl MethodTable {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler; duplicate names are rejected here rather than
    /// silently shadowed at dispatch time.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, Progress) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        if self.handlers.contains_key(name) {
            return Err(Error::DuplicateMethod {
                type_name: self.type_name.clone(),
                method: name.to_string(),
            });
        }
        self.handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get(&self, name: &str) -> Option<&MethodHandler> {
        self.handlers.get(name)
    }
}

/// Notification delivered to a node's subscribers.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    /// An event emitted on the node.
    Event { method: String, params: Value },
    /// The node was disposed. Fires exactly once per node.
    Disposed,
}

/// Handle identifying one subscription on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<DispatcherEvent>,
}

/// A remote-object proxy node in the dispatch tree.
///
/// The guid is unique for the lifetime of the connection and never reused;
/// the parent is fixed at registration. A node is reachable through the
/// registry if and only if neither it nor any ancestor has been disposed.
pub struct Dispatcher {
    guid: Arc<str>,
    type_name: String,
    parent: Option<Weak<Dispatcher>>,
    children: Mutex<Vec<Arc<Dispatcher>>>,
    disposed: AtomicBool,
    state: Arc<dyn DispatcherState>,
    methods: MethodTable,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

impl Dispatcher {
    pub fn guid(&self) -> &Arc<str> {
        &self.guid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent(&self) -> Option<Arc<Dispatcher>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Downcasts the attached domain state to its concrete type.
    pub fn state<T: DispatcherState>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.state).into_any_arc().downcast::<T>().ok()
    }

    /// Adds a subscriber. Events and the disposed notification are pushed to
    /// a snapshot of current subscribers, so subscribing or unsubscribing
    /// during delivery never affects an in-flight fan-out.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<DispatcherEvent>) {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    fn notify(&self, event: DispatcherEvent) {
        let snapshot: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| s.tx.clone())
            .collect();
        for tx in snapshot {
            let _ = tx.send(event.clone());
        }
    }
}

/// Options for [`DispatcherConnection::dispose`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DisposeOptions {
    /// The disposal was initiated by garbage collection on the controlling
    /// side rather than an explicit close.
    pub from_gc: bool,
}

/// One connection's dispatch tree, registry, and outbound writer.
///
/// All structural mutations happen from the connection's own sequential
/// context (the transport read loop and the call tasks it spawns); different
/// connections are fully independent, so multiple can coexist in-process.
pub struct DispatcherConnection {
    registry: DashMap<Arc<str>, Arc<Dispatcher>>,
    root: Arc<Dispatcher>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    closed_tx: watch::Sender<bool>,
    pending_tx: watch::Sender<usize>,
    default_timeout: Mutex<Option<Duration>>,
    call_observer: Mutex<Option<CallObserver>>,
}

impl DispatcherConnection {
    /// Creates a connection with an empty tree rooted at guid `""`. Returns
    /// the connection and the outbound channel to drain into the transport.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let root = Arc::new(Dispatcher {
            guid: Arc::from(""),
            type_name: "Root".to_string(),
            parent: None,
            children: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            state: Arc::new(()),
            methods: MethodTable::new("Root"),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });
        let registry = DashMap::new();
        registry.insert(root.guid.clone(), root.clone());
        let connection = Arc::new(Self {
            registry,
            root,
            outbound_tx: Mutex::new(Some(outbound_tx)),
            closed_tx: watch::Sender::new(false),
            pending_tx: watch::Sender::new(0),
            default_timeout: Mutex::new(None),
            call_observer: Mutex::new(None),
        });
        (connection, outbound_rx)
    }

    pub fn root(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.root)
    }

    /// Deadline applied to calls whose params carry no `timeout`.
    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        *self.default_timeout.lock() = timeout;
    }

    /// Installs an observer for frozen per-call metadata (the log
    /// side-channel; never sent over the wire).
    pub fn set_call_observer(&self, observer: CallObserver) {
        *self.call_observer.lock() = Some(observer);
    }

    /// Registers a new node as a child of `parent`. The node becomes
    /// routable immediately; registration has no wire side effect.
    pub fn register(
        &self,
        parent: &Arc<Dispatcher>,
        guid: &str,
        state: Arc<dyn DispatcherState>,
        methods: MethodTable,
    ) -> Result<Arc<Dispatcher>> {
        if parent.is_disposed() {
            return Err(Error::TargetClosed {
                guid: parent.guid.to_string(),
            });
        }
        let guid: Arc<str> = Arc::from(guid);
        let node = Arc::new(Dispatcher {
            guid: guid.clone(),
            type_name: methods.type_name.clone(),
            parent: Some(Arc::downgrade(parent)),
            children: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            state,
            methods,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });
        match self.registry.entry(guid.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateGuid(guid.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&node));
            }
        }
        parent.children.lock().push(Arc::clone(&node));
        Ok(node)
    }

    pub fn lookup(&self, guid: &str) -> Option<Arc<Dispatcher>> {
        self.registry.get(guid).map(|entry| Arc::clone(&entry))
    }

    /// Routes one inbound message. Unexpected shapes are logged and dropped;
    /// once the connection is closed all inbound messages are dropped.
    pub fn dispatch(self: &Arc<Self>, message: Value) {
        if self.is_closed() {
            tracing::debug!("Dropping inbound message on closed connection");
            return;
        }
        match serde_json::from_value::<Message>(message) {
            Ok(Message::Call(call)) => self.handle_call(call),
            Ok(Message::Response(response)) => {
                tracing::warn!(id = response.id, "Unexpected response envelope inbound");
            }
            Ok(Message::Event(event)) => {
                tracing::warn!(guid = %event.guid, method = %event.method, "Unexpected event envelope inbound");
            }
            Ok(Message::Unknown(value)) => {
                tracing::warn!(%value, "Dropping unrecognized inbound message");
            }
            Err(e) => {
                tracing::warn!("Failed to parse inbound message: {e}");
            }
        }
    }

    fn handle_call(self: &Arc<Self>, call: Call) {
        let node = match self.lookup(&call.guid) {
            Some(node) if !node.is_disposed() => node,
            _ => {
                self.send_failure(
                    call.id,
                    &Error::TargetClosed {
                        guid: call.guid.to_string(),
                    },
                );
                return;
            }
        };
        let Some(handler) = node.methods.get(&call.method) else {
            self.send_failure(
                call.id,
                &Error::UnknownMethod {
                    type_name: node.type_name.clone(),
                    method: call.method,
                },
            );
            return;
        };
        // A zero timeout means "no deadline", not "fail instantly".
        let timeout = call
            .params
            .get("timeout")
            .and_then(Value::as_f64)
            .map(|ms| {
                if ms > 0.0 {
                    Some(Duration::from_millis(ms as u64))
                } else {
                    None
                }
            })
            .unwrap_or_else(|| *self.default_timeout.lock());

        tracing::debug!(id = call.id, guid = %call.guid, method = %call.method, "Dispatching call");
        let metadata = CallMetadata::new(call.id, node.type_name(), &call.method);
        let handler = Arc::clone(handler);
        let connection = Arc::clone(self);
        let id = call.id;
        let params = call.params;
        self.pending_tx.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            let controller = ProgressController::new(metadata);
            let result = controller
                .run(timeout, move |progress| handler(params, progress))
                .await;
            if let Some(observer) = connection.call_observer.lock().as_ref() {
                observer(&controller.metadata());
            }
            match result {
                Ok(value) => connection.send_result(id, value),
                Err(error) => connection.send_failure(id, &error),
            }
            connection.pending_tx.send_modify(|n| *n -= 1);
        });
    }

    /// Delivers an event to the node's current subscribers and enqueues the
    /// event envelope on the wire. Never blocks on listener execution.
    pub fn emit(&self, guid: &str, method: &str, params: Value) -> Result<()> {
        let node = self
            .lookup(guid)
            .filter(|node| !node.is_disposed())
            .ok_or_else(|| Error::TargetClosed {
                guid: guid.to_string(),
            })?;
        let envelope = Event {
            guid: node.guid.clone(),
            method: method.to_string(),
            params: params.clone(),
        };
        self.send_message(serde_json::to_value(&envelope)?);
        node.notify(DispatcherEvent::Event {
            method: method.to_string(),
            params,
        });
        Ok(())
    }

    /// Disposes a subtree: descendants first, depth-first, each node's
    /// disposed notification firing exactly once. Re-disposing is a no-op.
    /// The explicitly disposed node announces its disposal on the wire.
    pub fn dispose(&self, node: &Arc<Dispatcher>, options: DisposeOptions) {
        let was_disposed = node.is_disposed();
        self.dispose_node(node, &options);
        if !was_disposed && !node.guid.is_empty() {
            let params = if options.from_gc {
                json!({"reason": "gc"})
            } else {
                json!({})
            };
            let envelope = Event {
                guid: node.guid.clone(),
                method: "__dispose__".to_string(),
                params,
            };
            match serde_json::to_value(&envelope) {
                Ok(value) => self.send_message(value),
                Err(e) => tracing::warn!("Failed to serialize dispose event: {e}"),
            }
        }
    }

    fn dispose_node(&self, node: &Arc<Dispatcher>, options: &DisposeOptions) {
        if node.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *node.children.lock());
        for child in &children {
            self.dispose_node(child, options);
        }
        self.registry.remove(&node.guid);
        tracing::debug!(guid = %node.guid, type_name = %node.type_name, "Disposed node");
        node.notify(DispatcherEvent::Disposed);
        if let Some(parent) = node.parent() {
            parent.children.lock().retain(|c| !Arc::ptr_eq(c, node));
        }
    }

    /// Drives the connection from the transport's inbound channel. The
    /// channel closing is the transport close signal: the connection enters
    /// its terminal state and later inbound messages are dropped.
    pub async fn run(self: Arc<Self>, mut message_rx: mpsc::UnboundedReceiver<Value>) {
        while let Some(message) = message_rx.recv().await {
            self.dispatch(message);
        }
        tracing::debug!("Transport closed, connection entering terminal state");
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the connection has entered its terminal state.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        *self.pending_tx.borrow()
    }

    /// Disposes the whole tree and drops the outbound writer, which closes
    /// the wire from our side.
    pub fn close(&self) {
        self.dispose(&self.root, DisposeOptions::default());
        self.closed_tx.send_replace(true);
        *self.outbound_tx.lock() = None;
    }

    /// Waits up to `grace` for in-flight calls to settle, then closes.
    pub async fn close_with_grace(&self, grace: Duration) {
        let mut pending = self.pending_tx.subscribe();
        let drained = async {
            while *pending.borrow_and_update() != 0 {
                if pending.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::warn!("Grace period elapsed with calls still pending");
        }
        self.close();
    }

    fn send_result(&self, id: u32, result: Value) {
        let response = Response {
            id,
            result: Some(result),
            error: None,
        };
        match serde_json::to_value(&response) {
            Ok(value) => self.send_message(value),
            Err(e) => tracing::error!(id, "Failed to serialize result: {e}"),
        }
    }

    fn send_failure(&self, id: u32, error: &Error) {
        tracing::debug!(id, "Call failed: {error}");
        let response = Response {
            id,
            result: None,
            error: Some(enginelink_protocol::ErrorWrapper {
                error: error.wire_payload(),
            }),
        };
        match serde_json::to_value(&response) {
            Ok(value) => self.send_message(value),
            Err(e) => tracing::error!(id, "Failed to serialize failure: {e}"),
        }
    }

    fn send_message(&self, message: Value) {
        let guard = self.outbound_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!("Outbound channel dropped, discarding message");
                }
            }
            None => tracing::debug!("Connection closed, discarding outbound message"),
        }
    }
}
