//! Inter-stage message routing.
//!
//! Every pipeline owns one [`MessageBus`]. Publishers hand it messages without
//! blocking; a dedicated dispatcher thread resolves each message's target
//! [`StageId`] in a routing table and hands it to that subscriber only.
//! Messages are dispatched in the order they were published, so each
//! publisher's messages arrive in FIFO order. Messages addressed to a stage
//! that is not subscribed are dropped.
//!
//! The chain topology (which stage follows which) lives here as well, so a
//! finishing stage looks its successor up instead of computing it.

use crate::data::DataRef;
use crate::error::{PipelineError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Identity of a stage within one pipeline, assigned densely from 1
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u16);

impl StageId {
    /// Identity given to the first registered stage
    pub const FIRST: StageId = StageId(1);

    /// Identity of an unbound stage
    pub const UNBOUND: StageId = StageId(0);

    /// Check if a pipeline has assigned this identity
    #[inline]
    pub fn is_bound(self) -> bool {
        self != Self::UNBOUND
    }

    /// The identity registered after this one, `None` once identities run out
    #[inline]
    pub fn next(self) -> Option<StageId> {
        self.0.checked_add(1).map(StageId)
    }
}

impl fmt::Debug for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNBOUND {
            write!(f, "StageId(UNBOUND)")
        } else {
            write!(f, "StageId({})", self.0)
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Control verbs an operator can send to a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Restart,
}

/// Pause or restart one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub target: StageId,
    pub command: ControlCommand,
}

impl ControlMessage {
    /// Ask `target` to park its run loop
    pub fn pause(target: StageId) -> Self {
        Self {
            target,
            command: ControlCommand::Pause,
        }
    }

    /// Resume `target`, or cancel its pending pause
    pub fn restart(target: StageId) -> Self {
        Self {
            target,
            command: ControlCommand::Restart,
        }
    }
}

/// A finished item travelling to the next stage
pub struct DataAvailableMessage<T> {
    pub target: StageId,
    pub sender: StageId,
    pub data: DataRef<T>,
}

impl<T> fmt::Debug for DataAvailableMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAvailableMessage")
            .field("target", &self.target)
            .field("sender", &self.sender)
            .field("is_final", &self.data.is_final())
            .finish()
    }
}

/// Everything the bus can carry
#[derive(Debug)]
pub enum BusMessage<T> {
    DataAvailable(DataAvailableMessage<T>),
    Control(ControlMessage),
}

impl<T> BusMessage<T> {
    /// Stage this message is addressed to
    pub fn target(&self) -> StageId {
        match self {
            BusMessage::DataAvailable(msg) => msg.target,
            BusMessage::Control(msg) => msg.target,
        }
    }
}

impl<T> From<ControlMessage> for BusMessage<T> {
    fn from(msg: ControlMessage) -> Self {
        BusMessage::Control(msg)
    }
}

impl<T> From<DataAvailableMessage<T>> for BusMessage<T> {
    fn from(msg: DataAvailableMessage<T>) -> Self {
        BusMessage::DataAvailable(msg)
    }
}

/// Receiver side of the bus.
///
/// Called on the dispatcher thread, so implementations must return quickly.
pub trait Subscriber<T>: Send + Sync {
    fn on_message(&self, message: BusMessage<T>);
}

enum Envelope<T> {
    Message(BusMessage<T>),
    Shutdown,
}

struct Routes<T> {
    subscribers: RwLock<HashMap<StageId, Weak<dyn Subscriber<T>>>>,
    links: RwLock<HashMap<StageId, StageId>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<T> Routes<T> {
    fn deliver(&self, message: BusMessage<T>) {
        let target = message.target();
        // Release the table lock before calling out so handlers may unsubscribe.
        let subscriber = self.subscribers.read().get(&target).and_then(Weak::upgrade);

        match subscriber {
            Some(subscriber) => {
                subscriber.on_message(message);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target_stage = %target, "no subscriber for message, dropping");
            }
        }
    }
}

/// Publish/subscribe router shared by a pipeline and its stages
pub struct MessageBus<T: Send + Sync + 'static> {
    name: String,
    routes: Arc<Routes<T>>,
    tx: Sender<Envelope<T>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> MessageBus<T> {
    /// Create a bus and start its dispatcher thread
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let routes = Arc::new(Routes {
            subscribers: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let (tx, rx) = unbounded();

        let dispatch_routes = Arc::clone(&routes);
        let dispatcher = thread::Builder::new()
            .name(format!("{name}-bus"))
            .spawn(move || dispatch(rx, dispatch_routes))
            .map_err(|e| PipelineError::Pool(format!("failed to spawn bus dispatcher: {e}")))?;

        Ok(Self {
            name,
            routes,
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Get the bus name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message for delivery. Never blocks.
    pub fn publish(&self, message: impl Into<BusMessage<T>>) {
        if self.tx.send(Envelope::Message(message.into())).is_err() {
            self.routes.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(bus = %self.name, "bus is shut down, dropping message");
        }
    }

    /// Route messages addressed to `id` to `subscriber`.
    ///
    /// A later subscription for the same identity replaces this one. The
    /// route is removed when the returned guard is dropped.
    pub fn subscribe(&self, id: StageId, subscriber: Weak<dyn Subscriber<T>>) -> Subscription<T> {
        self.routes
            .subscribers
            .write()
            .insert(id, Weak::clone(&subscriber));
        Subscription {
            id,
            subscriber,
            routes: Arc::downgrade(&self.routes),
        }
    }

    /// Number of live routes
    pub fn subscriber_count(&self) -> usize {
        self.routes.subscribers.read().len()
    }

    /// Record that items completed by `from` go to `to`
    pub fn link(&self, from: StageId, to: StageId) {
        self.routes.links.write().insert(from, to);
    }

    /// Stage that receives items completed by `id`, if any
    pub fn successor(&self, id: StageId) -> Option<StageId> {
        self.routes.links.read().get(&id).copied()
    }

    /// Forget the chain topology
    pub fn clear_links(&self) {
        self.routes.links.write().clear();
    }

    /// Messages handed to a subscriber so far
    pub fn delivered(&self) -> u64 {
        self.routes.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because no subscriber matched or the bus was down
    pub fn dropped(&self) -> u64 {
        self.routes.dropped.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher after it drains already-queued messages
    pub fn shutdown(&self) {
        let Some(handle) = self.dispatcher.lock().take() else {
            return;
        };
        let _ = self.tx.send(Envelope::Shutdown);

        // The last owner can be dropped from inside a handler.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(bus = %self.name, "bus dispatcher panicked");
        }
    }
}

impl<T: Send + Sync + 'static> Drop for MessageBus<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch<T>(rx: Receiver<Envelope<T>>, routes: Arc<Routes<T>>) {
    for envelope in rx.iter() {
        match envelope {
            Envelope::Message(message) => routes.deliver(message),
            Envelope::Shutdown => break,
        }
    }
}

/// Route registration that is removed when dropped
pub struct Subscription<T> {
    id: StageId,
    subscriber: Weak<dyn Subscriber<T>>,
    routes: Weak<Routes<T>>,
}

impl<T> Subscription<T> {
    /// Identity this route was registered for
    pub fn id(&self) -> StageId {
        self.id
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(routes) = self.routes.upgrade() else {
            return;
        };
        let mut subscribers = routes.subscribers.write();
        let ours = subscribers
            .get(&self.id)
            .is_some_and(|current| Weak::ptr_eq(current, &self.subscriber));
        if ours {
            subscribers.remove(&self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
