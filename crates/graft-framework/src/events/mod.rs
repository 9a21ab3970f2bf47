//! Asynchronous event delivery
//!
//! Events are queued on a bounded channel and delivered on a dedicated
//! dispatcher thread, in the order they were fired. Listeners are attributed
//! to the bundle that registered them so they can be removed together when
//! that bundle stops.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use graft_core::error::GraftResult;
use graft_core::types::BundleId;

use crate::services::ServiceId;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleEventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkEventKind {
    Started,
    Error,
    PackagesRefreshed,
    StartLevelChanged,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    Registered,
    Unregistering,
}

/// Something that happened inside the framework
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Bundle {
        kind: BundleEventKind,
        bundle: BundleId,
    },
    Framework {
        kind: FrameworkEventKind,
        bundle: BundleId,
        message: Option<String>,
    },
    Service {
        kind: ServiceEventKind,
        service: ServiceId,
        bundle: BundleId,
    },
}

impl Event {
    pub fn bundle(kind: BundleEventKind, bundle: BundleId) -> Self {
        Event::Bundle { kind, bundle }
    }

    pub fn framework(kind: FrameworkEventKind, bundle: BundleId) -> Self {
        Event::Framework {
            kind,
            bundle,
            message: None,
        }
    }

    /// Framework error event carrying the error's message
    pub fn error(bundle: BundleId, message: impl Into<String>) -> Self {
        Event::Framework {
            kind: FrameworkEventKind::Error,
            bundle,
            message: Some(message.into()),
        }
    }

    pub fn service(kind: ServiceEventKind, service: ServiceId, bundle: BundleId) -> Self {
        Event::Service {
            kind,
            service,
            bundle,
        }
    }

    /// Bundle the event is about
    pub fn source(&self) -> BundleId {
        match self {
            Event::Bundle { bundle, .. }
            | Event::Framework { bundle, .. }
            | Event::Service { bundle, .. } => *bundle,
        }
    }
}

/// Receives events on the dispatcher thread
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Registered {
    id: ListenerId,
    owner: BundleId,
    listener: Arc<dyn EventListener>,
}

type Listeners = Arc<RwLock<Vec<Registered>>>;

enum Message {
    Deliver(Event),
    Flush(Sender<()>),
}

/// Queue plus dispatcher thread
pub struct EventDispatcher {
    listeners: Listeners,
    next_listener: AtomicU64,
    worker: Worker<Message>,
}

impl EventDispatcher {
    /// Start the dispatcher thread with a queue of `capacity` events
    pub fn new(capacity: usize) -> GraftResult<Self> {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let delivery = Arc::clone(&listeners);
        let worker = Worker::spawn("graft-events", Some(capacity.max(1)), move |message| {
            match message {
                Message::Deliver(event) => deliver(&delivery, &event),
                Message::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        })?;

        Ok(Self {
            listeners,
            next_listener: AtomicU64::new(1),
            worker,
        })
    }

    /// Register a listener on behalf of `owner`
    pub fn add_listener(&self, owner: BundleId, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registered {
            id,
            owner,
            listener,
        });
        debug!("Bundle {} added {}", owner, id);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| registered.id != id);
        listeners.len() != before
    }

    /// Remove every listener a bundle registered, returning how many
    pub fn remove_listeners(&self, owner: BundleId) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| registered.owner != owner);
        before - listeners.len()
    }

    /// Number of listeners a bundle has registered
    pub fn listener_count(&self, owner: BundleId) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|registered| registered.owner == owner)
            .count()
    }

    /// Queue one event
    pub fn fire(&self, event: Event) {
        trace!("Firing {:?}", event);
        if !self.worker.submit(Message::Deliver(event)) {
            debug!("Event dispatcher stopped; dropping event");
        }
    }

    pub fn fire_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.fire(event);
        }
    }

    /// Wait until every event queued so far has been delivered.
    ///
    /// Returns at once when called from a listener.
    pub fn flush(&self) {
        if self.worker.is_current() {
            return;
        }
        let (ack, done) = bounded(1);
        if self.worker.submit(Message::Flush(ack)) {
            let _ = done.recv();
        }
    }

    /// Deliver what is queued, then stop the dispatcher thread
    pub fn shutdown(&self) {
        self.worker.stop();
    }
}

fn deliver(listeners: &Listeners, event: &Event) {
    let snapshot: Vec<Arc<dyn EventListener>> = listeners
        .read()
        .iter()
        .map(|registered| Arc::clone(&registered.listener))
        .collect();

    for listener in snapshot {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
        if outcome.is_err() {
            error!("Event listener panicked while handling {:?}", event);
        }
    }
}
