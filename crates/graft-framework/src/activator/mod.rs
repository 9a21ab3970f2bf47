//! Bundle activators and their context
//!
//! A bundle names its activator in the descriptor; the framework creates it
//! from the [`ActivatorRegistry`] when the bundle starts and drops it after
//! the bundle stops. Activators reach the framework only through the
//! [`BundleContext`] they are handed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use camino::Utf8PathBuf;

use graft_core::error::{GraftError, GraftResult};
use graft_core::types::{BundleId, BundleState};

use crate::bundle::Bundle;
use crate::events::{Event, EventListener, ListenerId, ServiceEventKind};
use crate::framework::FrameworkInner;
use crate::services::{ServiceObject, ServiceReference};

pub type ActivatorError = Box<dyn std::error::Error + Send + Sync>;

/// Start and stop hooks of a bundle
pub trait Activator: Send {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError>;

    fn stop(&mut self, context: &BundleContext) -> Result<(), ActivatorError>;
}

thread_local! {
    /// Events raised by the activator callback running on this thread
    static PENDING: RefCell<Option<Vec<Event>>> = RefCell::new(None);
}

/// Run an activator callback, appending the service events it raises to
/// `events` instead of firing them while the bundle lock is held.
pub(crate) fn buffered<R>(events: &mut Vec<Event>, callback: impl FnOnce() -> R) -> R {
    let outer = PENDING.with(|pending| pending.replace(Some(Vec::new())));
    let result = callback();
    let raised = PENDING
        .with(|pending| pending.replace(outer))
        .unwrap_or_default();
    events.extend(raised);
    result
}

fn emit(framework: &FrameworkInner, event: Event) {
    let event = PENDING.with(|pending| match pending.borrow_mut().as_mut() {
        Some(raised) => {
            raised.push(event);
            None
        }
        None => Some(event),
    });
    if let Some(event) = event {
        framework.events.fire(event);
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Activator> + Send + Sync>;

/// Activator factories by name
#[derive(Clone, Default)]
pub struct ActivatorRegistry {
    factories: HashMap<String, Factory>,
}

impl ActivatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration under the same name wins
    pub fn register<F, A>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: Activator + 'static,
    {
        self.factories
            .insert(name.into(), Arc::new(move || Box::new(factory()) as Box<dyn Activator>));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Activator>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ActivatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// A bundle's view of the framework
#[derive(Clone)]
pub struct BundleContext {
    bundle: BundleId,
    framework: Weak<FrameworkInner>,
}

impl BundleContext {
    pub(crate) fn new(bundle: BundleId, framework: Weak<FrameworkInner>) -> Self {
        Self { bundle, framework }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle
    }

    pub fn bundle(&self) -> Option<Arc<Bundle>> {
        self.framework.upgrade()?.lookup(self.bundle)
    }

    /// Every installed bundle, by ascending id
    pub fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.framework
            .upgrade()
            .map(|framework| framework.bundles())
            .unwrap_or_default()
    }

    pub fn register_service(
        &self,
        interfaces: &[&str],
        service: ServiceObject,
    ) -> GraftResult<ServiceReference> {
        let framework = self.framework()?;
        let reference = framework.services.register(self.bundle, interfaces, service);
        emit(
            &framework,
            Event::service(ServiceEventKind::Registered, reference.id, self.bundle),
        );
        Ok(reference)
    }

    pub fn unregister_service(&self, reference: &ServiceReference) -> bool {
        let Ok(framework) = self.framework() else {
            return false;
        };
        match framework.services.unregister(reference.id) {
            Some(removed) => {
                emit(
                    &framework,
                    Event::service(ServiceEventKind::Unregistering, removed.id, removed.bundle),
                );
                true
            }
            None => false,
        }
    }

    pub fn service_references(&self, interface: &str) -> Vec<ServiceReference> {
        self.framework
            .upgrade()
            .map(|framework| framework.services.get_references(interface))
            .unwrap_or_default()
    }

    /// Hold and downcast a service
    pub fn get_service<T: Any + Send + Sync>(&self, reference: &ServiceReference) -> Option<Arc<T>> {
        self.framework
            .upgrade()?
            .services
            .get_typed::<T>(self.bundle, reference.id)
    }

    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.framework
            .upgrade()
            .map(|framework| framework.services.unget_service(self.bundle, reference.id))
            .unwrap_or(false)
    }

    /// Listen to framework events until this bundle stops
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> GraftResult<ListenerId> {
        Ok(self.framework()?.events.add_listener(self.bundle, listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.framework
            .upgrade()
            .map(|framework| framework.events.remove_listener(id))
            .unwrap_or(false)
    }

    /// Private storage directory, when the framework keeps bundles on disk
    pub fn data_dir(&self) -> Option<Utf8PathBuf> {
        self.framework.upgrade()?.cache.data_dir(self.bundle)
    }

    fn framework(&self) -> GraftResult<Arc<FrameworkInner>> {
        self.framework
            .upgrade()
            .ok_or_else(|| GraftError::state(self.bundle, BundleState::Uninstalled, "use the context of"))
    }
}

impl fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle", &self.bundle)
            .finish()
    }
}
