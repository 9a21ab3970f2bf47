//! Service registry
//!
//! Bundles publish shared objects under one or more interface names and
//! look them up by name. The registry tracks which bundle registered each
//! service and how often every bundle currently holds it, so a stopping
//! bundle's registrations and holdings can be released in one sweep.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use graft_core::types::BundleId;

pub type ServiceObject = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service-{}", self.0)
    }
}

/// Handle on a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReference {
    pub id: ServiceId,
    pub bundle: BundleId,
    pub interfaces: Vec<String>,
}

impl ServiceReference {
    pub fn provides(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|name| name == interface)
    }
}

struct Registration {
    reference: ServiceReference,
    service: ServiceObject,
    usage: HashMap<BundleId, usize>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    registrations: RwLock<BTreeMap<ServiceId, Registration>>,
    next_id: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `service` under `interfaces` on behalf of `bundle`
    pub fn register(
        &self,
        bundle: BundleId,
        interfaces: &[&str],
        service: ServiceObject,
    ) -> ServiceReference {
        let id = ServiceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let reference = ServiceReference {
            id,
            bundle,
            interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
        };
        self.registrations.write().insert(
            id,
            Registration {
                reference: reference.clone(),
                service,
                usage: HashMap::new(),
            },
        );
        debug!("Bundle {} registered {} {:?}", bundle, id, interfaces);
        reference
    }

    /// References providing `interface`, oldest registration first
    pub fn get_references(&self, interface: &str) -> Vec<ServiceReference> {
        self.registrations
            .read()
            .values()
            .filter(|registration| registration.reference.provides(interface))
            .map(|registration| registration.reference.clone())
            .collect()
    }

    /// Take a hold on a service for `user`
    pub fn get_service(&self, user: BundleId, id: ServiceId) -> Option<ServiceObject> {
        let mut registrations = self.registrations.write();
        let registration = registrations.get_mut(&id)?;
        *registration.usage.entry(user).or_insert(0) += 1;
        Some(Arc::clone(&registration.service))
    }

    /// Take a hold on a service and downcast it
    pub fn get_typed<T: Any + Send + Sync>(&self, user: BundleId, id: ServiceId) -> Option<Arc<T>> {
        let service = self.get_service(user, id)?;
        match service.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                self.unget_service(user, id);
                None
            }
        }
    }

    /// Release one hold of `user` on a service
    pub fn unget_service(&self, user: BundleId, id: ServiceId) -> bool {
        let mut registrations = self.registrations.write();
        let Some(registration) = registrations.get_mut(&id) else {
            return false;
        };
        match registration.usage.get_mut(&user) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                registration.usage.remove(&user);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, id: ServiceId) -> Option<ServiceReference> {
        self.registrations
            .write()
            .remove(&id)
            .map(|registration| registration.reference)
    }

    /// Remove every service `bundle` registered
    pub fn unregister_services(&self, bundle: BundleId) -> Vec<ServiceReference> {
        let mut registrations = self.registrations.write();
        let ids: Vec<ServiceId> = registrations
            .values()
            .filter(|registration| registration.reference.bundle == bundle)
            .map(|registration| registration.reference.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| registrations.remove(&id))
            .map(|registration| registration.reference)
            .collect()
    }

    /// Release every hold `user` has on any service
    pub fn unget_services(&self, user: BundleId) -> usize {
        let mut released = 0;
        for registration in self.registrations.write().values_mut() {
            if registration.usage.remove(&user).is_some() {
                released += 1;
            }
        }
        released
    }

    pub fn services_registered_by(&self, bundle: BundleId) -> Vec<ServiceReference> {
        self.registrations
            .read()
            .values()
            .filter(|registration| registration.reference.bundle == bundle)
            .map(|registration| registration.reference.clone())
            .collect()
    }

    pub fn services_in_use_by(&self, user: BundleId) -> Vec<ServiceReference> {
        self.registrations
            .read()
            .values()
            .filter(|registration| registration.usage.contains_key(&user))
            .map(|registration| registration.reference.clone())
            .collect()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self.registrations.read();
        f.debug_struct("ServiceRegistry")
            .field(
                "services",
                &registrations
                    .values()
                    .map(|registration| &registration.reference)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
