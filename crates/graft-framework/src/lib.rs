//! Bundle lifecycle orchestration for Graft
//!
//! This crate runs bundles on top of the resolver: it installs, resolves,
//! starts, stops, updates, uninstalls and refreshes them under a multi-tier
//! locking protocol, drives start levels and refreshes on worker threads,
//! and delivers bundle, service and framework events asynchronously.

pub mod activator;
pub mod bundle;
pub mod events;
pub mod framework;
pub mod lock;
pub mod parser;
mod refresh;
pub mod services;
mod start_level;
mod worker;

// Re-export main types
pub use activator::{Activator, ActivatorError, ActivatorRegistry, BundleContext};
pub use bundle::Bundle;
pub use events::{
    BundleEventKind, Event, EventDispatcher, EventListener, FrameworkEventKind, ListenerId,
    ServiceEventKind,
};
pub use framework::{Framework, FrameworkBuilder, SYSTEM_LOCATION, SYSTEM_SYMBOLIC_NAME};
pub use lock::{BatchGuard, BundleGuard, LocationGuard, LockCoordinator};
pub use parser::{DescriptorParser, ManifestParser};
pub use services::{ServiceId, ServiceObject, ServiceReference, ServiceRegistry};

pub use graft_core::error::{GraftError, GraftResult};
