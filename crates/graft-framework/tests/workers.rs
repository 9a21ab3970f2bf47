//! Start-level and refresh workers driven through the public API

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use graft_config::FrameworkConfig;
use graft_core::types::{BundleId, BundleState, PersistentState};
use graft_framework::{Activator, ActivatorError, BundleContext, Framework, FrameworkEventKind};

use common::{descriptor, exporting, framework_without_purge, importing, Recorder};

struct Tracking {
    started: Arc<Mutex<Vec<BundleId>>>,
}

impl Activator for Tracking {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        self.started.lock().push(context.bundle_id());
        Ok(())
    }

    fn stop(&mut self, _context: &BundleContext) -> Result<(), ActivatorError> {
        Ok(())
    }
}

#[test]
fn async_refresh_restarts_active_dependents() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let framework = {
        let started = Arc::clone(&started);
        let mut config = FrameworkConfig::default();
        config.framework.purge_unused = false;
        Framework::builder(config)
            .activator("tracking", move || Tracking {
                started: Arc::clone(&started),
            })
            .build()
            .unwrap()
    };
    framework.start().unwrap();

    let a = framework
        .install("mem:a", &exporting("a", "1.0.0", "p", "1.0.0"))
        .unwrap();
    let b = framework
        .install(
            "mem:b",
            &descriptor(
                "b",
                "1.0.0",
                "activator = \"tracking\"\n[[imports]]\nname = \"p\"\n",
            ),
        )
        .unwrap();
    framework.start_bundle(b.id(), true).unwrap();
    framework.update(a.id(), None).unwrap();

    let recorder = Recorder::attach(&framework);
    assert!(framework.refresh_packages_async(Some(vec![a.id()])));
    recorder.wait_for(FrameworkEventKind::PackagesRefreshed);

    assert_eq!(b.state(), BundleState::Active);
    assert_eq!(*started.lock(), vec![b.id(), b.id()]);
    assert_eq!(a.modules().len(), 1);
}

#[test]
fn refresh_with_nothing_pending_still_reports() {
    let framework = framework_without_purge();
    let recorder = Recorder::attach(&framework);
    framework.refresh_packages(None).unwrap();
    recorder.wait_for(FrameworkEventKind::PackagesRefreshed);
}

#[test]
fn refresh_leaves_importer_installed_when_exporter_is_gone() {
    let framework = framework_without_purge();
    let a = framework
        .install("mem:a", &exporting("a", "1.0.0", "p", "1.0.0"))
        .unwrap();
    let b = framework.install("mem:b", &importing("b", &["p"])).unwrap();
    framework.resolve(b.id()).unwrap();

    framework.uninstall(a.id()).unwrap();
    let recorder = Recorder::attach(&framework);
    framework.refresh_packages(None).unwrap();

    assert!(framework.bundle(a.id()).is_none());
    assert_eq!(b.state(), BundleState::Installed);
    assert!(framework.wires(b.current_module().unwrap()).is_empty());
    // The failed re-resolve is broadcast as an error
    recorder.wait_for(FrameworkEventKind::Error);
}

#[test]
fn lowering_a_bundle_level_stops_it() {
    let framework = Framework::new(FrameworkConfig::default()).unwrap();
    framework.start().unwrap();
    let recorder = Recorder::attach(&framework);
    framework.set_framework_start_level(2).unwrap();
    recorder.wait_for(FrameworkEventKind::StartLevelChanged);

    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    framework.set_bundle_start_level(a.id(), 2).unwrap();
    framework.start_bundle(a.id(), true).unwrap();
    assert_eq!(a.state(), BundleState::Active);

    framework.set_bundle_start_level(a.id(), 5).unwrap();
    // Queued behind the bundle request
    framework.set_framework_start_level(1).unwrap();
    recorder.wait_for(FrameworkEventKind::StartLevelChanged);

    assert_eq!(a.start_level(), 5);
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(a.persistent_state(), PersistentState::Active);
}

#[test]
fn uninstalled_bundles_reject_lifecycle_calls() {
    let framework = framework_without_purge();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    framework.uninstall(a.id()).unwrap();

    assert!(framework.start_bundle(a.id(), false).is_err());
    assert!(framework.update(a.id(), None).is_err());
    assert!(framework.uninstall(a.id()).is_err());
    assert!(framework.set_bundle_start_level(a.id(), 2).is_err());

    // The location is free for a new install
    let again = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    assert_ne!(again.id(), a.id());
}
