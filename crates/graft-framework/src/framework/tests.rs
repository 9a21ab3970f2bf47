use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;

use graft_cache::{BundleCache, MemoryCache};
use graft_config::{FrameworkConfig, SystemPackage};
use graft_core::error::GraftError;
use graft_core::types::{BundleId, BundleState, PersistentState, Version, SYSTEM_BUNDLE_ID};

use super::*;
use crate::activator::{Activator, ActivatorError, BundleContext};
use crate::events::{BundleEventKind, Event, ServiceEventKind};

fn descriptor(name: &str, version: &str, body: &str) -> Vec<u8> {
    format!("symbolic-name = \"{name}\"\nversion = \"{version}\"\n{body}").into_bytes()
}

fn framework() -> Framework {
    Framework::new(FrameworkConfig::default()).unwrap()
}

/// Channel receiving every event fired after this call
fn events_of(framework: &Framework) -> Receiver<Event> {
    framework.flush_events();
    let (tx, rx) = unbounded();
    framework.add_listener(Arc::new(move |event: &Event| {
        let _ = tx.send(event.clone());
    }));
    rx
}

/// Events seen before the next start level change
fn wait_for_level_change(rx: &Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if matches!(
            event,
            Event::Framework {
                kind: FrameworkEventKind::StartLevelChanged,
                ..
            }
        ) {
            return seen;
        }
        seen.push(event);
    }
}

fn error_sources(events: &[Event]) -> Vec<BundleId> {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                Event::Framework {
                    kind: FrameworkEventKind::Error,
                    ..
                }
            )
        })
        .map(Event::source)
        .collect()
}

struct Recording {
    log: Arc<Mutex<Vec<(&'static str, BundleId)>>>,
}

impl Activator for Recording {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        self.log.lock().push(("start", context.bundle_id()));
        Ok(())
    }

    fn stop(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        self.log.lock().push(("stop", context.bundle_id()));
        Ok(())
    }
}

struct Publishing;

impl Activator for Publishing {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        context.register_service(&["greeting"], Arc::new("hello".to_string()))?;
        Ok(())
    }

    fn stop(&mut self, _context: &BundleContext) -> Result<(), ActivatorError> {
        Ok(())
    }
}

/// Holds on to everything it touches and refuses to stop
struct Stubborn;

impl Activator for Stubborn {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        context.register_service(&["stubborn"], Arc::new(7u32))?;
        for reference in context.service_references("shared") {
            context.get_service::<String>(&reference);
        }
        context.add_listener(Arc::new(|_: &Event| {}))?;
        Ok(())
    }

    fn stop(&mut self, _context: &BundleContext) -> Result<(), ActivatorError> {
        Err("refused to stop".into())
    }
}

struct Refusing;

impl Activator for Refusing {
    fn start(&mut self, _context: &BundleContext) -> Result<(), ActivatorError> {
        Err("not today".into())
    }

    fn stop(&mut self, _context: &BundleContext) -> Result<(), ActivatorError> {
        Ok(())
    }
}

fn exporter_and_importer(framework: &Framework) -> (Arc<Bundle>, Arc<Bundle>) {
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", "[[exports]]\nname = \"p\"\n"))
        .unwrap();
    let b = framework
        .install("mem:b", &descriptor("b", "1.0.0", "[[imports]]\nname = \"p\"\n"))
        .unwrap();
    (a, b)
}

#[test]
fn test_install_is_idempotent() {
    let framework = framework();
    let first = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    let again = framework.install("mem:a", b"not even parsed").unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.id(), BundleId(1));
    assert_eq!(first.state(), BundleState::Installed);
    assert_eq!(framework.bundles().len(), 2);
}

#[test]
fn test_failed_install_removes_archive() {
    let cache = Arc::new(MemoryCache::new());
    let framework = Framework::builder(FrameworkConfig::default())
        .cache(cache.clone())
        .build()
        .unwrap();

    let err = framework.install("mem:bad", b"symbolic-name = ").unwrap_err();
    assert!(matches!(err, GraftError::DescriptorParse { .. }));
    assert!(framework.bundle_by_location("mem:bad").is_none());
    assert!(cache.archives().is_empty());
}

#[test]
fn test_system_bundle_exports_configured_packages() {
    let mut config = FrameworkConfig::default();
    config.system_packages.push(SystemPackage {
        name: "graft.api".to_string(),
        version: Version::new(1, 0, 0),
    });
    let framework = Framework::new(config).unwrap();

    let system = framework.bundle(SYSTEM_BUNDLE_ID).unwrap();
    assert_eq!(system.state(), BundleState::Active);
    assert_eq!(system.symbolic_name(), SYSTEM_SYMBOLIC_NAME);

    let b = framework
        .install(
            "mem:b",
            &descriptor("b", "1.0.0", "[[imports]]\nname = \"graft.api\"\n"),
        )
        .unwrap();
    framework.resolve(b.id()).unwrap();

    let wires = framework.wires(b.current_module().unwrap());
    assert_eq!(wires.len(), 1);
    assert_eq!(wires[0].exporter.bundle, SYSTEM_BUNDLE_ID);
    assert!(framework.stop_bundle(SYSTEM_BUNDLE_ID, false).is_err());
    assert!(framework.uninstall(SYSTEM_BUNDLE_ID).is_err());
}

#[test]
fn test_failed_resolve_is_reported() {
    let framework = framework();
    let events = events_of(&framework);
    let b = framework
        .install(
            "mem:b",
            &descriptor("b", "1.0.0", "[[imports]]\nname = \"missing\"\n"),
        )
        .unwrap();

    let err = framework.resolve(b.id()).unwrap_err();
    assert!(matches!(err, GraftError::ResolutionConflict { .. }));
    assert_eq!(b.state(), BundleState::Installed);
    assert!(framework.wires(b.current_module().unwrap()).is_empty());

    framework.flush_events();
    let errors: Vec<Event> = events
        .try_iter()
        .filter(|event| {
            matches!(
                event,
                Event::Framework {
                    kind: FrameworkEventKind::Error,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source(), b.id());
}

#[test]
fn test_resolve_bundles_reports_partial_success() {
    let framework = framework();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    let b = framework
        .install(
            "mem:b",
            &descriptor("b", "1.0.0", "[[imports]]\nname = \"missing\"\n"),
        )
        .unwrap();

    assert!(!framework.resolve_bundles(None).unwrap());
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(b.state(), BundleState::Installed);
    assert!(framework.resolve_bundles(Some(&[a.id()])).unwrap());
}

#[test]
fn test_start_and_stop_manage_services() {
    let framework = Framework::builder(FrameworkConfig::default())
        .activator("publishing", || Publishing)
        .build()
        .unwrap();
    framework.start().unwrap();

    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", "activator = \"publishing\"\n"))
        .unwrap();
    framework.start_bundle(a.id(), true).unwrap();
    assert_eq!(a.state(), BundleState::Active);
    assert_eq!(a.persistent_state(), PersistentState::Active);

    let references = framework.services().get_references("greeting");
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].bundle, a.id());

    framework.stop_bundle(a.id(), true).unwrap();
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(a.persistent_state(), PersistentState::Installed);
    assert!(framework.services().get_references("greeting").is_empty());
}

#[test]
fn test_service_events_follow_bundle_transitions() {
    let framework = Framework::builder(FrameworkConfig::default())
        .activator("publishing", || Publishing)
        .build()
        .unwrap();
    framework.start().unwrap();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", "activator = \"publishing\"\n"))
        .unwrap();

    let events = events_of(&framework);
    framework.start_bundle(a.id(), true).unwrap();
    framework.flush_events();
    let seen: Vec<Event> = events.try_iter().collect();

    let position = |wanted: &dyn Fn(&Event) -> bool| seen.iter().position(|e| wanted(e)).unwrap();
    let starting = position(&|e| matches!(e, Event::Bundle { kind: BundleEventKind::Starting, .. }));
    let registered = position(&|e| matches!(e, Event::Service { kind: ServiceEventKind::Registered, .. }));
    let started = position(&|e| matches!(e, Event::Bundle { kind: BundleEventKind::Started, .. }));
    assert!(starting < registered && registered < started);
}

#[test]
fn test_unknown_activator_fails_start() {
    let framework = framework();
    framework.start().unwrap();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", "activator = \"nobody\"\n"))
        .unwrap();

    let err = framework.start_bundle(a.id(), true).unwrap_err();
    assert!(matches!(err, GraftError::Activation { .. }));
    assert_eq!(a.state(), BundleState::Resolved);
}

#[test]
fn test_fragment_cannot_start() {
    let framework = framework();
    framework.start().unwrap();
    framework
        .install("mem:host", &descriptor("host", "1.0.0", ""))
        .unwrap();
    let fragment = framework
        .install(
            "mem:frag",
            &descriptor("frag", "1.0.0", "fragment-host = { name = \"host\" }\n"),
        )
        .unwrap();

    let err = framework.start_bundle(fragment.id(), true).unwrap_err();
    assert!(matches!(err, GraftError::LifecycleState { .. }));
    assert_eq!(fragment.persistent_state(), PersistentState::Installed);
}

#[test]
fn test_transient_start_needs_persistent_activation() {
    let framework = framework();
    framework.start().unwrap();
    let b = framework
        .install("mem:b", &descriptor("b", "1.0.0", ""))
        .unwrap();

    framework.start_bundle(b.id(), false).unwrap();
    assert_eq!(b.state(), BundleState::Installed);
    assert_eq!(b.persistent_state(), PersistentState::Installed);

    framework.start_bundle(b.id(), true).unwrap();
    assert_eq!(b.state(), BundleState::Active);

    // A transient stop keeps the bundle persistently active
    framework.stop_bundle(b.id(), false).unwrap();
    assert_eq!(b.state(), BundleState::Resolved);
    assert_eq!(b.persistent_state(), PersistentState::Active);
    framework.start_bundle(b.id(), false).unwrap();
    assert_eq!(b.state(), BundleState::Active);
}

#[test]
fn test_failing_stop_still_cleans_up() {
    let framework = Framework::builder(FrameworkConfig::default())
        .activator("stubborn", || Stubborn)
        .build()
        .unwrap();
    framework.start().unwrap();
    framework
        .system_context()
        .register_service(&["shared"], Arc::new("shared".to_string()))
        .unwrap();

    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", "activator = \"stubborn\"\n"))
        .unwrap();
    framework.start_bundle(a.id(), true).unwrap();
    assert_eq!(framework.services().services_registered_by(a.id()).len(), 1);
    assert_eq!(framework.services().services_in_use_by(a.id()).len(), 1);
    assert_eq!(framework.listener_count(a.id()), 1);

    let events = events_of(&framework);
    let err = framework.stop_bundle(a.id(), true).unwrap_err();
    assert!(matches!(err, GraftError::Activation { .. }));
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(a.persistent_state(), PersistentState::Installed);
    assert!(framework.services().services_registered_by(a.id()).is_empty());
    assert!(framework.services().services_in_use_by(a.id()).is_empty());
    assert_eq!(framework.listener_count(a.id()), 0);

    framework.flush_events();
    let seen: Vec<Event> = events.try_iter().collect();
    assert_eq!(error_sources(&seen), vec![a.id()]);
}

#[test]
fn test_start_level_batch_survives_failing_bundle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let framework = {
        let log = Arc::clone(&log);
        Framework::builder(FrameworkConfig::default())
            .activator("recording", move || Recording {
                log: Arc::clone(&log),
            })
            .activator("refusing", || Refusing)
            .build()
            .unwrap()
    };
    framework.start().unwrap();

    let first = framework
        .install("mem:first", &descriptor("first", "1.0.0", "activator = \"recording\"\n"))
        .unwrap();
    let broken = framework
        .install("mem:broken", &descriptor("broken", "1.0.0", "activator = \"refusing\"\n"))
        .unwrap();
    let last = framework
        .install("mem:last", &descriptor("last", "1.0.0", "activator = \"recording\"\n"))
        .unwrap();
    for bundle in [&first, &broken, &last] {
        framework.set_bundle_start_level(bundle.id(), 2).unwrap();
        framework.start_bundle(bundle.id(), true).unwrap();
    }

    let events = events_of(&framework);
    framework.set_framework_start_level(2).unwrap();
    let seen = wait_for_level_change(&events);

    assert_eq!(framework.start_level(), 2);
    assert_eq!(first.state(), BundleState::Active);
    assert_eq!(broken.state(), BundleState::Resolved);
    assert_eq!(last.state(), BundleState::Active);
    assert_eq!(
        *log.lock(),
        vec![("start", first.id()), ("start", last.id())]
    );
    assert_eq!(error_sources(&seen), vec![broken.id()]);
}

#[test]
fn test_resolve_waits_for_provider_lock() {
    let framework = framework();
    let (a, b) = exporter_and_importer(&framework);
    let held = framework.inner.locks.acquire(a.id()).unwrap();

    std::thread::scope(|scope| {
        let resolving = scope.spawn(|| framework.resolve(b.id()));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(b.state(), BundleState::Installed);

        drop(held);
        resolving.join().unwrap().unwrap();
    });
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(b.state(), BundleState::Resolved);
}

#[test]
fn test_nested_resolve_does_not_wait_for_provider() {
    let framework = framework();
    let (a, b) = exporter_and_importer(&framework);
    let inner = &framework.inner;
    let (held_tx, held_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();

    std::thread::scope(|scope| {
        let exporter = a.id();
        scope.spawn(move || {
            let _guard = inner.locks.acquire(exporter).unwrap();
            held_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        held_rx.recv().unwrap();

        {
            let _own = inner.locks.acquire(b.id()).unwrap();
            let err = inner.resolve_locked(&b).unwrap_err();
            assert!(matches!(err, GraftError::LockContended { bundle } if bundle == a.id()));
        }
        assert_eq!(b.state(), BundleState::Installed);
        assert_eq!(a.state(), BundleState::Installed);
        assert!(framework.wires(b.current_module().unwrap()).is_empty());
        release_tx.send(()).unwrap();
    });

    framework.resolve(b.id()).unwrap();
    assert_eq!(b.state(), BundleState::Resolved);
}

#[test]
fn test_start_deferred_above_active_level() {
    let framework = framework();
    framework.start().unwrap();
    let events = events_of(&framework);

    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    framework.set_bundle_start_level(a.id(), 3).unwrap();
    framework.start_bundle(a.id(), true).unwrap();
    assert_eq!(a.state(), BundleState::Installed);
    assert_eq!(a.persistent_state(), PersistentState::Active);

    framework.set_framework_start_level(3).unwrap();
    wait_for_level_change(&events);
    assert_eq!(framework.start_level(), 3);
    assert_eq!(a.state(), BundleState::Active);

    framework.set_framework_start_level(2).unwrap();
    wait_for_level_change(&events);
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(a.persistent_state(), PersistentState::Active);
}

#[test]
fn test_invalid_start_levels() {
    let framework = framework();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    assert!(matches!(
        framework.set_bundle_start_level(a.id(), 0),
        Err(GraftError::InvalidStartLevel { level: 0, .. })
    ));
    assert!(framework.set_framework_start_level(0).is_err());
    assert!(framework.set_bundle_start_level(SYSTEM_BUNDLE_ID, 2).is_err());
}

#[test]
fn test_initial_bundle_start_level_from_config() {
    let mut config = FrameworkConfig::default();
    config.framework.initial_bundle_start_level = 3;
    let framework = Framework::new(config).unwrap();
    assert_eq!(framework.initial_bundle_start_level(), 3);

    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    assert_eq!(a.start_level(), 3);
}

#[test]
fn test_start_levels_order_bundles() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut config = FrameworkConfig::default();
    config.framework.begin_start_level = 2;
    let framework = {
        let log = Arc::clone(&log);
        Framework::builder(config)
            .activator("recording", move || Recording {
                log: Arc::clone(&log),
            })
            .build()
            .unwrap()
    };

    let body = "activator = \"recording\"\n";
    let late = framework
        .install("mem:late", &descriptor("late", "1.0.0", body))
        .unwrap();
    let early = framework
        .install("mem:early", &descriptor("early", "1.0.0", body))
        .unwrap();
    framework.set_bundle_start_level(late.id(), 2).unwrap();
    framework.start_bundle(late.id(), true).unwrap();
    framework.start_bundle(early.id(), true).unwrap();
    assert!(log.lock().is_empty());

    framework.start().unwrap();
    assert_eq!(
        *log.lock(),
        vec![("start", early.id()), ("start", late.id())]
    );

    framework.shutdown().unwrap();
    assert_eq!(
        log.lock()[2..],
        [("stop", late.id()), ("stop", early.id())]
    );
    assert_eq!(late.persistent_state(), PersistentState::Active);
}

#[test]
fn test_update_with_broken_content_rolls_back() {
    let cache = Arc::new(MemoryCache::new());
    let framework = Framework::builder(FrameworkConfig::default())
        .cache(cache.clone())
        .build()
        .unwrap();
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    framework.resolve(a.id()).unwrap();

    let err = framework.update(a.id(), Some(b"symbolic-name = ")).unwrap_err();
    assert!(matches!(err, GraftError::DescriptorParse { .. }));
    assert_eq!(a.modules().len(), 1);
    assert_eq!(a.state(), BundleState::Resolved);
    assert_eq!(cache.archive(a.id()).unwrap().revisions.len(), 1);
}

#[test]
fn test_update_of_unused_bundle_purges_old_revision() {
    let framework = framework();
    let events = events_of(&framework);
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", ""))
        .unwrap();
    framework.resolve(a.id()).unwrap();
    let first = a.current_module().unwrap();

    framework
        .update(a.id(), Some(&descriptor("a", "2.0.0", "")))
        .unwrap();
    assert_eq!(a.state(), BundleState::Installed);
    assert_eq!(a.version(), Version::new(2, 0, 0));
    assert_eq!(a.modules().len(), 1);
    assert_ne!(a.current_module(), Some(first));
    assert!(!framework.resolver().inspect(|graph| graph.contains(first)));

    framework.flush_events();
    let kinds: Vec<BundleEventKind> = events
        .try_iter()
        .filter_map(|event| match event {
            Event::Bundle { kind, bundle } if bundle == a.id() => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            BundleEventKind::Installed,
            BundleEventKind::Resolved,
            BundleEventKind::Unresolved,
            BundleEventKind::Updated,
        ]
    );
}

#[test]
fn test_update_restarts_active_bundle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let framework = {
        let log = Arc::clone(&log);
        Framework::builder(FrameworkConfig::default())
            .activator("recording", move || Recording {
                log: Arc::clone(&log),
            })
            .build()
            .unwrap()
    };
    framework.start().unwrap();

    let body = "activator = \"recording\"\n";
    let a = framework
        .install("mem:a", &descriptor("a", "1.0.0", body))
        .unwrap();
    framework.start_bundle(a.id(), true).unwrap();
    framework.update(a.id(), None).unwrap();

    assert_eq!(a.state(), BundleState::Active);
    assert_eq!(log.lock().len(), 3);
}

#[test]
fn test_dynamic_import() {
    let framework = framework();
    let a = framework
        .install(
            "mem:a",
            &descriptor("a", "1.0.0", "[[exports]]\nname = \"r.x\"\n"),
        )
        .unwrap();
    let b = framework
        .install(
            "mem:b",
            &descriptor("b", "1.0.0", "[[dynamic-imports]]\nname = \"r.*\"\n"),
        )
        .unwrap();
    framework.resolve(a.id()).unwrap();
    framework.resolve(b.id()).unwrap();

    let wire = framework
        .resolve_dynamic_import(b.id(), "r.x")
        .unwrap()
        .unwrap();
    assert_eq!(wire.exporter, a.current_module().unwrap());
    assert!(framework
        .resolve_dynamic_import(b.id(), "r.y")
        .unwrap()
        .is_none());

    // Repeated lookups reuse the existing wire
    framework.resolve_dynamic_import(b.id(), "r.x").unwrap();
    assert_eq!(framework.wires(b.current_module().unwrap()).len(), 1);
}

#[test]
fn test_restart_recovers_bundles() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = FrameworkConfig::default();
    config.framework.cache_dir =
        Some(Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap());

    let (kept, removed) = {
        let framework = Framework::new(config.clone()).unwrap();
        framework.start().unwrap();
        let kept = framework
            .install("mem:kept", &descriptor("kept", "1.0.0", ""))
            .unwrap();
        let removed = framework
            .install("mem:removed", &descriptor("removed", "1.0.0", ""))
            .unwrap();
        framework.start_bundle(kept.id(), true).unwrap();
        framework.uninstall(removed.id()).unwrap();
        framework.shutdown().unwrap();
        (kept.id(), removed.id())
    };

    let framework = Framework::new(config).unwrap();
    assert!(framework.bundle(removed).is_none());
    let recovered = framework.bundle(kept).unwrap();
    assert_eq!(recovered.location(), "mem:kept");
    assert_eq!(recovered.persistent_state(), PersistentState::Active);

    framework.start().unwrap();
    assert_eq!(recovered.state(), BundleState::Active);

    let next = framework
        .install("mem:next", &descriptor("next", "1.0.0", ""))
        .unwrap();
    assert!(next.id() > kept);
}

#[test]
fn test_shutdown_interrupts_further_work() {
    let framework = framework();
    framework.start().unwrap();
    framework.shutdown().unwrap();
    assert!(!framework.is_running());
    // A second shutdown is a no-op
    framework.shutdown().unwrap();

    let err = framework
        .install("mem:late", &descriptor("late", "1.0.0", ""))
        .unwrap_err();
    assert!(matches!(err, GraftError::LockInterrupted { .. }));
}
