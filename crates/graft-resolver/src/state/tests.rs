//! Unit tests for resolver state

use super::*;
use graft_core::types::{ModuleDescriptor, VersionRange};

fn mid(bundle: u64) -> ModuleId {
    ModuleId::new(BundleId(bundle), 0)
}

fn v(major: u64) -> Version {
    Version::new(major, 0, 0)
}

fn module(bundle: u64, descriptor: ModuleDescriptor) -> Module {
    Module::from_descriptor(mid(bundle), &descriptor)
}

fn first_requirement(state: &ResolverState, id: ModuleId) -> Arc<Requirement> {
    state.requirements(id).into_iter().next().unwrap()
}

fn package_providers(state: &ResolverState, importer: ModuleId) -> Vec<ModuleId> {
    let req = first_requirement(state, importer);
    state
        .get_candidates(importer, &req, true)
        .iter()
        .map(|cap| cap.module)
        .collect()
}

#[test]
fn test_candidates_are_best_first() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("a", v(1)).export("p", v(1))));
    state.add_module(module(2, ModuleDescriptor::new("b", v(1)).export("p", v(2))));
    state.add_module(module(3, ModuleDescriptor::new("c", v(1)).export("p", v(2))));
    state.add_module(module(
        4,
        ModuleDescriptor::new("d", v(1)).import("p", VersionRange::any()),
    ));

    assert_eq!(package_providers(&state, mid(4)), vec![mid(2), mid(3), mid(1)]);
}

#[test]
fn test_singleton_displaces_unresolved_selection() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("s", v(1)).singleton()));
    assert!(state.is_active(mid(1)));

    state.add_module(module(2, ModuleDescriptor::new("s", v(2)).singleton()));
    assert!(state.is_active(mid(2)));
    assert!(!state.is_active(mid(1)));
}

#[test]
fn test_singleton_keeps_resolved_selection() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("s", v(1)).singleton()));
    let resolved = state.commit(WireMap::from([(mid(1), Vec::new())])).unwrap();
    assert_eq!(resolved, vec![mid(1)]);

    state.add_module(module(2, ModuleDescriptor::new("s", v(2)).singleton()));
    assert!(state.is_active(mid(1)));
    assert!(!state.is_active(mid(2)));

    let err = state.check_singleton(mid(2)).unwrap_err();
    assert!(matches!(err, GraftError::ResolutionConflict { .. }));

    let err = state
        .commit(WireMap::from([(mid(2), Vec::new())]))
        .unwrap_err();
    assert!(matches!(err, GraftError::ResolutionConflict { .. }));
    assert!(!state.is_resolved(mid(2)));
}

#[test]
fn test_commit_swaps_unresolved_singleton_selection() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("s", v(2)).singleton()));
    state.add_module(module(2, ModuleDescriptor::new("s", v(1)).singleton()));
    assert!(state.is_active(mid(1)));
    assert_eq!(state.singleton_rivals(mid(2)), vec![mid(1)]);

    // Checking leaves the selection alone
    state.check_singleton(mid(2)).unwrap();
    assert!(state.is_active(mid(1)));
    assert!(!state.is_active(mid(2)));

    state.commit(WireMap::from([(mid(2), Vec::new())])).unwrap();
    assert!(state.is_active(mid(2)));
    assert!(!state.is_active(mid(1)));
}

#[test]
fn test_removed_singleton_promotes_next() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("s", v(2)).singleton()));
    state.add_module(module(2, ModuleDescriptor::new("s", v(1)).singleton()));

    assert!(state.remove_module(mid(1)).is_some());
    assert!(state.is_active(mid(2)));
}

#[test]
fn test_fragment_contributes_exports_to_host() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("host", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("frag", v(1))
            .fragment_of("host", VersionRange::any())
            .export("p", v(1)),
    ));
    state.add_module(module(
        3,
        ModuleDescriptor::new("user", v(1)).import("p", VersionRange::any()),
    ));

    state.inspect(|graph| {
        assert_eq!(graph.get(mid(1)).unwrap().fragments(), &[mid(2)]);
    });
    assert_eq!(package_providers(&state, mid(3)), vec![mid(1)]);
    assert_eq!(state.find_host(mid(2)), Some(mid(1)));
}

#[test]
fn test_better_fragment_displaces_attached_one() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("host", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("frag", v(1)).fragment_of("host", VersionRange::any()),
    ));
    state.add_module(module(
        3,
        ModuleDescriptor::new("frag", v(2)).fragment_of("host", VersionRange::any()),
    ));

    state.inspect(|graph| {
        assert_eq!(graph.get(mid(1)).unwrap().fragments(), &[mid(3)]);
        assert!(graph.get(mid(2)).unwrap().dependent_hosts().is_empty());
    });

    // Removing the winner brings the other revision back
    state.remove_module(mid(3));
    state.inspect(|graph| {
        assert_eq!(graph.get(mid(1)).unwrap().fragments(), &[mid(2)]);
    });
}

#[test]
fn test_conflicting_fragment_is_not_attached() {
    let state = ResolverState::new();
    state.add_module(module(
        1,
        ModuleDescriptor::new("host", v(1)).import("p", VersionRange::at_least(v(1))),
    ));
    state.add_module(module(
        2,
        ModuleDescriptor::new("frag", v(1))
            .fragment_of("host", VersionRange::any())
            .import("p", VersionRange::at_least(v(2))),
    ));

    state.inspect(|graph| {
        assert!(graph.get(mid(1)).unwrap().fragments().is_empty());
    });
}

#[test]
fn test_detach_fragment() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("host", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("frag", v(1))
            .fragment_of("host", VersionRange::any())
            .export("p", v(1)),
    ));

    state.detach_fragment(mid(1), mid(2));
    assert!(state
        .capabilities(mid(1))
        .iter()
        .all(|cap| cap.name() != "p"));
}

#[test]
fn test_commit_resolves_attached_fragments() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("host", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("frag", v(1)).fragment_of("host", VersionRange::any()),
    ));

    let resolved = state.commit(WireMap::from([(mid(1), Vec::new())])).unwrap();
    assert_eq!(resolved, vec![mid(1), mid(2)]);
    assert!(state.is_resolved(mid(2)));
}

#[test]
fn test_commit_records_reverse_edges() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("a", v(1)).export("p", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("b", v(1)).import("p", VersionRange::any()),
    ));

    let req = first_requirement(&state, mid(2));
    let cap = state.get_candidates(mid(2), &req, true).remove(0);
    let wires = WireMap::from([
        (mid(1), Vec::new()),
        (mid(2), vec![Wire::new(mid(2), req, cap)]),
    ]);
    state.commit(wires).unwrap();

    assert_eq!(state.dependents(mid(1)), vec![mid(2)]);
    assert_eq!(
        state.dependent_bundle_closure(&[BundleId(1)]),
        BTreeSet::from([BundleId(1), BundleId(2)])
    );
}

#[test]
fn test_commit_rejects_removed_exporter() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("a", v(1)).export("p", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("b", v(1)).import("p", VersionRange::any()),
    ));

    let req = first_requirement(&state, mid(2));
    let cap = state.get_candidates(mid(2), &req, true).remove(0);
    state.remove_module(mid(1));

    let wires = WireMap::from([(mid(2), vec![Wire::new(mid(2), req, cap)])]);
    assert!(state.commit(wires).is_err());
    assert!(!state.is_resolved(mid(2)));
}

#[test]
fn test_substituted_export_is_hidden() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("a", v(1)).export("p", v(2))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("b", v(1))
            .export("p", v(1))
            .import("p", VersionRange::any()),
    ));
    state.add_module(module(
        3,
        ModuleDescriptor::new("c", v(1)).import("p", VersionRange::any()),
    ));
    assert_eq!(package_providers(&state, mid(3)), vec![mid(1), mid(2)]);

    let req = first_requirement(&state, mid(2));
    let cap = state
        .get_candidates(mid(2), &req, true)
        .into_iter()
        .find(|cap| cap.module == mid(1))
        .unwrap();
    state
        .commit(WireMap::from([
            (mid(1), Vec::new()),
            (mid(2), vec![Wire::new(mid(2), req, cap)]),
        ]))
        .unwrap();

    assert_eq!(package_providers(&state, mid(3)), vec![mid(1)]);
}

#[test]
fn test_stale_provider_is_not_a_candidate() {
    let state = ResolverState::new();
    state.add_module(module(1, ModuleDescriptor::new("a", v(1)).export("p", v(1))));
    state.add_module(module(
        2,
        ModuleDescriptor::new("b", v(1)).import("p", VersionRange::any()),
    ));

    state.mark_stale(mid(1));
    assert!(package_providers(&state, mid(2)).is_empty());
}

#[test]
fn test_system_module_exports() {
    let state = ResolverState::new();
    let system = ModuleId::new(BundleId(0), 0);
    state.add_module(Module::from_descriptor(
        system,
        &ModuleDescriptor::new("graft.system", v(1)),
    ));
    state.add_module(module(
        1,
        ModuleDescriptor::new("b", v(1)).import("graft.log", VersionRange::any()),
    ));
    assert!(package_providers(&state, mid(1)).is_empty());

    let exports = system_exports(system, &v(1), &[("graft.log".to_string(), v(1))]);
    state.extend_system_module(system, exports);
    assert_eq!(package_providers(&state, mid(1)), vec![system]);
}
