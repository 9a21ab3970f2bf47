//! Shared helpers for framework integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use graft_config::FrameworkConfig;
use graft_framework::{Event, Framework, FrameworkEventKind};

/// TOML descriptor for a bundle named `name`
pub fn descriptor(name: &str, version: &str, body: &str) -> Vec<u8> {
    format!("symbolic-name = \"{name}\"\nversion = \"{version}\"\n{body}").into_bytes()
}

pub fn exporting(name: &str, version: &str, package: &str, package_version: &str) -> Vec<u8> {
    descriptor(
        name,
        version,
        &format!("[[exports]]\nname = \"{package}\"\nversion = \"{package_version}\"\n"),
    )
}

pub fn importing(name: &str, packages: &[&str]) -> Vec<u8> {
    let body: String = packages
        .iter()
        .map(|package| format!("[[imports]]\nname = \"{package}\"\n"))
        .collect();
    descriptor(name, "1.0.0", &body)
}

/// Framework that keeps unused revisions until an explicit refresh
pub fn framework_without_purge() -> Framework {
    let mut config = FrameworkConfig::default();
    config.framework.purge_unused = false;
    Framework::new(config).unwrap()
}

/// Records every event fired after the call
pub struct Recorder {
    rx: Receiver<Event>,
}

impl Recorder {
    pub fn attach(framework: &Framework) -> Self {
        framework.flush_events();
        let (tx, rx) = unbounded();
        framework.add_listener(Arc::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        }));
        Self { rx }
    }

    /// Everything delivered so far
    pub fn drain(&self, framework: &Framework) -> Vec<Event> {
        framework.flush_events();
        self.rx.try_iter().collect()
    }

    /// Block until a framework event of `kind` arrives
    pub fn wait_for(&self, kind: FrameworkEventKind) {
        loop {
            let event = self.rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if let Event::Framework { kind: seen, .. } = event {
                if seen == kind {
                    return;
                }
            }
        }
    }
}
