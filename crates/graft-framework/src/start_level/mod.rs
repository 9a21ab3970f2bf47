//! Start levels
//!
//! All start-level changes, for the framework and for single bundles, run
//! in order on one worker thread. Moving the active level walks it one step
//! at a time: going up starts the persistently started bundles assigned to
//! each new level, going down stops the bundles above it. A bundle that
//! fails to start or stop is reported and the walk goes on.

use std::cmp::Reverse;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info};

use graft_core::error::{GraftError, GraftResult};
use graft_core::types::{BundleId, BundleState, PersistentState, SYSTEM_BUNDLE_ID};

use crate::bundle::Bundle;
use crate::events::{Event, FrameworkEventKind};
use crate::framework::FrameworkInner;

pub(crate) enum StartLevelRequest {
    /// Move the framework to `level`, acknowledging on `ack` when done
    Framework { level: u32, ack: Option<Sender<()>> },
    /// Start or stop one bundle after its level changed
    Bundle(BundleId),
}

impl FrameworkInner {
    pub(crate) fn set_framework_start_level(&self, level: u32) -> GraftResult<()> {
        if level == 0 {
            return Err(GraftError::InvalidStartLevel {
                level,
                reason: "level 0 is reserved for shutdown".to_string(),
            });
        }
        self.submit_start_level(StartLevelRequest::Framework { level, ack: None })
    }

    pub(crate) fn set_bundle_start_level(&self, id: BundleId, level: u32) -> GraftResult<()> {
        if level == 0 {
            return Err(GraftError::InvalidStartLevel {
                level,
                reason: "bundle start levels start at 1".to_string(),
            });
        }
        let bundle = self.bundle(id)?;
        if id.is_system() || bundle.state() == BundleState::Uninstalled {
            return Err(GraftError::state(id, bundle.state(), "set the start level of"));
        }

        {
            let _guard = self.locks.acquire(id)?;
            self.cache.set_start_level(id, level)?;
            bundle.set_start_level(level);
        }
        debug!("Bundle {} assigned start level {}", id, level);
        self.submit_start_level(StartLevelRequest::Bundle(id))
    }

    /// Queue a framework level change and block until the worker applied it
    pub(crate) fn set_level_and_wait(&self, level: u32) -> GraftResult<()> {
        let (ack, done) = bounded(1);
        self.submit_start_level(StartLevelRequest::Framework {
            level,
            ack: Some(ack),
        })?;
        done.recv().map_err(|_| GraftError::LockInterrupted {
            resource: format!("start level {}", level),
        })
    }

    fn submit_start_level(&self, request: StartLevelRequest) -> GraftResult<()> {
        let queued = self
            .start_level_worker
            .get()
            .map(|worker| worker.submit(request))
            .unwrap_or(false);
        if queued {
            Ok(())
        } else {
            Err(GraftError::LockInterrupted {
                resource: "start level queue".to_string(),
            })
        }
    }

    pub(crate) fn handle_start_level(self: &Arc<Self>, request: StartLevelRequest) {
        match request {
            StartLevelRequest::Framework { level, ack } => {
                self.move_to_level(level);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            StartLevelRequest::Bundle(id) => self.apply_bundle_level(id),
        }
    }

    fn move_to_level(self: &Arc<Self>, target: u32) {
        let mut current = self.active_level();
        if target == current {
            return;
        }
        info!("Moving start level from {} to {}", current, target);

        while current < target {
            current += 1;
            self.active_level.store(current, Ordering::Release);
            let mut due: Vec<Arc<Bundle>> = self
                .level_bundles()
                .into_iter()
                .filter(|bundle| bundle.start_level() == current)
                .filter(|bundle| bundle.persistent_state() == PersistentState::Active)
                .collect();
            due.sort_by_key(|bundle| (bundle.start_level(), bundle.id()));
            for bundle in due {
                self.start_for_level(&bundle);
            }
        }

        while current > target {
            current -= 1;
            self.active_level.store(current, Ordering::Release);
            let mut due: Vec<Arc<Bundle>> = self
                .level_bundles()
                .into_iter()
                .filter(|bundle| bundle.start_level() > current)
                .filter(|bundle| bundle.state() == BundleState::Active)
                .collect();
            due.sort_by_key(|bundle| Reverse((bundle.start_level(), bundle.id())));
            for bundle in due {
                self.stop_for_level(&bundle);
            }
        }

        self.events.fire(Event::framework(
            FrameworkEventKind::StartLevelChanged,
            SYSTEM_BUNDLE_ID,
        ));
    }

    fn apply_bundle_level(self: &Arc<Self>, id: BundleId) {
        let Some(bundle) = self.lookup(id) else {
            return;
        };
        let active = self.active_level();
        if bundle.start_level() <= active {
            if bundle.persistent_state() == PersistentState::Active
                && bundle.state() != BundleState::Active
            {
                self.start_for_level(&bundle);
            }
        } else if bundle.state() == BundleState::Active {
            self.stop_for_level(&bundle);
        }
    }

    /// Bundles subject to start levels: all but the system bundle
    fn level_bundles(&self) -> Vec<Arc<Bundle>> {
        self.bundles()
            .into_iter()
            .filter(|bundle| !bundle.id().is_system())
            .collect()
    }

    fn start_for_level(self: &Arc<Self>, bundle: &Bundle) {
        let (result, events) = self
            .with_wiring_locks(bundle.id(), |events| self.start_locked(bundle, false, events));
        self.fire_all(events);
        if let Err(err) = result {
            self.broadcast(bundle.id(), &err);
        }
    }

    fn stop_for_level(self: &Arc<Self>, bundle: &Bundle) {
        let mut events = Vec::new();
        let result = match self.locks.acquire(bundle.id()) {
            Ok(_guard) => self.stop_locked(bundle, false, &mut events),
            Err(err) => Err(err),
        };
        self.fire_all(events);
        if let Err(err) = result {
            self.broadcast(bundle.id(), &err);
        }
    }
}
