//! Lifecycle locks
//!
//! Lock tiers, acquired in this order and never the other way around:
//!
//! 1. install-location locks, one per location being installed;
//! 2. the installed-bundle map (owned by the framework);
//! 3. the uninstalled-bundle list (owned by the framework);
//! 4. per-bundle reentrant locks, held for the whole of a lifecycle
//!    operation.
//!
//! Tiers 2 and 3 are short critical sections and are never held while
//! waiting on tier 1 or 4. Batch operations take every bundle they touch
//! through [`LockCoordinator::lock_all`], which either gets the whole set or
//! waits holding nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use graft_core::error::{GraftError, GraftResult};
use graft_core::types::BundleId;

#[derive(Debug, Clone, Copy)]
struct Owner {
    thread: ThreadId,
    count: usize,
}

/// Explicit lock objects for install locations and bundles
#[derive(Debug, Default)]
pub struct LockCoordinator {
    locations: Mutex<HashSet<String>>,
    location_released: Condvar,
    owners: Mutex<HashMap<BundleId, Owner>>,
    bundle_released: Condvar,
    interrupted: AtomicBool,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an install location, waiting while another thread installs it
    pub fn lock_location(&self, location: &str) -> GraftResult<LocationGuard<'_>> {
        let mut locations = self.locations.lock();
        while locations.contains(location) {
            self.check_interrupted(location)?;
            debug!("Waiting for install of {}", location);
            self.location_released.wait(&mut locations);
        }
        self.check_interrupted(location)?;
        locations.insert(location.to_string());
        Ok(LocationGuard {
            coordinator: self,
            location: location.to_string(),
        })
    }

    /// Acquire a bundle lock, blocking while another thread holds it
    pub fn acquire(&self, bundle: BundleId) -> GraftResult<BundleGuard<'_>> {
        let current = thread::current().id();
        let mut owners = self.owners.lock();
        loop {
            self.check_interrupted(&bundle_resource(bundle))?;
            match owners.get_mut(&bundle) {
                None => {
                    owners.insert(
                        bundle,
                        Owner {
                            thread: current,
                            count: 1,
                        },
                    );
                    break;
                }
                Some(owner) if owner.thread == current => {
                    owner.count += 1;
                    break;
                }
                Some(_) => {
                    debug!("Waiting for lock on bundle {}", bundle);
                    self.bundle_released.wait(&mut owners);
                }
            }
        }
        Ok(BundleGuard {
            coordinator: self,
            bundle,
        })
    }

    /// Acquire a bundle lock only if that does not block
    pub fn try_acquire(&self, bundle: BundleId) -> Option<BundleGuard<'_>> {
        let current = thread::current().id();
        let mut owners = self.owners.lock();
        if self.interrupted.load(Ordering::Acquire) {
            return None;
        }
        match owners.get_mut(&bundle) {
            None => {
                owners.insert(
                    bundle,
                    Owner {
                        thread: current,
                        count: 1,
                    },
                );
            }
            Some(owner) if owner.thread == current => owner.count += 1,
            Some(_) => return None,
        }
        Some(BundleGuard {
            coordinator: self,
            bundle,
        })
    }

    /// Acquire every bundle returned by `targets`, all at once.
    ///
    /// While any target is held by another thread nothing is acquired and
    /// the call waits for a release, then recomputes the target set from
    /// scratch. The set is recomputed once more after acquisition; if it
    /// grew, everything is released and the attempt repeats.
    pub fn lock_all<F>(&self, mut targets: F) -> GraftResult<BatchGuard<'_>>
    where
        F: FnMut() -> BTreeSet<BundleId>,
    {
        loop {
            let wanted = targets();
            let batch = {
                let mut owners = self.owners.lock();
                self.check_interrupted("bundle batch")?;
                match self.take_all(&mut owners, wanted) {
                    Ok(batch) => batch,
                    Err(blocked) => {
                        debug!("Batch waiting for lock on bundle {}", blocked);
                        self.bundle_released.wait(&mut owners);
                        continue;
                    }
                }
            };

            if targets().is_subset(&batch.bundles) {
                return Ok(batch);
            }
            // Dropping the batch releases it before retrying
        }
    }

    /// Acquire every bundle in `bundles` only if none is held by another
    /// thread; `LockContended` names one that is
    pub fn try_lock_all(&self, bundles: BTreeSet<BundleId>) -> GraftResult<BatchGuard<'_>> {
        let mut owners = self.owners.lock();
        self.check_interrupted("bundle batch")?;
        self.take_all(&mut owners, bundles)
            .map_err(|bundle| GraftError::LockContended { bundle })
    }

    /// Take every bundle of `wanted`, or nothing if one is held elsewhere
    fn take_all(
        &self,
        owners: &mut HashMap<BundleId, Owner>,
        wanted: BTreeSet<BundleId>,
    ) -> Result<BatchGuard<'_>, BundleId> {
        let current = thread::current().id();
        let blocked = wanted.iter().find(|bundle| {
            owners
                .get(*bundle)
                .map(|owner| owner.thread != current)
                .unwrap_or(false)
        });
        if let Some(bundle) = blocked {
            return Err(*bundle);
        }
        for bundle in &wanted {
            owners
                .entry(*bundle)
                .and_modify(|owner| owner.count += 1)
                .or_insert(Owner {
                    thread: current,
                    count: 1,
                });
        }
        Ok(BatchGuard {
            coordinator: self,
            bundles: wanted,
        })
    }

    /// Check if the current thread holds a bundle lock
    pub fn is_held_by_current_thread(&self, bundle: BundleId) -> bool {
        self.owners
            .lock()
            .get(&bundle)
            .map(|owner| owner.thread == thread::current().id())
            .unwrap_or(false)
    }

    /// Wake every waiter and fail all further waits with `LockInterrupted`
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        // Take each monitor so no waiter misses the wakeup
        drop(self.locations.lock());
        self.location_released.notify_all();
        drop(self.owners.lock());
        self.bundle_released.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn release(&self, bundle: BundleId) {
        let mut owners = self.owners.lock();
        let released = match owners.get_mut(&bundle) {
            Some(owner) => {
                owner.count -= 1;
                owner.count == 0
            }
            None => false,
        };
        if released {
            owners.remove(&bundle);
            drop(owners);
            self.bundle_released.notify_all();
        }
    }

    fn release_location(&self, location: &str) {
        self.locations.lock().remove(location);
        self.location_released.notify_all();
    }

    fn check_interrupted(&self, resource: &str) -> GraftResult<()> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(GraftError::LockInterrupted {
                resource: resource.to_string(),
            });
        }
        Ok(())
    }
}

fn bundle_resource(bundle: BundleId) -> String {
    format!("bundle {}", bundle)
}

/// Reservation of an install location
#[derive(Debug)]
pub struct LocationGuard<'a> {
    coordinator: &'a LockCoordinator,
    location: String,
}

impl Drop for LocationGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release_location(&self.location);
    }
}

/// One hold on a bundle lock
#[derive(Debug)]
pub struct BundleGuard<'a> {
    coordinator: &'a LockCoordinator,
    bundle: BundleId,
}

impl BundleGuard<'_> {
    pub fn bundle(&self) -> BundleId {
        self.bundle
    }
}

impl Drop for BundleGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.bundle);
    }
}

/// Holds on every bundle of a batch
#[derive(Debug)]
pub struct BatchGuard<'a> {
    coordinator: &'a LockCoordinator,
    bundles: BTreeSet<BundleId>,
}

impl BatchGuard<'_> {
    /// Bundles held by this batch
    pub fn bundles(&self) -> &BTreeSet<BundleId> {
        &self.bundles
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        for bundle in &self.bundles {
            self.coordinator.release(*bundle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_acquire() {
        let locks = LockCoordinator::new();
        let outer = locks.acquire(BundleId(1)).unwrap();
        let inner = locks.acquire(BundleId(1)).unwrap();
        assert!(locks.is_held_by_current_thread(BundleId(1)));
        drop(inner);
        assert!(locks.is_held_by_current_thread(BundleId(1)));
        drop(outer);
        assert!(!locks.is_held_by_current_thread(BundleId(1)));
    }

    #[test]
    fn test_try_acquire_does_not_block() {
        let locks = Arc::new(LockCoordinator::new());
        let _held = locks.acquire(BundleId(1)).unwrap();

        let other = Arc::clone(&locks);
        let acquired = std::thread::spawn(move || other.try_acquire(BundleId(1)).is_some())
            .join()
            .unwrap();
        assert!(!acquired);
        assert!(locks.try_acquire(BundleId(1)).is_some());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let locks = Arc::new(LockCoordinator::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = locks.acquire(BundleId(7)).unwrap();

        let handle = {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                let _guard = locks.acquire(BundleId(7)).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(guard);
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_all_waits_holding_nothing() {
        let locks = Arc::new(LockCoordinator::new());
        let held = locks.acquire(BundleId(2)).unwrap();

        let handle = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                let batch = locks
                    .lock_all(|| BTreeSet::from([BundleId(1), BundleId(2)]))
                    .unwrap();
                batch.bundles().len()
            })
        };

        // Bundle 1 stays available while the batch waits for bundle 2
        std::thread::sleep(Duration::from_millis(50));
        assert!(locks.try_acquire(BundleId(1)).is_some());

        drop(held);
        assert_eq!(handle.join().unwrap(), 2);
        assert!(locks.try_acquire(BundleId(2)).is_some());
    }

    #[test]
    fn test_lock_all_recomputes_targets_after_wake() {
        let locks = Arc::new(LockCoordinator::new());
        let wanted = Arc::new(parking_lot::Mutex::new(BTreeSet::from([BundleId(8)])));
        let held = locks.acquire(BundleId(8)).unwrap();

        let handle = {
            let locks = Arc::clone(&locks);
            let wanted = Arc::clone(&wanted);
            std::thread::spawn(move || {
                let batch = locks.lock_all(|| wanted.lock().clone()).unwrap();
                batch.bundles().clone()
            })
        };

        // The target set moves away from the held bundle while the batch
        // waits; any release wakes it and the new set is taken
        std::thread::sleep(Duration::from_millis(50));
        *wanted.lock() = BTreeSet::from([BundleId(9)]);
        drop(locks.acquire(BundleId(10)).unwrap());

        assert_eq!(handle.join().unwrap(), BTreeSet::from([BundleId(9)]));
        assert!(locks.is_held_by_current_thread(BundleId(8)));
        drop(held);
    }

    #[test]
    fn test_try_lock_all_is_all_or_nothing() {
        let locks = Arc::new(LockCoordinator::new());
        let _held = locks.acquire(BundleId(11)).unwrap();

        let other = Arc::clone(&locks);
        let (taken, twelve_free) = std::thread::spawn(move || {
            let taken = other.try_lock_all(BTreeSet::from([BundleId(11), BundleId(12)]));
            let taken = matches!(taken, Err(GraftError::LockContended { bundle }) if bundle == BundleId(11));
            (taken, other.try_acquire(BundleId(12)).is_some())
        })
        .join()
        .unwrap();
        assert!(taken);
        assert!(twelve_free);

        // Locks the current thread already holds do not block it
        let batch = locks
            .try_lock_all(BTreeSet::from([BundleId(11), BundleId(12)]))
            .unwrap();
        assert_eq!(batch.bundles().len(), 2);
    }

    #[test]
    fn test_lock_all_includes_own_locks() {
        let locks = LockCoordinator::new();
        let _held = locks.acquire(BundleId(3)).unwrap();
        let batch = locks.lock_all(|| BTreeSet::from([BundleId(3), BundleId(4)])).unwrap();
        drop(batch);
        assert!(locks.is_held_by_current_thread(BundleId(3)));
        assert!(!locks.is_held_by_current_thread(BundleId(4)));
    }

    #[test]
    fn test_interrupt_wakes_waiters() {
        let locks = Arc::new(LockCoordinator::new());
        let _held = locks.acquire(BundleId(5)).unwrap();

        let handle = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || locks.acquire(BundleId(5)).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        locks.interrupt();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(GraftError::LockInterrupted { .. })));
        assert!(locks.lock_location("file:a").is_err());
    }

    #[test]
    fn test_location_lock_serializes_installs() {
        let locks = Arc::new(LockCoordinator::new());
        let guard = locks.lock_location("file:a").unwrap();
        let other = locks.lock_location("file:b").unwrap();
        drop(other);

        let handle = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || locks.lock_location("file:a").is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(handle.join().unwrap());
    }
}
