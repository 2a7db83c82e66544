/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::sync::RwLock;

/// The root cancellation primitive. The supervisor holds a
/// [`LivelinessGuard`] for the child's lifetime; the watchdog, signal
/// forwarder, and readiness server select against `while_alive()` and
/// unblock when the guard drops.
#[async_trait]
pub trait LivelinessObserver: Send + Sync {
    /// Pending while we are alive. Ready when we aren't.
    async fn while_alive(&self);
}

impl dyn LivelinessObserver {
    pub async fn is_alive(&self) -> bool {
        futures::poll!(self.while_alive()).is_pending()
    }
}

/// Backed by an RW lock: the guard holds write access, and `while_alive()`
/// waits for read access, so observers stay pending exactly until the
/// guard is dropped.
type LivelinessObserverForGuard = RwLock<()>;

pub struct LivelinessGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl LivelinessGuard {
    pub fn create() -> (Arc<dyn LivelinessObserver>, LivelinessGuard) {
        let manager = Arc::new(LivelinessObserverForGuard::new(()));

        let guard = Arc::clone(&manager)
            .try_write_owned()
            .expect("This lock was just created");

        (manager as _, LivelinessGuard { _guard: guard })
    }
}

#[async_trait]
impl LivelinessObserver for LivelinessObserverForGuard {
    async fn while_alive(&self) {
        let _unused = self.read().await;
    }
}

#[async_trait]
impl LivelinessObserver for Arc<dyn LivelinessObserver> {
    async fn while_alive(&self) {
        self.as_ref().while_alive().await
    }
}

/// Always alive. For paths where a component runs uncancelled.
pub struct NoopLivelinessObserver;

impl NoopLivelinessObserver {
    pub fn create() -> Arc<dyn LivelinessObserver> {
        Arc::new(Self) as _
    }
}

#[async_trait]
impl LivelinessObserver for NoopLivelinessObserver {
    async fn while_alive(&self) {
        futures::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_is_alive() {
        let (observer, guard) = LivelinessGuard::create();
        assert!(observer.is_alive().await);
        drop(guard);
        assert!(!observer.is_alive().await);
    }

    #[tokio::test]
    async fn test_drop_unblocks_waiters() {
        let (observer, guard) = LivelinessGuard::create();
        let waiter = tokio::spawn(async move { observer.while_alive().await });
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter should unblock once the guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_is_forever_alive() {
        let observer = NoopLivelinessObserver::create();
        assert!(observer.is_alive().await);
    }
}
