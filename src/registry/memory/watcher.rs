use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::registry::{RegistryError, RegistryResult, Result, WatchOptions, Watcher};

/// Events buffered per watcher before new ones are dropped.
pub const WATCHER_BUFFER: usize = 64;

/// Store-side half of a watcher.
pub(super) struct WatcherSlot {
    opts: WatchOptions,
    tx: mpsc::Sender<RegistryResult>,
    exit: watch::Receiver<bool>,
}

impl WatcherSlot {
    fn is_stopped(&self) -> bool {
        *self.exit.borrow() || self.tx.is_closed()
    }
}

pub struct MemoryWatcher {
    id: Uuid,
    rx: mpsc::Receiver<RegistryResult>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    /// Tells the store to drop this watcher's slot.
    release: mpsc::UnboundedSender<Uuid>,
}

pub(super) fn channel(
    opts: WatchOptions,
    release: mpsc::UnboundedSender<Uuid>,
) -> (WatcherSlot, MemoryWatcher) {
    let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
    let (exit_tx, exit_rx) = watch::channel(false);

    let slot = WatcherSlot {
        opts,
        tx,
        exit: exit_rx.clone(),
    };
    let watcher = MemoryWatcher {
        id: Uuid::new_v4(),
        rx,
        exit_tx,
        exit_rx,
        release,
    };
    (slot, watcher)
}

/// Offer a result to every matching watcher without waiting.
///
/// Called with the store's write lock held, so a full watcher loses the
/// event instead of stalling the writer. Stopped watchers are released.
pub(super) fn notify(watchers: &mut HashMap<Uuid, WatcherSlot>, result: &RegistryResult) {
    watchers.retain(|id, slot| {
        if slot.is_stopped() {
            debug!("Releasing stopped watcher {}", id);
            return false;
        }
        if !slot.opts.matches(&result.service.name) {
            return true;
        }
        match slot.tx.try_send(result.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(
                    "Watcher {} is full, dropping {} event for service {}",
                    id, result.action, result.service.name
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    });
}

/// Drop the slots of watchers that were stopped or dropped.
pub(super) fn release_stopped(watchers: &mut HashMap<Uuid, WatcherSlot>) {
    watchers.retain(|id, slot| {
        let stopped = slot.is_stopped();
        if stopped {
            debug!("Releasing stopped watcher {}", id);
        }
        !stopped
    });
}

impl MemoryWatcher {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<RegistryResult> {
        let stopped = *self.exit_rx.borrow();
        if stopped {
            return Err(RegistryError::WatcherStopped);
        }

        tokio::select! {
            biased;
            _ = self.exit_rx.changed() => Err(RegistryError::WatcherStopped),
            result = self.rx.recv() => result.ok_or(RegistryError::WatcherStopped),
        }
    }

    fn stop(&self) {
        let already_stopped = self.exit_tx.send_replace(true);
        if !already_stopped {
            // the store may be gone already
            let _ = self.release.send(self.id);
        }
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
