use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::debug;

use super::kv::{KvEvent, KvEventKind, WatchEvents};
use crate::registry::{Action, RegistryError, RegistryResult, Result, Service, Watcher};

pub struct EtcdWatcher {
    events: WatchEvents,
    /// Events of an already received batch not yet handed out.
    pending: VecDeque<KvEvent>,
    cancel: watch::Sender<bool>,
}

impl EtcdWatcher {
    pub(super) fn new(events: WatchEvents, cancel: watch::Sender<bool>) -> Self {
        Self {
            events,
            pending: VecDeque::new(),
            cancel,
        }
    }
}

/// Translate a raw key event into a registry result. Deletes are decoded
/// from the previous value since the current one is gone.
pub(super) fn translate(event: &KvEvent) -> Option<RegistryResult> {
    let (action, data) = match event.kind {
        KvEventKind::Put if event.is_create() => (Action::Create, event.value.as_slice()),
        KvEventKind::Put => (Action::Update, event.value.as_slice()),
        KvEventKind::Delete => (Action::Delete, event.prev_value.as_deref()?),
    };

    match Service::decode(data) {
        Ok(service) => Some(RegistryResult::new(action, service)),
        Err(e) => {
            debug!("Skipping undecodable {} event on {}: {}", action, event.key, e);
            None
        }
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<RegistryResult> {
        loop {
            let stopped = *self.cancel.borrow();
            if stopped {
                return Err(RegistryError::WatcherStopped);
            }

            if let Some(event) = self.pending.pop_front() {
                match translate(&event) {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }

            match self.events.recv().await {
                Some(Ok(events)) => self.pending.extend(events),
                Some(Err(e)) => return Err(e),
                None => return Err(RegistryError::WatcherStopped),
            }
        }
    }

    fn stop(&self) {
        self.cancel.send_replace(true);
    }
}

impl Drop for EtcdWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
