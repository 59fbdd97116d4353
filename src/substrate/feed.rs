use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::types::{CacheName, Key, TransactionId, VersionedKey};

use super::partition::ProcStatus;

/// Notification that an entry changed in the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    VersionCommitted {
        cache: CacheName,
        version: VersionedKey<Key>,
    },
    VersionRemoved {
        cache: CacheName,
        version: VersionedKey<Key>,
    },
    /// `status` is `None` once the record has been deleted.
    StatusChanged {
        id: TransactionId,
        status: Option<ProcStatus>,
    },
}

/// Which entry a listener is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    Version {
        cache: CacheName,
        version: VersionedKey<Key>,
    },
    Status(TransactionId),
}

impl ChangeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (
                ChangeFilter::Version { cache, version },
                ChangeEvent::VersionCommitted {
                    cache: event_cache,
                    version: event_version,
                }
                | ChangeEvent::VersionRemoved {
                    cache: event_cache,
                    version: event_version,
                },
            ) => cache == event_cache && version == event_version,
            (ChangeFilter::Status(id), ChangeEvent::StatusChanged { id: event_id, .. }) => {
                id == event_id
            }
            _ => false,
        }
    }
}

/// What a listener observed while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Changed(ChangeEvent),
    /// Events were dropped; the listener must re-check the entry itself.
    Lagged,
    Closed,
}

/// Fan-in point for every change event of one substrate instance.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    active: Arc<AtomicUsize>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No receivers is not an error: nobody is waiting on anything.
            let _ = self.sender.send(event);
        }
    }

    pub fn subscribe(&self, filter: ChangeFilter) -> ChangeListener {
        self.active.fetch_add(1, Ordering::SeqCst);
        ChangeListener {
            receiver: self.sender.subscribe(),
            filter,
            active: self.active.clone(),
        }
    }

    /// Number of listeners currently registered.
    pub fn active_listeners(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Registration for changes of a single entry. Deregisters on drop.
#[derive(Debug)]
pub struct ChangeListener {
    receiver: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
    active: Arc<AtomicUsize>,
}

impl ChangeListener {
    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Wait for the next event matching this listener's filter.
    pub async fn recv(&mut self) -> ListenerEvent {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => {
                    return ListenerEvent::Changed(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return ListenerEvent::Lagged,
                Err(RecvError::Closed) => return ListenerEvent::Closed,
            }
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versioned(millis: u64) -> VersionedKey<Key> {
        VersionedKey::new("k".to_string(), TransactionId::new(millis, 0, 0))
    }

    #[tokio::test]
    async fn listener_sees_only_matching_events() {
        let feed = ChangeFeed::new(16);
        let mut listener = feed.subscribe(ChangeFilter::Version {
            cache: "c".to_string(),
            version: versioned(2),
        });

        feed.publish(vec![
            ChangeEvent::VersionCommitted {
                cache: "c".to_string(),
                version: versioned(1),
            },
            ChangeEvent::VersionCommitted {
                cache: "other".to_string(),
                version: versioned(2),
            },
            ChangeEvent::VersionRemoved {
                cache: "c".to_string(),
                version: versioned(2),
            },
        ]);

        assert_eq!(
            listener.recv().await,
            ListenerEvent::Changed(ChangeEvent::VersionRemoved {
                cache: "c".to_string(),
                version: versioned(2),
            })
        );
    }

    #[tokio::test]
    async fn dropping_listener_deregisters() {
        let feed = ChangeFeed::new(4);
        let first = feed.subscribe(ChangeFilter::Status(TransactionId::new(1, 0, 0)));
        let second = feed.subscribe(ChangeFilter::Status(TransactionId::new(2, 0, 0)));
        assert_eq!(feed.active_listeners(), 2);
        drop(first);
        assert_eq!(feed.active_listeners(), 1);
        drop(second);
        assert_eq!(feed.active_listeners(), 0);
    }

    #[tokio::test]
    async fn overflow_reports_lag() {
        let feed = ChangeFeed::new(1);
        let id = TransactionId::new(1, 0, 0);
        let mut listener = feed.subscribe(ChangeFilter::Status(id));
        feed.publish(vec![
            ChangeEvent::StatusChanged {
                id,
                status: Some(ProcStatus::Open),
            },
            ChangeEvent::StatusChanged { id, status: None },
        ]);
        assert_eq!(listener.recv().await, ListenerEvent::Lagged);
    }
}
