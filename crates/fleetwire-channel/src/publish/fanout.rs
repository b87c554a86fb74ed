use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use fleetwire_frame::{FrameConfig, FrameError, Message, HEADER_SIZE};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::lock;

/// What the fan-out knows about one connected subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: u64,
    pub peer: String,
    /// Identity announced with `{"id": ...}`, if any.
    pub identity: Option<String>,
}

/// Decides which subscribers receive a topic-restricted publish.
pub trait SubscriberFilter: Send + Sync {
    fn accepts(&self, subscriber: &SubscriberInfo, topics: &[String]) -> bool;
}

/// Accepts subscribers whose announced identity is one of the topics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl SubscriberFilter for IdentityFilter {
    fn accepts(&self, subscriber: &SubscriberInfo, topics: &[String]) -> bool {
        subscriber
            .identity
            .as_deref()
            .is_some_and(|identity| topics.iter().any(|topic| topic == identity))
    }
}

/// Notified when subscribers announce themselves and when they go away.
pub trait PresenceHook: Send + Sync {
    fn on_connect(&self, subscriber: &SubscriberInfo);
    fn on_disconnect(&self, subscriber: &SubscriberInfo);
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Queued for delivery.
    pub delivered: usize,
    /// Skipped because the subscriber's queue was at its high-water mark.
    pub dropped: usize,
    /// Skipped by the subscriber filter.
    pub filtered: usize,
    /// Subscribers found gone and removed.
    pub removed: usize,
}

struct Subscriber {
    info: SubscriberInfo,
    queue: mpsc::Sender<Bytes>,
}

/// The subscriber set of a publish daemon.
///
/// Each subscriber owns a bounded queue of encoded frames drained by its own
/// writer task, so a slow or broken subscriber never holds up the others.
pub struct Fanout {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    hwm: usize,
    filtering: bool,
    max_payload: usize,
    filter: RwLock<Arc<dyn SubscriberFilter>>,
    presence: RwLock<Option<Arc<dyn PresenceHook>>>,
}

impl Fanout {
    pub fn new(hwm: usize, filtering: bool, frame_config: &FrameConfig) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            hwm: hwm.max(1),
            filtering,
            max_payload: frame_config.max_payload_size,
            filter: RwLock::new(Arc::new(IdentityFilter)),
            presence: RwLock::new(None),
        }
    }

    pub fn set_filter(&self, filter: Arc<dyn SubscriberFilter>) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    pub fn set_presence(&self, hook: Option<Arc<dyn PresenceHook>>) {
        *self.presence.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    fn presence(&self) -> Option<Arc<dyn PresenceHook>> {
        self.presence.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Add a subscriber; the caller drains the returned queue to its socket.
    pub fn register(&self, peer: &str) -> (u64, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(self.hwm);
        let info = SubscriberInfo {
            id,
            peer: peer.to_string(),
            identity: None,
        };
        lock(&self.subscribers).insert(id, Subscriber { info, queue });
        debug!(subscriber = id, %peer, "subscriber joined");
        (id, rx)
    }

    /// Record the identity subscriber `id` announced.
    pub fn announce(&self, id: u64, identity: &str) {
        let info = {
            let mut subscribers = lock(&self.subscribers);
            let Some(subscriber) = subscribers.get_mut(&id) else {
                return;
            };
            subscriber.info.identity = Some(identity.to_string());
            subscriber.info.clone()
        };
        debug!(subscriber = id, %identity, "subscriber announced");
        if let Some(hook) = self.presence() {
            hook.on_connect(&info);
        }
    }

    /// Drop subscriber `id`. Returns whether it was still registered.
    pub fn remove(&self, id: u64) -> bool {
        let Some(subscriber) = lock(&self.subscribers).remove(&id) else {
            return false;
        };
        debug!(subscriber = id, peer = %subscriber.info.peer, "subscriber left");
        if subscriber.info.identity.is_some() {
            if let Some(hook) = self.presence() {
                hook.on_disconnect(&subscriber.info);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut infos: Vec<_> = lock(&self.subscribers)
            .values()
            .map(|subscriber| subscriber.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Encode `body` once and queue it for every eligible subscriber.
    ///
    /// With `topics` and filtering enabled, only subscribers accepted by the
    /// filter are eligible; otherwise every subscriber is.
    pub fn publish(&self, body: &Message, topics: Option<&[String]>) -> Result<PublishReport> {
        let wire = fleetwire_frame::encode(body, None)?;
        let size = wire.len() - HEADER_SIZE;
        if size > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload,
            }
            .into());
        }

        let snapshot: Vec<(SubscriberInfo, mpsc::Sender<Bytes>)> = lock(&self.subscribers)
            .values()
            .map(|subscriber| (subscriber.info.clone(), subscriber.queue.clone()))
            .collect();
        let filter = match topics {
            Some(topics) if self.filtering => Some((
                self.filter.read().unwrap_or_else(PoisonError::into_inner).clone(),
                topics,
            )),
            _ => None,
        };

        let mut report = PublishReport::default();
        for (info, queue) in snapshot {
            if let Some((filter, topics)) = &filter {
                if !filter.accepts(&info, topics) {
                    report.filtered += 1;
                    continue;
                }
            }
            match queue.try_send(wire.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(
                        subscriber = info.id,
                        peer = %info.peer,
                        hwm = self.hwm,
                        "subscriber queue full; dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    if self.remove(info.id) {
                        report.removed += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
