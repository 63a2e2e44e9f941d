//! Watch-backed caches and change subscriptions
//!
//! An `Informer` keeps a reflector store of one resource collection fresh and
//! fans every change out to its subscribers. Controllers only need a wake-up,
//! so events carry identity, never the object.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What changed in a watched collection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Applied {
        kind: String,
        namespace: Option<String>,
        name: String,
    },
    Deleted {
        kind: String,
        namespace: Option<String>,
        name: String,
    },
    /// A full relist finished
    Resynced { kind: String },
}

pub type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type HandlerMap = Mutex<BTreeMap<u64, Handler>>;

/// Registry of change handlers
#[derive(Clone, Default)]
pub struct Subscribers {
    handlers: Arc<HandlerMap>,
    next_id: Arc<AtomicU64>,
}

impl Subscribers {
    pub fn subscribe(&self, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, handler);
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Call every handler; the lock is not held while handlers run
    pub fn notify(&self, event: &ChangeEvent) {
        let handlers: Vec<Handler> = self.lock().values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unsubscribes when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerMap>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

/// Source of change notifications
pub trait Notifier: Send + Sync {
    fn subscribe(&self, handler: Handler) -> Subscription;

    /// The initial list has been delivered
    fn has_synced(&self) -> bool;
}

/// Cached reads with bounded staleness
pub trait Lister<K>: Notifier {
    fn get(&self, name: &str) -> Option<Arc<K>>;

    fn list(&self) -> Vec<Arc<K>>;
}

/// Reflector-backed cache of one collection, optionally namespace-scoped
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    store: Store<K>,
    namespace: Option<String>,
    subscribers: Subscribers,
    synced: Arc<AtomicBool>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Start watching `api` until `token` is cancelled
    pub fn spawn(
        api: Api<K>,
        config: watcher::Config,
        namespace: Option<String>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (store, mut writer) = reflector::store();
        let informer = Arc::new(Self {
            store,
            namespace,
            subscribers: Subscribers::default(),
            synced: Arc::new(AtomicBool::new(false)),
        });

        let subscribers = informer.subscribers.clone();
        let synced = informer.synced.clone();
        let kind = K::kind(&()).to_string();

        tokio::spawn(async move {
            let mut events = pin!(watcher(api, config).default_backoff());
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(event)) => {
                        writer.apply_watcher_event(&event);
                        let change = match &event {
                            watcher::Event::Apply(obj) => Some(ChangeEvent::Applied {
                                kind: kind.clone(),
                                namespace: obj.namespace(),
                                name: obj.name_any(),
                            }),
                            watcher::Event::Delete(obj) => Some(ChangeEvent::Deleted {
                                kind: kind.clone(),
                                namespace: obj.namespace(),
                                name: obj.name_any(),
                            }),
                            watcher::Event::InitDone => {
                                synced.store(true, Ordering::Release);
                                Some(ChangeEvent::Resynced { kind: kind.clone() })
                            }
                            watcher::Event::Init | watcher::Event::InitApply(_) => None,
                        };
                        if let Some(change) = change {
                            debug!(?change, "cache changed");
                            subscribers.notify(&change);
                        }
                    }
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "watch failed, backing off"),
                    None => break,
                }
            }
            debug!(kind = %kind, "informer stopped");
        });

        informer
    }
}

impl<K> Notifier for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, handler: Handler) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

impl<K> Lister<K> for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, name: &str) -> Option<Arc<K>> {
        let key = match &self.namespace {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };
        self.store.get(&key)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }
}

/// View a lister as a plain notifier
pub fn as_notifier<K: 'static>(lister: &Arc<dyn Lister<K>>) -> Arc<dyn Notifier> {
    Arc::new(ListerNotifier(lister.clone()))
}

struct ListerNotifier<K: 'static>(Arc<dyn Lister<K>>);

impl<K: 'static> Notifier for ListerNotifier<K> {
    fn subscribe(&self, handler: Handler) -> Subscription {
        self.0.subscribe(handler)
    }

    fn has_synced(&self) -> bool {
        self.0.has_synced()
    }
}
