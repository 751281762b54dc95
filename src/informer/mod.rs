//! Object Caches
//!
//! Watch-backed local mirrors of claims, volumes and storage classes. The
//! reconciler only ever reads these; the informer task is the only writer.

use crate::domain::objects::{object_key, split_key};
use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-mostly mirror of one kind of object
pub struct ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Mutex<Writer<K>>,
    store: Store<K>,
    /// Set once the first full listing has been applied
    synced: AtomicBool,
    synced_notify: Notify,
}

impl<K> Default for ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let writer = Writer::<K>::default();
        let store = writer.as_reader();
        Self {
            writer: Mutex::new(writer),
            store,
            synced: AtomicBool::new(false),
            synced_notify: Notify::new(),
        }
    }
}

impl<K> ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look an object up by its `namespace/name` (or `name`) key
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        let (namespace, name) = split_key(key);
        let mut object_ref = ObjectRef::<K>::new(name);
        if let Some(ns) = namespace {
            object_ref = object_ref.within(ns);
        }
        self.store.get(&object_ref)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Fold a watch event into the cache
    pub fn apply(&self, event: &watcher::Event<K>) {
        self.writer.lock().apply_watcher_event(event);
        if matches!(event, watcher::Event::Restarted(_)) && !self.synced.swap(true, Ordering::SeqCst) {
            self.synced_notify.notify_waiters();
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Wait for the first full listing
    pub async fn wait_synced(&self) {
        loop {
            let notified = self.synced_notify.notified();
            if self.has_synced() {
                return;
            }
            notified.await;
        }
    }

    /// Insert or replace one object
    pub fn upsert(&self, object: K) {
        self.apply(&watcher::Event::Applied(object));
    }

    pub fn remove(&self, object: K) {
        self.apply(&watcher::Event::Deleted(object));
    }
}

/// Queue key of a cached object
pub fn cache_key<K: Resource>(object: &K) -> String {
    object_key(object.meta().namespace.as_deref(), &object.name_any())
}

/// What happened to an object, as seen by event handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Deleted,
}

/// Keep `cache` in sync with the API server and report every change to
/// `handler` until `stop` fires. Every `resync_period` all cached objects are
/// reported again as upserted.
pub async fn run_informer<K, F>(
    api: Api<K>,
    cache: Arc<ObjectCache<K>>,
    resync_period: Duration,
    handler: F,
    stop: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K, ChangeKind) + Send + Sync,
{
    let kind = K::kind(&());
    info!(%kind, "Starting informer");

    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut resync = tokio::time::interval(resync_period);
    // The first tick fires immediately; the initial list covers it
    resync.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = resync.tick() => {
                let objects = cache.list();
                debug!(%kind, count = objects.len(), "Resyncing");
                for object in objects {
                    handler(&object, ChangeKind::Upserted);
                }
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    cache.apply(&event);
                    match &event {
                        watcher::Event::Applied(object) => handler(object, ChangeKind::Upserted),
                        watcher::Event::Deleted(object) => handler(object, ChangeKind::Deleted),
                        watcher::Event::Restarted(objects) => {
                            for object in objects {
                                handler(object, ChangeKind::Upserted);
                            }
                        }
                    }
                }
                Some(Err(e)) => warn!(%kind, error = %e, "Watch error"),
                None => {
                    warn!(%kind, "Watch stream ended");
                    break;
                }
            }
        }
    }

    info!(%kind, "Informer stopped");
}
