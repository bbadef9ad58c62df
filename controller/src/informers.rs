//! Informers maintains an on-demand, garbage-collected pool of watches on
//! remote clusters, keyed by `(providerConfigName, GVK)`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::pinned_kind,
    runtime::{reflector::Store, watcher},
    Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::index::{self, WatchKey};
use crate::{Error, Result};
use api::v1alpha1::Object;

/// GC_PERIOD is the cadence of the garbage-collection sweep.
pub const GC_PERIOD: tokio::time::Duration = tokio::time::Duration::from_secs(60);

/// RemoteEvent is the generic event dispatched for any change seen by an
/// informer.
#[derive(Clone, Debug)]
pub struct RemoteEvent {
    /// Provider_config names the config whose cluster produced the event.
    pub provider_config: String,
    /// Gvk is the watched GroupVersionKind.
    pub gvk: GroupVersionKind,
    /// Namespace of the changed object, for namespaced kinds.
    pub namespace: Option<String>,
    /// Name of the changed object.
    pub name: String,
}

/// Sink receives every dispatched RemoteEvent.
pub type Sink = dyn Fn(RemoteEvent) + Send + Sync;

struct WatchEntry {
    cancel: CancellationToken,
}

impl Drop for WatchEntry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Inner {
    watches: HashMap<WatchKey, WatchEntry>,
    sink: Option<Arc<Sink>>,
}

/// InformerManager owns one informer per `(providerConfigName, GVK)` key.
///
/// The map and the sink are guarded by a read-write lock: lookups and
/// dispatch take the read lock, insertion and cancellation the write lock.
/// Long operations (discovery, watch setup) happen outside the critical
/// section.
#[derive(Default)]
pub struct InformerManager {
    inner: RwLock<Inner>,
    store: std::sync::OnceLock<Store<Object>>,
}

impl InformerManager {
    /// Start registers the single dispatch sink.
    ///
    /// May be called at most once per lifetime of the manager.
    pub fn start(&self, sink: Box<Sink>) -> Result<()> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if inner.sink.is_some() {
            return Err(Error::Config("informer manager already started".into()));
        }
        inner.sink = Some(sink.into());
        Ok(())
    }

    /// Bind_store attaches the local Object cache the live set is computed
    /// from. Later binds are ignored.
    pub fn bind_store(&self, store: Store<Object>) {
        let _ = self.store.set(store);
    }

    /// Live is the set of keys some live, watching Object still needs.
    fn live(&self) -> HashSet<WatchKey> {
        self.store.get().map(index::live_keys).unwrap_or_default()
    }

    /// Active_keys snapshots the keys with a running informer.
    pub fn active_keys(&self) -> HashSet<WatchKey> {
        self.inner
            .read()
            .expect("lock poisoned")
            .watches
            .keys()
            .cloned()
            .collect()
    }

    /// Watch_resources idempotently starts an informer per GVK against the
    /// remote cluster `client` addresses.
    #[instrument(skip(self, client, gvks))]
    pub async fn watch_resources(
        self: &Arc<Self>,
        client: &Client,
        provider_config: &str,
        gvks: &[GroupVersionKind],
    ) -> Result<()> {
        for gvk in gvks {
            let key: WatchKey = (provider_config.to_string(), gvk.clone());
            if self
                .inner
                .read()
                .expect("lock poisoned")
                .watches
                .contains_key(&key)
            {
                continue;
            }

            // Discovery happens before the lock is taken; a slow fetch must
            // not block other watches. Watches span all namespaces.
            let (ar, _caps) = pinned_kind(client, gvk).await.map_err(Error::RemoteApi)?;
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);

            let cancel = CancellationToken::new();
            {
                let mut inner = self.inner.write().expect("lock poisoned");
                if inner.watches.contains_key(&key) {
                    continue;
                }
                inner.watches.insert(
                    key.clone(),
                    WatchEntry {
                        cancel: cancel.clone(),
                    },
                );
            }
            info!(gvk = ?gvk, provider_config, "starting informer");
            let mgr = self.clone();
            tokio::spawn(run_informer(mgr, api, key, cancel));
        }
        Ok(())
    }

    /// Stop_watching cancels the informers for the given GVKs, unless some
    /// non-terminating Object still needs the key.
    pub fn stop_watching(&self, provider_config: &str, gvks: &[GroupVersionKind]) {
        self.stop_watching_with(provider_config, gvks, &self.live());
    }

    pub(crate) fn stop_watching_with(
        &self,
        provider_config: &str,
        gvks: &[GroupVersionKind],
        live: &HashSet<WatchKey>,
    ) {
        let mut inner = self.inner.write().expect("lock poisoned");
        for gvk in gvks {
            let key = (provider_config.to_string(), gvk.clone());
            if live.contains(&key) {
                continue;
            }
            if inner.watches.remove(&key).is_some() {
                debug!(gvk = ?gvk, provider_config, "stopped informer");
            }
        }
    }

    /// Garbage_collect cancels every informer whose key is absent from the
    /// live set.
    pub fn garbage_collect(&self) {
        self.garbage_collect_with(&self.live());
    }

    pub(crate) fn garbage_collect_with(&self, live: &HashSet<WatchKey>) {
        let mut inner = self.inner.write().expect("lock poisoned");
        let before = inner.watches.len();
        inner.watches.retain(|key, _| live.contains(key));
        let after = inner.watches.len();
        if after < before {
            debug!(collected = before - after, "informer garbage collection");
        }
    }

    /// Spawn_gc runs the periodic sweep until cancelled, computing the live
    /// set from the local Object cache.
    pub fn spawn_gc(self: &Arc<Self>, store: Store<Object>, cancel: CancellationToken) {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        mgr.garbage_collect_with(&index::live_keys(&store));
                    }
                }
            }
            trace!("informer gc finished");
        });
    }

    fn dispatch(&self, ev: RemoteEvent) {
        // The sink is called under the read lock, as stated in the manager's
        // contract; sinks must not call back into the manager.
        let inner = self.inner.read().expect("lock poisoned");
        if let Some(sink) = &inner.sink {
            sink(ev);
        }
    }
}

/// Run_informer pumps one watcher stream into the dispatch sink until
/// cancelled.
///
/// The initial list is replayed as events; readiness of the underlying cache
/// is not awaited, events simply begin flowing once the list completes.
async fn run_informer(
    mgr: Arc<InformerManager>,
    api: Api<DynamicObject>,
    key: WatchKey,
    cancel: CancellationToken,
) {
    let (provider_config, gvk) = key;
    let mut versions: HashMap<String, String> = HashMap::new();
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.try_next() => ev,
        };
        let ev = match ev {
            Ok(Some(ev)) => ev,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, ?gvk, "informer watch error");
                continue;
            }
        };
        let (obj, deleted) = match ev {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => (obj, false),
            watcher::Event::Delete(obj) => (obj, true),
            watcher::Event::Init | watcher::Event::InitDone => continue,
        };
        let id = format!(
            "{}/{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        );
        let rv = obj.resource_version().unwrap_or_default();
        if deleted {
            versions.remove(&id);
        } else {
            // Relists echo objects whose resourceVersion has not moved;
            // those are not changes.
            if versions.get(&id) == Some(&rv) {
                continue;
            }
            versions.insert(id, rv);
        }
        mgr.dispatch(RemoteEvent {
            provider_config: provider_config.clone(),
            gvk: gvk.clone(),
            namespace: obj.namespace(),
            name: obj.name_any(),
        });
    }
    trace!(?gvk, provider_config, "informer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pc: &str, kind: &str) -> WatchKey {
        (pc.to_string(), GroupVersionKind::gvk("", "v1", kind))
    }

    #[test]
    fn start_registers_exactly_once() {
        let mgr = InformerManager::default();
        assert!(mgr.start(Box::new(|_| {})).is_ok());
        assert!(mgr.start(Box::new(|_| {})).is_err());
    }

    #[test]
    fn gc_cancels_dead_keys() {
        let mgr = InformerManager::default();
        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        {
            let mut inner = mgr.inner.write().unwrap();
            inner
                .watches
                .insert(key("a", "ConfigMap"), WatchEntry { cancel: t1.clone() });
            inner
                .watches
                .insert(key("a", "Secret"), WatchEntry { cancel: t2.clone() });
        }
        let live = HashSet::from([key("a", "ConfigMap")]);
        mgr.garbage_collect_with(&live);
        assert!(!t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert_eq!(mgr.active_keys(), live);
    }

    #[test]
    fn stop_watching_respects_live_set() {
        let mgr = InformerManager::default();
        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        {
            let mut inner = mgr.inner.write().unwrap();
            inner
                .watches
                .insert(key("a", "ConfigMap"), WatchEntry { cancel: t1.clone() });
            inner
                .watches
                .insert(key("a", "Secret"), WatchEntry { cancel: t2.clone() });
        }
        let live = HashSet::from([key("a", "ConfigMap")]);
        let gvks = [
            GroupVersionKind::gvk("", "v1", "ConfigMap"),
            GroupVersionKind::gvk("", "v1", "Secret"),
        ];
        mgr.stop_watching_with("a", &gvks, &live);
        // Another live Object still needs the ConfigMap informer.
        assert!(!t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn dispatch_reaches_the_sink() {
        let mgr = InformerManager::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        mgr.start(Box::new(move |ev| {
            sink_seen.lock().unwrap().push(ev.name);
        }))
        .unwrap();
        mgr.dispatch(RemoteEvent {
            provider_config: "a".into(),
            gvk: GroupVersionKind::gvk("", "v1", "ConfigMap"),
            namespace: None,
            name: "foo".into(),
        });
        assert_eq!(seen.lock().unwrap().as_slice(), ["foo"]);
    }
}
