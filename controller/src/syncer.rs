//! Syncer computes observed and desired state for a remote object and writes
//! changes, under one of two interchangeable strategies.

use std::{collections::HashMap, sync::Arc};

use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{pinned_kind, Scope},
    Client,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, trace};

use crate::{field_manager, manifest, openapi::ParserManager, Error, Result, LAST_APPLIED_ANNOTATION};
use api::v1alpha1;

/// Strategy selects how drift is computed and applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Drift against the last-applied-configuration annotation.
    LastApplied,
    /// Drift against the field-manager-owned subtree under server-side apply.
    ServerSideApply,
}

/// SyncContext bundles what the syncer needs to know about one Object.
pub struct SyncContext<'a> {
    /// Object is the managed Object being reconciled.
    pub object: &'a v1alpha1::Object,
    /// Parsed is its validated embedded manifest.
    pub parsed: &'a manifest::Parsed,
    /// Api addresses the manifest's GVK on the remote cluster.
    pub api: Api<DynamicObject>,
    /// Client talks to the remote cluster, for discovery fetches.
    pub client: Client,
    /// Pc_uid is the UID of the ProviderConfig in use.
    pub pc_uid: String,
    /// Sanitize redacts Secret data in anything mirrored to status.
    pub sanitize: bool,
}

impl SyncContext<'_> {
    fn manager(&self) -> String {
        use kube::ResourceExt;
        field_manager(&self.object.name_any())
    }
}

/// Remote_api builds the dynamic Api for a GVK on a remote cluster, pinning
/// plural and scope via discovery.
pub async fn remote_api(
    client: &Client,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
) -> Result<Api<DynamicObject>> {
    let (ar, caps) = pinned_kind(client, gvk).await.map_err(Error::RemoteApi)?;
    Ok(match (caps.scope, namespace) {
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
        (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), &ar),
        (Scope::Cluster, _) => Api::all_with(client.clone(), &ar),
    })
}

/// Manifest_hash fingerprints manifest bytes for the desired-state cache.
fn manifest_hash(manifest: &Value) -> Result<String> {
    let buf = serde_json::to_vec(manifest)?;
    Ok(hex::encode(Sha256::digest(&buf)))
}

/// Sanitize_secret replaces a Secret's data with a redaction marker.
pub fn sanitize_secret(manifest: &mut Value, gvk: &GroupVersionKind) {
    if gvk.group.is_empty() && gvk.version == "v1" && gvk.kind == "Secret" {
        if let Some(m) = manifest.as_object_mut() {
            if m.contains_key("data") {
                m.insert("data".into(), serde_json::json!({"redacted": null}));
            }
        }
    }
}

#[derive(Default)]
struct CacheEntry {
    hash: String,
    desired: Option<Value>,
}

/// DesiredCache memoizes per-Object desired state keyed by manifest hash, so
/// an unchanged manifest skips the dry-run round trip.
#[derive(Default)]
pub struct DesiredCache {
    entries: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<CacheEntry>>>>,
}

impl DesiredCache {
    fn entry(&self, uid: &str) -> Arc<tokio::sync::Mutex<CacheEntry>> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .entry(uid.to_string())
            .or_default()
            .clone()
    }

    /// Invalidate drops the entry for an Object, e.g. on deletion.
    pub fn invalidate(&self, uid: &str) {
        self.entries.lock().expect("lock poisoned").remove(uid);
    }

    async fn get_or_compute<F>(&self, uid: &str, hash: &str, compute: F) -> Result<Value>
    where
        F: std::future::Future<Output = Result<Value>>,
    {
        let entry = self.entry(uid);
        let mut entry = entry.lock().await;
        if entry.hash == hash {
            if let Some(v) = &entry.desired {
                trace!("desired-state cache hit");
                return Ok(v.clone());
            }
        }
        match compute.await {
            Ok(v) => {
                entry.hash = hash.to_string();
                entry.desired = Some(v.clone());
                Ok(v)
            }
            Err(err) => {
                entry.hash.clear();
                entry.desired = None;
                Err(err)
            }
        }
    }
}

/// Syncer is the construction-time choice of sync strategy, with the caches
/// both strategies share.
pub struct Syncer {
    strategy: Strategy,
    parsers: ParserManager,
    cache: DesiredCache,
}

impl Syncer {
    /// New builds a syncer for the chosen strategy.
    pub fn new(strategy: Strategy) -> Syncer {
        Syncer {
            strategy,
            parsers: ParserManager::default(),
            cache: DesiredCache::default(),
        }
    }

    /// Strategy reports the construction-time choice.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Invalidate drops cached desired state for an Object.
    pub fn invalidate(&self, uid: &str) {
        self.cache.invalidate(uid);
    }

    /// Drop_parsers discards the OpenAPI parser cache of a deleted
    /// ProviderConfig.
    pub fn drop_parsers(&self, pc_uid: &str) {
        self.parsers.remove(pc_uid);
    }

    /// Observed returns the observed state of the current remote object, or
    /// None when this provider has not written it yet.
    #[instrument(skip_all)]
    pub async fn observed(
        &self,
        cx: &SyncContext<'_>,
        current: &DynamicObject,
    ) -> Result<Option<Value>> {
        match self.strategy {
            Strategy::LastApplied => {
                use kube::ResourceExt;
                let raw = match current.annotations().get(LAST_APPLIED_ANNOTATION) {
                    Some(raw) => raw,
                    None => return Ok(None),
                };
                let v: Value = serde_json::from_str(raw).map_err(|err| {
                    Error::Manifest(format!("bad last-applied annotation: {err}"))
                })?;
                Ok(Some(v))
            }
            Strategy::ServerSideApply => {
                self.require_schema(cx).await?;
                let v = serde_json::to_value(current)?;
                crate::managed_fields::extract(&v, &cx.manager())
            }
        }
    }

    /// Desired returns the desired state for drift comparison.
    ///
    /// Under SSA this is a dry-run apply followed by extraction, which folds
    /// in server-side defaulting; the result is cached per manifest hash.
    #[instrument(skip_all)]
    pub async fn desired(&self, cx: &SyncContext<'_>) -> Result<Value> {
        use kube::ResourceExt;
        let uid = cx.object.uid().unwrap_or_default();
        let hash = manifest_hash(&cx.parsed.manifest)?;
        match self.strategy {
            Strategy::LastApplied => {
                self.cache
                    .get_or_compute(&uid, &hash, async { Ok(cx.parsed.manifest.clone()) })
                    .await
            }
            Strategy::ServerSideApply => {
                self.cache
                    .get_or_compute(&uid, &hash, async {
                        self.require_schema(cx).await?;
                        let mut pp = PatchParams::apply(&cx.manager()).force();
                        pp.dry_run = true;
                        debug!("dry-run apply for desired state");
                        let applied = cx
                            .api
                            .patch(cx.parsed.name(), &pp, &Patch::Apply(&cx.parsed.manifest))
                            .await
                            .map_err(Error::RemoteApi)?;
                        let v = serde_json::to_value(&applied)?;
                        crate::managed_fields::extract(&v, &cx.manager())?.ok_or_else(|| {
                            Error::Manifest(
                                "dry-run apply produced no managed fields for this manager".into(),
                            )
                        })
                    })
                    .await
            }
        }
    }

    /// Sync writes the desired state to the remote cluster and returns the
    /// applied object.
    #[instrument(skip_all)]
    pub async fn sync(
        &self,
        cx: &SyncContext<'_>,
        current: Option<&DynamicObject>,
    ) -> Result<DynamicObject> {
        match self.strategy {
            Strategy::LastApplied => {
                let raw = serde_json::to_string(&cx.object.spec.for_provider.manifest.0)?;
                let mut desired = cx.parsed.manifest.clone();
                manifest::set_value(
                    &mut desired,
                    &format!("metadata.annotations['{LAST_APPLIED_ANNOTATION}']"),
                    Value::String(raw),
                )
                .map_err(Error::Manifest)?;
                match current {
                    None => {
                        let obj: DynamicObject = serde_json::from_value(desired)?;
                        let pp = PostParams {
                            field_manager: Some(crate::CONTROLLER_NAME.into()),
                            ..Default::default()
                        };
                        cx.api.create(&pp, &obj).await.map_err(Error::RemoteApi)
                    }
                    Some(_) => cx
                        .api
                        .patch(cx.parsed.name(), &PatchParams::default(), &Patch::Merge(&desired))
                        .await
                        .map_err(Error::RemoteApi),
                }
            }
            Strategy::ServerSideApply => {
                self.require_schema(cx).await?;
                let pp = PatchParams::apply(&cx.manager()).force();
                cx.api
                    .patch(cx.parsed.name(), &pp, &Patch::Apply(&cx.parsed.manifest))
                    .await
                    .map_err(Error::RemoteApi)
            }
        }
    }

    /// Up_to_date reports whether no drift exists between observed and
    /// desired.
    pub fn up_to_date(&self, observed: Option<&Value>, desired: &Value) -> bool {
        observed.is_some_and(|o| o == desired)
    }

    /// Require_schema resolves the GroupVersion parser and checks the target
    /// kind is declared by the remote cluster's schema.
    async fn require_schema(&self, cx: &SyncContext<'_>) -> Result<()> {
        let gv = kube::core::GroupVersion {
            group: cx.parsed.gvk.group.clone(),
            version: cx.parsed.gvk.version.clone(),
        };
        let parser = self
            .parsers
            .cache_for(&cx.pc_uid)
            .parser_for(&cx.client, &gv)
            .await?;
        if parser.type_for(&cx.parsed.gvk).is_none() {
            return Err(Error::Config(format!(
                "remote cluster declares no schema for {}/{}",
                gv.api_version(),
                cx.parsed.gvk.kind,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_replaces_secret_data() {
        let mut v = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "creds"},
            "data": {"password": "aHVudGVyMg=="},
        });
        sanitize_secret(&mut v, &GroupVersionKind::gvk("", "v1", "Secret"));
        assert_eq!(v.get("data").unwrap(), &json!({"redacted": null}));
    }

    #[test]
    fn sanitize_leaves_other_kinds() {
        let mut v = json!({"kind": "ConfigMap", "data": {"k": "v"}});
        let orig = v.clone();
        sanitize_secret(&mut v, &GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(v, orig);
    }

    #[test]
    fn manifest_hash_is_stable() {
        let a = json!({"kind": "ConfigMap", "data": {"k": "v"}});
        assert_eq!(manifest_hash(&a).unwrap(), manifest_hash(&a.clone()).unwrap());
        let b = json!({"kind": "ConfigMap", "data": {"k": "w"}});
        assert_ne!(manifest_hash(&a).unwrap(), manifest_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn desired_cache_hits_and_invalidates() {
        let cache = DesiredCache::default();
        let v = cache
            .get_or_compute("u1", "h1", async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(v, json!(1));
        // Same hash: the closure must not run.
        let v = cache
            .get_or_compute("u1", "h1", async {
                Err(Error::Manifest("must not recompute".into()))
            })
            .await
            .unwrap();
        assert_eq!(v, json!(1));
        // Changed hash: recompute.
        let v = cache
            .get_or_compute("u1", "h2", async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(v, json!(2));
        // An error clears the entry.
        assert!(cache
            .get_or_compute("u1", "h2", async { Err(Error::Manifest("boom".into())) })
            .await
            .is_err());
        let v = cache
            .get_or_compute("u1", "h2", async { Ok(json!(3)) })
            .await
            .unwrap();
        assert_eq!(v, json!(3));
        cache.invalidate("u1");
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn up_to_date_is_semantic_equality() {
        let s = Syncer::new(Strategy::LastApplied);
        let desired = json!({"a": 1, "b": {"c": 2}});
        assert!(s.up_to_date(Some(&json!({"b": {"c": 2}, "a": 1})), &desired));
        assert!(!s.up_to_date(Some(&json!({"a": 1})), &desired));
        assert!(!s.up_to_date(None, &desired));
    }
}
