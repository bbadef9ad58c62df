//! References resolves an Object's declared references and maintains the
//! per-UID reference finalizers on their targets.

use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{pinned_kind, Scope},
    Client, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{debug, instrument, trace};

use crate::{index, manifest, not_found, Error, Result, REF_FINALIZER_PREFIX};
use api::v1alpha1::{self, ReferenceTarget};

/// Reference_finalizer is the finalizer a source Object with the given UID
/// places on each of its targets.
pub fn reference_finalizer(uid: &str) -> String {
    format!("{REF_FINALIZER_PREFIX}{uid}")
}

/// Apply_patch copies the value at `path` in `target` to the same path in
/// `source`.
fn apply_patch(source: &mut Value, target: &Value, path: &str) -> Result<()> {
    let v = manifest::get_value(target, path)
        .map_err(Error::Reference)?
        .ok_or_else(|| Error::Reference(format!("field path {path:?} not set on target")))?
        .clone();
    manifest::set_value(source, path, v).map_err(Error::Reference)
}

/// Target_api builds the local-cluster Api for one reference target.
async fn target_api(
    local: &Client,
    t: &ReferenceTarget<'_>,
) -> Result<Api<DynamicObject>> {
    let gvk = target_gvk(t)?;
    if gvk == index::object_gvk() {
        let ar = ApiResource::from_gvk_with_plural(&gvk, "objects");
        return Ok(Api::all_with(local.clone(), &ar));
    }
    let (ar, caps) = pinned_kind(local, &gvk).await?;
    Ok(match (caps.scope, t.namespace) {
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(local.clone(), ns, &ar),
        (Scope::Namespaced, None) => Api::default_namespaced_with(local.clone(), &ar),
        (Scope::Cluster, _) => Api::all_with(local.clone(), &ar),
    })
}

fn target_gvk(t: &ReferenceTarget<'_>) -> Result<GroupVersionKind> {
    use std::str::FromStr;
    let fallback = index::object_gvk();
    let gv = match t.api_version {
        Some(v) if !v.is_empty() => kube::core::GroupVersion::from_str(v)
            .map_err(|err| Error::Reference(format!("bad reference apiVersion {v:?}: {err}")))?,
        _ => kube::core::GroupVersion {
            group: fallback.group,
            version: fallback.version,
        },
    };
    Ok(gv.with_kind(t.kind.filter(|k| !k.is_empty()).unwrap_or("Object")))
}

/// Resolve fetches every reference target and returns the Object with all
/// `patchesFrom` values folded in.
#[instrument(skip_all, fields(name = obj.name_any()))]
pub async fn resolve(local: &Client, obj: &v1alpha1::Object) -> Result<v1alpha1::Object> {
    if obj.spec.references.is_empty() {
        return Ok(obj.clone());
    }
    let mut tree = serde_json::to_value(obj)?;
    for r in &obj.spec.references {
        let t = r
            .target()
            .ok_or_else(|| Error::Reference("reference names no target".into()))?;
        let api = target_api(local, &t).await?;
        let target = api.get(t.name).await.map_err(|err| {
            if not_found(&err) {
                Error::Reference(format!("reference target {:?} not found", t.name))
            } else {
                Error::Kube(err)
            }
        })?;
        if let Some(path) = t.field_path {
            trace!(referent = t.name, path, "patching from reference");
            let tv = serde_json::to_value(&target)?;
            apply_patch(&mut tree, &tv, path)?;
        }
    }
    Ok(serde_json::from_value(tree)?)
}

/// Ensure_target_finalizers places this Object's per-UID reference finalizer
/// on every target that does not already carry it.
#[instrument(skip_all, fields(name = obj.name_any()))]
pub async fn ensure_target_finalizers(local: &Client, obj: &v1alpha1::Object) -> Result<()> {
    if obj.spec.references.is_empty() {
        return Ok(());
    }
    let uid = obj
        .uid()
        .ok_or_else(|| Error::Reference("source object has no uid".into()))?;
    let fin = reference_finalizer(&uid);
    for r in &obj.spec.references {
        let t = r
            .target()
            .ok_or_else(|| Error::Reference("reference names no target".into()))?;
        let api = target_api(local, &t).await?;
        let target = api.get(t.name).await.map_err(|err| {
            if not_found(&err) {
                Error::Reference(format!("reference target {:?} not found", t.name))
            } else {
                Error::Kube(err)
            }
        })?;
        if target.finalizers().contains(&fin) {
            continue;
        }
        debug!(referent = t.name, finalizer = fin, "adding reference finalizer");
        let mut finalizers = target.finalizers().to_vec();
        finalizers.push(fin.clone());
        api.patch(
            t.name,
            &PatchParams::default(),
            &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
    }
    Ok(())
}

/// Remove_target_finalizers drops this Object's per-UID reference finalizer
/// from every target; targets that are already gone are ignored.
#[instrument(skip_all, fields(name = obj.name_any()))]
pub async fn remove_target_finalizers(local: &Client, obj: &v1alpha1::Object) -> Result<()> {
    let uid = match obj.uid() {
        Some(uid) => uid,
        None => return Ok(()),
    };
    let fin = reference_finalizer(&uid);
    for r in &obj.spec.references {
        let t = match r.target() {
            Some(t) => t,
            None => continue,
        };
        let api = target_api(local, &t).await?;
        let target = match api.get(t.name).await {
            Ok(target) => target,
            Err(err) if not_found(&err) => continue,
            Err(err) => return Err(Error::Kube(err)),
        };
        if !target.finalizers().contains(&fin) {
            continue;
        }
        debug!(referent = t.name, finalizer = fin, "removing reference finalizer");
        let finalizers: Vec<_> = target
            .finalizers()
            .iter()
            .filter(|f| *f != &fin)
            .cloned()
            .collect();
        match api
            .patch(
                t.name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if not_found(&err) => {}
            Err(err) => return Err(Error::Kube(err)),
        }
    }
    Ok(())
}
