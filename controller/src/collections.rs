//! Collections holds the controller for the "ObservedObjectCollection" CRD:
//! a selector-driven materializer of observe-only Objects.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::controller::Error as CtrlErr;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Duration;

use crate::{
    clients, conflict, metrics, prelude::*, syncer, COLLECTION_LABEL,
};
use api::v1alpha1::{
    ManagementPolicies, ManagementPolicy, Object, ObjectParameters, ObjectSpec,
    ObservedObjectCollection, ObservedObjectCollectionStatus,
};

static CONTROLLER: &str = "collections";

/// Controller is the ObservedObjectCollection controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<ObservedObjectCollection> = Api::all(client.clone());

    let ctl = Controller::new(root, ctlcfg.clone())
        .owns(Api::<Object>::all(client), ctlcfg)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!("starting collection controller");
        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                        _ => error!("controller error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("collection controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<ObservedObjectCollection>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::reconcile_failure(CONTROLLER);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, coll), fields(name = coll.name_any()))]
async fn reconcile(coll: Arc<ObservedObjectCollection>, ctx: Arc<Context>) -> Result<Action> {
    metrics::reconcile_run(CONTROLLER);
    let mut status = coll.status.clone().unwrap_or_default();

    match materialize(&coll, &ctx, &mut status).await {
        Ok(()) => {
            status.add_condition(Condition {
                type_: "Synced".into(),
                status: "True".into(),
                reason: "ReconcileSuccess".into(),
                message: "".into(),
                observed_generation: coll.metadata.generation,
                last_transition_time: now(),
            });
            patch_status(&ctx, &coll, status).await?;
            Ok(Action::requeue(ctx.options.poll_with_jitter()))
        }
        Err(err) => {
            status.add_condition(Condition {
                type_: "Synced".into(),
                status: "False".into(),
                reason: "ReconcileError".into(),
                message: err.to_string(),
                observed_generation: coll.metadata.generation,
                last_transition_time: now(),
            });
            patch_status(&ctx, &coll, status).await?;
            Err(err)
        }
    }
}

#[instrument(skip_all)]
async fn materialize(
    coll: &ObservedObjectCollection,
    ctx: &Context,
    status: &mut ObservedObjectCollectionStatus,
) -> Result<()> {
    let criteria = &coll.spec.observe_objects;
    let selector = selector_string(&criteria.selector)?;

    let remote =
        clients::remote_cluster(&ctx.client, &coll.spec.provider_config_ref.name, &ctx.identity)
            .await?;
    let gvk = {
        use std::str::FromStr;
        let gv = kube::core::GroupVersion::from_str(&criteria.api_version).map_err(|err| {
            Error::Config(format!("bad apiVersion {:?}: {err}", criteria.api_version))
        })?;
        gv.with_kind(&criteria.kind)
    };
    let remote_api =
        syncer::remote_api(&remote.client, &gvk, criteria.namespace.as_deref()).await?;
    debug!(selector, kind = criteria.kind, "listing remote objects");
    let matched = remote_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::RemoteApi)?;

    let membership = format!("{}={}", COLLECTION_LABEL.as_str(), coll.name_any());
    let local: Api<Object> = Api::all(ctx.client.clone());
    let children = local.list(&ListParams::default().labels(&membership)).await?;

    let mut kept = HashSet::new();
    for item in &matched.items {
        let child = child_for(coll, &gvk, item.namespace().as_deref(), &item.name_any());
        kept.insert(child.name_any());
        trace!(child = child.name_any(), "applying collection child");
        local
            .patch(&child.name_any(), &PATCH_PARAMS, &Patch::Apply(&child))
            .await?;
    }

    for stale in children.items.iter().filter(|c| !kept.contains(&c.name_any())) {
        info!(child = stale.name_any(), "pruning collection child");
        match local.delete(&stale.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if crate::not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }

    status.membership_label = BTreeMap::from([(
        COLLECTION_LABEL.to_string(),
        coll.name_any(),
    )]);
    let mut members: Vec<_> = kept.into_iter().collect();
    members.sort();
    status.members = members;
    Ok(())
}

/// Child_name derives the deterministic name of one materialized child.
///
/// SHA-256 over `GVK/namespace/name`, truncated to 8 hex characters and
/// appended to the collection name. The shape is fixed; renaming it would
/// orphan every existing child on upgrade.
fn child_name(coll: &str, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> String {
    let key = format!(
        "{}/{}/{}/{}",
        gvk.api_version(),
        gvk.kind,
        namespace.unwrap_or_default(),
        name,
    );
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{coll}-{}", &digest[..8])
}

/// Child_for builds the observe-only Object stub for one matched remote
/// object.
fn child_for(
    coll: &ObservedObjectCollection,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> Object {
    let mut manifest = json!({
        "apiVersion": coll.spec.observe_objects.api_version,
        "kind": coll.spec.observe_objects.kind,
        "metadata": {"name": name},
    });
    if let Some(ns) = namespace {
        manifest["metadata"]["namespace"] = json!(ns);
    }

    let mut child = Object::new(
        &child_name(&coll.name_any(), gvk, namespace, name),
        ObjectSpec {
            provider_config_ref: coll.spec.provider_config_ref.clone(),
            for_provider: ObjectParameters {
                manifest: k8s_openapi::apimachinery::pkg::runtime::RawExtension(manifest),
            },
            management_policies: ManagementPolicies(vec![ManagementPolicy::Observe]),
            ..Default::default()
        },
    );

    let template = coll
        .spec
        .template
        .as_ref()
        .and_then(|t| t.metadata.as_ref());
    if let Some(meta) = template {
        child.labels_mut().extend(meta.labels.clone());
        child.annotations_mut().extend(meta.annotations.clone());
    }
    child
        .labels_mut()
        .insert(COLLECTION_LABEL.to_string(), coll.name_any());
    if let Some(oref) = coll.controller_owner_ref(&()) {
        child.meta_mut().owner_references = Some(vec![oref]);
    }
    child
}

/// Selector_string renders a LabelSelector for a list call.
fn selector_string(sel: &LabelSelector) -> Result<String> {
    let mut parts = Vec::new();
    for (k, v) in sel.match_labels.iter().flatten() {
        parts.push(format!("{k}={v}"));
    }
    for expr in sel.match_expressions.iter().flatten() {
        let values = || -> Result<String> {
            let vs = expr
                .values
                .as_ref()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "selector operator {:?} needs values",
                        expr.operator
                    ))
                })?;
            Ok(vs.join(","))
        };
        match expr.operator.as_str() {
            "In" => parts.push(format!("{} in ({})", expr.key, values()?)),
            "NotIn" => parts.push(format!("{} notin ({})", expr.key, values()?)),
            "Exists" => parts.push(expr.key.clone()),
            "DoesNotExist" => parts.push(format!("!{}", expr.key)),
            op => {
                return Err(Error::Config(format!(
                    "invalid selector operator {op:?}"
                )))
            }
        }
    }
    Ok(parts.join(","))
}

/// Patch_status publishes the collection's status; write conflicts are
/// swallowed so the queue simply retries.
async fn patch_status(
    ctx: &Context,
    coll: &ObservedObjectCollection,
    status: ObservedObjectCollectionStatus,
) -> Result<()> {
    let api: Api<ObservedObjectCollection> = Api::all(ctx.client.clone());
    let patch = Patch::Apply(json!({
        "apiVersion": ObservedObjectCollection::api_version(&()),
        "kind": ObservedObjectCollection::kind(&()),
        "status": status,
    }));
    match api
        .patch_status(&coll.name_any(), &PATCH_PARAMS, &patch)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if conflict(&err) => {
            debug!("status write conflict, requeueing silently");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::{
        ObservedObjectCollectionSpec, ObservedObjectTemplate, ObservedObjectTemplateMetadata,
        ObserveObjectCriteria, ProviderConfigReference,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn collection() -> ObservedObjectCollection {
        let mut c = ObservedObjectCollection::new(
            "coll",
            ObservedObjectCollectionSpec {
                observe_objects: ObserveObjectCriteria {
                    api_version: "v1".into(),
                    kind: "Foo".into(),
                    namespace: None,
                    selector: LabelSelector {
                        match_labels: Some([("foo".to_string(), "bar".to_string())].into()),
                        ..Default::default()
                    },
                },
                provider_config_ref: ProviderConfigReference {
                    name: "remote".into(),
                },
                template: Some(ObservedObjectTemplate {
                    metadata: Some(ObservedObjectTemplateMetadata {
                        labels: [("team".to_string(), "obs".to_string())].into(),
                        ..Default::default()
                    }),
                }),
            },
        );
        c.metadata.uid = Some("c-1".into());
        c
    }

    #[test]
    fn child_names_are_deterministic_and_distinct() {
        let gvk = GroupVersionKind::gvk("", "v1", "Foo");
        let a = child_name("coll", &gvk, None, "foo0");
        let b = child_name("coll", &gvk, None, "foo1");
        assert_eq!(a, child_name("coll", &gvk, None, "foo0"));
        assert_ne!(a, b);
        assert!(a.starts_with("coll-"));
        assert_eq!(a.len(), "coll-".len() + 8);
    }

    #[test]
    fn child_carries_membership_and_observe_policy() {
        let coll = collection();
        let gvk = GroupVersionKind::gvk("", "v1", "Foo");
        let child = child_for(&coll, &gvk, Some("ns"), "foo0");
        assert_eq!(
            child.labels().get(COLLECTION_LABEL.as_str()).unwrap(),
            "coll"
        );
        assert_eq!(child.labels().get("team").unwrap(), "obs");
        assert_eq!(
            child.spec.management_policies,
            ManagementPolicies(vec![ManagementPolicy::Observe])
        );
        assert_eq!(
            child.spec.for_provider.manifest.0.pointer("/metadata/namespace"),
            Some(&json!("ns"))
        );
        let owners = child.meta().owner_references.as_ref().unwrap();
        assert_eq!(owners[0].name, "coll");
    }

    #[test]
    fn selectors_render_all_operators() {
        let sel = LabelSelector {
            match_labels: Some([("foo".to_string(), "bar".to_string())].into()),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: "In".into(),
                    values: Some(vec!["prod".into(), "stage".into()]),
                },
                LabelSelectorRequirement {
                    key: "legacy".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };
        assert_eq!(
            selector_string(&sel).unwrap(),
            "foo=bar,env in (prod,stage),!legacy"
        );
    }

    #[test]
    fn invalid_selector_operator_is_config_error() {
        let sel = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "Near".into(),
                values: None,
            }]),
            ..Default::default()
        };
        let err = selector_string(&sel).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn in_operator_without_values_is_config_error() {
        let sel = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "In".into(),
                values: Some(vec![]),
            }]),
            ..Default::default()
        };
        assert!(selector_string(&sel).is_err());
    }
}
