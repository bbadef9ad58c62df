//! Objects holds the controller for the "Object" CRD: the managed-object
//! reconciliation engine.

use std::sync::Arc;

use kube::{
    runtime::{
        controller::{self, trigger_self, Action, Error as CtrlErr},
        finalizer::{finalizer, Event as Finalizer},
        reflector::{self, ObjectRef},
        watcher, WatchStreamExt,
    },
};
use serde_json::{json, Value};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    time::Duration,
};
use tokio_stream::wrappers::{ReceiverStream, SignalStream};

use crate::{
    clients, conflict, index, informers::RemoteEvent, manifest, metrics, not_found, prelude::*,
    references, syncer::{self, SyncContext}, PAUSED_ANNOTATION, OBJECT_FINALIZER,
    READY_FALSE_POLL,
};
use api::v1alpha1::{
    ConnectionDetail, ManagementPolicy, Object, ObjectObservation, ObjectStatus,
    ProviderConfigUsage, ProviderConfigUsageSpec, ReadinessPolicy, TypedReference,
};
use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::runtime::RawExtension, ByteString};

static CONTROLLER: &str = "objects";

/// Controller is the Object controller.
///
/// This is the "hard-mode" construction: the reconcile queue merges the
/// Object reflector's own triggers with the informer manager's remote-event
/// channel, so remote changes enqueue exactly the Objects they concern.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let root: Api<Object> = Api::all(client.clone());
    let (reader, writer) = reflector::store::<Object>();
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    let (tx, rx) = mpsc::channel::<ObjectRef<Object>>(1024);
    let sink_reader = reader.clone();
    ctx.informers.start(Box::new(move |ev: RemoteEvent| {
        for obj in sink_reader.state() {
            if index::matches_event(
                &obj,
                &ev.provider_config,
                &ev.gvk,
                ev.namespace.as_deref(),
                &ev.name,
            ) {
                let oref = ObjectRef::from_obj(&*obj);
                if let Err(err) = tx.try_send(oref) {
                    warn!(error = %err, "dropping remote event, queue full");
                }
            }
        }
    }))?;
    ctx.informers.bind_store(reader.clone());
    ctx.informers.spawn_gc(reader.clone(), cancel.clone());

    let refl = reflector::reflector(writer, watcher(root, watcher::Config::default()));
    let self_trigger = trigger_self(refl.applied_objects(), ());
    let remote_trigger = ReceiverStream::new(rx).map(|oref| Ok::<_, watcher::Error>(oref.into()));
    let all_reader = reader.clone();
    let resync = sig.flat_map(move |_| {
        futures::stream::iter(
            all_reader
                .state()
                .into_iter()
                .map(|o| Ok::<_, watcher::Error>(controller::ReconcileRequest::from(ObjectRef::from_obj(&*o))))
                .collect::<Vec<_>>(),
        )
    });
    let queue = futures::stream::select_all([
        self_trigger.boxed(),
        remote_trigger.boxed(),
        resync.boxed(),
    ]);

    let cfg = controller::Config::default().concurrency(ctx.options.max_reconcile_rate);
    Ok(async move {
        if let Err(e) = Api::<Object>::all(client).list(&ListParams::default().limit(1)).await {
            error!("Object CRD is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::Config("no CRD".into()));
        }
        info!(syncer = %ctx.syncer.strategy(), "starting object controller");
        controller::applier(
            |obj, ctx| Box::pin(reconcile(obj, ctx)),
            error_policy,
            ctx,
            reader,
            queue,
            cfg,
        )
            .take_until(Box::pin(cancel.cancelled_owned()))
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
        debug!("object controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<Object>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::reconcile_failure(CONTROLLER);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, obj), fields(
    name = obj.name_any(),
    generation = obj.metadata.generation,
    resource_version = obj.metadata.resource_version,
))]
async fn reconcile(obj: Arc<Object>, ctx: Arc<Context>) -> Result<Action> {
    metrics::reconcile_run(CONTROLLER);
    let api: Api<Object> = Api::all(ctx.client.clone());

    if obj
        .annotations()
        .get(PAUSED_ANNOTATION.as_str())
        .is_some_and(|v| v == "true")
    {
        info!("reconciliation is paused via the pause annotation");
        let mut status = obj.status.clone().unwrap_or_default();
        status.add_condition(Condition {
            type_: "Paused".into(),
            status: "True".into(),
            reason: "ReconcilePaused".into(),
            message: "reconciliation is paused via the pause annotation".into(),
            observed_generation: obj.metadata.generation,
            last_transition_time: now(),
        });
        patch_status(&ctx, &obj, status).await?;
        return Ok(Action::await_change());
    }

    finalizer(&api, OBJECT_FINALIZER, obj, |event| async {
        match event {
            Finalizer::Apply(obj) => reconcile_live(obj, ctx.clone()).await,
            Finalizer::Cleanup(obj) => cleanup(obj, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[instrument(skip_all)]
async fn reconcile_live(obj: Arc<Object>, ctx: Arc<Context>) -> Result<Action> {
    let mut status = obj.status.clone().unwrap_or_default();
    status.remove_condition("Paused");
    status.observed_generation = obj.metadata.generation;

    // Resolve references and fold patches into the manifest.
    let resolved = match references::resolve(&ctx.client, &obj).await {
        Ok(resolved) => resolved,
        Err(err) => return synced_false(&ctx, &obj, status, err).await,
    };
    if let Err(err) = references::ensure_target_finalizers(&ctx.client, &resolved).await {
        return synced_false(&ctx, &obj, status, err).await;
    }

    let parsed = match manifest::parse(&resolved) {
        Ok(parsed) => parsed,
        Err(err) => return synced_false(&ctx, &obj, status, err).await,
    };

    let pc_name = &resolved.spec.provider_config_ref.name;
    let api: Api<v1alpha1::ProviderConfig> = Api::all(ctx.client.clone());
    let pc = match api.get(pc_name).await {
        Ok(pc) => pc,
        Err(err) if not_found(&err) => {
            let err = Error::Config(format!("ProviderConfig {pc_name:?} not found"));
            return synced_false(&ctx, &obj, status, err).await;
        }
        Err(err) => return Err(err.into()),
    };
    ensure_usage(&ctx, &resolved, &pc).await?;
    let remote = match clients::remote_cluster_for(&ctx.client, &pc, &ctx.identity).await {
        Ok(remote) => remote,
        Err(err) => return synced_false(&ctx, &obj, status, err).await,
    };

    if index::watching(&resolved) {
        let keys: Vec<_> = index::keys_for(&resolved)
            .into_iter()
            .map(|(_, gvk)| gvk)
            .collect();
        ctx.informers
            .watch_resources(&remote.client, pc_name, &keys)
            .await?;
    }

    let remote_api =
        match syncer::remote_api(&remote.client, &parsed.gvk, parsed.namespace()).await {
            Ok(api) => api,
            Err(err) => return synced_false(&ctx, &obj, status, err).await,
        };
    let cx = SyncContext {
        object: &resolved,
        parsed: &parsed,
        api: remote_api,
        client: remote.client.clone(),
        pc_uid: pc.uid().unwrap_or_default(),
        sanitize: ctx.options.sanitize_secrets,
    };

    let policies = effective_policies(&ctx, &resolved);
    if !policies.allows(ManagementPolicy::Observe) {
        let err = Error::Config("management policies must include Observe".into());
        return synced_false(&ctx, &obj, status, err).await;
    }

    let current = match cx.api.get_opt(parsed.name()).await {
        Ok(current) => current,
        Err(err) => return synced_false(&ctx, &obj, status, Error::RemoteApi(err)).await,
    };
    let observed = match current {
        None => {
            if !policies.allows(ManagementPolicy::Create) {
                debug!("remote object absent and creation is not allowed");
                status.add_condition(Condition {
                    type_: "Synced".into(),
                    status: "False".into(),
                    reason: "RemoteObjectMissing".into(),
                    message: "remote object does not exist and the policy forbids creating it"
                        .into(),
                    observed_generation: obj.metadata.generation,
                    last_transition_time: now(),
                });
                status.at_provider = None;
                patch_status(&ctx, &obj, status).await?;
                return Ok(Action::requeue(READY_FALSE_POLL));
            }
            info!(kind = parsed.gvk.kind, name = parsed.name(), "creating remote object");
            let applied = match ctx.syncer.sync(&cx, None).await {
                Ok(applied) => applied,
                Err(err) => return synced_false(&ctx, &obj, status, err).await,
            };
            publish_event(&ctx, &obj, "CreatedRemoteObject", &parsed).await;
            serde_json::to_value(&applied)?
        }
        Some(current) => {
            let observed = match ctx.syncer.observed(&cx, &current).await {
                Ok(observed) => observed,
                Err(err) => return synced_false(&ctx, &obj, status, err).await,
            };
            let desired = match ctx.syncer.desired(&cx).await {
                Ok(desired) => desired,
                Err(err) => return synced_false(&ctx, &obj, status, err).await,
            };
            if ctx.syncer.up_to_date(observed.as_ref(), &desired) {
                trace!("remote object is up to date");
                serde_json::to_value(&current)?
            } else if policies.allows(ManagementPolicy::Update) {
                info!(kind = parsed.gvk.kind, name = parsed.name(), "updating remote object");
                let applied = match ctx.syncer.sync(&cx, Some(&current)).await {
                    Ok(applied) => applied,
                    Err(err) => return synced_false(&ctx, &obj, status, err).await,
                };
                publish_event(&ctx, &obj, "UpdatedRemoteObject", &parsed).await;
                serde_json::to_value(&applied)?
            } else {
                debug!("drift detected but updates are not allowed");
                status.add_condition(Condition {
                    type_: "Synced".into(),
                    status: "False".into(),
                    reason: "DriftDetected".into(),
                    message: "remote object drifted from the manifest and the policy forbids \
                              updating it"
                        .into(),
                    observed_generation: obj.metadata.generation,
                    last_transition_time: now(),
                });
                let mut manifest = serde_json::to_value(&current)?;
                if cx.sanitize {
                    syncer::sanitize_secret(&mut manifest, &parsed.gvk);
                }
                status.at_provider = Some(ObjectObservation {
                    manifest: Some(RawExtension(manifest)),
                });
                patch_status(&ctx, &obj, status).await?;
                return Ok(Action::requeue(ctx.options.poll_with_jitter()));
            }
        }
    };

    // Mirror the observed manifest, publish connection details, and derive
    // readiness.
    let mut mirrored = observed.clone();
    if cx.sanitize {
        syncer::sanitize_secret(&mut mirrored, &parsed.gvk);
    }
    status.at_provider = Some(ObjectObservation {
        manifest: Some(RawExtension(mirrored)),
    });

    if let Err(err) = publish_connection_details(&ctx, &resolved).await {
        return synced_false(&ctx, &obj, status, err).await;
    }

    let (ready, message) = readiness(&resolved, &observed);
    status.add_condition(Condition {
        type_: "Ready".into(),
        status: if ready { "True" } else { "False" }.into(),
        reason: if ready { "Available" } else { "Unavailable" }.into(),
        message: message.unwrap_or_default(),
        observed_generation: obj.metadata.generation,
        last_transition_time: now(),
    });
    status.add_condition(Condition {
        type_: "Synced".into(),
        status: "True".into(),
        reason: "ReconcileSuccess".into(),
        message: "".into(),
        observed_generation: obj.metadata.generation,
        last_transition_time: now(),
    });
    patch_status(&ctx, &obj, status).await?;

    Ok(Action::requeue(if ready {
        ctx.options.poll_with_jitter()
    } else {
        READY_FALSE_POLL
    }))
}

#[instrument(skip_all)]
async fn cleanup(obj: Arc<Object>, ctx: Arc<Context>) -> Result<Action> {
    let policies = effective_policies(&ctx, &obj);

    if policies.allows(ManagementPolicy::Delete) {
        // References are not resolved on deletion; the stored manifest is
        // enough to address the remote object.
        if let Ok(parsed) = manifest::parse(&obj) {
            let pc_name = &obj.spec.provider_config_ref.name;
            let remote = clients::remote_cluster(&ctx.client, pc_name, &ctx.identity).await?;
            let api = syncer::remote_api(&remote.client, &parsed.gvk, parsed.namespace()).await?;
            info!(kind = parsed.gvk.kind, name = parsed.name(), "deleting remote object");
            match api.delete(parsed.name(), &DeleteParams::default()).await {
                Ok(_) => publish_event(&ctx, &obj, "DeletedRemoteObject", &parsed).await,
                Err(err) if not_found(&err) => {}
                Err(err) => return Err(Error::RemoteApi(err)),
            }
        }
    }

    references::remove_target_finalizers(&ctx.client, &obj).await?;

    // Stop watches this Object held; keys other live Objects still need
    // survive.
    let keys: Vec<_> = index::keys_for(&obj).into_iter().map(|(_, gvk)| gvk).collect();
    ctx.informers
        .stop_watching(&obj.spec.provider_config_ref.name, &keys);
    ctx.syncer.invalidate(&obj.uid().unwrap_or_default());

    Ok(Action::await_change())
}

/// Effective_policies reduces the spec's policy set per the provider-wide
/// feature gate.
fn effective_policies(ctx: &Context, obj: &Object) -> v1alpha1::ManagementPolicies {
    if ctx.options.enable_management_policies {
        obj.spec.management_policies.clone()
    } else {
        v1alpha1::ManagementPolicies::all()
    }
}

/// Readiness derives the Ready state from the observed remote object.
///
/// A CEL program error surfaces as not-ready with the error message on the
/// condition rather than failing the reconcile.
fn readiness(obj: &Object, observed: &Value) -> (bool, Option<String>) {
    let readiness = obj.spec.readiness.clone().unwrap_or_default();
    match readiness.policy {
        ReadinessPolicy::SuccessfulCreate => (true, None),
        ReadinessPolicy::DeriveFromObject => {
            let ready = remote_conditions(observed)
                .iter()
                .any(|(t, s)| t == "Ready" && s == "True");
            (ready, None)
        }
        ReadinessPolicy::AllTrue => {
            let cnds = remote_conditions(observed);
            let ready = !cnds.is_empty() && cnds.iter().all(|(_, s)| s == "True");
            (ready, None)
        }
        ReadinessPolicy::DeriveFromCelQuery => {
            let q = match readiness.cel_query.as_deref() {
                Some(q) if !q.is_empty() => q,
                _ => return (false, Some("readiness policy needs a celQuery".into())),
            };
            match eval_cel(q, observed) {
                Ok(ready) => (ready, None),
                Err(msg) => (false, Some(msg)),
            }
        }
    }
}

fn remote_conditions(observed: &Value) -> Vec<(String, String)> {
    observed
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| {
            Some((
                c.get("type")?.as_str()?.to_string(),
                c.get("status")?.as_str()?.to_string(),
            ))
        })
        .collect()
}

fn eval_cel(query: &str, observed: &Value) -> std::result::Result<bool, String> {
    use cel_interpreter::{Context as CelContext, Program, Value as CelValue};
    let program = Program::compile(query).map_err(|err| format!("compiling celQuery: {err}"))?;
    let mut cel = CelContext::default();
    cel.add_variable("object", observed.clone())
        .map_err(|err| format!("binding object: {err}"))?;
    match program.execute(&cel) {
        Ok(CelValue::Bool(b)) => Ok(b),
        Ok(v) => Err(format!("celQuery returned non-boolean value {v:?}")),
        Err(err) => Err(format!("evaluating celQuery: {err}")),
    }
}

/// Ensure_usage applies the ProviderConfigUsage recording this Object's use
/// of its config.
#[instrument(skip_all)]
async fn ensure_usage(
    ctx: &Context,
    obj: &Object,
    pc: &v1alpha1::ProviderConfig,
) -> Result<()> {
    let mut pcu = ProviderConfigUsage::new(
        &obj.name_any(),
        ProviderConfigUsageSpec {
            provider_config_ref: obj.spec.provider_config_ref.clone(),
            resource_ref: TypedReference {
                api_version: Object::api_version(&()).to_string(),
                kind: Object::kind(&()).to_string(),
                name: obj.name_any(),
                uid: obj.uid(),
            },
        },
    );
    pcu.labels_mut().insert(
        provider_label("provider-config"),
        pc.name_any(),
    );
    if let Some(oref) = obj.controller_owner_ref(&()) {
        pcu.meta_mut().owner_references = Some(vec![oref]);
    }
    let api: Api<ProviderConfigUsage> = Api::all(ctx.client.clone());
    api.patch(&obj.name_any(), &PATCH_PARAMS, &Patch::Apply(&pcu))
        .await?;
    Ok(())
}

/// Publish_connection_details reads each rule's field and stores the values
/// in the Object's connection secret.
#[instrument(skip_all)]
async fn publish_connection_details(ctx: &Context, obj: &Object) -> Result<()> {
    let sink = match (&obj.spec.write_connection_secret_to_ref, obj.spec.connection_details.len()) {
        (_, 0) => return Ok(()),
        (None, _) => {
            return Err(Error::Config(
                "connectionDetails need writeConnectionSecretToRef".into(),
            ))
        }
        (Some(sink), _) => sink,
    };

    let mut data = BTreeMap::new();
    for rule in &obj.spec.connection_details {
        let value = connection_detail_value(ctx, rule).await?;
        data.insert(rule.to_connection_secret_key.clone(), ByteString(value));
    }

    let mut secret = Secret::default();
    secret.metadata.name = Some(sink.name.clone());
    secret.metadata.namespace = Some(sink.namespace.clone());
    if let Some(oref) = obj.controller_owner_ref(&()) {
        secret.metadata.owner_references = Some(vec![oref]);
    }
    secret.data = Some(data);
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &sink.namespace);
    api.patch(&sink.name, &PATCH_PARAMS, &Patch::Apply(&secret))
        .await?;
    Ok(())
}

async fn connection_detail_value(ctx: &Context, rule: &ConnectionDetail) -> Result<Vec<u8>> {
    use std::str::FromStr;
    let gv = kube::core::GroupVersion::from_str(&rule.api_version)
        .map_err(|err| Error::Config(format!("bad apiVersion {:?}: {err}", rule.api_version)))?;
    let gvk = gv.with_kind(&rule.kind);
    let api = syncer::remote_api(&ctx.client, &gvk, rule.namespace.as_deref()).await?;
    let source = api.get(&rule.name).await.map_err(|err| {
        if not_found(&err) {
            Error::Reference(format!("connection detail source {:?} not found", rule.name))
        } else {
            Error::Kube(err)
        }
    })?;
    let tree = serde_json::to_value(&source)?;
    let value = manifest::get_value(&tree, &rule.field_path)
        .map_err(Error::Reference)?
        .ok_or_else(|| {
            Error::Reference(format!(
                "field path {:?} not set on connection detail source",
                rule.field_path
            ))
        })?;

    // Secret data is stored base64-encoded; decode before the sink re-encodes
    // it.
    let is_secret_data = gvk.group.is_empty()
        && gvk.version == "v1"
        && gvk.kind == "Secret"
        && (rule.field_path.starts_with("data.") || rule.field_path.starts_with("data["));
    if is_secret_data {
        let s = value
            .as_str()
            .ok_or_else(|| Error::Reference("secret data value is not a string".into()))?;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        return STANDARD
            .decode(s)
            .map_err(|err| Error::Reference(format!("decoding secret data: {err}")));
    }
    Ok(match value {
        Value::String(s) => s.clone().into_bytes(),
        v => serde_json::to_vec(v)?,
    })
}

async fn publish_event(ctx: &Context, obj: &Object, action: &str, parsed: &manifest::Parsed) {
    let ev = Event {
        type_: EventType::Normal,
        reason: "Reconcile".into(),
        note: Some(format!("{} {} {:?}", action, parsed.gvk.kind, parsed.name())),
        action: action.into(),
        secondary: None,
    };
    if let Err(err) = ctx.recorder.publish(&ev, &obj.object_ref(&())).await {
        warn!(error = %err, "unable to publish event");
    }
}

/// Synced_false writes a Synced=False condition carrying `err` and returns
/// the error so the work queue backs off.
async fn synced_false(
    ctx: &Context,
    obj: &Object,
    mut status: ObjectStatus,
    err: Error,
) -> Result<Action> {
    status.add_condition(Condition {
        type_: "Synced".into(),
        status: "False".into(),
        reason: "ReconcileError".into(),
        message: err.to_string(),
        observed_generation: obj.metadata.generation,
        last_transition_time: now(),
    });
    patch_status(ctx, obj, status).await?;
    Err(err)
}

/// Patch_status publishes the Object's status; write conflicts are swallowed
/// so the queue simply retries.
#[instrument(skip_all)]
async fn patch_status(ctx: &Context, obj: &Object, status: ObjectStatus) -> Result<()> {
    let api: Api<Object> = Api::all(ctx.client.clone());
    let patch = Patch::Apply(json!({
        "apiVersion": Object::api_version(&()),
        "kind": Object::kind(&()),
        "status": status,
    }));
    match api.patch_status(&obj.name_any(), &PATCH_PARAMS, &patch).await {
        Ok(_) => Ok(()),
        Err(err) if conflict(&err) => {
            debug!("status write conflict, requeueing silently");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
