//! Providerconfigs holds the usage-tracking controller: a ProviderConfig
//! cannot be deleted while ProviderConfigUsages reference it.

use std::sync::Arc;

use kube::runtime::{controller::Error as CtrlErr, reflector::ObjectRef};
use serde_json::json;
use tokio::time::Duration;

use crate::{conflict, metrics, prelude::*, PC_IN_USE_FINALIZER};
use api::v1alpha1::{ProviderConfig, ProviderConfigStatus, ProviderConfigUsage};

static CONTROLLER: &str = "providerconfigs";

/// Controller is the ProviderConfig usage controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<ProviderConfig> = Api::all(client.clone());

    let ctl = Controller::new(root, ctlcfg.clone())
        .watches(
            Api::<ProviderConfigUsage>::all(client),
            ctlcfg,
            |pcu: ProviderConfigUsage| {
                Some(ObjectRef::new(&pcu.spec.provider_config_ref.name))
            },
        )
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!("starting providerconfig controller");
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
        debug!("providerconfig controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<ProviderConfig>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::reconcile_failure(CONTROLLER);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, pc), fields(name = pc.name_any()))]
async fn reconcile(pc: Arc<ProviderConfig>, ctx: Arc<Context>) -> Result<Action> {
    metrics::reconcile_run(CONTROLLER);
    let api: Api<ProviderConfig> = Api::all(ctx.client.clone());
    let usages: Api<ProviderConfigUsage> = Api::all(ctx.client.clone());

    let selector = format!("{}={}", provider_label("provider-config"), pc.name_any());
    let in_use = usages
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .len();
    debug!(in_use, "counted usages");

    if pc.metadata.deletion_timestamp.is_some() && in_use == 0 {
        if let Some(uid) = pc.uid() {
            ctx.syncer.drop_parsers(&uid);
        }
    }

    let has = pc.finalizers().contains(&PC_IN_USE_FINALIZER.to_string());
    if in_use > 0 && !has {
        let mut finalizers = pc.finalizers().to_vec();
        finalizers.push(PC_IN_USE_FINALIZER.into());
        api.patch(
            &pc.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
    } else if in_use == 0 && has {
        let finalizers: Vec<_> = pc
            .finalizers()
            .iter()
            .filter(|f| *f != PC_IN_USE_FINALIZER)
            .cloned()
            .collect();
        api.patch(
            &pc.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
    }

    let status = ProviderConfigStatus {
        users: Some(i64::try_from(in_use).unwrap_or(i64::MAX)),
        ..pc.status.clone().unwrap_or_default()
    };
    let patch = Patch::Apply(json!({
        "apiVersion": ProviderConfig::api_version(&()),
        "kind": ProviderConfig::kind(&()),
        "status": status,
    }));
    match api
        .patch_status(&pc.name_any(), &PATCH_PARAMS, &patch)
        .await
    {
        Ok(_) => {}
        Err(err) if conflict(&err) => debug!("status write conflict, requeueing silently"),
        Err(err) => return Err(err.into()),
    }

    Ok(Action::requeue(ctx.options.poll_with_jitter()))
}
