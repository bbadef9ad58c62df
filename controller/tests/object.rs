use k8s_openapi::api::core::v1::Namespace;

use api::v1alpha1::{
    CredentialsSource, Object, ProviderConfig, ProviderCredentials, ProviderConfigSpec,
};
use controller::{objects, Error};
mod util;
use util::prelude::*;

/// Drives one create cycle end to end: an Object whose manifest is a
/// Namespace, against a ProviderConfig addressing the ambient cluster.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[cfg_attr(not(feature = "test_ci"), ignore)]
async fn create() -> Result<(), Error> {
    let ctx = util::test_context().await;
    util::load_crds(&ctx.client).await?;

    let token = CancellationToken::new();
    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(objects::controller(token.clone(), ctx.clone())?);
    ctrls.spawn(create_inner(ctx));

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => token.cancel(),
            res = ctrls.join_next() => {
                eprintln!("task finished");
                if res.is_none() {
                    break;
                }
                match res.unwrap()? {
                    Ok(_) => {},
                    Err(err) => return Err(err),
                };
                token.cancel();
            },
            else => break,
        }
    }
    Ok(())
}

async fn create_inner(ctx: Arc<controller::Context>) -> Result<(), Error> {
    const NAME: &str = "objects-create-test";
    let params = PostParams::default();

    let pcs: Api<ProviderConfig> = Api::all(ctx.client.clone());
    let pc = ProviderConfig::new(
        NAME,
        ProviderConfigSpec {
            credentials: ProviderCredentials {
                source: CredentialsSource::InjectedIdentity,
                ..Default::default()
            },
            identity: None,
        },
    );
    pcs.create(&params, &pc).await?;

    let objects: Api<Object> = Api::all(ctx.client.clone());
    let obj: Object = serde_json::from_value(json!({
        "apiVersion": "kubernetes.provider.dev/v1alpha1",
        "kind": "Object",
        "metadata": {"name": NAME},
        "spec": {
            "providerConfigRef": {"name": NAME},
            "forProvider": {
                "manifest": {
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {"name": NAME},
                },
            },
        },
    }))?;
    objects.create(&params, &obj).await?;

    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let mut found = false;
    for _ in 0..60 {
        if namespaces.get_opt(NAME).await?.is_some() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(found, "remote namespace was not created");

    objects.delete(NAME, &DeleteParams::default()).await?;
    for _ in 0..60 {
        if objects.get_opt(NAME).await?.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    pcs.delete(NAME, &DeleteParams::default()).await?;

    Ok(())
}
