#![allow(dead_code)]

use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    CustomResourceExt, ResourceExt,
};

use controller::{Context, Options, Result};

pub mod prelude {
    pub use std::sync::Arc;

    pub use kube::api::{Api, DeleteParams, PostParams};
    pub use serde_json::json;
    pub use tokio::{signal, task, time::Duration};
    pub use tokio_util::sync::CancellationToken;
}

/// Test_context builds a Context against the ambient cluster.
pub async fn test_context() -> Arc<Context> {
    let config = kube::Config::infer().await.expect("kubeconfig");
    let client = kube::client::ClientBuilder::try_from(config)
        .expect("client builder")
        .build();
    Arc::new(Context::new(client, Options::default()))
}

/// Load_crds applies the provider CRDs so the controllers can run.
pub async fn load_crds(client: &kube::Client) -> Result<()> {
    use api::v1alpha1;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("provider-kubernetes-tests").force();
    for crd in [
        v1alpha1::Object::crd(),
        v1alpha1::ProviderConfig::crd(),
        v1alpha1::ProviderConfigUsage::crd(),
        v1alpha1::ObservedObjectCollection::crd(),
    ] {
        crds.patch(&crd.name_any(), &params, &Patch::Apply(&crd))
            .await?;
    }
    Ok(())
}
