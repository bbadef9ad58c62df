//! Extras that only show up during tests.
#![allow(missing_docs)]

use std::{collections::BTreeMap, sync::Arc};

use assert_json_diff::assert_json_include;
use futures::prelude::*;
use http::{Request, Response, StatusCode};
use kube::{
    client::{Body, Client},
    runtime::events::Recorder,
    Resource,
};
use serde_json::{json, Value};

use super::*;
use api::v1alpha1::Object;

pub use test_log::test;

impl Context {
    /// Object_tests builds a Context backed by a mock apiserver.
    pub fn object_tests() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let mock_recorder = Recorder::new(mock_client.clone(), super::REPORTER.clone());
        let ctx = Self {
            client: mock_client,
            recorder: mock_recorder,
            options: Options::default(),
            informers: Arc::new(crate::informers::InformerManager::default()),
            syncer: Arc::new(crate::syncer::Syncer::new(crate::syncer::Strategy::LastApplied)),
            identity: crate::clients::IdentityRegistry::default(),
        };
        (Arc::new(ctx), ApiServerVerifier::new(handle))
    }
}

pub mod object {
    use api::v1alpha1::{Object, ObjectParameters, ObjectSpec, ProviderConfigReference};
    use kube::ResourceExt;
    use serde_json::json;

    /// Return a minimal Object instance managing a Namespace.
    pub fn test() -> Object {
        let mut o = Object::new(
            "test",
            ObjectSpec {
                provider_config_ref: ProviderConfigReference {
                    name: "remote".into(),
                },
                for_provider: ObjectParameters {
                    manifest: k8s_openapi::apimachinery::pkg::runtime::RawExtension(json!({
                        "apiVersion": "v1",
                        "kind": "Namespace",
                        "metadata": {"name": "cs"},
                    })),
                },
                ..Default::default()
            },
        );
        o.metadata.uid = Some("42".into());
        o
    }

    pub fn finalized(mut o: Object) -> Object {
        o.finalizers_mut().push(crate::OBJECT_FINALIZER.into());
        o
    }

    pub fn paused(mut o: Object) -> Object {
        o.annotations_mut()
            .insert(crate::PAUSED_ANNOTATION.clone(), "true".into());
        o
    }

    pub fn with_depends_on(mut o: Object, target: &str) -> Object {
        o.spec.references.push(api::v1alpha1::Reference {
            depends_on: Some(api::v1alpha1::DependsOn {
                name: target.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        o
    }
}

pub mod provider_config {
    use api::v1alpha1::{ProviderConfig, ProviderConfigSpec, ProviderCredentials};

    /// Return a minimal ProviderConfig using the in-cluster identity.
    pub fn test(name: &str) -> ProviderConfig {
        let mut pc = ProviderConfig::new(
            name,
            ProviderConfigSpec {
                credentials: ProviderCredentials {
                    source: api::v1alpha1::CredentialsSource::InjectedIdentity,
                    ..Default::default()
                },
                identity: None,
            },
        );
        pc.metadata.uid = Some(format!("pc-{name}"));
        pc
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Synced_condition digs the Synced condition out of a status payload.
fn synced_condition(status: &Value) -> Value {
    status
        .get("conditions")
        .and_then(Value::as_array)
        .and_then(|cs| cs.iter().find(|c| c.get("type") == Some(&json!("Synced"))))
        .cloned()
        .expect("a Synced condition")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ApiServerVerifier {
    handle: ApiServerHandle,
    state: BTreeMap<String, Value>,
}

/// Scenarios we want to test for.
pub enum ObjectScenario {
    /// The finalizer is added to a fresh Object.
    FinalizerCreation(Object),
    /// A paused Object only has its Paused condition written.
    Paused(Object),
    /// A missing ProviderConfig surfaces as Synced=False.
    MissingProviderConfig(Object),
    /// A missing reference target surfaces as Synced=False.
    MissingReferenceTarget(Object, String),
}

/// Scenarios for the ProviderConfig usage controller.
pub enum ProviderConfigScenario {
    /// A config with no usages gets its user count written and no finalizer.
    NoUsages(api::v1alpha1::ProviderConfig),
}

impl ApiServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self {
            handle,
            state: BTreeMap::new(),
        }
    }

    /// Tests only get to run specific scenarios that have matching handlers.
    ///
    /// NB: If the controller is making more calls than we are handling in the
    /// scenario, you then typically see a `KubeError(Service(Closed(())))`
    /// from the reconciler. Await the returned `JoinHandle` (with a timeout)
    /// to ensure the scenario ran to completion.
    pub fn run(self, scenario: ObjectScenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use ObjectScenario::*;
            match scenario {
                FinalizerCreation(o) => self.handle_finalizer_creation(o).await,
                Paused(o) => {
                    self.handle_status_patch(&o, |status| {
                        let cnd = status
                            .get("conditions")
                            .and_then(Value::as_array)
                            .and_then(|cs| {
                                cs.iter().find(|c| c.get("type") == Some(&json!("Paused")))
                            })
                            .cloned()
                            .expect("a Paused condition");
                        assert_eq!(cnd.get("status"), Some(&json!("True")));
                    })
                    .await
                }
                MissingProviderConfig(o) => {
                    self.handle_get_provider_config_not_found("remote")
                        .await
                        .unwrap()
                        .handle_status_patch(&o, |status| {
                            let cnd = synced_condition(status);
                            assert_eq!(cnd.get("status"), Some(&json!("False")));
                        })
                        .await
                }
                MissingReferenceTarget(o, target) => {
                    self.handle_get_object_not_found(&target)
                        .await
                        .unwrap()
                        .handle_status_patch(&o, |status| {
                            let cnd = synced_condition(status);
                            assert_eq!(cnd.get("status"), Some(&json!("False")));
                            let msg = cnd.get("message").and_then(Value::as_str).unwrap();
                            assert!(msg.contains("reference"), "message names the cause: {msg}");
                        })
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    /// Run_pc is [ApiServerVerifier::run] for the ProviderConfig controller.
    pub fn run_pc(self, scenario: ProviderConfigScenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use ProviderConfigScenario::*;
            match scenario {
                NoUsages(pc) => {
                    self.handle_list_usages_empty(&pc)
                        .await
                        .unwrap()
                        .handle_pc_status_patch(&pc, |status| {
                            assert_eq!(status.get("users"), Some(&json!(0)));
                        })
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    fn next_request(
        &mut self,
    ) -> impl Future<Output = Option<(Request<Body>, tower_test::mock::SendResponse<Response<Body>>)>>
    {
        self.handle.next_request()
    }

    async fn handle_finalizer_creation(mut self, o: Object) -> Result<Self> {
        use kube::ResourceExt;
        let (request, send) = self.next_request().await.expect("service not called");
        // We expect a json patch to the specified document adding our
        // finalizer.
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/kubernetes.provider.dev/v1alpha1/objects/{}?",
                o.name_any()
            )
        );
        let expected_patch = json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![crate::OBJECT_FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let o = object::finalized(o);
        let response = serde_json::to_vec(&o).unwrap(); // respond as the apiserver would have
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    async fn handle_get_provider_config_not_found(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().to_string(),
            format!("/apis/kubernetes.provider.dev/v1alpha1/providerconfigs/{name}")
        );
        let err = json!({
            "code": 404,
            "status": "Failure",
            "reason": "NotFound",
            "details": {
                "group": api::GROUP,
                "kind": "ProviderConfig",
                "name": name,
            },
        });
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(serde_json::to_vec(&err).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_get_object_not_found(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().to_string(),
            format!("/apis/kubernetes.provider.dev/v1alpha1/objects/{name}")
        );
        let err = json!({
            "code": 404,
            "status": "Failure",
            "reason": "NotFound",
            "details": {
                "group": api::GROUP,
                "kind": "Object",
                "name": name,
            },
        });
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(serde_json::to_vec(&err).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_list_usages_empty(
        mut self,
        pc: &api::v1alpha1::ProviderConfig,
    ) -> Result<Self> {
        use kube::ResourceExt;
        let (request, send) = self.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with("/apis/kubernetes.provider.dev/v1alpha1/providerconfigusages?"),
            "unexpected path: {uri}"
        );
        assert!(
            uri.contains("labelSelector="),
            "usages are listed by label: {uri}"
        );
        assert!(uri.contains(&pc.name_any()), "selector names the config: {uri}");
        let list = json!({
            "apiVersion": "kubernetes.provider.dev/v1alpha1",
            "kind": "ProviderConfigUsageList",
            "metadata": {"resourceVersion": "1"},
            "items": [],
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&list).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    /// Handles a PATCH to the ProviderConfig's status subresource.
    async fn handle_pc_status_patch<F>(
        mut self,
        pc: &api::v1alpha1::ProviderConfig,
        check: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Value),
    {
        use kube::ResourceExt;
        let (request, send) = self.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with(&format!(
                "/apis/kubernetes.provider.dev/v1alpha1/providerconfigs/{}/status?",
                pc.name_any()
            )),
            "unexpected path: {uri}"
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
        let status = patch.get("status").expect("status object");
        check(status);

        let mut pc = pc.clone();
        pc.status = serde_json::from_value(status.clone()).expect("valid status");
        let response = serde_json::to_vec(&pc).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    /// Handles a PATCH to the Object's status subresource and hands the sent
    /// status to `check`.
    async fn handle_status_patch<F>(mut self, o: &Object, check: F) -> Result<Self>
    where
        F: FnOnce(&Value),
    {
        use kube::ResourceExt;
        let (request, send) = self.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let uri = request.uri().to_string();
        assert!(
            uri.starts_with(&format!(
                "/apis/kubernetes.provider.dev/v1alpha1/objects/{}/status?",
                o.name_any()
            )),
            "unexpected path: {uri}"
        );
        assert!(
            uri.contains(&format!("fieldManager={}", crate::CONTROLLER_NAME)),
            "status patches carry the provider's field manager: {uri}"
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
        assert_eq!(patch.get("kind"), Some(&json!(Object::kind(&()))));
        let status = patch.get("status").expect("status object");
        check(status);

        let mut o = o.clone();
        o.status = serde_json::from_value(status.clone()).expect("valid status");
        self.state.insert(o.name_any(), serde_json::to_value(&o).unwrap());
        let response = serde_json::to_vec(&o).unwrap();
        // pass through document "patch accepted"
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }
}
