//! Clients turns a ProviderConfig into an authenticated client for a remote
//! cluster.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::{debug, instrument, trace};

use crate::{not_found, Error, Result};
use api::v1alpha1::{CredentialsSource, IdentityType, ProviderConfig, ProviderCredentials};

/// CLIENT_BURST is the fixed burst for remote clients.
///
/// `kube::Config` has no client-side throttle; the pair is kept as the
/// contract for the transport layer in front of the remote apiserver.
pub const CLIENT_BURST: u32 = 300;
/// CLIENT_QPS is the fixed steady-state rate for remote clients.
pub const CLIENT_QPS: f32 = 50.0;

/// RemoteCluster couples a remote client with the REST config it was built
/// from.
pub struct RemoteCluster {
    /// Client talks to the remote apiserver.
    pub client: Client,
    /// Config is the REST config the client was built from.
    pub config: Config,
}

impl std::fmt::Debug for RemoteCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCluster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// IdentityBinder wraps a REST config so requests carry an overlay identity.
///
/// This is the only contract the core consumes; the concrete cloud overlays
/// live outside it.
pub trait IdentityBinder: Send + Sync {
    /// Bind mutates `config` so requests authenticate as the overlay
    /// identity. `creds` carries the extracted identity credentials, absent
    /// for ambient sources.
    fn bind<'a>(
        &'a self,
        config: &'a mut Config,
        creds: Option<&'a [u8]>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// IdentityRegistry dispatches identity overlays by type.
#[derive(Clone, Default)]
pub struct IdentityRegistry(Arc<HashMap<IdentityType, Arc<dyn IdentityBinder>>>);

impl IdentityRegistry {
    /// New builds a registry from the provided binders.
    pub fn new(binders: HashMap<IdentityType, Arc<dyn IdentityBinder>>) -> Self {
        Self(Arc::new(binders))
    }

    fn get(&self, t: IdentityType) -> Option<&Arc<dyn IdentityBinder>> {
        self.0.get(&t)
    }
}

/// Extract_credentials pulls raw credential bytes per the selector.
///
/// Returns None for the None and InjectedIdentity sources, which carry no
/// bytes.
#[instrument(skip(local, creds), fields(source = ?creds.source))]
pub async fn extract_credentials(
    local: &Client,
    creds: &ProviderCredentials,
) -> Result<Option<Vec<u8>>> {
    match creds.source {
        CredentialsSource::None | CredentialsSource::InjectedIdentity => Ok(None),
        CredentialsSource::Secret => {
            let sel = creds
                .secret_ref
                .as_ref()
                .ok_or_else(|| Error::Config("credentials source Secret needs secretRef".into()))?;
            let api: Api<Secret> = Api::namespaced(local.clone(), &sel.namespace);
            let secret = api.get(&sel.name).await.map_err(|err| {
                if not_found(&err) {
                    Error::Credential(format!(
                        "secret {}/{} not found",
                        sel.namespace, sel.name
                    ))
                } else {
                    Error::Kube(err)
                }
            })?;
            let data = secret
                .data
                .and_then(|mut d| d.remove(&sel.key))
                .ok_or_else(|| {
                    Error::Credential(format!(
                        "secret {}/{} has no key {:?}",
                        sel.namespace, sel.name, sel.key
                    ))
                })?;
            Ok(Some(data.0))
        }
        CredentialsSource::Environment => {
            let sel = creds
                .env
                .as_ref()
                .ok_or_else(|| Error::Config("credentials source Environment needs env".into()))?;
            let v = std::env::var(&sel.name).map_err(|err| {
                Error::Credential(format!("environment variable {:?}: {err}", sel.name))
            })?;
            Ok(Some(v.into_bytes()))
        }
        CredentialsSource::Filesystem => {
            let sel = creds
                .fs
                .as_ref()
                .ok_or_else(|| Error::Config("credentials source Filesystem needs fs".into()))?;
            let buf = tokio::fs::read(&sel.path)
                .await
                .map_err(|err| Error::Credential(format!("reading {:?}: {err}", sel.path)))?;
            Ok(Some(buf))
        }
        CredentialsSource::ServiceAccount => Err(Error::Config(
            "credentials source ServiceAccount cannot carry a kubeconfig".into(),
        )),
    }
}

/// Config_from_kubeconfig synthesizes a REST config from kubeconfig bytes,
/// using the current context's cluster and user.
pub async fn config_from_kubeconfig(buf: &[u8]) -> Result<Config> {
    let text = std::str::from_utf8(buf)
        .map_err(|err| Error::Config(format!("kubeconfig is not UTF-8: {err}")))?;
    let kc = Kubeconfig::from_yaml(text)
        .map_err(|err| Error::Config(format!("cannot parse kubeconfig: {err}")))?;
    Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .map_err(|err| Error::Config(format!("cannot load kubeconfig: {err}")))
}

/// Remote_cluster resolves a ProviderConfig into an authenticated client for
/// the remote cluster it addresses.
#[instrument(skip(local, identity))]
pub async fn remote_cluster(
    local: &Client,
    name: &str,
    identity: &IdentityRegistry,
) -> Result<RemoteCluster> {
    let api: Api<ProviderConfig> = Api::all(local.clone());
    let pc = api.get(name).await.map_err(|err| {
        if not_found(&err) {
            Error::Config(format!("ProviderConfig {name:?} not found"))
        } else {
            Error::Kube(err)
        }
    })?;
    remote_cluster_for(local, &pc, identity).await
}

/// Remote_cluster_for is [remote_cluster] for an already-fetched config.
pub async fn remote_cluster_for(
    local: &Client,
    pc: &ProviderConfig,
    identity: &IdentityRegistry,
) -> Result<RemoteCluster> {
    let creds = &pc.spec.credentials;
    let mut config = match creds.source {
        CredentialsSource::InjectedIdentity => {
            trace!("using in-cluster config");
            Config::incluster()?
        }
        _ => {
            let buf = extract_credentials(local, creds).await?.ok_or_else(|| {
                Error::Config(format!(
                    "credentials source {:?} carries no kubeconfig",
                    creds.source
                ))
            })?;
            config_from_kubeconfig(&buf).await?
        }
    };

    if let Some(id) = &pc.spec.identity {
        if id.credentials.source == CredentialsSource::InjectedIdentity
            && id.type_.requires_explicit_credentials()
        {
            return Err(Error::Config(format!(
                "identity type {:?} does not support the InjectedIdentity source",
                id.type_
            )));
        }
        let binder = identity.get(id.type_).ok_or_else(|| {
            Error::Config(format!("identity type {:?} is not configured", id.type_))
        })?;
        let id_creds = extract_credentials(local, &id.credentials).await?;
        debug!(identity = ?id.type_, "binding identity overlay");
        binder.bind(&mut config, id_creds.as_deref()).await?;
    }

    let client = Client::try_from(config.clone())?;
    Ok(RemoteCluster { client, config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::{EnvSelector, Identity, ProviderConfigSpec};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    server: https://remote.example:6443
  name: remote
contexts:
- context:
    cluster: remote
    user: admin
  name: remote
current-context: remote
users:
- name: admin
  user:
    token: sekrit
"#;

    #[tokio::test]
    async fn kubeconfig_synthesizes_rest_config() {
        let cfg = config_from_kubeconfig(KUBECONFIG.as_bytes()).await.unwrap();
        assert_eq!(cfg.cluster_url.to_string(), "https://remote.example:6443/");
    }

    #[tokio::test]
    async fn kubeconfig_without_current_context_is_config_error() {
        let buf = KUBECONFIG.replace("current-context: remote", "");
        let err = config_from_kubeconfig(buf.as_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn garbage_kubeconfig_is_config_error() {
        let err = config_from_kubeconfig(b"{159:").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    fn pc_with_identity(t: IdentityType, source: CredentialsSource) -> ProviderConfig {
        ProviderConfig::new(
            "test",
            ProviderConfigSpec {
                credentials: ProviderCredentials {
                    source: CredentialsSource::Environment,
                    env: Some(EnvSelector {
                        name: "TEST_PROVIDER_KUBECONFIG".into(),
                    }),
                    ..Default::default()
                },
                identity: Some(Identity {
                    type_: t,
                    credentials: ProviderCredentials {
                        source,
                        ..Default::default()
                    },
                }),
            },
        )
    }

    #[tokio::test]
    async fn injected_identity_rejected_for_upbound() {
        // The kubeconfig itself resolves via the environment.
        unsafe { std::env::set_var("TEST_PROVIDER_KUBECONFIG", KUBECONFIG) };
        let local = Client::try_from(Config::new("http://127.0.0.1:8080".parse().unwrap()))
            .expect("offline client");
        let pc = pc_with_identity(
            IdentityType::UpboundTokens,
            CredentialsSource::InjectedIdentity,
        );
        let err = remote_cluster_for(&local, &pc, &IdentityRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn unregistered_identity_type_is_config_error() {
        unsafe { std::env::set_var("TEST_PROVIDER_KUBECONFIG", KUBECONFIG) };
        let local = Client::try_from(Config::new("http://127.0.0.1:8080".parse().unwrap()))
            .expect("offline client");
        let pc = pc_with_identity(
            IdentityType::GoogleApplicationCredentials,
            CredentialsSource::None,
        );
        let err = remote_cluster_for(&local, &pc, &IdentityRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    struct StaticToken;
    impl IdentityBinder for StaticToken {
        fn bind<'a>(
            &'a self,
            config: &'a mut Config,
            _creds: Option<&'a [u8]>,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                config.auth_info.token = Some("overlay".to_string().into());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn identity_binder_mutates_config() {
        unsafe { std::env::set_var("TEST_PROVIDER_KUBECONFIG", KUBECONFIG) };
        let local = Client::try_from(Config::new("http://127.0.0.1:8080".parse().unwrap()))
            .expect("offline client");
        let pc = pc_with_identity(
            IdentityType::GoogleApplicationCredentials,
            CredentialsSource::None,
        );
        let reg = IdentityRegistry::new(HashMap::from([(
            IdentityType::GoogleApplicationCredentials,
            Arc::new(StaticToken) as Arc<dyn IdentityBinder>,
        )]));
        let rc = remote_cluster_for(&local, &pc, &reg).await.unwrap();
        assert!(rc.config.auth_info.token.is_some());
    }
}
