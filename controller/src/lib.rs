#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the provider binary and the
//! controller functions themselves.

use std::{env, sync::LazyLock};

use k8s_openapi::{apimachinery::pkg::apis::meta, jiff::Timestamp};
use kube::runtime::events;
use tokio::time::Duration;

/// Prelude is the common types for CRD controllers.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, sync::Arc};

    pub use futures::prelude::*;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::{self, v1::Condition};
    pub use kube::{
        self,
        api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
        core::{ApiResource, DynamicObject, GroupVersionKind},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1::{self, ConditionedStatus};

    pub use super::{now, provider_label, Context, ControllerFuture, Error, Options, Result};
    pub use super::{CONTROLLER_NAME, PATCH_PARAMS};
}

pub mod clients;
pub mod collections;
pub mod index;
pub mod informers;
pub mod manifest;
pub mod objects;
pub mod openapi;
pub mod providerconfigs;
pub mod references;
pub mod syncer;
pub mod webhook;

mod managed_fields;
mod metrics;

#[cfg(test)]
pub(crate) mod testing;

// NB The docs are unclear, but backtraces are unsupported on stable.
/// Error is the combined error type for all controllers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate, talking to the local
    /// cluster.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Kubeconfig indicates a kubeconfig could not be loaded or synthesized
    /// into a client config.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// InCluster indicates the in-cluster config was requested but
    /// unavailable.
    #[error("in-cluster config error: {0}")]
    InCluster(#[from] kube::config::InClusterError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// AddrParse indicates the provided string failed to parse into an
    /// address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Finalizer indicates the finalizer machinery failed around a reconcile.
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// Config indicates malformed provider inputs: a bad selector, an unknown
    /// identity type, a missing current context.
    #[error("provider config error: {0}")]
    Config(String),
    /// Credential indicates credentials could not be extracted or were
    /// rejected.
    #[error("credentials error: {0}")]
    Credential(String),
    /// Manifest indicates the embedded manifest is absent-kind or not
    /// parseable.
    #[error("manifest error: {0}")]
    Manifest(String),
    /// Reference indicates a reference target is missing or its field path is
    /// invalid.
    #[error("reference error: {0}")]
    Reference(String),
    /// RemoteApi is any non-NotFound failure from the remote Kubernetes API.
    #[error("remote api error: {0}")]
    RemoteApi(#[source] kube::Error),
    /// Readiness indicates readiness evaluation failed.
    #[error("readiness error: {0}")]
    Readiness(String),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Not_found reports whether a kube error is the apiserver saying 404.
pub fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Conflict reports whether a kube error is the apiserver saying 409.
pub fn conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Options carries the provider-wide settings resolved from the CLI.
#[derive(Clone, Debug)]
pub struct Options {
    /// Poll is the steady-state requeue interval.
    pub poll: Duration,
    /// Poll_jitter_percentage spreads poll requeues, 0-99.
    pub poll_jitter_percentage: u8,
    /// Max_reconcile_rate bounds reconcile-worker parallelism.
    pub max_reconcile_rate: u16,
    /// Enable_management_policies honors multi-action policy sets.
    pub enable_management_policies: bool,
    /// Sanitize_secrets redacts Secret data mirrored into status.
    pub sanitize_secrets: bool,
    /// Server_side_apply selects the SSA syncer over the last-applied one.
    pub server_side_apply: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            poll: Duration::from_secs(10 * 60),
            poll_jitter_percentage: 10,
            max_reconcile_rate: 10,
            enable_management_policies: true,
            sanitize_secrets: false,
            server_side_apply: true,
        }
    }
}

impl Options {
    /// Poll_with_jitter returns the poll interval with the configured jitter
    /// applied.
    pub fn poll_with_jitter(&self) -> Duration {
        jittered(self.poll, self.poll_jitter_percentage)
    }
}

/// Jittered spreads `base` by up to ±`percentage` percent.
pub(crate) fn jittered(base: Duration, percentage: u8) -> Duration {
    use rand::Rng;
    if percentage == 0 {
        return base;
    }
    let spread = base.as_millis().saturating_mul(u128::from(percentage)) / 100;
    let spread = u64::try_from(spread).unwrap_or(u64::MAX / 2);
    let offset = rand::rng().random_range(0..=spread.saturating_mul(2));
    let low = base.as_millis() as u64;
    Duration::from_millis(low.saturating_sub(spread).saturating_add(offset))
}

/// Context is common context for controllers.
pub struct Context {
    /// Client is a k8s client for the local cluster. This should only ever be
    /// `clone()`'d out of the Context.
    pub client: kube::Client,
    /// Recorder publishes Kubernetes events.
    pub recorder: events::Recorder,
    /// Options are the provider-wide settings.
    pub options: Options,
    /// Informers is the dynamic informer manager for remote watches.
    pub informers: std::sync::Arc<informers::InformerManager>,
    /// Syncer is the construction-time choice of sync strategy.
    pub syncer: std::sync::Arc<syncer::Syncer>,
    /// Identity is the registry of identity-overlay binders.
    pub identity: clients::IdentityRegistry,
}

impl Context {
    /// New builds a Context around a local client.
    pub fn new(client: kube::Client, options: Options) -> Context {
        let recorder = events::Recorder::new(client.clone(), REPORTER.clone());
        let strategy = if options.server_side_apply {
            syncer::Strategy::ServerSideApply
        } else {
            syncer::Strategy::LastApplied
        };
        Context {
            client,
            recorder,
            options,
            informers: std::sync::Arc::new(informers::InformerManager::default()),
            syncer: std::sync::Arc::new(syncer::Syncer::new(strategy)),
            identity: clients::IdentityRegistry::default(),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// Now reports the current time as a Kubernetes Time.
pub fn now() -> meta::v1::Time {
    meta::v1::Time(Timestamp::now())
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Provider_label returns the provided argument as a name in the provider's
/// space, suitable for use as an annotation or label.
pub fn provider_label<S: AsRef<str>>(s: S) -> String {
    keyify(format!("{}/", api::GROUP), s)
}

/// PAUSED_ANNOTATION marks an Object as paused; a paused Object is not
/// reconciled until the annotation is removed.
pub static PAUSED_ANNOTATION: LazyLock<String> = LazyLock::new(|| provider_label("paused"));

/// COLLECTION_LABEL is the membership label placed on collection children.
pub static COLLECTION_LABEL: LazyLock<String> =
    LazyLock::new(|| provider_label("owned-by-collection"));

/// OBJECT_FINALIZER is placed on every managed Object.
pub const OBJECT_FINALIZER: &str = "objects.kubernetes.provider.dev";

/// REF_FINALIZER_PREFIX prefixes the per-UID finalizer placed on reference
/// targets; the source Object's UID is appended.
pub const REF_FINALIZER_PREFIX: &str = "kubernetes.provider.dev/referred-by-object-";

/// PC_IN_USE_FINALIZER blocks ProviderConfig deletion while usages exist.
pub const PC_IN_USE_FINALIZER: &str = "in-use.kubernetes.provider.dev";

/// LAST_APPLIED_ANNOTATION stores the raw manifest bytes exactly as supplied.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Field_manager is the per-Object field manager used for server-side apply
/// against the remote cluster.
pub fn field_manager(name: &str) -> String {
    format!("{CONTROLLER_NAME}/{name}")
}

/// PATCH_PARAMS is default patch parameters for local-cluster writes.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// READY_FALSE_POLL is the shortened requeue used while an Object is not
/// Ready.
pub const READY_FALSE_POLL: Duration = Duration::from_secs(30);

/// CONTROLLER_NAME is the name the provider uses whenever it needs a
/// human-readable name.
pub const CONTROLLER_NAME: &str = "provider-kubernetes";

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn provider_label_keyifies() {
        assert_eq!(
            provider_label("Owned By_Collection"),
            "kubernetes.provider.dev/owned-by-collection"
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let base = Duration::from_secs(600);
        for _ in 0..100 {
            let d = jittered(base, 10);
            assert!(d >= Duration::from_secs(540), "{d:?}");
            assert!(d <= Duration::from_secs(660), "{d:?}");
        }
        assert_eq!(jittered(base, 0), base);
    }

    #[test]
    fn field_manager_is_per_object() {
        assert_eq!(field_manager("cs"), "provider-kubernetes/cs");
    }
}
