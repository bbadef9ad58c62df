//! Module `v1alpha1` implements the v1alpha1 provider CRD API.
use k8s_openapi::{
    apimachinery::pkg::apis::meta::{self, v1::Condition},
    apimachinery::pkg::runtime::RawExtension,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

pub use crate::{ProviderConfigReference, SecretKeySelector, SecretReference};

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ObjectSpec describes an object on a remote cluster and how to manage it.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema,
)]
#[kube(
    group = "kubernetes.provider.dev",
    version = "v1alpha1",
    kind = "Object",
    status = "ObjectStatus",
    shortname = "kobj",
    category = "provider",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.forProvider.manifest.kind"}"#,
    printcolumn = r#"{"name":"ProviderConfig","type":"string","jsonPath":".spec.providerConfigRef.name"}"#,
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpec {
    /// ProviderConfigRef names the ProviderConfig addressing the remote cluster.
    pub provider_config_ref: ProviderConfigReference,

    /// ForProvider carries the embedded manifest.
    pub for_provider: ObjectParameters,

    /// References declares other Objects this one depends on or patches from.
    ///
    /// References are resolved in order, before the manifest is applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,

    /// ManagementPolicies restricts the operations performed on the remote
    /// object.
    #[serde(default, skip_serializing_if = "ManagementPolicies::is_empty")]
    pub management_policies: ManagementPolicies,

    /// Readiness selects how the Ready condition is derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,

    /// ConnectionDetails extracts credential-like fields into the connection
    /// secret.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_details: Vec<ConnectionDetail>,

    /// Watch requests a live watch on the remote object instead of relying on
    /// polling alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,

    /// WriteConnectionSecretToRef names the local Secret that receives the
    /// extracted connection details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretReference>,
}

/// ObjectParameters wraps the embedded manifest.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectParameters {
    /// Manifest is the raw Kubernetes object to reconcile onto the remote
    /// cluster.
    ///
    /// `kind` must be present. If `metadata.name` is empty it defaults to the
    /// Object's own name.
    pub manifest: RawExtension,
}

/// ObjectStatus describes the observed state of an Object.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    /// Conditions reports k8s-style conditions, notably Synced and Ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// AtProvider mirrors the most recently observed remote manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_provider: Option<ObjectObservation>,

    /// ObservedGeneration is the generation most recently reconciled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// ObjectObservation is the observed remote manifest.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectObservation {
    /// Manifest is the remote object as last observed, possibly redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<RawExtension>,
}

/// Reference declares a relationship to another Object on the local cluster.
///
/// Exactly one of `dependsOn` and `patchesFrom` must be set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// DependsOn only orders deletion; the target must exist for this Object
    /// to sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    /// PatchesFrom additionally copies a field from the target into this
    /// Object before apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches_from: Option<PatchesFrom>,
}

impl Reference {
    /// Target returns the normalized referent, whichever arm is set.
    pub fn target(&self) -> Option<ReferenceTarget<'_>> {
        if let Some(p) = &self.patches_from {
            return Some(ReferenceTarget {
                api_version: p.api_version.as_deref(),
                kind: p.kind.as_deref(),
                name: &p.name,
                namespace: p.namespace.as_deref(),
                field_path: p.field_path.as_deref(),
            });
        }
        self.depends_on.as_ref().map(|d| ReferenceTarget {
            api_version: d.api_version.as_deref(),
            kind: d.kind.as_deref(),
            name: &d.name,
            namespace: d.namespace.as_deref(),
            field_path: None,
        })
    }
}

/// ReferenceTarget is a borrowed view over either reference arm.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceTarget<'a> {
    /// APIVersion of the referent; defaults to this group's Object.
    pub api_version: Option<&'a str>,
    /// Kind of the referent; defaults to Object.
    pub kind: Option<&'a str>,
    /// Name of the referent.
    pub name: &'a str,
    /// Namespace of the referent, for namespaced referents.
    pub namespace: Option<&'a str>,
    /// FieldPath to copy, for patching references.
    pub field_path: Option<&'a str>,
}

/// DependsOn names an object whose lifetime this Object depends on.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependsOn {
    /// APIVersion of the referent. Defaults to this group's Object version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referent. Defaults to Object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the referent.
    pub name: String,
    /// Namespace of the referent, for namespaced referents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// PatchesFrom names an object and a field to copy into this Object's
/// manifest.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchesFrom {
    /// APIVersion of the referent. Defaults to this group's Object version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referent. Defaults to Object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the referent.
    pub name: String,
    /// Namespace of the referent, for namespaced referents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// FieldPath is the path of the field to copy, read from the referent and
    /// written at the same path on this Object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

/// ManagementPolicy is one permitted operation on the remote object.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub enum ManagementPolicy {
    /// Observe permits reading the remote object.
    Observe,
    /// Create permits creating the remote object when absent.
    Create,
    /// Update permits applying the manifest when drift is detected.
    Update,
    /// Delete permits deleting the remote object with the Object.
    Delete,
    /// All is shorthand for the full set.
    #[serde(rename = "*")]
    All,
}

/// ManagementPolicies is the set of permitted operations.
///
/// An empty set is equivalent to `[All]`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct ManagementPolicies(pub Vec<ManagementPolicy>);

impl ManagementPolicies {
    /// Is_empty reports whether no policy is spelled out.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Allows reports whether the set permits the given operation.
    pub fn allows(&self, p: ManagementPolicy) -> bool {
        self.0.is_empty()
            || self.0.contains(&ManagementPolicy::All)
            || self.0.contains(&p)
    }

    /// All constructs the full set.
    pub fn all() -> Self {
        Self(vec![ManagementPolicy::All])
    }
}

/// Readiness configures how the Ready condition is derived.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// Policy selects the derivation.
    #[serde(default)]
    pub policy: ReadinessPolicy,
    /// CelQuery is the CEL program for the DeriveFromCelQuery policy. The
    /// variable `object` is bound to the observed remote object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cel_query: Option<String>,
}

/// ReadinessPolicy selects how Ready is computed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub enum ReadinessPolicy {
    /// Ready as soon as the remote object is observed.
    #[default]
    SuccessfulCreate,
    /// Ready iff the remote object's own Ready condition is True.
    DeriveFromObject,
    /// Ready iff the remote object has conditions and all are True.
    AllTrue,
    /// Ready iff the CEL query evaluates to boolean true.
    DeriveFromCelQuery,
}

/// ConnectionDetail extracts one field into the connection secret.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetail {
    /// APIVersion of the source object on the local cluster.
    pub api_version: String,
    /// Kind of the source object.
    pub kind: String,
    /// Name of the source object.
    pub name: String,
    /// Namespace of the source object, for namespaced sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// FieldPath is the path of the value to extract.
    pub field_path: String,
    /// ToConnectionSecretKey is the key the value is stored under.
    pub to_connection_secret_key: String,
}

/// ProviderConfigSpec addresses a remote cluster.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema,
)]
#[kube(
    group = "kubernetes.provider.dev",
    version = "v1alpha1",
    kind = "ProviderConfig",
    status = "ProviderConfigStatus",
    shortname = "pc",
    category = "provider",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.credentials.source"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Credentials locates the kubeconfig (or equivalent) for the remote
    /// cluster.
    pub credentials: ProviderCredentials,
    /// Identity optionally overlays a cloud identity on the connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

/// ProviderConfigStatus is the observed state of a ProviderConfig.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigStatus {
    /// Conditions reports k8s-style conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Users counts the resources currently using this config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<i64>,
}

/// ProviderCredentials locates credentials for a remote cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    /// Source selects where the credentials come from.
    #[serde(default)]
    pub source: CredentialsSource,
    /// SecretRef selects the Secret key for the Secret source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
    /// Env selects the environment variable for the Environment source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvSelector>,
    /// Fs selects the file path for the Filesystem source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsSelector>,
}

/// EnvSelector names an environment variable of the provider process.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvSelector {
    /// Name of the environment variable.
    pub name: String,
}

/// FsSelector names a path on the provider's filesystem.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FsSelector {
    /// Path of the credentials file.
    pub path: String,
}

/// CredentialsSource selects where credentials come from.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub enum CredentialsSource {
    /// No credentials.
    #[default]
    None,
    /// A key of a Secret on the local cluster.
    Secret,
    /// The provider pod's service account token.
    ServiceAccount,
    /// The in-cluster environment of the provider pod.
    InjectedIdentity,
    /// An environment variable of the provider process.
    Environment,
    /// A file on the provider's filesystem.
    Filesystem,
}

/// Identity overlays a cloud identity onto the remote connection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Type selects the identity flavor.
    #[serde(rename = "type")]
    pub type_: IdentityType,
    /// Credentials for the identity itself.
    #[serde(flatten)]
    pub credentials: ProviderCredentials,
}

/// IdentityType enumerates the supported identity overlays.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, JsonSchema)]
pub enum IdentityType {
    /// Google application-default or supplied JSON credentials.
    GoogleApplicationCredentials,
    /// Azure service principal via exec plugin.
    AzureServicePrincipalCredentials,
    /// Azure workload identity via federated token file.
    AzureWorkloadIdentityCredentials,
    /// AWS web identity with presigned STS tokens.
    AWSWebIdentityCredentials,
    /// Upbound session tokens exchanged from an org token.
    UpboundTokens,
}

impl IdentityType {
    /// Requires_explicit_credentials reports whether the overlay rejects the
    /// InjectedIdentity source.
    pub fn requires_explicit_credentials(&self) -> bool {
        matches!(
            self,
            IdentityType::AzureServicePrincipalCredentials
                | IdentityType::AzureWorkloadIdentityCredentials
                | IdentityType::UpboundTokens
        )
    }
}

/// ProviderConfigUsageSpec records one resource using a ProviderConfig.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema,
)]
#[kube(
    group = "kubernetes.provider.dev",
    version = "v1alpha1",
    kind = "ProviderConfigUsage",
    shortname = "pcu",
    category = "provider",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"ProviderConfig","type":"string","jsonPath":".spec.providerConfigRef.name"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resourceRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigUsageSpec {
    /// ProviderConfigRef names the config in use.
    pub provider_config_ref: ProviderConfigReference,
    /// ResourceRef names the resource using it.
    pub resource_ref: TypedReference,
}

/// TypedReference names an arbitrary cluster-scoped resource.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    /// APIVersion of the referent.
    pub api_version: String,
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
    /// UID of the referent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// ObservedObjectCollectionSpec selects remote objects to observe.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema,
)]
#[kube(
    group = "kubernetes.provider.dev",
    version = "v1alpha1",
    kind = "ObservedObjectCollection",
    status = "ObservedObjectCollectionStatus",
    shortname = "ooc",
    category = "provider",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.observeObjects.kind"}"#,
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObjectCollectionSpec {
    /// ObserveObjects selects the remote objects to materialize.
    pub observe_objects: ObserveObjectCriteria,
    /// ProviderConfigRef names the ProviderConfig addressing the remote
    /// cluster.
    pub provider_config_ref: ProviderConfigReference,
    /// Template is applied to every materialized child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<ObservedObjectTemplate>,
}

/// ObserveObjectCriteria is the remote selector.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObserveObjectCriteria {
    /// APIVersion of the remote objects.
    pub api_version: String,
    /// Kind of the remote objects.
    pub kind: String,
    /// Namespace to list in, for namespaced kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Selector matches remote objects by label.
    pub selector: meta::v1::LabelSelector,
}

/// ObservedObjectTemplate is metadata stamped onto materialized children.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObjectTemplate {
    /// Metadata to merge into each child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObservedObjectTemplateMetadata>,
}

/// ObservedObjectTemplateMetadata is the mergeable subset of child metadata.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObjectTemplateMetadata {
    /// Labels added to each child.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
    /// Annotations added to each child.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// ObservedObjectCollectionStatus is the observed state of a collection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObjectCollectionStatus {
    /// Conditions reports k8s-style conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// MembershipLabel is the label selecting this collection's children on
    /// the local cluster.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub membership_label: std::collections::BTreeMap<String, String>,
    /// Members lists the names of the materialized children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// ConditionedStatus is common helpers for dealing with status conditions.
pub trait ConditionedStatus {
    /// Get_conditions returns the condition list.
    fn get_conditions(&self) -> &Vec<Condition>;
    /// Set_conditions replaces the condition list.
    fn set_conditions(&mut self, cnd: Vec<Condition>);

    /// Add_condition adds a Condition, ensuring the list is deduplicated by
    /// type.
    fn add_condition(&mut self, cnd: Condition) {
        let mut found = false;
        let mut out: Vec<Condition> = self
            .get_conditions()
            .iter()
            .map(|c| {
                if c.type_ == cnd.type_ {
                    found = true;
                    &cnd
                } else {
                    c
                }
            })
            .cloned()
            .collect();
        if !found {
            out.push(cnd);
        }
        out.sort_unstable_by_key(|c| c.type_.clone());
        self.set_conditions(out);
    }

    /// Condition returns the condition of the given type, if present.
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.get_conditions().iter().find(|c| c.type_ == type_)
    }

    /// Remove_condition drops the condition of the given type.
    fn remove_condition(&mut self, type_: &str) {
        let out = self
            .get_conditions()
            .iter()
            .filter(|c| c.type_ != type_)
            .cloned()
            .collect();
        self.set_conditions(out);
    }
}

macro_rules! impl_conditioned {
    ($($status:ty),+ $(,)?) => {
        $(
        impl ConditionedStatus for $status {
            fn get_conditions(&self) -> &Vec<Condition> {
                &self.conditions
            }
            fn set_conditions(&mut self, cnd: Vec<Condition>) {
                self.conditions = cnd;
            }
        }
        )+
    };
}
impl_conditioned!(
    ObjectStatus,
    ProviderConfigStatus,
    ObservedObjectCollectionStatus,
);

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Object({})",
            self.metadata.uid.as_deref().unwrap_or("<>"),
        ))
    }
}
