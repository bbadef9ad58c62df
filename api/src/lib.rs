#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the versions of the provider CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

pub mod v1alpha1;

/// GROUP is the kubernetes API group.
pub static GROUP: &str = "kubernetes.provider.dev";

/// ProviderConfigReference names the ProviderConfig a resource connects through.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigReference {
    /// Name of the referenced ProviderConfig.
    pub name: String,
}

/// SecretReference locates a Secret in some namespace.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret.
    pub name: String,
    /// Namespace holding the Secret.
    pub namespace: String,
}

/// SecretKeySelector locates one key of a Secret in some namespace.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Name of the Secret.
    pub name: String,
    /// Namespace holding the Secret.
    pub namespace: String,
    /// The key to select.
    pub key: String,
}
