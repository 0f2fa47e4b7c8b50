//! Custom resources read and written by the operator.
//!
//! [`BoshDeployment`] is the user-facing resource. [`SecretRequest`] is the request object of the
//! secret generation subsystem: this operator only issues and updates requests, the values are
//! generated elsewhere.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "bosh.stackable.tech",
    version = "v1alpha1",
    kind = "BoshDeployment",
    plural = "boshdeployments",
    shortname = "bdpl",
    status = "BoshDeploymentStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BoshDeploymentSpec {
    /// The base manifest.
    pub manifest: ResourceReference,

    /// Ops files applied to the base manifest, in order.
    #[serde(default)]
    pub ops: Vec<ResourceReference>,

    /// User-provided values for manifest variables. A variable listed here is never generated.
    #[serde(default)]
    pub vars: Vec<VariableReference>,
}

/// Points at a manifest or ops file.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    /// The object name, the URL, or for [`ReferenceType::Inline`] the content itself.
    pub name: String,

    #[serde(rename = "type")]
    pub type_: ReferenceType,

    /// The data key to read from a config map or secret. Defaults to `manifest` for the base
    /// manifest and `ops` for ops files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReferenceType {
    Inline,
    #[serde(rename = "configmap")]
    #[strum(serialize = "configmap")]
    ConfigMap,
    Secret,
    Url,
}

/// A user-provided value for the manifest variable `name`, read from the secret `secret`.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableReference {
    pub name: String,
    pub secret: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoshDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeploymentState>,

    #[serde(default)]
    pub total_job_count: i32,

    #[serde(default)]
    pub completed_job_count: i32,

    #[serde(default)]
    pub total_instance_groups: i32,

    #[serde(default)]
    pub deployed_instance_groups: i32,

    /// When `state` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_timestamp: Option<Time>,
}

/// The lifecycle state of a [`BoshDeployment`].
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
pub enum DeploymentState {
    /// The deployment was seen for the first time and its manifest is being resolved.
    Creating,

    /// A new manifest version was resolved for an existing deployment.
    Updating,

    /// Neither all jobs completed nor all instance groups are deployed.
    Resolving,

    /// Exactly one of jobs and instance groups is done.
    Converting,

    /// All jobs completed and all instance groups are deployed.
    Deployed,
}

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "bosh.stackable.tech",
    version = "v1alpha1",
    kind = "SecretRequest",
    plural = "secretrequests",
    status = "SecretRequestStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecretRequestSpec {
    #[serde(rename = "type")]
    pub type_: SecretType,

    /// The secret the generated value is written to.
    pub secret_name: String,

    #[serde(default)]
    pub request: GenerationRequest,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SecretType {
    Password,
    Certificate,
    Ssh,
    Rsa,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRequest>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    #[serde(default)]
    pub common_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,

    #[serde(default)]
    pub is_ca: bool,

    /// Key `certificate` of this secret signs the certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_ref: Option<SecretKeyReference>,

    /// Key `private_key` of this secret is the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_ref: Option<SecretKeyReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_key_usage: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<bool>,
}
