//! Well-known label and annotation keys used on every object this operator reads or writes.

use std::collections::BTreeMap;

use const_format::concatcp;

/// The API group of the custom resources and the prefix of all operator-specific keys.
pub const GROUP: &str = "bosh.stackable.tech";

const KEY_PREFIX: &str = concatcp!(GROUP, "/");

/// The well-known Kubernetes app managed-by key `app.kubernetes.io/managed-by`.
pub const K8S_APP_MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";

/// The value of [`K8S_APP_MANAGED_BY_KEY`] on every object created by this operator.
pub const MANAGED_BY_VALUE: &str = "bosh-operator";

/// Names the deployment an object belongs to. This is the ownership label the status
/// aggregator and the orphan cleanup list children by.
pub const DEPLOYMENT_NAME_KEY: &str = concatcp!(KEY_PREFIX, "deployment-name");

/// The artifact family type, e.g. `with-ops` or `bpm`.
pub const ARTIFACT_TYPE_KEY: &str = concatcp!(KEY_PREFIX, "artifact-type");

/// The artifact version, a positive integer rendered in decimal.
pub const ARTIFACT_VERSION_KEY: &str = concatcp!(KEY_PREFIX, "artifact-version");

/// The instance group a child object or an instance-group scoped artifact belongs to.
pub const INSTANCE_GROUP_KEY: &str = concatcp!(KEY_PREFIX, "instance-group");

/// The manifest variable a secret generation request was issued for.
pub const VARIABLE_NAME_KEY: &str = concatcp!(KEY_PREFIX, "variable-name");

/// Marks rendering jobs so that they can be told apart from errand jobs.
pub const JOB_ROLE_KEY: &str = concatcp!(KEY_PREFIX, "job-role");

/// Meltdown bookkeeping: the RFC 3339 timestamp at which the current reconcile cycle started.
pub const RECONCILE_START_ANNOTATION: &str = concatcp!(KEY_PREFIX, "reconcile-start");

/// Link provider metadata on secrets and services, a JSON object `{"name": …, "type": …}`.
pub const LINK_PROVIDES_ANNOTATION: &str = concatcp!(KEY_PREFIX, "provides");

/// Digest over every config object a workload set references.
pub const CONFIG_DIGEST_ANNOTATION: &str = concatcp!(KEY_PREFIX, "config-sha256");

/// Digest over the spec an object was last applied with.
pub const SPEC_DIGEST_ANNOTATION: &str = concatcp!(KEY_PREFIX, "spec-sha256");

/// Labels put on every child of the deployment `deployment_name`.
pub fn deployment_labels(deployment_name: &str) -> BTreeMap<String, String> {
    [
        (K8S_APP_MANAGED_BY_KEY.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (DEPLOYMENT_NAME_KEY.to_owned(), deployment_name.to_owned()),
    ]
    .into()
}

/// Labels put on every child belonging to one instance group of a deployment.
pub fn instance_group_labels(
    deployment_name: &str,
    instance_group: &str,
) -> BTreeMap<String, String> {
    let mut labels = deployment_labels(deployment_name);
    labels.insert(INSTANCE_GROUP_KEY.to_owned(), instance_group.to_owned());
    labels
}
