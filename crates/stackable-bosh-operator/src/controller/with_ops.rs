//! The ops-applier: turns a [`BoshDeployment`] into its with-ops manifest artifact.
//!
//! Every reconcile resolves the manifest from scratch. The base manifest gets its ops files
//! applied and consumed links merged in, then the result is written as the next with-ops version
//! unless it is identical to the latest one. Secret generation requests are refreshed and
//! workload sets of instance groups that left the manifest are deleted.

use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::{
    api::{apps::v1::StatefulSet, core::v1::Service},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kube::{Resource, ResourceExt, core::Selector, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{Context, variables};
use crate::{
    artifact::{self, ArtifactKind, ArtifactType, Created},
    client::Client,
    crd::{BoshDeployment, DeploymentState},
    kvp::{DEPLOYMENT_NAME_KEY, INSTANCE_GROUP_KEY},
    links::{self, LinkResolver},
    manifest::{self, Manifest},
    reconcile::{ErrorClass, ReconcilerError},
    resolver::{self, ReferenceResolver, WithOpsResolver},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "with-ops";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("deployment {name} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("failed to update the status of deployment {name:?}"))]
    UpdateStatus { source: StoreError, name: String },

    #[snafu(display("failed to resolve the manifest of deployment {name:?}"))]
    ResolveManifest {
        source: resolver::Error,
        name: String,
    },

    #[snafu(display("failed to resolve the links of deployment {name:?}"))]
    ResolveLinks { source: links::Error, name: String },

    #[snafu(display("failed to serialize the manifest of deployment {name:?}"))]
    SerializeManifest {
        source: manifest::Error,
        name: String,
    },

    #[snafu(display("failed to write the with-ops artifact of deployment {name:?}"))]
    WriteArtifact {
        source: artifact::Error,
        name: String,
    },

    #[snafu(display("failed to issue secret generation requests"))]
    IssueSecretRequests { source: variables::Error },

    #[snafu(display("failed to list the workload sets of deployment {name:?}"))]
    ListWorkloadSets { source: StoreError, name: String },

    #[snafu(display("failed to delete orphaned {kind} {object}"))]
    DeleteOrphan {
        source: StoreError,
        kind: &'static str,
        object: String,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ResolveManifest { source, .. } => source.class(),
            Self::ResolveLinks { source, .. } => source.class(),
            Self::WriteArtifact { source, .. } => source.class(),
            Self::IssueSecretRequests { source } => source.class(),
            Self::UpdateStatus { source, .. }
            | Self::ListWorkloadSets { source, .. }
            | Self::DeleteOrphan { source, .. } => source.class(),
            Self::ObjectHasNoNamespace { .. }
            | Self::MissingOwner { .. }
            | Self::SerializeManifest { .. } => ErrorClass::Fatal,
        }
    }
}

async fn set_state(
    client: &Client,
    deployment: &BoshDeployment,
    state: DeploymentState,
) -> Result<BoshDeployment> {
    let mut updated = deployment.clone();
    let status = updated.status.get_or_insert_with(Default::default);
    status.state = Some(state);
    status.state_timestamp = Some(Time(Utc::now()));
    let updated = client
        .update_status(&updated)
        .await
        .context(UpdateStatusSnafu {
            name: deployment.name_any(),
        })?;
    tracing::info!(deployment = %deployment.name_any(), %state, "Deployment state changed");
    Ok(updated)
}

/// Deletes the workload sets and services of instance groups `manifest` no longer declares.
///
/// Returns the names of the removed instance groups.
pub async fn delete_orphans(
    client: &Client,
    deployment: &str,
    namespace: &str,
    manifest: &Manifest,
) -> Result<BTreeSet<String>> {
    let declared: BTreeSet<&str> = manifest
        .instance_groups
        .iter()
        .map(|group| group.name.as_str())
        .collect();
    let selector = Selector::from_iter([(DEPLOYMENT_NAME_KEY.to_owned(), deployment.to_owned())]);
    let is_orphan = |labels: &std::collections::BTreeMap<String, String>| {
        labels
            .get(INSTANCE_GROUP_KEY)
            .filter(|group| !declared.contains(group.as_str()))
            .cloned()
    };

    let mut removed = BTreeSet::new();
    let stateful_sets = client
        .list_with_label_selector::<StatefulSet>(namespace, &selector)
        .await
        .context(ListWorkloadSetsSnafu { name: deployment })?;
    let orphaned_sets: Vec<_> = stateful_sets
        .iter()
        .filter_map(|set| Some((is_orphan(set.labels())?, set)))
        .collect();
    for (group, set) in orphaned_sets {
        client.delete(set).await.context(DeleteOrphanSnafu {
            kind: "StatefulSet",
            object: set.name_any(),
        })?;
        tracing::info!(
            stateful_set = %set.name_any(),
            instance_group = %group,
            "Deleted orphaned workload set"
        );
        removed.insert(group);
    }

    let services = client
        .list_with_label_selector::<Service>(namespace, &selector)
        .await
        .context(ListWorkloadSetsSnafu { name: deployment })?;
    let orphaned_services: Vec<_> = services
        .iter()
        .filter_map(|service| Some((is_orphan(service.labels())?, service)))
        .collect();
    for (group, service) in orphaned_services {
        client.delete(service).await.context(DeleteOrphanSnafu {
            kind: "Service",
            object: service.name_any(),
        })?;
        tracing::debug!(service = %service.name_any(), "Deleted orphaned service");
        removed.insert(group);
    }
    Ok(removed)
}

#[tracing::instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(deployment: Arc<BoshDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let name = deployment.name_any();
    let namespace = deployment
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    let owner = deployment
        .controller_owner_ref(&())
        .context(MissingOwnerSnafu { name: &name })?;

    let previous_state = deployment.status.as_ref().and_then(|status| status.state);
    let mut deployment = (*deployment).clone();
    if previous_state.is_none() {
        deployment = set_state(&ctx.client, &deployment, DeploymentState::Creating).await?;
    }

    let resolver = WithOpsResolver::new(ReferenceResolver::new(ctx.client.clone()));
    let resolved = resolver
        .resolve(&name, &deployment.spec, &namespace)
        .await
        .context(ResolveManifestSnafu { name: &name })?;
    for warning in &resolved.warnings {
        tracing::warn!(deployment = %name, %warning, "Manifest resolved with a warning");
    }
    let mut manifest = resolved.manifest;

    let (links, link_infos) = LinkResolver::new(ctx.client.clone(), &ctx.config.cluster_domain)
        .resolve(&manifest, &namespace)
        .await
        .context(ResolveLinksSnafu { name: &name })?;
    for info in &link_infos {
        tracing::debug!(
            provider = %info.provider,
            secret = %info.secret_name,
            service = ?info.service_name,
            "Resolved link"
        );
    }
    links::merge(&mut manifest, &links).context(ResolveLinksSnafu { name: &name })?;

    let payload = manifest
        .marshal()
        .context(SerializeManifestSnafu { name: &name })?;
    let created = artifact::create(
        &ctx.client,
        &namespace,
        owner.clone(),
        &name,
        &ArtifactType::new(ArtifactKind::WithOps),
        &payload,
        Default::default(),
    )
    .await
    .context(WriteArtifactSnafu { name: &name })?;
    if matches!(created, Created::New(_)) && previous_state.is_some() {
        set_state(&ctx.client, &deployment, DeploymentState::Updating).await?;
    }

    let requests = variables::secret_requests(
        &name,
        &namespace,
        &manifest,
        &variables::user_provided(&deployment),
        &owner,
    )
    .context(IssueSecretRequestsSnafu)?;
    variables::apply_secret_requests(&ctx.client, requests)
        .await
        .context(IssueSecretRequestsSnafu)?;

    delete_orphans(&ctx.client, &name, &namespace, &manifest).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::{
        controller::OperatorConfig,
        crd::{BoshDeploymentSpec, ReferenceType, ResourceReference, SecretRequest},
        kvp::instance_group_labels,
    };

    const MANIFEST: &str = indoc! {"
        name: nats
        instance_groups:
          - name: nats
            instances: 2
            jobs:
              - name: nats
                release: nats
                properties:
                  password: ((nats_password))
        variables:
          - name: nats_password
            type: password
    "};

    async fn deployment(client: &Client, manifest: &str) -> BoshDeployment {
        client
            .create(&BoshDeployment {
                metadata: ObjectMeta {
                    name: Some("nats".to_owned()),
                    namespace: Some("default".to_owned()),
                    ..ObjectMeta::default()
                },
                spec: BoshDeploymentSpec {
                    manifest: ResourceReference {
                        name: manifest.to_owned(),
                        type_: ReferenceType::Inline,
                        key: None,
                    },
                    ops: Vec::new(),
                    vars: Vec::new(),
                },
                status: None,
            })
            .await
            .expect("deployment is created")
    }

    fn context(client: &Client) -> Arc<Context> {
        Arc::new(Context::new(client.clone(), OperatorConfig::default()))
    }

    async fn with_ops_versions(client: &Client) -> Vec<u64> {
        let mut versions: Vec<_> = client
            .list::<Secret>("default")
            .await
            .expect("secrets are listed")
            .iter()
            .filter(|secret| {
                secret.labels().get(crate::kvp::ARTIFACT_TYPE_KEY).map(String::as_str)
                    == Some("with-ops")
            })
            .filter_map(artifact::version_of)
            .collect();
        versions.sort_unstable();
        versions
    }

    #[tokio::test]
    async fn first_reconcile_writes_the_artifact_and_requests() {
        let (client, _) = Client::in_memory();
        let deployment = deployment(&client, MANIFEST).await;

        reconcile(Arc::new(deployment), context(&client))
            .await
            .expect("reconcile succeeds");

        assert_eq!(with_ops_versions(&client).await, [1]);
        let requests = client
            .list::<SecretRequest>("default")
            .await
            .expect("requests are listed");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name_any(), "nats.var-nats-password");

        let deployment: BoshDeployment =
            client.get("nats", "default").await.expect("deployment exists");
        assert_eq!(
            deployment.status.and_then(|status| status.state),
            Some(DeploymentState::Creating)
        );
    }

    #[tokio::test]
    async fn repeated_reconciles_are_idempotent() {
        let (client, _) = Client::in_memory();
        deployment(&client, MANIFEST).await;

        for _ in 0..3 {
            let deployment: BoshDeployment =
                client.get("nats", "default").await.expect("deployment exists");
            reconcile(Arc::new(deployment), context(&client))
                .await
                .expect("reconcile succeeds");
        }

        assert_eq!(with_ops_versions(&client).await, [1]);
    }

    #[tokio::test]
    async fn a_changed_manifest_is_an_update() {
        let (client, _) = Client::in_memory();
        deployment(&client, MANIFEST).await;
        let current: BoshDeployment = client.get("nats", "default").await.expect("exists");
        reconcile(Arc::new(current), context(&client))
            .await
            .expect("reconcile succeeds");

        let mut current: BoshDeployment = client.get("nats", "default").await.expect("exists");
        current.spec.manifest.name = MANIFEST.replace("instances: 2", "instances: 3");
        let current = client.update(&current).await.expect("spec is updated");
        reconcile(Arc::new(current), context(&client))
            .await
            .expect("reconcile succeeds");

        assert_eq!(with_ops_versions(&client).await, [1, 2]);
        let current: BoshDeployment = client.get("nats", "default").await.expect("exists");
        assert_eq!(
            current.status.and_then(|status| status.state),
            Some(DeploymentState::Updating)
        );
    }

    #[tokio::test]
    async fn workload_sets_of_removed_instance_groups_are_deleted() {
        let (client, _) = Client::in_memory();
        for group in ["nats", "old"] {
            let metadata = ObjectMeta {
                name: Some(format!("nats-{group}")),
                namespace: Some("default".to_owned()),
                labels: Some(instance_group_labels("nats", group)),
                ..ObjectMeta::default()
            };
            client
                .create(&StatefulSet {
                    metadata: metadata.clone(),
                    ..StatefulSet::default()
                })
                .await
                .expect("set is created");
            client
                .create(&Service {
                    metadata,
                    ..Service::default()
                })
                .await
                .expect("service is created");
        }
        let manifest = Manifest::parse(MANIFEST).expect("valid manifest");

        let removed = delete_orphans(&client, "nats", "default", &manifest)
            .await
            .expect("orphans are deleted");

        assert_eq!(removed, BTreeSet::from(["old".to_owned()]));
        let sets: Vec<_> = client
            .list::<StatefulSet>("default")
            .await
            .expect("sets are listed")
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        assert_eq!(sets, ["nats-nats"]);
        let services = client
            .list::<Service>("default")
            .await
            .expect("services are listed");
        assert_eq!(services.len(), 1);
    }

    #[tokio::test]
    async fn missing_link_providers_fail_the_reconcile() {
        let (client, _) = Client::in_memory();
        let deployment = deployment(
            &client,
            indoc! {"
                name: nats
                instance_groups:
                  - name: web
                    jobs:
                      - name: web
                        release: web
                        consumes:
                          database: {from: postgres}
            "},
        )
        .await;

        let error = reconcile(Arc::new(deployment), context(&client))
            .await
            .expect_err("the provider is missing");

        assert_eq!(error.category(), "ResolveLinks");
        assert!(with_ops_versions(&client).await.is_empty());
    }
}
