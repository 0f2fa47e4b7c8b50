//! Aggregates the jobs and workload sets of a deployment into its status.

use std::sync::Arc;

use k8s_openapi::{
    api::{apps::v1::StatefulSet, batch::v1::Job},
    chrono::Utc,
};
use kube::{ResourceExt, core::Selector, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    crd::BoshDeployment,
    kvp::DEPLOYMENT_NAME_KEY,
    reconcile::{ErrorClass, ReconcilerError},
    status::{Counts, next_status},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "status";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("deployment {name} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to list the {kind} of deployment {name:?}"))]
    ListChildren {
        source: StoreError,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to update the status of deployment {name:?}"))]
    UpdateStatus { source: StoreError, name: String },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ListChildren { source, .. } | Self::UpdateStatus { source, .. } => {
                source.class()
            }
            Self::ObjectHasNoNamespace { .. } => ErrorClass::Fatal,
        }
    }
}

#[tracing::instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(deployment: Arc<BoshDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let name = deployment.name_any();
    let namespace = deployment
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;

    // Children are found by label, so adopted objects count before their owner reference is set.
    let selector = Selector::from_iter([(DEPLOYMENT_NAME_KEY.to_owned(), name.clone())]);
    let jobs = ctx
        .client
        .list_with_label_selector::<Job>(&namespace, &selector)
        .await
        .context(ListChildrenSnafu {
            kind: "jobs",
            name: &name,
        })?;
    let stateful_sets = ctx
        .client
        .list_with_label_selector::<StatefulSet>(&namespace, &selector)
        .await
        .context(ListChildrenSnafu {
            kind: "workload sets",
            name: &name,
        })?;

    let counts = Counts::from_children(&jobs, &stateful_sets);
    let Some(status) = next_status(deployment.status.as_ref(), counts, Utc::now()) else {
        return Ok(Action::await_change());
    };

    let state = status.state;
    let mut updated = (*deployment).clone();
    updated.status = Some(status);
    ctx.client
        .update_status(&updated)
        .await
        .context(UpdateStatusSnafu { name: &name })?;
    tracing::info!(
        deployment = %name,
        state = ?state,
        jobs = counts.total_jobs,
        completed_jobs = counts.completed_jobs,
        instance_groups = counts.total_instance_groups,
        deployed_instance_groups = counts.deployed_instance_groups,
        "Updated deployment status"
    );
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{StatefulSetSpec, StatefulSetStatus},
        batch::v1::JobStatus,
    };
    use kube::api::ObjectMeta;

    use super::*;
    use crate::{
        client::Client,
        controller::OperatorConfig,
        crd::{BoshDeploymentSpec, DeploymentState, ReferenceType, ResourceReference},
        kvp::{deployment_labels, instance_group_labels},
    };

    async fn deployment(client: &Client) -> BoshDeployment {
        client
            .create(&BoshDeployment {
                metadata: ObjectMeta {
                    name: Some("nats".to_owned()),
                    namespace: Some("default".to_owned()),
                    ..ObjectMeta::default()
                },
                spec: BoshDeploymentSpec {
                    manifest: ResourceReference {
                        name: "name: nats".to_owned(),
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

    fn job(name: &str, succeeded: i32) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(deployment_labels("nats")),
                ..ObjectMeta::default()
            },
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    fn stateful_set(ready: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("nats-nats".to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(instance_group_labels("nats", "nats")),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                ..StatefulSetSpec::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(ready),
                ..StatefulSetStatus::default()
            }),
        }
    }

    async fn reconcile_and_get(client: &Client) -> BoshDeployment {
        let current: BoshDeployment = client.get("nats", "default").await.expect("exists");
        reconcile(
            Arc::new(current),
            Arc::new(Context::new(client.clone(), OperatorConfig::default())),
        )
        .await
        .expect("reconcile succeeds");
        client.get("nats", "default").await.expect("exists")
    }

    #[tokio::test]
    async fn deployments_without_children_keep_their_status() {
        let (client, _) = Client::in_memory();
        deployment(&client).await;

        let deployment = reconcile_and_get(&client).await;

        assert_eq!(deployment.status, None);
    }

    #[tokio::test]
    async fn the_state_follows_the_children() {
        let (client, _) = Client::in_memory();
        deployment(&client).await;
        client.create(&job("nats-render-v1", 0)).await.expect("job");
        client.create(&stateful_set(0)).await.expect("set");

        let status = reconcile_and_get(&client).await.status.expect("status");
        assert_eq!(status.state, Some(DeploymentState::Resolving));
        assert_eq!(status.total_job_count, 1);
        assert_eq!(status.total_instance_groups, 1);

        let mut set: StatefulSet = client.get("nats-nats", "default").await.expect("set");
        set.status = stateful_set(2).status;
        client.update_status(&set).await.expect("set is ready");
        let status = reconcile_and_get(&client).await.status.expect("status");
        assert_eq!(status.state, Some(DeploymentState::Converting));

        let mut render_job: Job = client.get("nats-render-v1", "default").await.expect("job");
        render_job.status = job("nats-render-v1", 1).status;
        client.update_status(&render_job).await.expect("job completed");
        let status = reconcile_and_get(&client).await.status.expect("status");
        assert_eq!(status.state, Some(DeploymentState::Deployed));
        assert_eq!(status.completed_job_count, 1);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let (client, _) = Client::in_memory();
        deployment(&client).await;
        client.create(&stateful_set(2)).await.expect("set");

        let first = reconcile_and_get(&client).await;
        let second = reconcile_and_get(&client).await;

        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }
}
