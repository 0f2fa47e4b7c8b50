//! Drives one deployment through every stage against the in-process store.

use std::{sync::Arc, time::Duration};

use indoc::indoc;
use k8s_openapi::{
    ByteString,
    api::{
        apps::v1::{StatefulSet, StatefulSetStatus},
        batch::v1::{Job, JobStatus},
        core::v1::Secret,
    },
};
use kube::{ResourceExt, api::ObjectMeta};
use stackable_bosh_operator::{
    artifact::{self, ArtifactKind, ArtifactType},
    client::Client,
    controller::{
        Context, OperatorConfig, bpm, desired_manifest, instance_group, status, variables,
        with_ops,
    },
    crd::{
        BoshDeployment, BoshDeploymentSpec, DeploymentState, ReferenceType, ResourceReference,
        SecretRequest,
    },
    manifest::Manifest,
    reconcile::{ErrorClass, ReconcilerError},
    release::JobSpecs,
    render,
};

const MANIFEST: &str = indoc! {"
    name: nats
    releases:
      - name: nats
        version: '26'
    instance_groups:
      - name: nats
        instances: 1
        jobs:
          - name: nats
            release: nats
            properties:
              nats:
                password: ((nats_password))
    variables:
      - name: nats_password
        type: password
"};

struct Harness {
    client: Client,
    ctx: Arc<Context>,
}

impl Harness {
    fn new() -> Self {
        let (client, _) = Client::in_memory();
        let ctx = Arc::new(Context::new(
            client.clone(),
            OperatorConfig {
                meltdown_duration: Duration::ZERO,
                ..OperatorConfig::default()
            },
        ));
        Self { client, ctx }
    }

    async fn deployment(&self) -> Arc<BoshDeployment> {
        Arc::new(
            self.client
                .get("nats", "default")
                .await
                .expect("deployment exists"),
        )
    }

    async fn latest(&self, artifact_type: ArtifactType) -> Arc<Secret> {
        Arc::new(
            artifact::latest(&self.client, "default", "nats", &artifact_type)
                .await
                .expect("artifact exists"),
        )
    }

    async fn state(&self) -> Option<DeploymentState> {
        status::reconcile(self.deployment().await, self.ctx.clone())
            .await
            .expect("status is aggregated");
        self.deployment()
            .await
            .status
            .as_ref()
            .and_then(|status| status.state)
    }
}

#[tokio::test]
async fn a_deployment_goes_from_resolving_to_deployed() {
    let harness = Harness::new();
    let client = &harness.client;
    client
        .create(&BoshDeployment {
            metadata: ObjectMeta {
                name: Some("nats".to_owned()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            spec: BoshDeploymentSpec {
                manifest: ResourceReference {
                    name: MANIFEST.to_owned(),
                    type_: ReferenceType::Inline,
                    key: None,
                },
                ops: Vec::new(),
                vars: Vec::new(),
            },
            status: None,
        })
        .await
        .expect("deployment is created");

    // Ops-applier and variable generator.
    with_ops::reconcile(harness.deployment().await, harness.ctx.clone())
        .await
        .expect("with-ops artifact is written");
    assert_eq!(harness.state().await, Some(DeploymentState::Creating));
    let with_ops_artifact = harness
        .latest(ArtifactType::new(ArtifactKind::WithOps))
        .await;
    variables::reconcile(with_ops_artifact.clone(), harness.ctx.clone())
        .await
        .expect("requests are issued");
    let requests = client
        .list::<SecretRequest>("default")
        .await
        .expect("requests are listed");
    assert_eq!(requests.len(), 1);

    // The interpolator waits until the secret generation subsystem did its work.
    let error = desired_manifest::reconcile(with_ops_artifact.clone(), harness.ctx.clone())
        .await
        .expect_err("the password is not generated yet");
    assert_eq!(error.class(), ErrorClass::Configuration { retry: true });
    client
        .create(&Secret {
            metadata: ObjectMeta {
                name: Some(requests[0].spec.secret_name.clone()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            data: Some([("password".to_owned(), ByteString(b"s3cret".to_vec()))].into()),
            ..Secret::default()
        })
        .await
        .expect("password is generated");
    desired_manifest::reconcile(with_ops_artifact, harness.ctx.clone())
        .await
        .expect("desired manifest is written");

    // The rendering job, with the job's own work done inline.
    let desired = harness
        .latest(ArtifactType::new(ArtifactKind::Desired))
        .await;
    instance_group::reconcile(desired.clone(), harness.ctx.clone())
        .await
        .expect("rendering job is created");
    let payload = artifact::payload(&desired).expect("desired payload");
    assert!(payload.contains("s3cret"));
    let manifest = Manifest::parse(&payload).expect("valid desired manifest");
    render::publish(
        client,
        "default",
        "nats",
        &manifest,
        "nats",
        &JobSpecs::default(),
    )
    .await
    .expect("instance group is rendered");

    // The BPM deployer.
    let bpm_artifact = harness
        .latest(ArtifactType::for_instance_group(ArtifactKind::Bpm, "nats"))
        .await;
    bpm::reconcile(bpm_artifact, harness.ctx.clone())
        .await
        .expect("instance group is deployed");
    assert_eq!(harness.state().await, Some(DeploymentState::Resolving));

    let mut set: StatefulSet = client
        .get("nats-nats", "default")
        .await
        .expect("workload set exists");
    set.status = Some(StatefulSetStatus {
        replicas: 1,
        ready_replicas: Some(1),
        ..StatefulSetStatus::default()
    });
    client.update_status(&set).await.expect("workload set is ready");
    assert_eq!(harness.state().await, Some(DeploymentState::Converting));

    let render_job_name = instance_group::render_job_name(
        "nats",
        artifact::version_of(&desired).expect("desired version"),
    );
    let mut render_job: Job = client
        .get(&render_job_name, "default")
        .await
        .expect("rendering job exists");
    render_job.status = Some(JobStatus {
        succeeded: Some(1),
        ..JobStatus::default()
    });
    client
        .update_status(&render_job)
        .await
        .expect("rendering job completed");
    assert_eq!(harness.state().await, Some(DeploymentState::Deployed));

    // Deleting the deployment removes everything it owns.
    let deployment = harness.deployment().await;
    client.delete(&*deployment).await.expect("deployment is deleted");
    let leftovers: Vec<_> = client
        .list::<Secret>("default")
        .await
        .expect("secrets are listed")
        .iter()
        .filter(|secret| secret.labels().contains_key(stackable_bosh_operator::kvp::ARTIFACT_TYPE_KEY))
        .map(ResourceExt::name_any)
        .collect();
    assert!(leftovers.is_empty(), "artifacts survived: {leftovers:?}");
}
