//! Launches the job rendering every instance group of a desired manifest.
//!
//! The job mounts the desired manifest artifact and runs `util instance-group` once per instance
//! group. Each run publishes the resolved properties and the BPM configuration of its group as
//! artifacts, which in turn trigger the BPM deployer.

use std::sync::Arc;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EmptyDirVolumeSource, KeyToPath, PodSpec, PodTemplateSpec, Secret,
            SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt, api::ObjectMeta, core::Selector, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    artifact::{self, ArtifactKind},
    cli::{RELEASES_PATH, RENDERING_MANIFEST_PATH},
    crd::BoshDeployment,
    kvp::{DEPLOYMENT_NAME_KEY, JOB_ROLE_KEY, deployment_labels},
    manifest::{self, Manifest, kube_name},
    reconcile::{ErrorClass, ReconcilerError},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "instance-group";

/// The value of [`JOB_ROLE_KEY`] on rendering jobs.
pub const RENDER_JOB_ROLE: &str = "render";

const DESIRED_MANIFEST_VOLUME: &str = "desired-manifest";
const RELEASES_VOLUME: &str = "all-releases";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("artifact {name} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to read artifact {name}"))]
    ReadArtifact {
        source: artifact::Error,
        name: String,
    },

    #[snafu(display("artifact {name} has no version label"))]
    MissingVersion { name: String },

    #[snafu(display("artifact {name} does not hold a valid manifest"))]
    ParseManifest {
        source: manifest::Error,
        name: String,
    },

    #[snafu(display("failed to read deployment {name:?}"))]
    GetDeployment { source: StoreError, name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("failed to create rendering job {name}"))]
    CreateJob { source: StoreError, name: String },

    #[snafu(display("failed to list the rendering jobs of deployment {name:?}"))]
    ListJobs { source: StoreError, name: String },

    #[snafu(display("failed to delete outdated rendering job {name}"))]
    DeleteJob { source: StoreError, name: String },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ReadArtifact { source, .. } => source.class(),
            Self::GetDeployment { source, .. }
            | Self::CreateJob { source, .. }
            | Self::ListJobs { source, .. }
            | Self::DeleteJob { source, .. } => source.class(),
            Self::ParseManifest { .. } => ErrorClass::Configuration { retry: false },
            Self::ObjectHasNoNamespace { .. }
            | Self::MissingVersion { .. }
            | Self::MissingOwner { .. } => ErrorClass::Fatal,
        }
    }
}

/// The name of the job rendering version `version` of the desired manifest of `deployment`.
pub fn render_job_name(deployment: &str, version: u64) -> String {
    artifact::artifact_name(&format!("{}-render", kube_name(deployment)), version)
}

/// Builds the rendering job for the desired manifest `artifact` holding `manifest`.
pub fn render_job(
    deployment: &str,
    namespace: &str,
    artifact: &Secret,
    version: u64,
    manifest: &Manifest,
    operator_image: &str,
    owner: OwnerReference,
) -> Job {
    let mut labels = deployment_labels(deployment);
    labels.insert(JOB_ROLE_KEY.to_owned(), RENDER_JOB_ROLE.to_owned());

    let (manifest_dir, manifest_file) = RENDERING_MANIFEST_PATH
        .rsplit_once('/')
        .unwrap_or(("/var/vcap/rendering", "manifest.yaml"));
    let volumes = vec![
        Volume {
            name: DESIRED_MANIFEST_VOLUME.to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(artifact.name_any()),
                items: Some(vec![KeyToPath {
                    key: ArtifactKind::Desired.payload_key().to_owned(),
                    path: manifest_file.to_owned(),
                    ..KeyToPath::default()
                }]),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: RELEASES_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
    ];
    let volume_mounts = vec![
        VolumeMount {
            name: DESIRED_MANIFEST_VOLUME.to_owned(),
            mount_path: manifest_dir.to_owned(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: RELEASES_VOLUME.to_owned(),
            mount_path: RELEASES_PATH.to_owned(),
            ..VolumeMount::default()
        },
    ];

    // Each release image contributes its job specs to the shared volume, where the rendering
    // containers read the property defaults from.
    let init_containers = manifest
        .releases
        .iter()
        .map(|release| {
            let target = format!("{RELEASES_PATH}/{}", release.name);
            Container {
                name: format!("spec-copier-{}", kube_name(&release.name)),
                image: Some(release.image()),
                command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
                args: Some(vec![format!(
                    "mkdir -p {target} && cp -ar /var/vcap/jobs-src/. {target}/"
                )]),
                volume_mounts: Some(volume_mounts.clone()),
                ..Container::default()
            }
        })
        .collect::<Vec<_>>();

    let containers = manifest
        .instance_groups
        .iter()
        .map(|group| Container {
            name: kube_name(&group.name),
            image: Some(operator_image.to_owned()),
            args: Some(vec![
                "util".to_owned(),
                "instance-group".to_owned(),
                "--deployment-name".to_owned(),
                deployment.to_owned(),
                "--namespace".to_owned(),
                namespace.to_owned(),
                "--instance-group".to_owned(),
                group.name.clone(),
                "--manifest".to_owned(),
                RENDERING_MANIFEST_PATH.to_owned(),
                "--releases-dir".to_owned(),
                RELEASES_PATH.to_owned(),
            ]),
            volume_mounts: Some(volume_mounts.clone()),
            ..Container::default()
        })
        .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(render_job_name(deployment, version)),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers,
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_owned()),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

#[tracing::instrument(skip(desired, ctx), fields(artifact = %desired.name_any()))]
pub async fn reconcile(desired: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let name = desired.name_any();
    let namespace = desired
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    let (deployment_name, artifact_type) =
        artifact::family_of(&desired).context(ReadArtifactSnafu { name: &name })?;
    if artifact_type.kind != ArtifactKind::Desired {
        return Ok(Action::await_change());
    }
    if !artifact::is_latest(&ctx.client, &desired)
        .await
        .context(ReadArtifactSnafu { name: &name })?
    {
        tracing::debug!("Artifact was superseded");
        return Ok(Action::await_change());
    }
    let version = artifact::version_of(&desired).context(MissingVersionSnafu { name: &name })?;

    let Some(deployment) = ctx
        .client
        .get_opt::<BoshDeployment>(&deployment_name, &namespace)
        .await
        .context(GetDeploymentSnafu {
            name: &deployment_name,
        })?
    else {
        return Ok(Action::await_change());
    };
    let owner = deployment
        .controller_owner_ref(&())
        .context(MissingOwnerSnafu {
            name: &deployment_name,
        })?;

    let payload = artifact::payload(&desired).context(ReadArtifactSnafu { name: &name })?;
    let manifest = Manifest::parse(&payload).context(ParseManifestSnafu { name: &name })?;
    let job = render_job(
        &deployment_name,
        &namespace,
        &desired,
        version,
        &manifest,
        &ctx.config.operator_image,
        owner,
    );
    let job_name = job.name_any();
    let existing = ctx
        .client
        .get_opt::<Job>(&job_name, &namespace)
        .await
        .context(CreateJobSnafu { name: &job_name })?;
    if existing.is_none() {
        ctx.client
            .create(&job)
            .await
            .context(CreateJobSnafu { name: &job_name })?;
        tracing::info!(job = %job_name, version, "Created rendering job");
    }

    let selector = Selector::from_iter([
        (DEPLOYMENT_NAME_KEY.to_owned(), deployment_name.clone()),
        (JOB_ROLE_KEY.to_owned(), RENDER_JOB_ROLE.to_owned()),
    ]);
    let render_jobs = ctx
        .client
        .list_with_label_selector::<Job>(&namespace, &selector)
        .await
        .context(ListJobsSnafu {
            name: &deployment_name,
        })?;
    for outdated in render_jobs.iter().filter(|job| job.name_any() != job_name) {
        ctx.client
            .delete(outdated)
            .await
            .context(DeleteJobSnafu {
                name: outdated.name_any(),
            })?;
        tracing::debug!(job = %outdated.name_any(), "Deleted outdated rendering job");
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        artifact::ArtifactType,
        client::Client,
        controller::OperatorConfig,
        crd::{BoshDeploymentSpec, ReferenceType, ResourceReference},
    };

    const DESIRED: &str = indoc! {"
        name: nats
        releases:
          - name: nats
            version: '26'
          - name: bpm
            version: '1.1'
        instance_groups:
          - name: nats
            instances: 2
            jobs:
              - name: nats
                release: nats
          - name: smoke_tests
            lifecycle: errand
            jobs:
              - name: smoke
                release: nats
    "};

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
                        name: DESIRED.to_owned(),
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

    async fn desired(client: &Client, owner: &OwnerReference, payload: &str) -> Secret {
        artifact::create(
            client,
            "default",
            owner.clone(),
            "nats",
            &ArtifactType::new(ArtifactKind::Desired),
            payload,
            Default::default(),
        )
        .await
        .expect("artifact is created")
        .into_artifact()
    }

    fn context(client: &Client) -> Arc<Context> {
        Arc::new(Context::new(client.clone(), OperatorConfig::default()))
    }

    #[test]
    fn the_job_renders_every_instance_group() {
        let manifest = Manifest::parse(DESIRED).expect("valid manifest");
        let artifact = Secret {
            metadata: ObjectMeta {
                name: Some("nats.desired-v3".to_owned()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };

        let job = render_job(
            "nats",
            "default",
            &artifact,
            3,
            &manifest,
            "operator:latest",
            OwnerReference::default(),
        );

        assert_eq!(job.name_any(), "nats-render-v3");
        assert_eq!(
            job.labels().get(JOB_ROLE_KEY).map(String::as_str),
            Some(RENDER_JOB_ROLE)
        );
        let pod = job
            .spec
            .and_then(|spec| spec.template.spec)
            .expect("pod spec");
        let containers: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(containers, ["nats", "smoke-tests"]);
        let init_containers: Vec<_> = pod
            .init_containers
            .iter()
            .flatten()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(init_containers, ["spec-copier-nats", "spec-copier-bpm"]);
        let args = pod.containers[1].args.clone().unwrap_or_default();
        assert!(args.windows(2).any(|pair| pair == ["--instance-group", "smoke_tests"]));
        assert!(args.windows(2).any(|pair| pair == ["--releases-dir", RELEASES_PATH]));
        assert_eq!(
            pod.volumes.iter().flatten().next().and_then(|volume| volume
                .secret
                .as_ref()
                .and_then(|secret| secret.secret_name.clone())),
            Some("nats.desired-v3".to_owned())
        );
    }

    #[tokio::test]
    async fn newer_versions_replace_older_jobs() {
        let (client, _) = Client::in_memory();
        let deployment = deployment(&client).await;
        let owner = deployment.controller_owner_ref(&()).expect("owner reference");

        let first = desired(&client, &owner, DESIRED).await;
        reconcile(Arc::new(first), context(&client))
            .await
            .expect("reconcile succeeds");
        let second = desired(&client, &owner, &DESIRED.replace("instances: 2", "instances: 3")).await;
        reconcile(Arc::new(second), context(&client))
            .await
            .expect("reconcile succeeds");

        let jobs: Vec<_> = client
            .list::<Job>("default")
            .await
            .expect("jobs are listed")
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        assert_eq!(jobs, ["nats-render-v2"]);
    }

    #[tokio::test]
    async fn superseded_artifacts_are_ignored() {
        let (client, _) = Client::in_memory();
        let deployment = deployment(&client).await;
        let owner = deployment.controller_owner_ref(&()).expect("owner reference");
        let first = desired(&client, &owner, DESIRED).await;
        desired(&client, &owner, &DESIRED.replace("instances: 2", "instances: 3")).await;

        reconcile(Arc::new(first), context(&client))
            .await
            .expect("reconcile succeeds");

        assert!(client.list::<Job>("default").await.expect("listed").is_empty());
    }
}
