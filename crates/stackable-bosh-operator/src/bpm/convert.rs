//! Turns the BPM configuration of one instance group into Kubernetes resources.
//!
//! A service instance group becomes a [`StatefulSet`] with a headless [`Service`], an errand
//! becomes a [`Job`]. Every BPM process is one container running the release image of its job.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, ResourceRequirements, SecretVolumeSource, Service, ServicePort,
            ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::api::ObjectMeta;
use serde::Deserialize;
use serde_yaml::Value;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{Config, Configs};
use crate::{
    kvp::instance_group_labels,
    manifest::{
        Job as ManifestJob, Manifest, instance_group_object_name, kube_name, lookup,
    },
};

/// Where the resolved properties artifact is mounted in every container.
pub const RESOLVED_PROPERTIES_DIR: &str = "/var/vcap/jobs-resolved";

const RESOLVED_PROPERTIES_VOLUME: &str = "resolved-properties";
const EPHEMERAL_DISK_VOLUME: &str = "ephemeral-disk";
const PERSISTENT_DISK_VOLUME: &str = "persistent-disk";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("instance group {name:?} is not part of the manifest"))]
    UnknownInstanceGroup { name: String },

    #[snafu(display("job {job:?} references the unknown release {release:?}"))]
    UnknownRelease { job: String, release: String },

    #[snafu(display("job {job:?} declares invalid ports"))]
    InvalidPorts {
        source: serde_yaml::Error,
        job: String,
    },
}

/// Every resource of one instance group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resources {
    pub services: Vec<Service>,
    pub stateful_sets: Vec<StatefulSet>,
    pub jobs: Vec<Job>,
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
}

/// A port declared below `properties.quarks.ports` of a job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct Port {
    name: String,

    #[serde(default = "Port::default_protocol")]
    protocol: String,

    internal: i32,
}

impl Port {
    fn default_protocol() -> String {
        "TCP".to_owned()
    }
}

fn declared_ports(job: &ManifestJob) -> Result<Vec<Port>> {
    let properties = Value::Mapping(job.properties.clone());
    lookup(&properties, "quarks.ports")
        .map(|ports| serde_yaml::from_value(ports.clone()))
        .transpose()
        .with_context(|_| InvalidPortsSnafu { job: &job.name })
        .map(Option::unwrap_or_default)
}

/// Converts the instance group `instance_group` of `manifest`.
///
/// `properties_artifact` names the secret holding the resolved properties of the group, it is
/// mounted into every container.
pub fn convert(
    deployment: &str,
    namespace: &str,
    manifest: &Manifest,
    instance_group: &str,
    configs: &Configs,
    properties_artifact: &str,
) -> Result<Resources> {
    let group = manifest
        .instance_group(instance_group)
        .context(UnknownInstanceGroupSnafu {
            name: instance_group,
        })?;
    let name = instance_group_object_name(deployment, instance_group);
    let labels = instance_group_labels(deployment, instance_group);
    let metadata = |name: String| ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_owned()),
        labels: Some(labels.clone()),
        ..ObjectMeta::default()
    };

    let has_persistent_disk = !group.is_errand() && group.persistent_disk.is_some();
    let claim_name = format!("{name}-pvc");

    let mut containers = Vec::new();
    let mut ports = Vec::new();
    let mut needs_ephemeral_disk = false;
    for job in &group.jobs {
        let release = manifest
            .releases
            .iter()
            .find(|release| release.name == job.release)
            .context(UnknownReleaseSnafu {
                job: &job.name,
                release: &job.release,
            })?;
        let config = configs.get(&job.name).cloned().unwrap_or_default();
        needs_ephemeral_disk |= config.processes.iter().any(|p| p.ephemeral_disk);
        containers.extend(containers_for_job(
            job,
            &config,
            &release.image(),
            has_persistent_disk,
        ));
        ports.extend(declared_ports(job)?);
    }

    let mut volumes = vec![Volume {
        name: RESOLVED_PROPERTIES_VOLUME.to_owned(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(properties_artifact.to_owned()),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }];
    if needs_ephemeral_disk {
        volumes.push(Volume {
            name: EPHEMERAL_DISK_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
    }
    if has_persistent_disk {
        volumes.push(Volume {
            name: PERSISTENT_DISK_VOLUME.to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                ..PersistentVolumeClaimVolumeSource::default()
            }),
            ..Volume::default()
        });
    }

    let pod_spec = PodSpec {
        containers,
        volumes: Some(volumes),
        enable_service_links: Some(false),
        ..PodSpec::default()
    };
    let template = |restart_policy: &str| PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            restart_policy: Some(restart_policy.to_owned()),
            ..pod_spec.clone()
        }),
    };

    let mut resources = Resources::default();
    if group.is_errand() {
        let completions = group.instances.max(1);
        resources.jobs.push(Job {
            metadata: metadata(name),
            spec: Some(JobSpec {
                template: template("Never"),
                completions: Some(completions),
                parallelism: Some(completions),
                backoff_limit: Some(2),
                ..JobSpec::default()
            }),
            ..Job::default()
        });
        return Ok(resources);
    }

    let service_ports: Vec<_> = ports
        .iter()
        .map(|port| ServicePort {
            name: Some(kube_name(&port.name)),
            protocol: Some(port.protocol.clone()),
            port: port.internal,
            ..ServicePort::default()
        })
        .collect();

    resources.services.push(Service {
        metadata: metadata(name.clone()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_owned()),
            selector: Some(labels.clone()),
            ports: (!service_ports.is_empty()).then(|| service_ports.clone()),
            publish_not_ready_addresses: Some(true),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    });
    if !service_ports.is_empty() {
        resources.services.push(Service {
            metadata: metadata(format!("{name}-svc")),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(labels.clone()),
                ports: Some(service_ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        });
    }

    if let Some(size) = group.persistent_disk.filter(|_| has_persistent_disk) {
        resources.persistent_volume_claims.push(PersistentVolumeClaim {
            metadata: metadata(claim_name),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_owned(), Quantity(format!("{size}Mi")))].into(),
                    ),
                    ..VolumeResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        });
    }

    resources.stateful_sets.push(StatefulSet {
        metadata: metadata(name.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(group.instances),
            service_name: Some(name),
            pod_management_policy: Some("Parallel".to_owned()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: template("Always"),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    });

    Ok(resources)
}

fn containers_for_job(
    job: &ManifestJob,
    config: &Config,
    image: &str,
    has_persistent_disk: bool,
) -> Vec<Container> {
    config
        .processes
        .iter()
        .map(|process| {
            let mut volume_mounts = vec![VolumeMount {
                name: RESOLVED_PROPERTIES_VOLUME.to_owned(),
                mount_path: RESOLVED_PROPERTIES_DIR.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            }];
            if process.ephemeral_disk {
                volume_mounts.push(VolumeMount {
                    name: EPHEMERAL_DISK_VOLUME.to_owned(),
                    mount_path: format!("/var/vcap/data/{}", job.name),
                    sub_path: Some(job.name.clone()),
                    ..VolumeMount::default()
                });
            }
            if process.persistent_disk && has_persistent_disk {
                volume_mounts.push(VolumeMount {
                    name: PERSISTENT_DISK_VOLUME.to_owned(),
                    mount_path: format!("/var/vcap/store/{}", job.name),
                    sub_path: Some(job.name.clone()),
                    ..VolumeMount::default()
                });
            }

            let limits: BTreeMap<_, _> = process
                .limits
                .as_ref()
                .and_then(|limits| limits.memory.clone())
                .map(|memory| ("memory".to_owned(), Quantity(memory)))
                .into_iter()
                .collect();

            Container {
                name: kube_name(&format!("{}-{}", job.name, process.name)),
                image: Some(image.to_owned()),
                command: Some(vec![process.executable.clone()]),
                args: (!process.args.is_empty()).then(|| process.args.clone()),
                env: (!process.env.is_empty()).then(|| {
                    process
                        .env
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: Some(value.clone()),
                            ..EnvVar::default()
                        })
                        .collect()
                }),
                working_dir: process.workdir.clone(),
                resources: (!limits.is_empty()).then(|| ResourceRequirements {
                    limits: Some(limits),
                    ..ResourceRequirements::default()
                }),
                volume_mounts: Some(volume_mounts),
                ..Container::default()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{bpm, kvp::INSTANCE_GROUP_KEY};

    const MANIFEST: &str = indoc! {"
        name: nats
        releases:
          - name: nats
            version: '26'
        instance_groups:
          - name: nats
            instances: 2
            persistent_disk: 1024
            jobs:
              - name: nats
                release: nats
                properties:
                  quarks:
                    ports:
                      - name: nats
                        internal: 4222
          - name: smoke_tests
            instances: 1
            lifecycle: errand
            jobs:
              - name: smoke
                release: nats
    "};

    const BPM: &str = indoc! {"
        nats:
          processes:
            - name: nats
              executable: /var/vcap/packages/gnatsd/bin/gnatsd
              limits: {memory: 128Mi}
              ephemeral_disk: true
              persistent_disk: true
            - name: exporter
              executable: /var/vcap/packages/exporter/bin/exporter
              env: {PORT: '9090'}
    "};

    fn manifest() -> Manifest {
        Manifest::parse(MANIFEST).expect("valid manifest")
    }

    #[test]
    fn service_groups_become_stateful_sets() {
        let configs = bpm::parse(BPM).expect("valid BPM configuration");
        let resources = convert(
            "nats",
            "default",
            &manifest(),
            "nats",
            &configs,
            "nats.resolved-properties.nats-v1",
        )
        .expect("conversion succeeds");

        assert!(resources.jobs.is_empty());
        let set = &resources.stateful_sets[0];
        let spec = set.spec.as_ref().expect("spec is set");
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.service_name.as_deref(), Some("nats-nats"));
        assert_eq!(
            set.metadata.labels.as_ref().and_then(|l| l.get(INSTANCE_GROUP_KEY)),
            Some(&"nats".to_owned())
        );

        let pod = spec.template.spec.as_ref().expect("pod spec is set");
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["nats-nats", "nats-exporter"]);
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("docker.io/cfcontainerization/nats:26")
        );
        let volumes: Vec<_> = pod
            .volumes
            .iter()
            .flatten()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(
            volumes,
            vec![RESOLVED_PROPERTIES_VOLUME, EPHEMERAL_DISK_VOLUME, PERSISTENT_DISK_VOLUME]
        );

        assert_eq!(resources.persistent_volume_claims.len(), 1);
        let service_names: Vec<_> = resources
            .services
            .iter()
            .map(|s| s.metadata.name.as_deref())
            .collect();
        assert_eq!(service_names, vec![Some("nats-nats"), Some("nats-nats-svc")]);
    }

    #[test]
    fn errands_become_jobs() {
        let resources = convert(
            "nats",
            "default",
            &manifest(),
            "smoke_tests",
            &Configs::new(),
            "nats.resolved-properties.smoke_tests-v1",
        )
        .expect("conversion succeeds");

        assert!(resources.stateful_sets.is_empty());
        assert!(resources.services.is_empty());
        assert_eq!(resources.jobs.len(), 1);
        assert_eq!(
            resources.jobs[0].metadata.name.as_deref(),
            Some("nats-smoke-tests")
        );
    }

    #[test]
    fn unknown_groups_are_rejected() {
        assert!(matches!(
            convert("nats", "default", &manifest(), "router", &Configs::new(), "x"),
            Err(Error::UnknownInstanceGroup { .. })
        ));
    }
}
