//! Rendering of one instance group, run inside the rendering job.
//!
//! The desired manifest is narrowed down to the instance group: job properties are merged over
//! the instance group and global properties, which in turn win over the defaults declared in
//! the release's job spec. Links between jobs of the same deployment are
//! resolved, and the BPM configuration of every job is derived. Jobs may carry their BPM
//! configuration below `properties.quarks.bpm`, otherwise a single process running the job's
//! `bin/run` script is assumed.

use std::collections::BTreeMap;

use kube::Resource;
use serde_yaml::{Mapping, Value};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    artifact::{self, ArtifactKind, ArtifactType},
    bpm::{self, Config, Process},
    client::Client,
    crd::BoshDeployment,
    links::{LINKS_PROPERTY, Link, LinkInstance},
    manifest::{self, InstanceGroup, Manifest, instance_group_object_name, lookup},
    release::JobSpecs,
    store::StoreError,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("instance group {name:?} is not part of the manifest"))]
    UnknownInstanceGroup { name: String },

    #[snafu(display("job {job:?} has an invalid BPM configuration"))]
    InvalidBpm {
        source: serde_yaml::Error,
        job: String,
    },

    #[snafu(display("failed to serialize link {name:?}"))]
    SerializeLink {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to read deployment {name:?}"))]
    GetDeployment { source: StoreError, name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("failed to serialize the resolved properties"))]
    SerializeProperties { source: manifest::Error },

    #[snafu(display("failed to serialize the BPM configuration"))]
    SerializeBpm { source: bpm::Error },

    #[snafu(display("failed to write the {artifact_type} artifact"))]
    WriteArtifact {
        source: artifact::Error,
        artifact_type: ArtifactType,
    },
}

/// The outputs of rendering one instance group.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    /// The manifest reduced to the instance group, with final job properties.
    pub properties: Manifest,
    pub bpm: bpm::Configs,
}

/// Recursively merges `overlay` into `base`. Values of `overlay` win, mappings are merged.
pub fn merge_properties(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(base_map)), Value::Mapping(overlay_map)) => {
                merge_properties(base_map, overlay_map);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Links provided by jobs of `manifest`, keyed by provider name.
fn local_links(deployment: &str, namespace: &str, manifest: &Manifest) -> Vec<(String, Link)> {
    let mut links = Vec::new();
    for group in &manifest.instance_groups {
        for job in &group.jobs {
            for (name, options) in &job.provides {
                let provider = options
                    .as_ref()
                    .and_then(|options| options.as_.clone())
                    .unwrap_or_else(|| name.clone());
                links.push((
                    provider,
                    local_link(deployment, namespace, group, name, job.properties.clone()),
                ));
            }
            for definition in &job.custom_provider_definitions {
                let properties = Value::Mapping(job.properties.clone());
                let mut exported = Mapping::new();
                for path in &definition.properties {
                    if let Some(value) = lookup(&properties, path) {
                        crate::manifest::insert_path(&mut exported, path, value.clone());
                    }
                }
                links.push((
                    definition.name.clone(),
                    local_link(deployment, namespace, group, &definition.type_, exported),
                ));
            }
        }
    }
    links
}

fn local_link(
    deployment: &str,
    namespace: &str,
    group: &InstanceGroup,
    type_: &str,
    properties: Mapping,
) -> Link {
    let service = instance_group_object_name(deployment, &group.name);
    Link {
        type_: type_.to_owned(),
        address: Some(format!("{service}.{namespace}.svc")),
        instances: group
            .instance_list(deployment)
            .into_iter()
            .map(|instance| LinkInstance {
                address: format!("{service}-{}.{service}.{namespace}.svc", instance.index),
                name: instance.name,
                id: instance.id,
                index: instance.index as usize,
                az: instance.az.unwrap_or_default(),
                bootstrap: instance.index == 0,
            })
            .collect(),
        properties,
    }
}

fn bpm_config(job: &crate::manifest::Job) -> Result<Config> {
    let properties = Value::Mapping(job.properties.clone());
    match lookup(&properties, "quarks.bpm") {
        Some(config) => {
            serde_yaml::from_value(config.clone()).context(InvalidBpmSnafu { job: &job.name })
        }
        None => Ok(Config {
            processes: vec![Process {
                name: job.name.clone(),
                executable: format!("/var/vcap/jobs/{}/bin/run", job.name),
                ..Process::default()
            }],
        }),
    }
}

/// Renders the instance group `instance_group` of the desired manifest.
pub fn render_instance_group(
    deployment: &str,
    namespace: &str,
    manifest: &Manifest,
    instance_group: &str,
    job_specs: &JobSpecs,
) -> Result<Rendered> {
    let group = manifest
        .instance_group(instance_group)
        .context(UnknownInstanceGroupSnafu {
            name: instance_group,
        })?;

    let mut properties = manifest.clone();
    properties.variables.clear();
    for (name, link) in local_links(deployment, namespace, manifest) {
        let already_resolved = properties
            .properties
            .get(LINKS_PROPERTY)
            .and_then(|links| links.get(&name))
            .is_some();
        if already_resolved {
            continue;
        }
        let value = serde_yaml::to_value(&link).context(SerializeLinkSnafu { name: &name })?;
        crate::manifest::insert_path(
            &mut properties.properties,
            &format!("{LINKS_PROPERTY}.{name}"),
            value,
        );
    }

    let mut rendered_group = group.clone();
    let mut configs = bpm::Configs::new();
    for job in &mut rendered_group.jobs {
        let mut job_properties = job_specs
            .defaults(&job.release, &job.name)
            .cloned()
            .unwrap_or_default();
        merge_properties(&mut job_properties, &properties.properties);
        merge_properties(&mut job_properties, &group.properties);
        merge_properties(&mut job_properties, &job.properties);
        job.properties = job_properties;
        configs.insert(job.name.clone(), bpm_config(job)?);
    }
    properties.instance_groups = vec![rendered_group];

    Ok(Rendered {
        properties,
        bpm: configs,
    })
}

/// Renders `instance_group` and writes its resolved properties and BPM artifacts.
///
/// Either artifact triggers the deployment of the group. The properties are written first, so a
/// new BPM configuration is never deployed with properties older than it.
#[tracing::instrument(skip(client, manifest, job_specs))]
pub async fn publish(
    client: &Client,
    namespace: &str,
    deployment: &str,
    manifest: &Manifest,
    instance_group: &str,
    job_specs: &JobSpecs,
) -> Result<()> {
    let owner = client
        .get::<BoshDeployment>(deployment, namespace)
        .await
        .context(GetDeploymentSnafu { name: deployment })?
        .controller_owner_ref(&())
        .context(MissingOwnerSnafu { name: deployment })?;
    let rendered =
        render_instance_group(deployment, namespace, manifest, instance_group, job_specs)?;

    let outputs = [
        (
            ArtifactKind::ResolvedProperties,
            rendered
                .properties
                .marshal()
                .context(SerializePropertiesSnafu)?,
        ),
        (
            ArtifactKind::Bpm,
            bpm::marshal(&rendered.bpm).context(SerializeBpmSnafu)?,
        ),
    ];
    for (kind, payload) in outputs {
        let artifact_type = ArtifactType::for_instance_group(kind, instance_group);
        artifact::create(
            client,
            namespace,
            owner.clone(),
            deployment,
            &artifact_type,
            &payload,
            BTreeMap::new(),
        )
        .await
        .with_context(|_| WriteArtifactSnafu {
            artifact_type: artifact_type.clone(),
        })?;
    }
    Ok(())
}
