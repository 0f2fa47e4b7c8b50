//! Tracks which deployments and workload sets consume which config maps and secrets.
//!
//! The functions here map a changed object to the objects that have to be reconciled because of
//! it. They work on snapshots of the controllers' caches and never talk to the store.

use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, PodTemplateSpec, Secret},
};
use kube::{Resource, ResourceExt, runtime::reflector::ObjectRef};
use sha2::{Digest, Sha256};
use strum::Display;

use crate::{
    artifact::{self, ArtifactKind},
    crd::{BoshDeployment, ReferenceType},
    kvp::{ARTIFACT_TYPE_KEY, DEPLOYMENT_NAME_KEY, LINK_PROVIDES_ANNOTATION},
};

/// The kinds of objects a pod template can consume.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ReferencedKind {
    ConfigMap,
    Secret,
}

fn referenced(deployment: &BoshDeployment, reference_type: ReferenceType) -> BTreeSet<String> {
    std::iter::once(&deployment.spec.manifest)
        .chain(&deployment.spec.ops)
        .filter(|reference| reference.type_ == reference_type)
        .map(|reference| reference.name.clone())
        .collect()
}

/// Config maps the manifest or ops files of `deployment` are read from.
pub fn referenced_config_maps(deployment: &BoshDeployment) -> BTreeSet<String> {
    referenced(deployment, ReferenceType::ConfigMap)
}

/// Secrets the manifest, ops files or variable values of `deployment` are read from.
pub fn referenced_secrets(deployment: &BoshDeployment) -> BTreeSet<String> {
    let mut secrets = referenced(deployment, ReferenceType::Secret);
    secrets.extend(deployment.spec.vars.iter().map(|var| var.secret.clone()));
    secrets
}

fn in_namespace<'a, K: Resource>(
    objects: &'a [Arc<K>],
    namespace: Option<String>,
) -> impl Iterator<Item = &'a Arc<K>> {
    objects
        .iter()
        .filter(move |object| object.meta().namespace == namespace)
}

/// Deployments that read `config_map`.
pub fn deployments_for_config_map(
    deployments: &[Arc<BoshDeployment>],
    config_map: &ConfigMap,
) -> Vec<ObjectRef<BoshDeployment>> {
    let name = config_map.name_any();
    in_namespace(deployments, config_map.namespace())
        .filter(|deployment| referenced_config_maps(deployment).contains(&name))
        .map(|deployment| ObjectRef::from_obj(&**deployment))
        .collect()
}

/// Deployments that read `secret`. A link provider secret concerns every deployment in its
/// namespace, since any of them may consume the link.
pub fn deployments_for_secret(
    deployments: &[Arc<BoshDeployment>],
    secret: &Secret,
) -> Vec<ObjectRef<BoshDeployment>> {
    let name = secret.name_any();
    let provides_link = secret.annotations().contains_key(LINK_PROVIDES_ANNOTATION);
    in_namespace(deployments, secret.namespace())
        .filter(|deployment| provides_link || referenced_secrets(deployment).contains(&name))
        .map(|deployment| ObjectRef::from_obj(&**deployment))
        .collect()
}

/// The newest with-ops artifacts of the deployments `secret` holds a variable value for.
///
/// That is the case for the generated secrets `<deployment>.var-*` and for secrets a deployment
/// names in its variable references.
pub fn artifacts_for_variable_secret(
    artifacts: &[Arc<Secret>],
    deployments: &[Arc<BoshDeployment>],
    secret: &Secret,
) -> Vec<ObjectRef<Secret>> {
    let name = secret.name_any();
    let consumers: BTreeSet<String> = in_namespace(deployments, secret.namespace())
        .filter(|deployment| {
            name.starts_with(&format!("{}.var-", deployment.name_any()))
                || deployment.spec.vars.iter().any(|var| var.secret == name)
        })
        .map(|deployment| deployment.name_any())
        .collect();

    let with_ops = ArtifactKind::WithOps.to_string();
    consumers
        .iter()
        .filter_map(|deployment| {
            in_namespace(artifacts, secret.namespace())
                .filter(|artifact| {
                    let labels = artifact.labels();
                    labels.get(DEPLOYMENT_NAME_KEY) == Some(deployment)
                        && labels.get(ARTIFACT_TYPE_KEY) == Some(&with_ops)
                })
                .max_by_key(|artifact| artifact::version_of(artifact))
                .map(|artifact| ObjectRef::from_obj(&**artifact))
        })
        .collect()
}

/// Names of the config maps and secrets a pod template mounts or sources environment from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateReferences {
    pub config_maps: BTreeSet<String>,
    pub secrets: BTreeSet<String>,
}

impl TemplateReferences {
    pub fn contains(&self, kind: ReferencedKind, name: &str) -> bool {
        match kind {
            ReferencedKind::ConfigMap => self.config_maps.contains(name),
            ReferencedKind::Secret => self.secrets.contains(name),
        }
    }
}

pub fn template_references(template: &PodTemplateSpec) -> TemplateReferences {
    let mut references = TemplateReferences::default();
    let Some(spec) = &template.spec else {
        return references;
    };

    for volume in spec.volumes.iter().flatten() {
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
            references.secrets.insert(name);
        }
        if let Some(config_map) = &volume.config_map {
            references.config_maps.insert(config_map.name.clone());
        }
        for source in volume.projected.iter().flat_map(|p| p.sources.iter().flatten()) {
            if let Some(secret) = &source.secret {
                references.secrets.insert(secret.name.clone());
            }
            if let Some(config_map) = &source.config_map {
                references.config_maps.insert(config_map.name.clone());
            }
        }
    }

    let containers = spec.containers.iter().chain(spec.init_containers.iter().flatten());
    for container in containers {
        for env in container.env.iter().flatten() {
            let Some(source) = &env.value_from else {
                continue;
            };
            if let Some(selector) = &source.secret_key_ref {
                references.secrets.insert(selector.name.clone());
            }
            if let Some(selector) = &source.config_map_key_ref {
                references.config_maps.insert(selector.name.clone());
            }
        }
        for source in container.env_from.iter().flatten() {
            if let Some(secret) = &source.secret_ref {
                references.secrets.insert(secret.name.clone());
            }
            if let Some(config_map) = &source.config_map_ref {
                references.config_maps.insert(config_map.name.clone());
            }
        }
    }

    references.secrets.remove("");
    references.config_maps.remove("");
    references
}

/// Workload sets owned by a deployment whose pod template consumes the object `name`.
pub fn workload_sets_for_object(
    sets: &[Arc<StatefulSet>],
    kind: ReferencedKind,
    namespace: Option<String>,
    name: &str,
) -> Vec<ObjectRef<StatefulSet>> {
    in_namespace(sets, namespace)
        .filter(|set| set.labels().contains_key(DEPLOYMENT_NAME_KEY))
        .filter(|set| {
            set.spec
                .as_ref()
                .is_some_and(|spec| template_references(&spec.template).contains(kind, name))
        })
        .map(|set| ObjectRef::from_obj(&**set))
        .collect()
}

/// Hex encoded SHA-256 over `parts`, each part prefixed by its length.
pub fn sha256_hex<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Digest over the data of every given secret and config map, independent of their order.
pub fn config_digest(secrets: &[Secret], config_maps: &[ConfigMap]) -> String {
    let mut entries: Vec<Vec<u8>> = Vec::new();
    for secret in secrets {
        for (key, value) in secret.data.iter().flatten() {
            entries.push(format!("secret/{}/{key}", secret.name_any()).into_bytes());
            entries.push(value.0.clone());
        }
    }
    for config_map in config_maps {
        for (key, value) in config_map.data.iter().flatten() {
            entries.push(format!("configmap/{}/{key}", config_map.name_any()).into_bytes());
            entries.push(value.clone().into_bytes());
        }
        for (key, value) in config_map.binary_data.iter().flatten() {
            entries.push(format!("configmap/{}/{key}", config_map.name_any()).into_bytes());
            entries.push(value.0.clone());
        }
    }

    let mut pairs: Vec<_> = entries.chunks(2).collect();
    pairs.sort();
    sha256_hex(pairs.into_iter().flatten())
}
