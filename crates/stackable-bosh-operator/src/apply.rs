//! Applies the resources of one instance group.
//!
//! Objects are created when missing and updated only when they differ from the desired state.
//! The spec an object was applied with is tracked by a digest annotation, so fields the cluster
//! defaults never count as a difference.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        batch::v1::Job,
        core::v1::{PersistentVolumeClaim, Service},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use snafu::{ResultExt, Snafu};

use crate::{
    bpm::convert::Resources,
    client::Client,
    kvp::{CONFIG_DIGEST_ANNOTATION, INSTANCE_GROUP_KEY, SPEC_DIGEST_ANNOTATION},
    reconcile::ErrorClass,
    references::sha256_hex,
    store::{Kind, ResourceKind, StoreError},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply {kind} {name:?}"))]
    Apply {
        source: StoreError,
        kind: ResourceKind,
        name: String,
    },

    #[snafu(display("failed to serialize the spec of {kind} {name:?}"))]
    SerializeSpec {
        source: serde_json::Error,
        kind: ResourceKind,
        name: String,
    },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Apply { source, .. } if source.is_conflict() => ErrorClass::Conflict,
            Self::Apply { .. } => ErrorClass::Transient,
            Self::SerializeSpec { .. } => ErrorClass::Fatal,
        }
    }
}

/// Resources whose spec can be applied.
pub trait Applicable: Kind {
    fn spec_json(&self) -> serde_json::Result<Vec<u8>>;

    /// Replaces the spec of `self` with the one of `desired`, keeping fields the cluster owns.
    fn take_spec(&mut self, desired: &Self);
}

impl Applicable for Service {
    fn spec_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.spec)
    }

    fn take_spec(&mut self, desired: &Self) {
        let mut spec = desired.spec.clone().unwrap_or_default();
        if let Some(live) = &self.spec {
            if spec.cluster_ip.as_deref() != Some("None") {
                spec.cluster_ip.clone_from(&live.cluster_ip);
                spec.cluster_ips.clone_from(&live.cluster_ips);
            }
        }
        self.spec = Some(spec);
    }
}

impl Applicable for StatefulSet {
    fn spec_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.spec)
    }

    fn take_spec(&mut self, desired: &Self) {
        let mut spec = desired.spec.clone().unwrap_or_default();
        // The config digest is maintained by the restart controller.
        let live_digest = self
            .spec
            .as_ref()
            .and_then(|live| live.template.metadata.as_ref())
            .and_then(|meta| meta.annotations.as_ref())
            .and_then(|annotations| annotations.get(CONFIG_DIGEST_ANNOTATION));
        if let Some(digest) = live_digest {
            spec.template
                .metadata
                .get_or_insert_default()
                .annotations
                .get_or_insert_default()
                .entry(CONFIG_DIGEST_ANNOTATION.to_owned())
                .or_insert_with(|| digest.clone());
        }
        self.spec = Some(spec);
    }
}

impl Applicable for Job {
    fn spec_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.spec)
    }

    fn take_spec(&mut self, desired: &Self) {
        self.spec.clone_from(&desired.spec);
    }
}

fn merge_map(
    live: &mut Option<BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let live = live.get_or_insert_default();
    let mut changed = false;
    for (key, value) in desired {
        if live.get(key) != Some(value) {
            live.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Merges the labels, annotations and owners of `desired` into `live`.
///
/// Keys only present on the live object are kept, they may be owned by someone else.
fn merge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let labels_changed = merge_map(&mut live.labels, desired.labels.as_ref());
    let annotations_changed = merge_map(&mut live.annotations, desired.annotations.as_ref());
    let owners_changed = desired.owner_references.is_some()
        && live.owner_references != desired.owner_references;
    if owners_changed {
        live.owner_references.clone_from(&desired.owner_references);
    }
    labels_changed || annotations_changed || owners_changed
}

/// The object to write to turn `live` into `desired`, or [`None`] if both are equal.
///
/// `desired` must carry its spec digest.
pub fn diff<K: Applicable>(live: &K, desired: &K) -> Option<K> {
    let mut updated = live.clone();
    if !merge_meta(updated.meta_mut(), desired.meta()) {
        return None;
    }
    updated.take_spec(desired);
    Some(updated)
}

/// What [`Applier::apply`] did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub recreated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Applies the resources of the instance group `instance_group`, owned by `owner`.
pub struct Applier<'a> {
    client: &'a Client,
    owner: OwnerReference,
    instance_group: &'a str,
}

impl<'a> Applier<'a> {
    pub fn new(client: &'a Client, owner: OwnerReference, instance_group: &'a str) -> Self {
        Self {
            client,
            owner,
            instance_group,
        }
    }

    /// Applies every resource, stopping at the first failure.
    ///
    /// Objects applied before the failure stay in place, the next run continues from there.
    pub async fn apply(&self, resources: Resources) -> Result<Summary> {
        let mut summary = Summary::default();
        for claim in resources.persistent_volume_claims {
            self.create_if_absent(claim, &mut summary).await?;
        }
        for service in resources.services {
            self.create_or_update(service, false, &mut summary).await?;
        }
        for stateful_set in resources.stateful_sets {
            self.create_or_update(stateful_set, false, &mut summary)
                .await?;
        }
        for job in resources.jobs {
            self.create_or_update(job, true, &mut summary).await?;
        }
        Ok(summary)
    }

    /// Sets the owner of `object`. Objects of another instance group are rejected.
    fn prepare<K: Kind>(&self, object: &mut K) -> bool {
        let instance_group = object.labels().get(INSTANCE_GROUP_KEY).cloned();
        if instance_group.as_deref() != Some(self.instance_group) {
            tracing::warn!(
                kind = %K::KIND,
                name = %object.name_any(),
                instance_group = ?instance_group,
                expected = self.instance_group,
                "Skipping resource of another instance group"
            );
            return false;
        }
        object.meta_mut().owner_references = Some(vec![self.owner.clone()]);
        true
    }

    async fn create_if_absent(
        &self,
        mut claim: PersistentVolumeClaim,
        summary: &mut Summary,
    ) -> Result<()> {
        if !self.prepare(&mut claim) {
            summary.skipped += 1;
            return Ok(());
        }
        match self.client.create(&claim).await {
            Ok(_) => summary.created += 1,
            // Claims are immutable once bound.
            Err(StoreError::AlreadyExists { .. }) => summary.unchanged += 1,
            Err(source) => {
                return Err(Error::Apply {
                    source,
                    kind: ResourceKind::PersistentVolumeClaim,
                    name: claim.name_any(),
                });
            }
        }
        Ok(())
    }

    async fn create_or_update<K: Applicable>(
        &self,
        mut desired: K,
        recreate: bool,
        summary: &mut Summary,
    ) -> Result<()> {
        if !self.prepare(&mut desired) {
            summary.skipped += 1;
            return Ok(());
        }
        let name = desired.name_any();
        let namespace = desired.namespace().unwrap_or_default();
        let spec_json = desired.spec_json().context(SerializeSpecSnafu {
            kind: K::KIND,
            name: &name,
        })?;
        desired
            .annotations_mut()
            .insert(SPEC_DIGEST_ANNOTATION.to_owned(), sha256_hex([spec_json]));

        let apply_context = || ApplySnafu {
            kind: K::KIND,
            name: &name,
        };
        let live = self
            .client
            .get_opt::<K>(&name, &namespace)
            .await
            .with_context(|_| apply_context())?;
        let Some(live) = live else {
            self.client
                .create(&desired)
                .await
                .with_context(|_| apply_context())?;
            tracing::debug!(kind = %K::KIND, name = %name, "Created resource");
            summary.created += 1;
            return Ok(());
        };

        match diff(&live, &desired) {
            None => summary.unchanged += 1,
            Some(_) if recreate => {
                // Job specs are immutable.
                self.client
                    .delete(&live)
                    .await
                    .with_context(|_| apply_context())?;
                self.client
                    .create(&desired)
                    .await
                    .with_context(|_| apply_context())?;
                tracing::info!(kind = %K::KIND, name = %name, "Recreated resource");
                summary.recreated += 1;
            }
            Some(updated) => {
                self.client
                    .update(&updated)
                    .await
                    .with_context(|_| apply_context())?;
                tracing::info!(kind = %K::KIND, name = %name, "Updated resource");
                summary.updated += 1;
            }
        }
        Ok(())
    }
}
