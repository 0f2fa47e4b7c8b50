//! Publishes DNS aliases for the instance groups of a deployment.
//!
//! BOSH jobs address each other as `<instance-group>.<deployment>.bosh`. The aliases are written
//! to the config map `<deployment>.dns`, from which a cluster DNS plugin can serve them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};

use crate::{
    client::Client,
    kvp::deployment_labels,
    manifest::{Manifest, instance_group_object_name},
    reconcile::ErrorClass,
    store::StoreError,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the DNS config map {name:?}"))]
    Read { source: StoreError, name: String },

    #[snafu(display("failed to write the DNS config map {name:?}"))]
    Write { source: StoreError, name: String },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => source.class(),
        }
    }
}

/// Publishes the instance group aliases of a deployment.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn apply(
        &self,
        deployment: &str,
        manifest: &Manifest,
        namespace: &str,
        owner: OwnerReference,
    ) -> Result<()>;
}

/// Name of the config map holding the aliases of `deployment`.
pub fn config_map_name(deployment: &str) -> String {
    format!("{deployment}.dns")
}

/// Alias to service DNS name for every instance group.
pub fn aliases(
    deployment: &str,
    manifest: &Manifest,
    namespace: &str,
    cluster_domain: &str,
) -> BTreeMap<String, String> {
    manifest
        .instance_groups
        .iter()
        .map(|group| {
            (
                format!("{}.{deployment}.bosh", group.name),
                format!(
                    "{}.{namespace}.svc.{cluster_domain}",
                    instance_group_object_name(deployment, &group.name)
                ),
            )
        })
        .collect()
}

/// A [`NameService`] backed by a config map.
#[derive(Clone)]
pub struct ConfigMapNameService {
    client: Client,
    cluster_domain: String,
}

impl ConfigMapNameService {
    pub fn new(client: Client, cluster_domain: impl Into<String>) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.into(),
        }
    }
}

#[async_trait]
impl NameService for ConfigMapNameService {
    #[tracing::instrument(skip(self, manifest, owner))]
    async fn apply(
        &self,
        deployment: &str,
        manifest: &Manifest,
        namespace: &str,
        owner: OwnerReference,
    ) -> Result<()> {
        let name = config_map_name(deployment);
        let data = aliases(deployment, manifest, namespace, &self.cluster_domain);

        let live = self
            .client
            .get_opt::<ConfigMap>(&name, namespace)
            .await
            .context(ReadSnafu { name: &name })?;
        match live {
            Some(live) if live.data.as_ref() == Some(&data) => {
                tracing::debug!("DNS aliases are up to date");
            }
            Some(mut live) => {
                live.data = Some(data);
                self.client
                    .update(&live)
                    .await
                    .context(WriteSnafu { name: &name })?;
                tracing::info!(config_map = %name, "Updated DNS aliases");
            }
            None => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.to_owned()),
                        labels: Some(deployment_labels(deployment)),
                        owner_references: Some(vec![owner]),
                        ..ObjectMeta::default()
                    },
                    data: Some(data),
                    ..ConfigMap::default()
                };
                self.client
                    .create(&config_map)
                    .await
                    .context(WriteSnafu { name: &name })?;
                tracing::info!(config_map = %name, "Published DNS aliases");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            name: "nats".to_owned(),
            uid: "uid-0".to_owned(),
            ..OwnerReference::default()
        }
    }

    #[tokio::test]
    async fn aliases_point_at_headless_services() {
        let (client, _) = Client::in_memory();
        let service = ConfigMapNameService::new(client.clone(), "cluster.local");
        let manifest = Manifest::parse(indoc! {"
            name: nats
            instance_groups:
              - name: nats
              - name: smoke_tests
        "})
        .expect("valid manifest");

        service
            .apply("nats", &manifest, "default", owner())
            .await
            .expect("apply succeeds");
        service
            .apply("nats", &manifest, "default", owner())
            .await
            .expect("apply succeeds");

        let config_map: ConfigMap = client.get("nats.dns", "default").await.expect("exists");
        let data = config_map.data.expect("data is set");
        assert_eq!(data["nats.nats.bosh"], "nats-nats.default.svc.cluster.local");
        assert_eq!(
            data["smoke_tests.nats.bosh"],
            "nats-smoke-tests.default.svc.cluster.local"
        );
        assert_eq!(
            config_map.metadata.resource_version,
            Some("1".to_owned()),
            "an unchanged alias list is not written again"
        );
    }
}
