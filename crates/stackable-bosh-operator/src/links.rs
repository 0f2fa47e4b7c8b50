//! Cross-deployment links.
//!
//! A job consumes a link by name. Links provided by jobs of the same manifest are resolved by
//! the rendering step, every other consumed link must be provided from outside: by a secret
//! carrying the link properties and optionally a service carrying the addresses, both tagged
//! with the provider annotation `{"name": …, "type": …}`. Resolved links are merged into the
//! manifest's global properties below `quarks_links`.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Endpoints, Pod, Secret, Service};
use kube::{ResourceExt, core::Selector};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use snafu::{ResultExt, Snafu};

use crate::{
    client::Client,
    kvp::{INSTANCE_GROUP_KEY, LINK_PROVIDES_ANNOTATION},
    manifest::{Manifest, insert_path},
    reconcile::ErrorClass,
    store::StoreError,
};

/// The global property resolved links are merged into.
pub const LINKS_PROPERTY: &str = "quarks_links";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list link providers"))]
    ListProviders { source: StoreError },

    #[snafu(display("duplicated provider {name:?}: provided by both {first} and {second}"))]
    DuplicatedProvider {
        name: String,
        first: String,
        second: String,
    },

    #[snafu(display("missing link secrets for providers: {}", names.join(", ")))]
    MissingProviders { names: Vec<String> },

    #[snafu(display("failed to serialize link {name:?}"))]
    SerializeLink {
        source: serde_yaml::Error,
        name: String,
    },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ListProviders { source } => source.class(),
            // Provider changes trigger a new reconcile.
            Self::DuplicatedProvider { .. } | Self::MissingProviders { .. } => {
                ErrorClass::Configuration { retry: false }
            }
            Self::SerializeLink { .. } => ErrorClass::Fatal,
        }
    }
}

/// The value of [`LINK_PROVIDES_ANNOTATION`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderAnnotation {
    pub name: String,

    #[serde(rename = "type", default)]
    pub type_: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Link {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    pub instances: Vec<LinkInstance>,

    pub properties: Mapping,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LinkInstance {
    pub name: String,
    pub id: String,
    pub index: usize,
    pub az: String,
    pub address: String,
    pub bootstrap: bool,
}

/// Which objects a link was resolved from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkInfo {
    pub provider: String,
    pub secret_name: String,
    pub service_name: Option<String>,
}

/// Names of all links the jobs of `manifest` consume.
pub fn consumed_providers(manifest: &Manifest) -> BTreeSet<String> {
    manifest
        .instance_groups
        .iter()
        .flat_map(|group| &group.jobs)
        .flat_map(|job| &job.consumes)
        .map(|(name, options)| {
            options
                .as_ref()
                .and_then(|options| options.from.clone())
                .unwrap_or_else(|| name.clone())
        })
        .collect()
}

/// Names of all links the jobs of `manifest` provide themselves.
pub fn local_providers(manifest: &Manifest) -> BTreeSet<String> {
    let jobs = manifest
        .instance_groups
        .iter()
        .flat_map(|group| &group.jobs);
    let provided = jobs.clone().flat_map(|job| &job.provides).map(|(name, options)| {
        options
            .as_ref()
            .and_then(|options| options.as_.clone())
            .unwrap_or_else(|| name.clone())
    });
    let custom = jobs
        .flat_map(|job| &job.custom_provider_definitions)
        .map(|definition| definition.name.clone());
    provided.chain(custom).collect()
}

/// Links the manifest consumes but does not provide.
pub fn missing_providers(manifest: &Manifest) -> BTreeSet<String> {
    let local = local_providers(manifest);
    consumed_providers(manifest)
        .into_iter()
        .filter(|name| !local.contains(name))
        .collect()
}

/// The provider an object announces, if any.
///
/// An unparsable annotation only disqualifies its own object. If it was meant to provide a
/// consumed link, that link ends up missing and is reported as such.
fn provider_annotation(
    annotations: &BTreeMap<String, String>,
    object: impl FnOnce() -> String,
) -> Option<ProviderAnnotation> {
    let value = annotations.get(LINK_PROVIDES_ANNOTATION)?;
    match serde_json::from_str(value) {
        Ok(provider) => Some(provider),
        Err(error) => {
            tracing::warn!(
                object = %object(),
                error = &error as &dyn std::error::Error,
                "Ignoring invalid link provider annotation"
            );
            None
        }
    }
}

/// Turns link secret data into a property tree. Keys are `.`-separated paths, values YAML.
fn link_properties(secret: &Secret) -> Mapping {
    let mut properties = Mapping::new();
    for (key, value) in secret.data.iter().flatten() {
        let text = match std::str::from_utf8(&value.0) {
            Ok(text) => text.to_owned(),
            Err(error) => {
                tracing::debug!(
                    secret = %secret.name_any(),
                    key,
                    %error,
                    "Link property is not valid UTF-8, replacing invalid bytes"
                );
                String::from_utf8_lossy(&value.0).into_owned()
            }
        };
        let value = match serde_yaml::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(
                    secret = %secret.name_any(),
                    key,
                    %error,
                    "Link property is not YAML, keeping it as a string"
                );
                Value::String(text)
            }
        };
        insert_path(&mut properties, key, value);
    }
    properties
}

/// Pods that serve traffic: running and not on their way out.
fn is_live(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running")
}

/// Resolves the links a manifest consumes from other deployments.
#[derive(Clone)]
pub struct LinkResolver {
    client: Client,
    cluster_domain: String,
}

impl LinkResolver {
    pub fn new(client: Client, cluster_domain: impl Into<String>) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.into(),
        }
    }

    fn service_address(&self, service: &str, namespace: &str) -> String {
        format!("{service}.{namespace}.svc.{}", self.cluster_domain)
    }

    /// Resolves every link `manifest` consumes but does not provide.
    ///
    /// Returns the link properties keyed by provider name, ready to be merged with [`merge`].
    #[tracing::instrument(skip(self, manifest), fields(deployment = %manifest.name))]
    pub async fn resolve(
        &self,
        manifest: &Manifest,
        namespace: &str,
    ) -> Result<(BTreeMap<String, Link>, Vec<LinkInfo>)> {
        let missing = missing_providers(manifest);
        if missing.is_empty() {
            return Ok((BTreeMap::new(), Vec::new()));
        }

        let secrets = self
            .client
            .list::<Secret>(namespace)
            .await
            .context(ListProvidersSnafu)?;
        let mut found: BTreeMap<String, (Secret, ProviderAnnotation)> = BTreeMap::new();
        for secret in secrets {
            let Some(provider) = provider_annotation(secret.annotations(), || {
                format!("secret {}", secret.name_any())
            }) else {
                continue;
            };
            if !missing.contains(&provider.name) {
                continue;
            }
            if let Some((first, _)) = found.get(&provider.name) {
                return DuplicatedProviderSnafu {
                    name: provider.name,
                    first: format!("secret {}", first.name_any()),
                    second: format!("secret {}", secret.name_any()),
                }
                .fail();
            }
            found.insert(provider.name.clone(), (secret, provider));
        }

        let unmatched: Vec<_> = missing
            .iter()
            .filter(|name| !found.contains_key(*name))
            .cloned()
            .collect();
        if !unmatched.is_empty() {
            return MissingProvidersSnafu { names: unmatched }.fail();
        }

        let services = self
            .client
            .list::<Service>(namespace)
            .await
            .context(ListProvidersSnafu)?;
        let mut service_by_provider: BTreeMap<String, Service> = BTreeMap::new();
        for service in services {
            let Some(provider) = provider_annotation(service.annotations(), || {
                format!("service {}", service.name_any())
            }) else {
                continue;
            };
            if !found.contains_key(&provider.name) {
                continue;
            }
            if let Some(first) = service_by_provider.get(&provider.name) {
                return DuplicatedProviderSnafu {
                    name: provider.name,
                    first: format!("service {}", first.name_any()),
                    second: format!("service {}", service.name_any()),
                }
                .fail();
            }
            service_by_provider.insert(provider.name, service);
        }

        let mut links = BTreeMap::new();
        let mut infos = Vec::new();
        for (name, (secret, provider)) in found {
            let service = service_by_provider.remove(&name);
            let mut link = Link {
                type_: provider.type_,
                properties: link_properties(&secret),
                ..Link::default()
            };
            if let Some(service) = &service {
                link.address = Some(self.service_address(&service.name_any(), namespace));
                link.instances = self.service_instances(service, namespace).await?;
            }
            tracing::debug!(
                provider = %name,
                instances = link.instances.len(),
                "Resolved link"
            );
            infos.push(LinkInfo {
                provider: name.clone(),
                secret_name: secret.name_any(),
                service_name: service.map(|service| service.name_any()),
            });
            links.insert(name, link);
        }

        Ok((links, infos))
    }

    async fn service_instances(&self, service: &Service, namespace: &str) -> Result<Vec<LinkInstance>> {
        let service_name = service.name_any();
        let selector = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .filter(|selector| !selector.is_empty());

        if let Some(selector) = selector {
            let pods = self
                .client
                .list_with_label_selector::<Pod>(namespace, &Selector::from_iter(selector))
                .await
                .context(ListProvidersSnafu)?;
            return Ok(pods
                .iter()
                .filter(|pod| is_live(pod))
                .filter_map(|pod| {
                    let ip = pod.status.as_ref()?.pod_ip.clone()?;
                    let name = pod
                        .labels()
                        .get(INSTANCE_GROUP_KEY)
                        .cloned()
                        .unwrap_or_else(|| service_name.clone());
                    Some((pod, name, ip))
                })
                .enumerate()
                .map(|(index, (pod, name, address))| LinkInstance {
                    name,
                    id: pod.uid().unwrap_or_else(|| pod.name_any()),
                    index,
                    az: pod
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.node_name.clone())
                        .unwrap_or_default(),
                    address,
                    bootstrap: index == 0,
                })
                .collect());
        }

        let endpoints = self
            .client
            .get_opt::<Endpoints>(&service_name, namespace)
            .await
            .context(ListProvidersSnafu)?;
        let addresses = endpoints
            .iter()
            .flat_map(|endpoints| endpoints.subsets.iter().flatten())
            .flat_map(|subset| subset.addresses.iter().flatten())
            .map(|address| address.ip.clone());
        // Without endpoints the service is only a DNS name.
        Ok(addresses
            .enumerate()
            .map(|(index, address)| LinkInstance {
                name: service_name.clone(),
                id: format!("{service_name}-{index}"),
                index,
                az: String::new(),
                address,
                bootstrap: index == 0,
            })
            .collect())
    }
}

/// Merges resolved links into `properties.quarks_links.<provider>` of the manifest.
pub fn merge(manifest: &mut Manifest, links: &BTreeMap<String, Link>) -> Result<()> {
    if links.is_empty() {
        return Ok(());
    }
    let mut merged = manifest
        .properties
        .get(LINKS_PROPERTY)
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    for (name, link) in links {
        let value = serde_yaml::to_value(link).context(SerializeLinkSnafu { name })?;
        merged.insert(Value::String(name.clone()), value);
    }
    insert_path(&mut manifest.properties, LINKS_PROPERTY, Value::Mapping(merged));
    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use k8s_openapi::{
        ByteString,
        api::core::v1::{EndpointAddress, EndpointSubset, PodStatus, ServiceSpec},
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::Utc,
    };
    use kube::api::ObjectMeta;

    use super::*;

    const CONSUMER: &str = indoc! {"
        name: app
        instance_groups:
          - name: app
            instances: 1
            jobs:
              - name: app
                consumes:
                  nats: {from: nats-cluster}
                  database: ~
              - name: local
                provides:
                  database: ~
                custom_provider_definitions:
                  - name: metrics
                    type: prometheus
    "};

    fn meta(name: &str, provider: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            annotations: provider.map(|provider| {
                [(
                    LINK_PROVIDES_ANNOTATION.to_owned(),
                    format!(r#"{{"name":"{provider}","type":"nats"}}"#),
                )]
                .into()
            }),
            ..ObjectMeta::default()
        }
    }

    fn link_secret(name: &str, provider: &str) -> Secret {
        Secret {
            metadata: meta(name, Some(provider)),
            data: Some(
                [
                    ("nats.user".to_owned(), ByteString(b"admin".to_vec())),
                    ("nats.port".to_owned(), ByteString(b"4222".to_vec())),
                ]
                .into(),
            ),
            ..Secret::default()
        }
    }

    fn resolver(client: &Client) -> LinkResolver {
        LinkResolver::new(client.clone(), "cluster.local")
    }

    fn consumer() -> Manifest {
        Manifest::parse(CONSUMER).expect("valid manifest")
    }

    #[test]
    fn local_providers_are_not_missing() {
        let manifest = consumer();

        assert_eq!(
            consumed_providers(&manifest),
            ["database", "nats-cluster"].map(str::to_owned).into()
        );
        assert_eq!(
            missing_providers(&manifest),
            ["nats-cluster".to_owned()].into()
        );
    }

    #[tokio::test]
    async fn secrets_and_selector_services_resolve_to_pod_addresses() {
        let (client, _) = Client::in_memory();
        client
            .create(&link_secret("nats-link", "nats-cluster"))
            .await
            .expect("create succeeds");
        client
            .create(&Service {
                metadata: meta("nats", Some("nats-cluster")),
                spec: Some(ServiceSpec {
                    selector: Some([("app".to_owned(), "nats".to_owned())].into()),
                    ..ServiceSpec::default()
                }),
                ..Service::default()
            })
            .await
            .expect("create succeeds");
        for (name, ip, phase, terminating) in [
            ("nats-0", Some("10.0.0.1"), "Running", false),
            ("nats-1", Some("10.0.0.2"), "Running", false),
            ("nats-2", None, "Pending", false),
            ("nats-3", Some("10.0.0.4"), "Running", true),
            ("nats-4", Some("10.0.0.5"), "Succeeded", false),
        ] {
            let mut metadata = meta(name, None);
            metadata.labels = Some([("app".to_owned(), "nats".to_owned())].into());
            metadata.deletion_timestamp = terminating.then(|| Time(Utc::now()));
            client
                .create(&Pod {
                    metadata,
                    status: Some(PodStatus {
                        pod_ip: ip.map(str::to_owned),
                        phase: Some(phase.to_owned()),
                        ..PodStatus::default()
                    }),
                    ..Pod::default()
                })
                .await
                .expect("create succeeds");
        }

        let (links, infos) = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect("links resolve");

        let link = &links["nats-cluster"];
        assert_eq!(link.type_, "nats");
        assert_eq!(
            link.address.as_deref(),
            Some("nats.default.svc.cluster.local")
        );
        let addresses: Vec<_> = link.instances.iter().map(|i| i.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(link.instances[0].bootstrap);
        assert!(!link.instances[1].bootstrap);
        assert_eq!(
            Value::Mapping(link.properties.clone())["nats"]["port"],
            Value::from(4222)
        );
        assert_eq!(infos[0].service_name.as_deref(), Some("nats"));
    }

    #[tokio::test]
    async fn services_without_selector_use_endpoints_or_dns_only() {
        let (client, _) = Client::in_memory();
        client
            .create(&link_secret("nats-link", "nats-cluster"))
            .await
            .expect("create succeeds");
        client
            .create(&Service {
                metadata: meta("external-nats", Some("nats-cluster")),
                spec: Some(ServiceSpec::default()),
                ..Service::default()
            })
            .await
            .expect("create succeeds");

        let (links, _) = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect("links resolve");
        assert!(links["nats-cluster"].instances.is_empty());
        assert_eq!(
            links["nats-cluster"].address.as_deref(),
            Some("external-nats.default.svc.cluster.local")
        );

        client
            .create(&Endpoints {
                metadata: meta("external-nats", None),
                subsets: Some(vec![EndpointSubset {
                    addresses: Some(vec![EndpointAddress {
                        ip: "192.168.1.10".to_owned(),
                        ..EndpointAddress::default()
                    }]),
                    ..EndpointSubset::default()
                }]),
            })
            .await
            .expect("create succeeds");

        let (links, _) = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect("links resolve");
        assert_eq!(links["nats-cluster"].instances[0].address, "192.168.1.10");
    }

    #[tokio::test]
    async fn duplicated_providers_are_fatal() {
        let (client, _) = Client::in_memory();
        for name in ["nats-link-a", "nats-link-b"] {
            client
                .create(&link_secret(name, "nats-cluster"))
                .await
                .expect("create succeeds");
        }

        let error = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect_err("provider is duplicated");

        assert!(matches!(error, Error::DuplicatedProvider { .. }));
        assert!(error.to_string().starts_with("duplicated provider"));
    }

    #[tokio::test]
    async fn invalid_annotations_of_unrelated_objects_are_ignored() {
        let (client, _) = Client::in_memory();
        client
            .create(&link_secret("nats-link", "nats-cluster"))
            .await
            .expect("create succeeds");
        let mut metadata = meta("other-team", None);
        metadata.annotations =
            Some([(LINK_PROVIDES_ANNOTATION.to_owned(), "not json".to_owned())].into());
        client
            .create(&Secret {
                metadata: metadata.clone(),
                ..Secret::default()
            })
            .await
            .expect("create succeeds");
        client
            .create(&Service {
                metadata,
                ..Service::default()
            })
            .await
            .expect("create succeeds");

        let (links, infos) = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect("links resolve");

        assert_eq!(links.keys().collect::<Vec<_>>(), ["nats-cluster"]);
        assert_eq!(infos[0].secret_name, "nats-link");
        assert_eq!(infos[0].service_name, None);
    }

    #[tokio::test]
    async fn a_needed_provider_with_an_invalid_annotation_is_missing() {
        let (client, _) = Client::in_memory();
        let mut metadata = meta("nats-link", None);
        metadata.annotations = Some(
            [(
                LINK_PROVIDES_ANNOTATION.to_owned(),
                r#"{"name": "nats-cluster""#.to_owned(),
            )]
            .into(),
        );
        client
            .create(&Secret {
                metadata,
                ..Secret::default()
            })
            .await
            .expect("create succeeds");

        let error = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect_err("provider is missing");

        assert!(matches!(error, Error::MissingProviders { .. }));
    }

    #[test]
    fn undecodable_link_data_is_kept_as_text() {
        let mut secret = link_secret("nats-link", "nats-cluster");
        secret.data = Some(
            [
                ("nats.banner".to_owned(), ByteString(b"key: [".to_vec())),
                ("nats.raw".to_owned(), ByteString(vec![b'a', 0xff, b'b'])),
            ]
            .into(),
        );

        let properties = Value::Mapping(link_properties(&secret));

        assert_eq!(properties["nats"]["banner"], Value::from("key: ["));
        assert_eq!(properties["nats"]["raw"], Value::from("a\u{fffd}b"));
    }

    #[tokio::test]
    async fn missing_providers_are_fatal_and_named() {
        let (client, _) = Client::in_memory();
        client
            .create(&link_secret("unrelated", "postgres"))
            .await
            .expect("create succeeds");

        let error = resolver(&client)
            .resolve(&consumer(), "default")
            .await
            .expect_err("provider is missing");

        assert_eq!(
            error.to_string(),
            "missing link secrets for providers: nats-cluster"
        );
    }

    #[test]
    fn links_are_merged_below_the_reserved_property() {
        let mut manifest = consumer();
        let links = BTreeMap::from([(
            "nats-cluster".to_owned(),
            Link {
                type_: "nats".to_owned(),
                ..Link::default()
            },
        )]);

        merge(&mut manifest, &links).expect("links merge");

        let properties = Value::Mapping(manifest.properties);
        assert_eq!(
            properties[LINKS_PROPERTY]["nats-cluster"]["type"],
            Value::from("nats")
        );
    }
}
