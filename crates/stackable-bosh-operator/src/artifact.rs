//! Versioned, append-only configuration snapshots.
//!
//! An artifact is an immutable [`Secret`] holding one YAML payload. Artifacts of the same
//! deployment and [`ArtifactType`] form a family whose versions count up from 1. A new payload
//! is always a new object named `<deployment>.<type>-v<version>`, an identical payload is never
//! written twice in a row.
//!
//! Versions are computed from a listing, so two writers may pick the same next version. The
//! second create then fails with an "already exists" conflict and the writer requeues, no
//! version is ever overwritten.

use std::{collections::BTreeMap, fmt, str::FromStr};

use k8s_openapi::{
    ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{ResourceExt, api::ObjectMeta, core::Selector};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::{
    client::Client,
    kvp::{
        ARTIFACT_TYPE_KEY, ARTIFACT_VERSION_KEY, DEPLOYMENT_NAME_KEY, INSTANCE_GROUP_KEY,
        deployment_labels,
    },
    manifest::kube_name,
    reconcile::ErrorClass,
    store::StoreError,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no {artifact_type} artifact exists for deployment {deployment}"))]
    NotFound {
        deployment: String,
        artifact_type: ArtifactType,
    },

    #[snafu(display("failed to access artifacts"))]
    Store { source: StoreError },

    #[snafu(display("artifact {name} has no {key} payload"))]
    MissingPayload { name: String, key: String },

    #[snafu(display("artifact {name} payload is not valid UTF-8"))]
    InvalidPayload {
        source: std::string::FromUtf8Error,
        name: String,
    },

    #[snafu(display("artifact {name} does not carry deployment and type labels"))]
    MissingFamilyLabels { name: String },

    #[snafu(display("invalid artifact type {artifact_type:?}"))]
    InvalidType {
        source: strum::ParseError,
        artifact_type: String,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Store { source } => source.class(),
            Self::MissingPayload { .. }
            | Self::InvalidPayload { .. }
            | Self::MissingFamilyLabels { .. }
            | Self::InvalidType { .. } => ErrorClass::Fatal,
        }
    }
}

/// The stages that produce artifacts.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ArtifactKind {
    /// The base manifest with all ops files and resolved links applied.
    WithOps,

    /// The manifest with every variable interpolated.
    Desired,

    /// Per instance group: the job properties after rendering.
    ResolvedProperties,

    /// Per instance group: the process configuration.
    Bpm,
}

impl ArtifactKind {
    /// The secret data key the payload is stored under.
    pub fn payload_key(self) -> &'static str {
        match self {
            Self::WithOps | Self::Desired => "manifest.yaml",
            Self::ResolvedProperties => "properties.yaml",
            Self::Bpm => "bpm.yaml",
        }
    }
}

/// Identifies an artifact family of a deployment, e.g. `with-ops` or `bpm.web`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ArtifactType {
    pub kind: ArtifactKind,
    pub instance_group: Option<String>,
}

impl ArtifactType {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            instance_group: None,
        }
    }

    pub fn for_instance_group(kind: ArtifactKind, instance_group: impl Into<String>) -> Self {
        Self {
            kind,
            instance_group: Some(instance_group.into()),
        }
    }

    /// The family name, `<deployment>.<type>`. Instance group names are sanitized.
    pub fn family_name(&self, deployment: &str) -> String {
        match &self.instance_group {
            Some(instance_group) => {
                format!("{deployment}.{}.{}", self.kind, kube_name(instance_group))
            }
            None => format!("{deployment}.{}", self.kind),
        }
    }

    fn selector(&self, deployment: &str) -> Selector {
        Selector::from_iter([
            (DEPLOYMENT_NAME_KEY.to_owned(), deployment.to_owned()),
            (ARTIFACT_TYPE_KEY.to_owned(), self.to_string()),
        ])
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_group {
            Some(instance_group) => write!(f, "{}.{instance_group}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for ArtifactType {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (kind, instance_group) = match input.split_once('.') {
            Some((kind, instance_group)) => (kind, Some(instance_group.to_owned())),
            None => (input, None),
        };
        Ok(Self {
            kind: kind.parse().context(InvalidTypeSnafu {
                artifact_type: input,
            })?,
            instance_group,
        })
    }
}

/// The result of [`create`].
#[derive(Clone, Debug, PartialEq)]
pub enum Created {
    /// A new version was written.
    New(Secret),

    /// The latest version already holds this payload, nothing was written.
    Identical(Secret),
}

impl Created {
    pub fn artifact(&self) -> &Secret {
        match self {
            Self::New(artifact) | Self::Identical(artifact) => artifact,
        }
    }

    pub fn into_artifact(self) -> Secret {
        match self {
            Self::New(artifact) | Self::Identical(artifact) => artifact,
        }
    }
}

/// Renders `<name>-v<version>`.
pub fn artifact_name(name: &str, version: u64) -> String {
    format!("{name}-v{version}")
}

/// The version of an artifact, read from its version label.
pub fn version_of(artifact: &Secret) -> Option<u64> {
    artifact.labels().get(ARTIFACT_VERSION_KEY)?.parse().ok()
}

/// The deployment and type an artifact belongs to, read from its labels.
pub fn family_of(artifact: &Secret) -> Result<(String, ArtifactType)> {
    let labels = artifact.labels();
    let (Some(deployment), Some(artifact_type)) = (
        labels.get(DEPLOYMENT_NAME_KEY),
        labels.get(ARTIFACT_TYPE_KEY),
    ) else {
        return MissingFamilyLabelsSnafu {
            name: artifact.name_any(),
        }
        .fail();
    };
    Ok((deployment.clone(), artifact_type.parse()?))
}

/// The payload of an artifact.
pub fn payload(artifact: &Secret) -> Result<String> {
    let (_, artifact_type) = family_of(artifact)?;
    let key = artifact_type.kind.payload_key();
    let bytes = artifact
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .with_context(|| MissingPayloadSnafu {
            name: artifact.name_any(),
            key,
        })?;
    String::from_utf8(bytes.0.clone()).with_context(|_| InvalidPayloadSnafu {
        name: artifact.name_any(),
    })
}

fn newest(artifacts: Vec<Secret>) -> Option<Secret> {
    artifacts
        .into_iter()
        .filter_map(|artifact| Some((version_of(&artifact)?, artifact)))
        .max_by_key(|(version, _)| *version)
        .map(|(_, artifact)| artifact)
}

/// Writes `payload` as the next version of the `artifact_type` family of `deployment`.
///
/// `extra_labels` are added to the family labels. Fails with a conflict when a concurrent
/// writer claimed the same version first.
#[tracing::instrument(skip(client, owner, payload, extra_labels))]
pub async fn create(
    client: &Client,
    namespace: &str,
    owner: OwnerReference,
    deployment: &str,
    artifact_type: &ArtifactType,
    payload: &str,
    extra_labels: BTreeMap<String, String>,
) -> Result<Created> {
    let existing = client
        .list_with_label_selector::<Secret>(namespace, &artifact_type.selector(deployment))
        .await
        .context(StoreSnafu)?;

    let latest = newest(existing);
    let key = artifact_type.kind.payload_key();
    let next_version = match latest {
        Some(latest) => {
            let latest_payload = latest.data.as_ref().and_then(|data| data.get(key));
            if latest_payload.is_some_and(|bytes| bytes.0 == payload.as_bytes()) {
                tracing::debug!(artifact = %latest.name_any(), "Payload is unchanged");
                return Ok(Created::Identical(latest));
            }
            version_of(&latest).unwrap_or_default() + 1
        }
        None => 1,
    };

    let mut labels = extra_labels;
    labels.extend(deployment_labels(deployment));
    labels.insert(ARTIFACT_TYPE_KEY.to_owned(), artifact_type.to_string());
    labels.insert(ARTIFACT_VERSION_KEY.to_owned(), next_version.to_string());
    if let Some(instance_group) = &artifact_type.instance_group {
        labels.insert(INSTANCE_GROUP_KEY.to_owned(), instance_group.clone());
    }

    let artifact = Secret {
        metadata: ObjectMeta {
            name: Some(artifact_name(
                &artifact_type.family_name(deployment),
                next_version,
            )),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        data: Some([(key.to_owned(), ByteString(payload.as_bytes().to_vec()))].into()),
        immutable: Some(true),
        ..Secret::default()
    };

    let created = client.create(&artifact).await.context(StoreSnafu)?;
    tracing::info!(
        artifact = %created.name_any(),
        version = next_version,
        "Created artifact"
    );
    Ok(Created::New(created))
}

/// The newest version of the `artifact_type` family of `deployment`.
pub async fn latest(
    client: &Client,
    namespace: &str,
    deployment: &str,
    artifact_type: &ArtifactType,
) -> Result<Secret> {
    let existing = client
        .list_with_label_selector::<Secret>(namespace, &artifact_type.selector(deployment))
        .await
        .context(StoreSnafu)?;
    newest(existing).with_context(|| NotFoundSnafu {
        deployment,
        artifact_type: artifact_type.clone(),
    })
}

/// Whether `artifact` is the newest version of its family.
pub async fn is_latest(client: &Client, artifact: &Secret) -> Result<bool> {
    let (deployment, artifact_type) = family_of(artifact)?;
    let namespace = artifact.namespace().unwrap_or_default();
    let latest = latest(client, &namespace, &deployment, &artifact_type).await?;
    Ok(version_of(&latest) == version_of(artifact))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "bosh.stackable.tech/v1alpha1".to_owned(),
            kind: "BoshDeployment".to_owned(),
            name: "nats".to_owned(),
            uid: "uid-nats".to_owned(),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    async fn write(client: &Client, artifact_type: &ArtifactType, payload: &str) -> Created {
        create(
            client,
            "default",
            owner(),
            "nats",
            artifact_type,
            payload,
            BTreeMap::new(),
        )
        .await
        .expect("artifact is written")
    }

    #[rstest]
    #[case(ArtifactType::new(ArtifactKind::WithOps), "with-ops")]
    #[case(ArtifactType::new(ArtifactKind::Desired), "desired")]
    #[case(
        ArtifactType::for_instance_group(ArtifactKind::Bpm, "web"),
        "bpm.web"
    )]
    #[case(
        ArtifactType::for_instance_group(ArtifactKind::ResolvedProperties, "web"),
        "resolved-properties.web"
    )]
    fn artifact_types_render_and_parse(#[case] artifact_type: ArtifactType, #[case] rendered: &str) {
        assert_eq!(artifact_type.to_string(), rendered);
        assert_eq!(
            rendered.parse::<ArtifactType>().expect("valid type"),
            artifact_type
        );
    }

    #[test]
    fn artifact_names_carry_the_version() {
        let family = ArtifactType::new(ArtifactKind::WithOps).family_name("nats");
        assert_eq!(artifact_name(&family, 3), "nats.with-ops-v3");
    }

    #[tokio::test]
    async fn identical_payloads_are_written_once() {
        let (client, _) = Client::in_memory();
        let with_ops = ArtifactType::new(ArtifactKind::WithOps);

        let first = write(&client, &with_ops, "name: nats").await;
        assert!(matches!(first, Created::New(_)));

        for _ in 0..3 {
            let repeat = write(&client, &with_ops, "name: nats").await;
            assert!(matches!(repeat, Created::Identical(_)));
            assert_eq!(version_of(repeat.artifact()), Some(1));
        }
    }

    #[tokio::test]
    async fn changed_payloads_get_the_next_version() {
        let (client, _) = Client::in_memory();
        let with_ops = ArtifactType::new(ArtifactKind::WithOps);

        let first = write(&client, &with_ops, "name: nats").await.into_artifact();
        let second = write(&client, &with_ops, "name: nats\nreleases: []")
            .await
            .into_artifact();

        assert_eq!(second.name_any(), "nats.with-ops-v2");
        assert_eq!(
            payload(&second).expect("payload is readable"),
            "name: nats\nreleases: []"
        );
        assert!(!is_latest(&client, &first).await.expect("lookup succeeds"));
        assert!(is_latest(&client, &second).await.expect("lookup succeeds"));
    }

    #[tokio::test]
    async fn families_are_versioned_independently() {
        let (client, _) = Client::in_memory();
        let web = ArtifactType::for_instance_group(ArtifactKind::Bpm, "web");
        let worker = ArtifactType::for_instance_group(ArtifactKind::Bpm, "worker");

        write(&client, &web, "a: 1").await;
        write(&client, &web, "a: 2").await;
        let worker_artifact = write(&client, &worker, "a: 1").await.into_artifact();

        assert_eq!(worker_artifact.name_any(), "nats.bpm.worker-v1");
        assert_eq!(
            worker_artifact.labels().get(INSTANCE_GROUP_KEY).map(String::as_str),
            Some("worker")
        );
        let latest_web = latest(&client, "default", "nats", &web)
            .await
            .expect("web family exists");
        assert_eq!(version_of(&latest_web), Some(2));
    }

    #[tokio::test]
    async fn latest_of_an_empty_family_is_not_found() {
        let (client, _) = Client::in_memory();

        let error = latest(
            &client,
            "default",
            "nats",
            &ArtifactType::new(ArtifactKind::Desired),
        )
        .await
        .expect_err("family is empty");
        assert!(error.is_not_found());
    }
}
