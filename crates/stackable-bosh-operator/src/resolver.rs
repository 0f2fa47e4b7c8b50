//! Loads the manifest and ops files a deployment references and combines them.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde_yaml::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

use crate::{
    client::Client,
    crd::{BoshDeploymentSpec, ReferenceType, ResourceReference},
    manifest::{self, Manifest, ops},
    reconcile::ErrorClass,
    store::StoreError,
};

/// The data key read for the base manifest unless the reference names another one.
pub const MANIFEST_KEY: &str = "manifest";

/// The data key read for ops files unless the reference names another one.
pub const OPS_KEY: &str = "ops";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {reference_type} {name:?}"))]
    ReadReference {
        source: StoreError,
        reference_type: ReferenceType,
        name: String,
    },

    #[snafu(display("{reference_type} {name:?} has no key {key:?}"))]
    MissingKey {
        reference_type: ReferenceType,
        name: String,
        key: String,
    },

    #[snafu(display("key {key:?} of secret {name:?} is not valid UTF-8"))]
    InvalidSecretData {
        source: std::string::FromUtf8Error,
        name: String,
        key: String,
    },

    #[snafu(display("invalid URL {url:?}"))]
    InvalidUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("failed to fetch {url}"))]
    Fetch { source: reqwest::Error, url: Url },

    #[snafu(display("failed to parse manifest {name:?}"))]
    ParseManifest {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to parse ops file {name:?}"))]
    ParseOps { source: ops::Error, name: String },

    #[snafu(display("failed to apply ops file {name:?}"))]
    ApplyOps { source: ops::Error, name: String },

    #[snafu(display("the patched manifest is invalid"))]
    InvalidManifest { source: manifest::Error },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            // The referenced object may still be created.
            Self::ReadReference { source, .. } if source.is_not_found() => {
                ErrorClass::Configuration { retry: true }
            }
            Self::ReadReference { source, .. } => source.class(),
            Self::Fetch { .. } => ErrorClass::Transient,
            Self::MissingKey { .. } => ErrorClass::Configuration { retry: true },
            Self::InvalidSecretData { .. }
            | Self::InvalidUrl { .. }
            | Self::ParseManifest { .. }
            | Self::ParseOps { .. }
            | Self::ApplyOps { .. }
            | Self::InvalidManifest { .. } => ErrorClass::Configuration { retry: false },
        }
    }
}

/// Reads the raw content a [`ResourceReference`] points at.
#[derive(Clone)]
pub struct ReferenceResolver {
    client: Client,
    http: reqwest::Client,
}

impl ReferenceResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
        }
    }

    /// Loads the content of `reference`. Config maps and secrets are read at the key the
    /// reference names, or at `default_key`.
    pub async fn load_raw(
        &self,
        namespace: &str,
        reference: &ResourceReference,
        default_key: &str,
    ) -> Result<String> {
        let name = &reference.name;
        let key = reference.key.as_deref().unwrap_or(default_key);
        let missing_key = || MissingKeySnafu {
            reference_type: reference.type_,
            name,
            key,
        };

        match reference.type_ {
            ReferenceType::Inline => Ok(name.clone()),

            ReferenceType::ConfigMap => {
                let config_map = self
                    .client
                    .get::<ConfigMap>(name, namespace)
                    .await
                    .context(ReadReferenceSnafu {
                        reference_type: reference.type_,
                        name,
                    })?;
                config_map
                    .data
                    .and_then(|mut data| data.remove(key))
                    .with_context(missing_key)
            }

            ReferenceType::Secret => {
                let secret = self
                    .client
                    .get::<Secret>(name, namespace)
                    .await
                    .context(ReadReferenceSnafu {
                        reference_type: reference.type_,
                        name,
                    })?;
                let bytes = secret
                    .data
                    .and_then(|mut data| data.remove(key))
                    .with_context(missing_key)?;
                String::from_utf8(bytes.0).context(InvalidSecretDataSnafu { name, key })
            }

            ReferenceType::Url => {
                let url = Url::parse(name).context(InvalidUrlSnafu { url: name })?;
                tracing::debug!(%url, "Fetching remote reference");
                self.fetch(url).await
            }
        }
    }

    async fn fetch(&self, url: Url) -> Result<String> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(FetchSnafu { url: url.clone() })?;
        response.text().await.context(FetchSnafu { url })
    }
}

/// The outcome of [`WithOpsResolver::resolve`].
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub manifest: Manifest,

    /// The same manifest, untyped. Placeholders and unknown fields are kept verbatim.
    pub value: Value,

    /// Problems that do not prevent the deployment, e.g. optional ops paths matching nothing.
    pub warnings: Vec<String>,
}

/// Applies the ops files of a deployment to its base manifest.
#[derive(Clone)]
pub struct WithOpsResolver {
    references: ReferenceResolver,
}

impl WithOpsResolver {
    pub fn new(references: ReferenceResolver) -> Self {
        Self { references }
    }

    /// Resolves the manifest of the deployment `name` without writing anything.
    ///
    /// This is also the validation run when a deployment is admitted.
    #[tracing::instrument(skip(self, spec))]
    pub async fn resolve(
        &self,
        name: &str,
        spec: &BoshDeploymentSpec,
        namespace: &str,
    ) -> Result<Resolved> {
        let raw = self
            .references
            .load_raw(namespace, &spec.manifest, MANIFEST_KEY)
            .await?;
        let mut value: Value = serde_yaml::from_str(&raw).context(ParseManifestSnafu {
            name: &spec.manifest.name,
        })?;

        let mut warnings = Vec::new();
        for reference in &spec.ops {
            let raw = self
                .references
                .load_raw(namespace, reference, OPS_KEY)
                .await?;
            let operations = ops::parse(&raw).context(ParseOpsSnafu {
                name: &reference.name,
            })?;
            let ops_warnings = ops::apply(&mut value, &operations).context(ApplyOpsSnafu {
                name: &reference.name,
            })?;
            warnings.extend(
                ops_warnings
                    .into_iter()
                    .map(|warning| format!("ops file {:?}: {warning}", reference.name)),
            );
        }

        let manifest = Manifest::from_value(value.clone()).context(InvalidManifestSnafu)?;
        if manifest.name != name {
            warnings.push(format!(
                "manifest name {:?} differs from the deployment name {name:?}",
                manifest.name
            ));
        }

        Ok(Resolved {
            manifest,
            value,
            warnings,
        })
    }
}
