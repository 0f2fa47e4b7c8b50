//! The interpolator: fills the variables into the latest with-ops manifest.
//!
//! The desired manifest is only written once every referenced variable has a value. Bursts of
//! with-ops versions and variable changes are coalesced by the meltdown governor, keyed on an
//! annotation of the with-ops artifact.

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{api::core::v1::Secret, chrono::Utc};
use kube::{Resource, ResourceExt, runtime::controller::Action};
use serde_yaml::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    artifact::{self, ArtifactKind, ArtifactType},
    client::Client,
    crd::BoshDeployment,
    manifest::{self, Manifest, variables},
    meltdown::{self, Decision},
    name_service,
    reconcile::{ErrorClass, ReconcilerError},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "desired-manifest";

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

    #[snafu(display("artifact {name} does not hold valid YAML"))]
    ParseArtifact {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to read deployment {name:?}"))]
    GetDeployment { source: StoreError, name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("failed to read variable secret {secret:?}"))]
    ReadVariable { source: StoreError, secret: String },

    #[snafu(display("waiting for variable secrets {secrets:?}"))]
    WaitingForVariableSecrets { secrets: Vec<String> },

    #[snafu(display("failed to interpolate variables"))]
    Interpolate { source: variables::Error },

    #[snafu(display("the interpolated manifest is invalid"))]
    InvalidManifest { source: manifest::Error },

    #[snafu(display("failed to update the reconcile marker of artifact {name}"))]
    WriteMarker { source: StoreError, name: String },

    #[snafu(display("failed to write the desired manifest of deployment {name:?}"))]
    WriteArtifact {
        source: artifact::Error,
        name: String,
    },

    #[snafu(display("failed to publish the DNS aliases of deployment {name:?}"))]
    PublishNames {
        source: name_service::Error,
        name: String,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ReadArtifact { source, .. } | Self::WriteArtifact { source, .. } => {
                source.class()
            }
            Self::GetDeployment { source, .. }
            | Self::ReadVariable { source, .. }
            | Self::WriteMarker { source, .. } => source.class(),
            Self::PublishNames { source, .. } => source.class(),
            Self::WaitingForVariableSecrets { .. } => ErrorClass::Configuration { retry: true },
            Self::Interpolate { .. } | Self::InvalidManifest { .. } => {
                ErrorClass::Configuration { retry: true }
            }
            Self::ObjectHasNoNamespace { .. }
            | Self::ParseArtifact { .. }
            | Self::MissingOwner { .. } => ErrorClass::Fatal,
        }
    }
}

/// The secret holding the value of the variable `name`.
///
/// Values provided through the deployment spec win over declared variables, anything else is an
/// implicit variable.
pub fn variable_secret_name(deployment: &BoshDeployment, manifest: &Manifest, name: &str) -> String {
    if let Some(reference) = deployment.spec.vars.iter().find(|var| var.name == name) {
        return reference.secret.clone();
    }
    let deployment_name = deployment.name_any();
    if manifest.variables.iter().any(|variable| variable.name == name) {
        variables::explicit_secret_name(&deployment_name, name)
    } else {
        variables::implicit_secret_name(&deployment_name, name)
    }
}

/// Reads the value of every variable `value` references.
async fn variable_values(
    client: &Client,
    deployment: &BoshDeployment,
    namespace: &str,
    manifest: &Manifest,
    value: &Value,
) -> Result<BTreeMap<String, Value>> {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();
    for name in variables::placeholders(value) {
        let secret_name = variable_secret_name(deployment, manifest, &name);
        let secret = client
            .get_opt::<Secret>(&secret_name, namespace)
            .await
            .context(ReadVariableSnafu {
                secret: &secret_name,
            })?;
        match secret {
            Some(secret) => {
                values.insert(name, variables::value_from_secret(&secret));
            }
            None => missing.push(secret_name),
        }
    }
    if !missing.is_empty() {
        return WaitingForVariableSecretsSnafu { secrets: missing }.fail();
    }
    Ok(values)
}

/// Computes the desired manifest from a with-ops payload.
async fn desired_manifest(
    client: &Client,
    deployment: &BoshDeployment,
    namespace: &str,
    with_ops: &Secret,
) -> Result<(Manifest, String)> {
    let name = with_ops.name_any();
    let payload = artifact::payload(with_ops).context(ReadArtifactSnafu { name: &name })?;
    let value: Value = serde_yaml::from_str(&payload).context(ParseArtifactSnafu { name: &name })?;
    let manifest = Manifest::from_value(value.clone()).context(InvalidManifestSnafu)?;

    let values = variable_values(client, deployment, namespace, &manifest, &value).await?;
    let interpolated = variables::interpolate(&value, &values).context(InterpolateSnafu)?;
    let mut desired = Manifest::from_value(interpolated).context(InvalidManifestSnafu)?;
    desired.variables.clear();
    let payload = desired.marshal().context(InvalidManifestSnafu)?;
    Ok((desired, payload))
}

async fn is_unchanged(
    client: &Client,
    namespace: &str,
    deployment: &str,
    payload: &str,
) -> Result<bool> {
    let desired_type = ArtifactType::new(ArtifactKind::Desired);
    match artifact::latest(client, namespace, deployment, &desired_type).await {
        Ok(latest) => {
            let latest_payload =
                artifact::payload(&latest).context(ReadArtifactSnafu { name: latest.name_any() })?;
            Ok(latest_payload == payload)
        }
        Err(error) if error.is_not_found() => Ok(false),
        Err(error) => Err(error).context(ReadArtifactSnafu { name: deployment }),
    }
}

async fn write_marker(client: &Client, mut artifact: Secret, stamp: bool) -> Result<()> {
    let now = Utc::now();
    if stamp {
        meltdown::stamp(&mut artifact.metadata, now);
    } else {
        meltdown::clear(&mut artifact.metadata);
    }
    client
        .update(&artifact)
        .await
        .context(WriteMarkerSnafu {
            name: artifact.name_any(),
        })?;
    Ok(())
}

#[tracing::instrument(skip(with_ops, ctx), fields(artifact = %with_ops.name_any()))]
pub async fn reconcile(with_ops: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let name = with_ops.name_any();
    let namespace = with_ops
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    let (deployment_name, artifact_type) =
        artifact::family_of(&with_ops).context(ReadArtifactSnafu { name: &name })?;
    if artifact_type.kind != ArtifactKind::WithOps {
        return Ok(Action::await_change());
    }
    if !artifact::is_latest(&ctx.client, &with_ops)
        .await
        .context(ReadArtifactSnafu { name: &name })?
    {
        tracing::debug!("Artifact was superseded");
        return Ok(Action::await_change());
    }
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

    let now = Utc::now();
    let window = ctx.config.meltdown_duration;
    let marker = meltdown::marker(&with_ops.metadata);
    let clear_marker = match meltdown::should_skip(marker, now, window) {
        Decision::Skip => {
            let start = marker.unwrap_or(now);
            return Ok(Action::requeue(meltdown::remaining(start, now, window)));
        }
        Decision::Delay(delay) => {
            let (_, payload) =
                desired_manifest(&ctx.client, &deployment, &namespace, &with_ops).await?;
            if is_unchanged(&ctx.client, &namespace, &deployment_name, &payload).await? {
                tracing::debug!("Desired manifest is up to date");
                return Ok(Action::await_change());
            }
            write_marker(&ctx.client, (*with_ops).clone(), true).await?;
            tracing::info!(
                deployment = %deployment_name,
                delay = %humantime::format_duration(delay),
                "Delaying desired manifest update"
            );
            return Ok(Action::requeue(delay));
        }
        Decision::Proceed { clear_marker } => clear_marker,
    };

    let (desired, payload) =
        desired_manifest(&ctx.client, &deployment, &namespace, &with_ops).await?;
    artifact::create(
        &ctx.client,
        &namespace,
        owner.clone(),
        &deployment_name,
        &ArtifactType::new(ArtifactKind::Desired),
        &payload,
        Default::default(),
    )
    .await
    .context(WriteArtifactSnafu {
        name: &deployment_name,
    })?;
    ctx.name_service
        .apply(&deployment_name, &desired, &namespace, owner)
        .await
        .context(PublishNamesSnafu {
            name: &deployment_name,
        })?;
    if clear_marker {
        write_marker(&ctx.client, (*with_ops).clone(), false).await?;
    }
    Ok(Action::await_change())
}
