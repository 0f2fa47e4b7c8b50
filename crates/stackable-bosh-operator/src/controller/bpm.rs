//! The BPM deployer: applies the resources of one instance group once its BPM or resolved
//! properties artifact changes.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    apply::{self, Applier},
    artifact::{self, ArtifactKind, ArtifactType},
    bpm::{self, convert},
    crd::BoshDeployment,
    manifest::{self, Manifest},
    reconcile::{ErrorClass, ReconcilerError},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "bpm";

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

    #[snafu(display("artifact {name} is not scoped to an instance group"))]
    MissingInstanceGroup { name: String },

    #[snafu(display("artifact {name} does not hold a valid BPM configuration"))]
    ParseBpm { source: bpm::Error, name: String },

    #[snafu(display("artifact {name} does not hold a valid manifest"))]
    ParseManifest {
        source: manifest::Error,
        name: String,
    },

    #[snafu(display("failed to read deployment {name:?}"))]
    GetDeployment { source: StoreError, name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("failed to convert instance group {instance_group:?}"))]
    Convert {
        source: convert::Error,
        instance_group: String,
    },

    #[snafu(display("failed to apply the resources of instance group {instance_group:?}"))]
    Apply {
        source: apply::Error,
        instance_group: String,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ReadArtifact { source, .. } => source.class(),
            Self::GetDeployment { source, .. } => source.class(),
            Self::Apply { source, .. } => source.class(),
            Self::ParseBpm { .. } | Self::ParseManifest { .. } | Self::Convert { .. } => {
                ErrorClass::Configuration { retry: false }
            }
            Self::ObjectHasNoNamespace { .. }
            | Self::MissingInstanceGroup { .. }
            | Self::MissingOwner { .. } => ErrorClass::Fatal,
        }
    }
}

/// The newest artifact of `kind` for `instance_group`, or `None` if none was published yet.
async fn latest_of(
    ctx: &Context,
    namespace: &str,
    deployment: &str,
    kind: ArtifactKind,
    instance_group: &str,
) -> Result<Option<Secret>> {
    let artifact_type = ArtifactType::for_instance_group(kind, instance_group);
    match artifact::latest(&ctx.client, namespace, deployment, &artifact_type).await {
        Ok(artifact) => Ok(Some(artifact)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(source) => Err(Error::ReadArtifact {
            source,
            name: artifact_type.family_name(deployment),
        }),
    }
}

/// Deploys an instance group when either its BPM or its resolved properties artifact changes.
///
/// Both are re-read, so the workload always pairs the newest BPM configuration with the newest
/// properties, no matter which of the two triggered.
#[tracing::instrument(skip(trigger, ctx), fields(artifact = %trigger.name_any()))]
pub async fn reconcile(trigger: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let name = trigger.name_any();
    let namespace = trigger
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    let (deployment_name, artifact_type) =
        artifact::family_of(&trigger).context(ReadArtifactSnafu { name: &name })?;
    if !matches!(
        artifact_type.kind,
        ArtifactKind::Bpm | ArtifactKind::ResolvedProperties
    ) {
        return Ok(Action::await_change());
    }
    let instance_group = artifact_type
        .instance_group
        .clone()
        .context(MissingInstanceGroupSnafu { name: &name })?;
    if !artifact::is_latest(&ctx.client, &trigger)
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

    let bpm_artifact = latest_of(
        &ctx,
        &namespace,
        &deployment_name,
        ArtifactKind::Bpm,
        &instance_group,
    )
    .await?;
    let properties = latest_of(
        &ctx,
        &namespace,
        &deployment_name,
        ArtifactKind::ResolvedProperties,
        &instance_group,
    )
    .await?;
    let (Some(bpm_artifact), Some(properties)) = (bpm_artifact, properties) else {
        tracing::info!(
            instance_group = %instance_group,
            "BPM configuration or resolved properties are not published yet"
        );
        return Ok(Action::requeue(ctx.policy.transient));
    };

    let bpm_name = bpm_artifact.name_any();
    let payload = artifact::payload(&bpm_artifact).context(ReadArtifactSnafu { name: &bpm_name })?;
    let configs = bpm::parse(&payload).context(ParseBpmSnafu { name: &bpm_name })?;

    let properties_name = properties.name_any();
    let properties_payload = artifact::payload(&properties).context(ReadArtifactSnafu {
        name: &properties_name,
    })?;
    let manifest = Manifest::parse(&properties_payload).context(ParseManifestSnafu {
        name: &properties_name,
    })?;

    let resources = convert::convert(
        &deployment_name,
        &namespace,
        &manifest,
        &instance_group,
        &configs,
        &properties_name,
    )
    .context(ConvertSnafu {
        instance_group: &instance_group,
    })?;
    let summary = Applier::new(&ctx.client, owner, &instance_group)
        .apply(resources)
        .await
        .context(ApplySnafu {
            instance_group: &instance_group,
        })?;
    tracing::info!(
        deployment = %deployment_name,
        instance_group = %instance_group,
        created = summary.created,
        updated = summary.updated,
        recreated = summary.recreated,
        unchanged = summary.unchanged,
        "Applied instance group"
    );
    Ok(Action::await_change())
}
