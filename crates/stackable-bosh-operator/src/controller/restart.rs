//! Restarts workload sets when a secret or config map their pods consume changes.
//!
//! The pod template carries a digest over all consumed data. Changing the digest rolls the pods.

use std::sync::Arc;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, Secret},
};
use kube::{ResourceExt, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    client::Client,
    kvp::{CONFIG_DIGEST_ANNOTATION, DEPLOYMENT_NAME_KEY},
    reconcile::{ErrorClass, ReconcilerError},
    references::{config_digest, template_references},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "restart-on-update";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("workload set {name} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to read {kind} {name:?}"))]
    ReadReferenced {
        source: StoreError,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to update workload set {name}"))]
    UpdateWorkloadSet { source: StoreError, name: String },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ReadReferenced { source, .. } | Self::UpdateWorkloadSet { source, .. } => {
                source.class()
            }
            Self::ObjectHasNoNamespace { .. } => ErrorClass::Fatal,
        }
    }
}

/// The digest over every object the pod template of `set` consumes. Missing objects are left out.
pub async fn current_digest(client: &Client, namespace: &str, set: &StatefulSet) -> Result<String> {
    let Some(spec) = &set.spec else {
        return Ok(config_digest(&[], &[]));
    };
    let references = template_references(&spec.template);

    let mut secrets = Vec::new();
    for name in &references.secrets {
        let secret = client
            .get_opt::<Secret>(name, namespace)
            .await
            .context(ReadReferencedSnafu {
                kind: "secret",
                name,
            })?;
        secrets.extend(secret);
    }
    let mut config_maps = Vec::new();
    for name in &references.config_maps {
        let config_map = client
            .get_opt::<ConfigMap>(name, namespace)
            .await
            .context(ReadReferencedSnafu {
                kind: "config map",
                name,
            })?;
        config_maps.extend(config_map);
    }
    Ok(config_digest(&secrets, &config_maps))
}

fn template_digest(set: &StatefulSet) -> Option<&String> {
    set.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CONFIG_DIGEST_ANNOTATION)
}

#[tracing::instrument(skip(set, ctx), fields(stateful_set = %set.name_any()))]
pub async fn reconcile(set: Arc<StatefulSet>, ctx: Arc<Context>) -> Result<Action> {
    let name = set.name_any();
    let namespace = set
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    if !set.labels().contains_key(DEPLOYMENT_NAME_KEY) {
        return Ok(Action::await_change());
    }

    let digest = current_digest(&ctx.client, &namespace, &set).await?;
    if template_digest(&set) == Some(&digest) {
        return Ok(Action::await_change());
    }

    let mut updated = (*set).clone();
    let Some(spec) = updated.spec.as_mut() else {
        return Ok(Action::await_change());
    };
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CONFIG_DIGEST_ANNOTATION.to_owned(), digest);
    ctx.client
        .update(&updated)
        .await
        .context(UpdateWorkloadSetSnafu { name: &name })?;
    tracing::info!(stateful_set = %name, "Consumed configuration changed, restarting pods");
    Ok(Action::await_change())
}
