//! Issues a secret generation request for every variable a manifest declares.
//!
//! The ops-applier issues the requests right after writing a with-ops artifact. This loop
//! re-derives them from the artifact, so a failed request write is retried without resolving the
//! manifest again.

use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt, api::ObjectMeta, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::Context;
use crate::{
    artifact::{self, ArtifactKind},
    client::Client,
    crd::{
        BoshDeployment, CertificateRequest, GenerationRequest, SecretKeyReference,
        SecretRequest, SecretRequestSpec, SecretType,
    },
    kvp::{VARIABLE_NAME_KEY, deployment_labels},
    manifest::{self, Manifest, Variable, variables},
    reconcile::{ErrorClass, ReconcilerError},
    store::StoreError,
};

pub const CONTROLLER_NAME: &str = "variables";

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

    #[snafu(display("artifact {name} does not hold a valid manifest"))]
    ParseManifest {
        source: manifest::Error,
        name: String,
    },

    #[snafu(display("failed to read deployment {name:?}"))]
    GetDeployment { source: StoreError, name: String },

    #[snafu(display("deployment {name:?} cannot own objects yet"))]
    MissingOwner { name: String },

    #[snafu(display("variable {name:?} has the unsupported type {type_:?}"))]
    UnsupportedVariableType { name: String, type_: String },

    #[snafu(display("failed to apply secret request {name:?}"))]
    ApplySecretRequest { source: StoreError, name: String },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::ReadArtifact { source, .. } => source.class(),
            Self::GetDeployment { source, .. } | Self::ApplySecretRequest { source, .. } => {
                source.class()
            }
            Self::UnsupportedVariableType { .. } | Self::ParseManifest { .. } => {
                ErrorClass::Configuration { retry: false }
            }
            Self::ObjectHasNoNamespace { .. } | Self::MissingOwner { .. } => ErrorClass::Fatal,
        }
    }
}

fn secret_type(variable: &Variable) -> Result<SecretType> {
    match variable.type_.as_str() {
        "password" => Ok(SecretType::Password),
        "certificate" => Ok(SecretType::Certificate),
        "ssh" => Ok(SecretType::Ssh),
        "rsa" => Ok(SecretType::Rsa),
        other => UnsupportedVariableTypeSnafu {
            name: &variable.name,
            type_: other,
        }
        .fail(),
    }
}

fn certificate_request(deployment: &str, variable: &Variable) -> Option<CertificateRequest> {
    let options = variable.options.as_ref()?;
    let ca_secret = options
        .ca
        .as_ref()
        .map(|ca| variables::explicit_secret_name(deployment, ca));
    Some(CertificateRequest {
        common_name: options.common_name.clone().unwrap_or_default(),
        alternative_names: options.alternative_names.clone(),
        is_ca: options.is_ca,
        ca_ref: ca_secret.clone().map(|name| SecretKeyReference {
            name,
            key: "certificate".to_owned(),
        }),
        ca_key_ref: ca_secret.map(|name| SecretKeyReference {
            name,
            key: "private_key".to_owned(),
        }),
        extended_key_usage: options.extended_key_usage.clone(),
    })
}

/// One request per declared variable of `manifest`, except for those listed in `user_provided`.
pub fn secret_requests(
    deployment: &str,
    namespace: &str,
    manifest: &Manifest,
    user_provided: &BTreeSet<String>,
    owner: &OwnerReference,
) -> Result<Vec<SecretRequest>> {
    variables::explicit(manifest)
        .iter()
        .filter(|variable| !user_provided.contains(&variable.name))
        .map(|variable| {
            let type_ = secret_type(variable)?;
            let secret_name = variables::explicit_secret_name(deployment, &variable.name);
            let mut labels = deployment_labels(deployment);
            labels.insert(VARIABLE_NAME_KEY.to_owned(), variable.name.clone());
            Ok(SecretRequest {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: Some(namespace.to_owned()),
                    labels: Some(labels),
                    owner_references: Some(vec![owner.clone()]),
                    ..ObjectMeta::default()
                },
                spec: SecretRequestSpec {
                    type_,
                    secret_name,
                    request: GenerationRequest {
                        certificate: match type_ {
                            SecretType::Certificate => certificate_request(deployment, variable),
                            _ => None,
                        },
                    },
                },
                status: None,
            })
        })
        .collect()
}

/// Names of the variables the user provides through the deployment spec.
pub fn user_provided(deployment: &BoshDeployment) -> BTreeSet<String> {
    deployment
        .spec
        .vars
        .iter()
        .map(|var| var.name.clone())
        .collect()
}

/// Creates missing requests and updates the ones whose spec or labels changed.
///
/// Returns how many requests were written.
pub async fn apply_secret_requests(client: &Client, requests: Vec<SecretRequest>) -> Result<usize> {
    let mut written = 0;
    for request in requests {
        let name = request.name_any();
        let namespace = request.namespace().unwrap_or_default();
        let live = client
            .get_opt::<SecretRequest>(&name, &namespace)
            .await
            .context(ApplySecretRequestSnafu { name: &name })?;
        match live {
            Some(live) if live.spec == request.spec && live.labels() == request.labels() => {}
            Some(mut live) => {
                live.spec = request.spec;
                live.metadata.labels = request.metadata.labels;
                client
                    .update(&live)
                    .await
                    .context(ApplySecretRequestSnafu { name: &name })?;
                written += 1;
            }
            None => {
                client
                    .create(&request)
                    .await
                    .context(ApplySecretRequestSnafu { name: &name })?;
                written += 1;
            }
        }
    }
    Ok(written)
}

#[tracing::instrument(skip(artifact, ctx), fields(artifact = %artifact.name_any()))]
pub async fn reconcile(artifact: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let name = artifact.name_any();
    let namespace = artifact
        .namespace()
        .context(ObjectHasNoNamespaceSnafu { name: &name })?;
    let (deployment_name, artifact_type) =
        artifact::family_of(&artifact).context(ReadArtifactSnafu { name: &name })?;
    if artifact_type.kind != ArtifactKind::WithOps {
        return Ok(Action::await_change());
    }
    let is_latest = artifact::is_latest(&ctx.client, &artifact)
        .await
        .context(ReadArtifactSnafu { name: &name })?;
    if !is_latest {
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

    let payload = artifact::payload(&artifact).context(ReadArtifactSnafu { name: &name })?;
    let manifest = Manifest::parse(&payload).context(ParseManifestSnafu { name: &name })?;
    let requests = secret_requests(
        &deployment_name,
        &namespace,
        &manifest,
        &user_provided(&deployment),
        &owner,
    )?;
    let written = apply_secret_requests(&ctx.client, requests).await?;
    if written > 0 {
        tracing::info!(
            deployment = %deployment_name,
            written,
            "Updated secret generation requests"
        );
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            name: "nats".to_owned(),
            uid: "uid-1".to_owned(),
            ..OwnerReference::default()
        }
    }

    const MANIFEST: &str = indoc! {"
        name: nats
        variables:
          - name: nats_password
            type: password
          - name: nats_ca
            type: certificate
            options:
              is_ca: true
              common_name: nats-ca
          - name: nats_cert
            type: certificate
            options:
              ca: nats_ca
              common_name: nats
              alternative_names: [nats.default.svc]
          - name: user_password
            type: password
    "};

    #[test]
    fn requests_are_derived_from_declarations() {
        let manifest = Manifest::parse(MANIFEST).expect("valid manifest");
        let user_provided = BTreeSet::from(["user_password".to_owned()]);

        let requests = secret_requests("nats", "default", &manifest, &user_provided, &owner())
            .expect("requests are derived");

        let names: Vec<_> = requests.iter().map(|request| request.name_any()).collect();
        assert_eq!(
            names,
            ["nats.var-nats-password", "nats.var-nats-ca", "nats.var-nats-cert"]
        );
        let certificate = requests[2]
            .spec
            .request
            .certificate
            .as_ref()
            .expect("certificate request");
        assert_eq!(certificate.common_name, "nats");
        assert_eq!(
            certificate.ca_ref,
            Some(SecretKeyReference {
                name: "nats.var-nats-ca".to_owned(),
                key: "certificate".to_owned(),
            })
        );
        assert_eq!(
            requests[0].labels().get(VARIABLE_NAME_KEY).map(String::as_str),
            Some("nats_password")
        );
    }

    #[test]
    fn unknown_variable_types_are_rejected() {
        let manifest = Manifest::parse(indoc! {"
            name: nats
            variables:
              - name: token
                type: jwt
        "})
        .expect("valid manifest");

        let error = secret_requests("nats", "default", &manifest, &BTreeSet::new(), &owner())
            .expect_err("jwt is not supported");
        assert_eq!(error.class(), ErrorClass::Configuration { retry: false });
    }

    #[tokio::test]
    async fn unchanged_requests_are_not_rewritten() {
        let (client, _) = Client::in_memory();
        let manifest = Manifest::parse(MANIFEST).expect("valid manifest");
        let requests = || {
            secret_requests("nats", "default", &manifest, &BTreeSet::new(), &owner())
                .expect("requests are derived")
        };

        assert_eq!(
            apply_secret_requests(&client, requests()).await.expect("applied"),
            4
        );
        assert_eq!(
            apply_secret_requests(&client, requests()).await.expect("applied"),
            0
        );
    }
}
