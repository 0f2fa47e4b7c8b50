use std::path::PathBuf;

use clap::Parser;
use kube::CustomResourceExt;
use snafu::{ResultExt, Snafu};
use stackable_bosh_operator::{
    cli::{Command, InstanceGroupArguments, Util},
    client::Client,
    controller::{self, FIELD_MANAGER},
    crd::{BoshDeployment, SecretRequest},
    manifest::{self, Manifest},
    release::{self, JobSpecs},
    render, telemetry,
};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize the CRDs"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeTelemetry { source: telemetry::Error },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to read the manifest at {path:?}"))]
    ReadManifest {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse the manifest at {path:?}"))]
    ParseManifest {
        source: manifest::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to load the job specs from {path:?}"))]
    LoadJobSpecs {
        source: release::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to publish instance group {instance_group:?}"))]
    Publish {
        source: render::Error,
        instance_group: String,
    },
}

fn print_crds() -> Result<(), Error> {
    for crd in [BoshDeployment::crd(), SecretRequest::crd()] {
        let yaml = serde_yaml::to_string(&crd).context(SerializeCrdSnafu)?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn render_instance_group(arguments: InstanceGroupArguments) -> Result<(), Error> {
    let InstanceGroupArguments {
        deployment_name,
        namespace,
        instance_group,
        manifest: path,
        releases_dir,
        ..
    } = arguments;
    let content = tokio::fs::read_to_string(&path)
        .await
        .context(ReadManifestSnafu { path: &path })?;
    let manifest = Manifest::parse(&content).context(ParseManifestSnafu { path: &path })?;
    let job_specs = JobSpecs::load(&releases_dir, &manifest)
        .await
        .context(LoadJobSpecsSnafu {
            path: &releases_dir,
        })?;

    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let client = Client::for_kubernetes(kube_client, Some(FIELD_MANAGER.to_owned()));
    render::publish(
        &client,
        &namespace,
        &deployment_name,
        &manifest,
        &instance_group,
        &job_specs,
    )
    .await
    .context(PublishSnafu {
        instance_group: &instance_group,
    })?;
    tracing::info!(
        deployment = %deployment_name,
        instance_group = %instance_group,
        "Published rendered instance group"
    );
    Ok(())
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::parse() {
        Command::Crd => print_crds(),
        Command::Run(arguments) => {
            telemetry::init(arguments.log.log_level, arguments.log.log_format)
                .context(InitializeTelemetrySnafu)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                watch_namespace = ?arguments.watch_namespace,
                "Starting {}",
                controller::OPERATOR_NAME
            );

            let kube_client = kube::Client::try_default()
                .await
                .context(CreateClientSnafu)?;
            controller::run(kube_client, arguments.into()).await;
            Ok(())
        }
        Command::Util(Util::InstanceGroup(arguments)) => {
            telemetry::init(arguments.log.log_level, arguments.log.log_format)
                .context(InitializeTelemetrySnafu)?;
            render_instance_group(arguments).await
        }
    }
}
