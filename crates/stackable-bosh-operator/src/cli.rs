//! Command line interface of the operator binary.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};
use tracing::level_filters::LevelFilter;

use crate::telemetry::LogFormat;

pub const DEFAULT_OPERATOR_IMAGE: &str = "oci.stackable.tech/sdp/bosh-operator:0.1.0";

/// The default path the desired manifest is mounted at in rendering jobs.
pub const RENDERING_MANIFEST_PATH: &str = "/var/vcap/rendering/manifest.yaml";

/// The default directory rendering jobs collect the job specs of all releases in.
pub const RELEASES_PATH: &str = "/var/vcap/all-releases";

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "stackable-bosh-operator",
    author,
    version,
    about = "Operator reconciling BOSH deployments"
)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),

    /// Helpers run inside jobs created by the operator.
    #[command(subcommand)]
    Util(Util),
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Util {
    /// Render one instance group of a desired manifest and publish the results.
    InstanceGroup(InstanceGroupArguments),
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            WatchNamespace::All
        } else {
            WatchNamespace::One(s.to_string())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<T>(&self, client: &kube::Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            WatchNamespace::All => Api::all(client.clone()),
            WatchNamespace::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct LogArguments {
    /// The default log level, overridden by `RUST_LOG`.
    #[arg(long, env, default_value = "info")]
    pub log_level: LevelFilter,

    #[arg(long, env, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// The DNS domain of the cluster, used to build service addresses.
    #[arg(long, env, default_value = "cluster.local")]
    pub cluster_domain: String,

    /// The image rendering jobs run with, usually the operator's own image.
    #[arg(long, env, default_value = DEFAULT_OPERATOR_IMAGE)]
    pub operator_image: String,

    /// Bursts of changes to one manifest are coalesced within this window.
    #[arg(long, env, default_value = "1m", value_parser = humantime::parse_duration)]
    pub meltdown_duration: Duration,

    /// A reconcile running longer than this is aborted and retried.
    #[arg(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub reconcile_timeout: Duration,

    /// The delay before retrying a reconcile that failed on store I/O.
    #[arg(long, env, default_value = "5s", value_parser = humantime::parse_duration)]
    pub transient_backoff: Duration,

    /// How many objects each control loop reconciles in parallel.
    #[arg(long, env, default_value_t = 1)]
    pub max_workers: u16,

    #[command(flatten)]
    pub log: LogArguments,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct InstanceGroupArguments {
    #[arg(long, env = "BOSH_DEPLOYMENT_NAME")]
    pub deployment_name: String,

    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "BOSH_INSTANCE_GROUP")]
    pub instance_group: String,

    /// Path of the desired manifest.
    #[arg(long, env = "BOSH_MANIFEST_PATH", default_value = RENDERING_MANIFEST_PATH)]
    pub manifest: PathBuf,

    /// Directory holding `<release>/<job>/job.MF` for every release of the manifest.
    #[arg(long, env = "BOSH_RELEASES_DIR", default_value = RELEASES_PATH)]
    pub releases_dir: PathBuf,

    #[command(flatten)]
    pub log: LogArguments,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;

        Command::command().debug_assert()
    }

    #[test]
    fn run_arguments_parse_durations() {
        let command = Command::parse_from([
            "stackable-bosh-operator",
            "run",
            "--watch-namespace",
            "bosh",
            "--meltdown-duration",
            "30s",
            "--max-workers",
            "4",
            "--log-format",
            "json",
        ]);

        let Command::Run(arguments) = command else {
            panic!("expected the run command");
        };
        assert_eq!(
            arguments.watch_namespace,
            WatchNamespace::One("bosh".to_owned())
        );
        assert_eq!(arguments.meltdown_duration, Duration::from_secs(30));
        assert_eq!(arguments.reconcile_timeout, Duration::from_secs(300));
        assert_eq!(arguments.max_workers, 4);
        assert_eq!(arguments.log.log_format, LogFormat::Json);
        assert_eq!(arguments.log.log_level, LevelFilter::INFO);
    }

    #[test]
    fn instance_group_arguments_default_the_manifest_path() {
        let command = Command::parse_from([
            "stackable-bosh-operator",
            "util",
            "instance-group",
            "--deployment-name",
            "nats",
            "--namespace",
            "default",
            "--instance-group",
            "nats",
        ]);

        assert_eq!(
            command,
            Command::Util(Util::InstanceGroup(InstanceGroupArguments {
                deployment_name: "nats".to_owned(),
                namespace: "default".to_owned(),
                instance_group: "nats".to_owned(),
                manifest: PathBuf::from(RENDERING_MANIFEST_PATH),
                releases_dir: PathBuf::from(RELEASES_PATH),
                log: LogArguments {
                    log_level: LevelFilter::INFO,
                    log_format: LogFormat::Plain,
                },
            }))
        );
    }
}
