//! BOSH process manager (BPM) configuration.
//!
//! The rendering step produces one BPM configuration per job of an instance group. It describes
//! the processes of the job, which the converter turns into containers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub mod convert;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse BPM configuration"))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("failed to serialize BPM configuration"))]
    Serialize { source: serde_yaml::Error },
}

/// BPM configuration of every job of one instance group, keyed by job name.
pub type Configs = BTreeMap<String, Config>;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Config {
    #[serde(default)]
    pub processes: Vec<Process>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Process {
    pub name: String,
    pub executable: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,

    /// Mounts a scratch directory below `/var/vcap/data/<job>`.
    pub ephemeral_disk: bool,

    /// Mounts the instance group's persistent disk below `/var/vcap/store/<job>`.
    pub persistent_disk: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Limits {
    /// A Kubernetes memory quantity, e.g. `512Mi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_files: Option<i64>,
}

pub fn parse(input: &str) -> Result<Configs> {
    serde_yaml::from_str(input).context(ParseSnafu)
}

pub fn marshal(configs: &Configs) -> Result<String> {
    serde_yaml::to_string(configs).context(SerializeSnafu)
}
