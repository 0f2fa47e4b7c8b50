//! The BOSH deployment manifest.
//!
//! Only the parts the operator acts on are typed. Everything else is carried through untouched in
//! the `extra` maps, so parsing and marshalling a manifest never drops user data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use snafu::{ResultExt, Snafu};

pub mod ops;
pub mod variables;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse manifest"))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("failed to serialize manifest"))]
    Serialize { source: serde_yaml::Error },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<Release>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_groups: Vec<InstanceGroup>,

    /// Global properties.
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub properties: Mapping,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Release {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell: Option<ReleaseStemcell>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Release {
    /// The container image holding the release's rendered job templates.
    pub fn image(&self) -> String {
        let base = self
            .url
            .as_deref()
            .unwrap_or("docker.io/cfcontainerization")
            .trim_end_matches('/');
        match &self.stemcell {
            Some(stemcell) => format!(
                "{base}/{name}:{os}-{stemcell_version}-{version}",
                name = self.name,
                os = stemcell.os,
                stemcell_version = stemcell.version,
                version = self.version,
            ),
            None => format!("{base}/{}:{}", self.name, self.version),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReleaseStemcell {
    pub os: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InstanceGroup {
    pub name: String,

    #[serde(default)]
    pub instances: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Job>,

    /// `service` (the default), `errand` or `auto-errand`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,

    /// Size of the persistent disk in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_disk: Option<i64>,

    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub properties: Mapping,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl InstanceGroup {
    pub fn is_errand(&self) -> bool {
        matches!(self.lifecycle.as_deref(), Some("errand" | "auto-errand"))
    }

    /// The instances of this group, their availability zones assigned round-robin.
    pub fn instance_list(&self, deployment: &str) -> Vec<Instance> {
        (0..self.instances.max(0))
            .map(|index| Instance {
                name: self.name.clone(),
                id: format!("{deployment}-{}-{index}", self.name),
                index,
                az: (!self.azs.is_empty())
                    .then(|| self.azs[index as usize % self.azs.len()].clone()),
            })
            .collect()
    }
}

/// One replica of an instance group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    pub name: String,
    pub id: String,
    pub index: i32,
    pub az: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub name: String,

    #[serde(default)]
    pub release: String,

    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub properties: Mapping,

    /// Link name to `{from: <provider>}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumes: BTreeMap<String, Option<LinkOptions>>,

    /// Link name to `{as: <alias>}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, Option<LinkOptions>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_provider_definitions: Vec<CustomProviderDefinition>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Options of a consumed or provided link.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LinkOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CustomProviderDefinition {
    pub name: String,

    #[serde(rename = "type", default)]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,

    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VariableOptions>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct VariableOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,

    pub is_ca: bool,

    /// Name of the variable holding the signing CA.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extended_key_usage: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Manifest {
    pub fn parse(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context(ParseSnafu)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_yaml::from_value(value).context(ParseSnafu)
    }

    pub fn marshal(&self) -> Result<String> {
        serde_yaml::to_string(self).context(SerializeSnafu)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_yaml::to_value(self).context(SerializeSnafu)
    }

    pub fn instance_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|group| group.name == name)
    }
}

/// Turns a manifest name into a valid Kubernetes object name segment.
pub fn kube_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

/// Name of the workload set, the headless service and the job of an instance group.
pub fn instance_group_object_name(deployment: &str, instance_group: &str) -> String {
    format!("{}-{}", kube_name(deployment), kube_name(instance_group))
}

/// Looks up a `.`-separated property path.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Sets a `.`-separated property path, creating intermediate mappings.
///
/// A non-mapping value in the way is replaced.
pub fn insert_path(target: &mut Mapping, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        let key = Value::String(segment.to_owned());
        if segments.peek().is_none() {
            current.insert(key, value);
            return;
        }
        let entry = current
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(next) = entry else {
            return;
        };
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const NATS: &str = indoc! {"
        name: nats
        releases:
          - name: nats
            version: '26'
            url: docker.io/cfcontainerization
            stemcell:
              os: SLE_15_SP1
              version: 23.1-7.0.0_374.gb8e8e6af
        instance_groups:
          - name: nats
            instances: 3
            azs: [z1, z2]
            jobs:
              - name: nats
                release: nats
                properties:
                  nats:
                    user: admin
                    password: ((nats_password))
                provides:
                  nats: {as: nats-cluster}
          - name: smoke-tests
            instances: 1
            lifecycle: errand
            jobs:
              - name: smoke
                release: nats
                consumes:
                  nats: {from: nats-cluster}
        variables:
          - name: nats_password
            type: password
        update:
          canaries: 1
    "};

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let manifest = Manifest::parse(NATS).expect("valid manifest");
        let reparsed =
            Manifest::parse(&manifest.marshal().expect("manifest serializes")).expect("valid");

        assert_eq!(reparsed, manifest);
        assert!(manifest.extra.contains_key("update"));
    }

    #[test]
    fn instances_are_spread_over_azs() {
        let manifest = Manifest::parse(NATS).expect("valid manifest");
        let instances = manifest
            .instance_group("nats")
            .expect("group exists")
            .instance_list("nats");

        let azs: Vec<_> = instances
            .iter()
            .map(|instance| instance.az.as_deref())
            .collect();
        assert_eq!(azs, vec![Some("z1"), Some("z2"), Some("z1")]);
        assert_eq!(instances[2].id, "nats-nats-2");
    }

    #[test]
    fn errands_are_recognized() {
        let manifest = Manifest::parse(NATS).expect("valid manifest");

        assert!(!manifest.instance_groups[0].is_errand());
        assert!(manifest.instance_groups[1].is_errand());
        assert_eq!(
            manifest.instance_groups[1].jobs[0].consumes["nats"]
                .as_ref()
                .and_then(|options| options.from.as_deref()),
            Some("nats-cluster")
        );
    }

    #[test]
    fn release_images_include_the_stemcell() {
        let manifest = Manifest::parse(NATS).expect("valid manifest");

        assert_eq!(
            manifest.releases[0].image(),
            "docker.io/cfcontainerization/nats:SLE_15_SP1-23.1-7.0.0_374.gb8e8e6af-26"
        );
    }

    #[test]
    fn property_paths_are_looked_up_and_inserted() {
        let mut properties = Mapping::new();
        insert_path(&mut properties, "nats.tls.enabled", Value::Bool(true));
        insert_path(&mut properties, "nats.port", Value::from(4222));

        let value = Value::Mapping(properties);
        assert_eq!(lookup(&value, "nats.tls.enabled"), Some(&Value::Bool(true)));
        assert_eq!(lookup(&value, "nats.port"), Some(&Value::from(4222)));
        assert_eq!(lookup(&value, "nats.user"), None);
    }

    #[test]
    fn object_names_are_sanitized() {
        assert_eq!(
            instance_group_object_name("nats", "smoke_tests"),
            "nats-smoke-tests"
        );
    }
}
