//! Job specs shipped with releases.
//!
//! The rendering job copies the `jobs-src` tree of every release image into one directory, laid
//! out as `<release>/<job>/job.MF`. The property defaults declared there are the bottom layer of
//! a job's resolved properties.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use snafu::{ResultExt, Snafu};

use crate::manifest::{Manifest, insert_path};

/// File name of a job spec inside its job directory.
pub const JOB_SPEC_FILE: &str = "job.MF";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read job spec {path:?}"))]
    ReadJobSpec { source: io::Error, path: PathBuf },

    #[snafu(display("job spec {path:?} is not valid"))]
    ParseJobSpec {
        source: serde_yaml::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Default, Deserialize)]
struct JobSpec {
    /// Dotted property path to its declaration.
    #[serde(default)]
    properties: BTreeMap<String, Option<PropertySpec>>,
}

#[derive(Debug, Default, Deserialize)]
struct PropertySpec {
    default: Option<Value>,
}

/// The property defaults of a job spec as a property tree.
pub fn parse_defaults(input: &str) -> Result<Mapping, serde_yaml::Error> {
    let spec: JobSpec = serde_yaml::from_str(input)?;
    let mut defaults = Mapping::new();
    for (path, property) in spec.properties {
        if let Some(default) = property.and_then(|property| property.default) {
            insert_path(&mut defaults, &path, default);
        }
    }
    Ok(defaults)
}

/// Property defaults of the jobs a manifest uses, keyed by release and job name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSpecs {
    defaults: BTreeMap<(String, String), Mapping>,
}

impl JobSpecs {
    pub fn insert(&mut self, release: impl Into<String>, job: impl Into<String>, defaults: Mapping) {
        self.defaults.insert((release.into(), job.into()), defaults);
    }

    pub fn defaults(&self, release: &str, job: &str) -> Option<&Mapping> {
        self.defaults.get(&(release.to_owned(), job.to_owned()))
    }

    /// Reads the specs of every job `manifest` uses from `dir`.
    ///
    /// Jobs without a spec file get no defaults, not every release image ships its specs.
    pub async fn load(dir: &Path, manifest: &Manifest) -> Result<Self> {
        let mut specs = Self::default();
        let jobs = manifest
            .instance_groups
            .iter()
            .flat_map(|group| group.jobs.iter());
        for job in jobs {
            if specs.defaults(&job.release, &job.name).is_some() {
                continue;
            }
            let path = dir.join(&job.release).join(&job.name).join(JOB_SPEC_FILE);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "Job has no spec, using no defaults");
                    continue;
                }
                Err(source) => return Err(Error::ReadJobSpec { source, path }),
            };
            let defaults = parse_defaults(&content).context(ParseJobSpecSnafu { path: &path })?;
            specs.insert(&job.release, &job.name, defaults);
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn declared_defaults_form_a_property_tree() {
        let defaults = parse_defaults(indoc! {"
            name: nats
            templates:
              nats.conf.erb: config/nats.conf
            properties:
              nats.port:
                description: Client port
                default: 4222
              nats.tls.enabled:
                default: false
              nats.user:
                description: Required, no default
              nats.debug:
        "})
        .expect("valid job spec");

        let defaults = Value::Mapping(defaults);
        assert_eq!(defaults["nats"]["port"], Value::from(4222));
        assert_eq!(defaults["nats"]["tls"]["enabled"], Value::Bool(false));
        assert_eq!(defaults["nats"].get("user"), None);
        assert_eq!(defaults["nats"].get("debug"), None);
    }

    #[tokio::test]
    async fn releases_without_specs_have_no_defaults() {
        let manifest = Manifest::parse(indoc! {"
            name: nats
            instance_groups:
              - name: nats
                instances: 1
                jobs:
                  - name: nats
                    release: nats
        "})
        .expect("valid manifest");

        let specs = JobSpecs::load(Path::new("/nonexistent/all-releases"), &manifest)
            .await
            .expect("missing specs are tolerated");

        assert_eq!(specs, JobSpecs::default());
    }
}
