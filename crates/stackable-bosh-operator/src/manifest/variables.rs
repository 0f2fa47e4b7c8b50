//! Manifest variables and their interpolation.
//!
//! A placeholder is written `((name))` or `((name.sub.path))`. Declared variables are generated
//! by the secret generation subsystem, undeclared ("implicit") ones have to be provided by the
//! user. Either way the value is read from a secret named after the variable.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};

use k8s_openapi::api::core::v1::Secret;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use snafu::Snafu;

use super::{Manifest, Variable, kube_name, lookup};

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(!?([-/\.\w]+)\)\)").expect("failed to compile placeholder regex")
});

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("variables {names:?} are not resolved"))]
    Unresolved { names: Vec<String> },

    #[snafu(display("variable {name} holds structured data and cannot be embedded into a string"))]
    NotEmbeddable { name: String },
}

/// The variable name of a placeholder path, i.e. everything before the first `.`.
fn variable_name(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => names.extend(
            PLACEHOLDER_REGEX
                .captures_iter(text)
                .map(|captures| variable_name(&captures[1]).to_owned()),
        ),
        Value::Sequence(items) => {
            for item in items {
                collect_placeholders(item, names);
            }
        }
        Value::Mapping(map) => {
            for item in map.values() {
                collect_placeholders(item, names);
            }
        }
        Value::Tagged(tagged) => collect_placeholders(&tagged.value, names),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// The names of all variables referenced by placeholders in `value`.
pub fn placeholders(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_placeholders(value, &mut names);
    names
}

/// The variables declared in the manifest.
pub fn explicit(manifest: &Manifest) -> &[Variable] {
    &manifest.variables
}

/// Names of referenced variables that are not declared in the manifest.
pub fn implicit(manifest: &Manifest, manifest_value: &Value) -> BTreeSet<String> {
    let declared: BTreeSet<_> = manifest.variables.iter().map(|v| v.name.as_str()).collect();
    placeholders(manifest_value)
        .into_iter()
        .filter(|name| !declared.contains(name.as_str()))
        .collect()
}

/// The secret holding the generated value of a declared variable.
pub fn explicit_secret_name(deployment: &str, variable: &str) -> String {
    format!("{deployment}.var-{}", kube_name(variable))
}

/// The secret the user provides the value of an implicit variable in, under the key `value`.
pub fn implicit_secret_name(deployment: &str, variable: &str) -> String {
    format!("{deployment}.var-implicit-{}", kube_name(variable))
}

/// The value a variable secret stands for.
///
/// A secret holding only a `password` or only a `value` is a plain string, any other secret a map
/// of all its keys.
pub fn value_from_secret(secret: &Secret) -> Value {
    let data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
        .chain(secret.string_data.iter().flatten().map(|(k, v)| (k.clone(), v.clone())))
        .collect();

    if data.len() == 1 {
        if let Some(single) = data.get("password").or_else(|| data.get("value")) {
            return Value::String(single.clone());
        }
    }
    Value::Mapping(
        data.into_iter()
            .map(|(key, value)| (Value::String(key), Value::String(value)))
            .collect::<Mapping>(),
    )
}

fn resolve<'a>(path: &str, values: &'a BTreeMap<String, Value>) -> Option<&'a Value> {
    let (name, sub_path) = match path.split_once('.') {
        Some((name, sub_path)) => (name, Some(sub_path)),
        None => (path, None),
    };
    let value = values.get(name)?;
    match sub_path {
        Some(sub_path) => lookup(value, sub_path),
        None => Some(value),
    }
}

fn render_scalar(name: &str, value: &Value) -> Result<String, Error> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Null => Ok(String::new()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => NotEmbeddableSnafu { name }.fail(),
    }
}

fn whole_placeholder(text: &str) -> Option<String> {
    let captures = PLACEHOLDER_REGEX.captures(text)?;
    (captures[0].len() == text.len()).then(|| captures[1].to_owned())
}

fn interpolate_node(
    node: &mut Value,
    values: &BTreeMap<String, Value>,
    unresolved: &mut BTreeSet<String>,
) -> Result<(), Error> {
    match node {
        Value::String(text) => {
            // A placeholder spanning the whole scalar keeps the type of its value.
            if let Some(path) = whole_placeholder(text) {
                match resolve(&path, values) {
                    Some(value) => *node = value.clone(),
                    None => {
                        unresolved.insert(variable_name(&path).to_owned());
                    }
                }
                return Ok(());
            }

            let mut rendered = String::with_capacity(text.len());
            let mut last_end = 0;
            for captures in PLACEHOLDER_REGEX.captures_iter(text) {
                let whole = captures.get(0).map_or(0..0, |m| m.range());
                rendered.push_str(&text[last_end..whole.start]);
                match resolve(&captures[1], values) {
                    Some(value) => rendered.push_str(&render_scalar(&captures[1], value)?),
                    None => {
                        unresolved.insert(variable_name(&captures[1]).to_owned());
                        rendered.push_str(&text[whole.clone()]);
                    }
                }
                last_end = whole.end;
            }
            rendered.push_str(&text[last_end..]);
            *text = rendered;
        }
        Value::Sequence(items) => {
            for item in items {
                interpolate_node(item, values, unresolved)?;
            }
        }
        Value::Mapping(map) => {
            for item in map.values_mut() {
                interpolate_node(item, values, unresolved)?;
            }
        }
        Value::Tagged(tagged) => interpolate_node(&mut tagged.value, values, unresolved)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Substitutes every placeholder in `value` with the variable values in `values`.
///
/// Fails without touching `value` when any referenced variable has no value.
pub fn interpolate(value: &Value, values: &BTreeMap<String, Value>) -> Result<Value, Error> {
    let mut interpolated = value.clone();
    let mut unresolved = BTreeSet::new();
    interpolate_node(&mut interpolated, values, &mut unresolved)?;
    if unresolved.is_empty() {
        Ok(interpolated)
    } else {
        UnresolvedSnafu {
            names: unresolved.into_iter().collect::<Vec<_>>(),
        }
        .fail()
    }
}
