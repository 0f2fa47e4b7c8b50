//! In-process object store for tests and dry runs.
//!
//! Mirrors the API server semantics the control loops depend on: unique names per kind and
//! namespace, resource versions checked on every update, a status path separate from the rest
//! of the object, and garbage collection of dependents through owner references.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::core::{DynamicObject, Selector, SelectorExt};
use snafu::OptionExt;

use super::{MissingNameSnafu, MissingNamespaceSnafu, ObjectStore, ResourceKind, Result, StoreError};

type Key = (ResourceKind, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    uid_counter: u64,
    resource_version_counter: u64,
    cluster_ip_counter: u32,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version_counter += 1;
        self.resource_version_counter.to_string()
    }
}

/// An [`ObjectStore`] holding every object in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of objects of `kind` across all namespaces.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|(object_kind, ..)| *object_kind == kind)
            .count()
    }
}

fn address(kind: ResourceKind, object: &DynamicObject) -> Result<Key> {
    let name = object
        .metadata
        .name
        .clone()
        .context(MissingNameSnafu { kind })?;
    let namespace = object
        .metadata
        .namespace
        .clone()
        .with_context(|| MissingNamespaceSnafu {
            kind,
            name: name.clone(),
        })?;
    Ok((kind, namespace, name))
}

fn not_found((kind, namespace, name): Key) -> StoreError {
    StoreError::NotFound {
        kind,
        namespace,
        name,
    }
}

fn conflict((kind, namespace, name): Key) -> StoreError {
    StoreError::Conflict {
        kind,
        namespace,
        name,
    }
}

/// Rejects writes based on an outdated read. Writes without a resource version are unconditional.
fn check_resource_version(key: &Key, stored: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
    match &incoming.metadata.resource_version {
        Some(version) if Some(version) != stored.metadata.resource_version.as_ref() => {
            Err(conflict(key.clone()))
        }
        _ => Ok(()),
    }
}

fn status_of(object: &DynamicObject) -> Option<serde_json::Value> {
    object.data.get("status").cloned()
}

fn set_status(object: &mut DynamicObject, status: Option<serde_json::Value>) {
    if let Some(fields) = object.data.as_object_mut() {
        match status {
            Some(status) => fields.insert("status".to_owned(), status),
            None => fields.remove("status"),
        };
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        let key = (kind, namespace.to_owned(), name.to_owned());
        let state = self.state();
        state.objects.get(&key).cloned().ok_or_else(|| not_found(key))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state();
        Ok(state
            .objects
            .iter()
            .filter(|((object_kind, object_namespace, _), _)| {
                *object_kind == kind && object_namespace == namespace
            })
            .filter(|(_, object)| {
                selector.matches(object.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, mut object: DynamicObject) -> Result<DynamicObject> {
        let key = address(kind, &object)?;
        let mut state = self.state();
        if state.objects.contains_key(&key) {
            let (kind, namespace, name) = key;
            return Err(StoreError::AlreadyExists {
                kind,
                namespace,
                name,
            });
        }

        state.uid_counter += 1;
        object.metadata.uid = Some(format!("uid-{}", state.uid_counter));
        object.metadata.resource_version = Some(state.next_resource_version());
        object.metadata.creation_timestamp = Some(Time(Utc::now()));

        if kind == ResourceKind::Service {
            let spec = object
                .data
                .as_object_mut()
                .and_then(|fields| fields.get_mut("spec"))
                .and_then(serde_json::Value::as_object_mut);
            if let Some(spec) = spec {
                if !spec.contains_key("clusterIP") {
                    state.cluster_ip_counter += 1;
                    let counter = state.cluster_ip_counter;
                    let cluster_ip = format!("10.96.{}.{}", counter / 256, counter % 256);
                    spec.insert("clusterIP".to_owned(), cluster_ip.into());
                }
            }
        }

        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, kind: ResourceKind, mut object: DynamicObject) -> Result<DynamicObject> {
        let key = address(kind, &object)?;
        let mut state = self.state();
        let Some(stored) = state.objects.get(&key) else {
            return Err(not_found(key));
        };
        check_resource_version(&key, stored, &object)?;

        object.metadata.uid.clone_from(&stored.metadata.uid);
        object
            .metadata
            .creation_timestamp
            .clone_from(&stored.metadata.creation_timestamp);
        let status = status_of(stored);
        set_status(&mut object, status);
        object.metadata.resource_version = Some(state.next_resource_version());

        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let key = address(kind, &object)?;
        let mut state = self.state();
        let Some(stored) = state.objects.get(&key) else {
            return Err(not_found(key));
        };
        check_resource_version(&key, stored, &object)?;

        let mut updated = stored.clone();
        set_status(&mut updated, status_of(&object));
        updated.metadata.resource_version = Some(state.next_resource_version());

        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let key = (kind, namespace.to_owned(), name.to_owned());
        let mut state = self.state();
        let Some(deleted) = state.objects.remove(&key) else {
            return Err(not_found(key));
        };

        // Collect dependents whose owners are all gone, until nothing is left to collect.
        let mut removed = vec![deleted];
        while let Some(owner) = removed.pop() {
            let Some(owner_uid) = owner.metadata.uid else {
                continue;
            };
            let orphans = state
                .objects
                .iter()
                .filter(|((_, object_namespace, _), object)| {
                    object_namespace == namespace
                        && object.metadata.owner_references.as_ref().is_some_and(|owners| {
                            owners.iter().any(|owner| owner.uid == owner_uid)
                        })
                })
                .filter(|(_, object)| {
                    object.metadata.owner_references.iter().flatten().all(|owner| {
                        owner.uid == owner_uid
                            || !state
                                .objects
                                .values()
                                .any(|live| live.metadata.uid.as_deref() == Some(owner.uid.as_str()))
                    })
                })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for orphan in orphans {
                if let Some(object) = state.objects.remove(&orphan) {
                    removed.push(object);
                }
            }
        }

        Ok(())
    }
}
