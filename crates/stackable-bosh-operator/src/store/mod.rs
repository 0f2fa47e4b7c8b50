//! The backing object store.
//!
//! Every control loop talks to the store through the dyn-compatible [`ObjectStore`] trait, which
//! moves [`DynamicObject`]s tagged with a [`ResourceKind`]. The kinds form a static registry
//! built with [`register_kinds!`], mapping each kind to its typed Rust representation and to
//! the [`ApiResource`] used against the Kubernetes API. [`crate::client::Client`] layers a typed
//! API on top.
//!
//! Two implementations exist: [`kubernetes::KubeStore`] for a real API server and
//! [`memory::MemoryStore`], an in-process store with the same optimistic concurrency and
//! cascading deletion semantics.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::Job,
    core::v1::{ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Secret, Service},
};
use kube::{
    Resource,
    core::{ApiResource, DynamicObject, Selector},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::{
    crd::{BoshDeployment, SecretRequest},
    reconcile::ErrorClass,
};

pub mod kubernetes;
pub mod memory;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{kind} {namespace}/{name} not found"))]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} already exists"))]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} was modified concurrently"))]
    Conflict {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[snafu(display("request for {kind} in namespace {namespace} failed"))]
    Request {
        source: kube::Error,
        kind: ResourceKind,
        namespace: String,
    },

    #[snafu(display("failed to convert {kind} object"))]
    Convert {
        source: serde_json::Error,
        kind: ResourceKind,
    },

    #[snafu(display("{kind} object has no name"))]
    MissingName { kind: ResourceKind },

    #[snafu(display("{kind} object {name} has no namespace"))]
    MissingNamespace { kind: ResourceKind, name: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Both an optimistic concurrency failure and a lost create race count as a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Request { .. } => ErrorClass::Transient,
            Self::Convert { .. } | Self::MissingName { .. } | Self::MissingNamespace { .. } => {
                ErrorClass::Fatal
            }
        }
    }
}

/// A strongly consistent, namespaced object store with optimistic concurrency.
///
/// `update` and `update_status` must fail with [`StoreError::Conflict`] when the object's
/// resource version is stale, `create` with [`StoreError::AlreadyExists`] when the name is taken.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// Lists the objects of `kind` in `namespace` whose labels match `selector`, ordered by name.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ResourceKind, object: DynamicObject) -> Result<DynamicObject>;

    /// Replaces everything but the status.
    async fn update(&self, kind: ResourceKind, object: DynamicObject) -> Result<DynamicObject>;

    /// Replaces only the status.
    async fn update_status(
        &self,
        kind: ResourceKind,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// Deletes the object and, through owner references, everything it owns.
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;
}

/// A Rust type registered in the [`ResourceKind`] registry.
pub trait Kind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;
}

macro_rules! register_kinds {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        /// Every kind of object this operator reads or writes.
        #[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub enum ResourceKind {
            $($variant,)*
        }

        impl ResourceKind {
            /// The API coordinates used to address this kind on a Kubernetes API server.
            pub fn api_resource(self) -> ApiResource {
                match self {
                    $(Self::$variant => ApiResource::erase::<$ty>(&()),)*
                }
            }
        }

        $(
            impl Kind for $ty {
                const KIND: ResourceKind = ResourceKind::$variant;
            }
        )*
    };
}

register_kinds! {
    BoshDeployment => BoshDeployment,
    SecretRequest => SecretRequest,
    ConfigMap => ConfigMap,
    Secret => Secret,
    Service => Service,
    Endpoints => Endpoints,
    Pod => Pod,
    StatefulSet => StatefulSet,
    Job => Job,
    PersistentVolumeClaim => PersistentVolumeClaim,
}

/// Erases a typed object into the representation the store moves around.
pub fn to_dynamic<K: Kind>(object: &K) -> Result<DynamicObject> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .context(ConvertSnafu { kind: K::KIND })
}

/// Restores the typed representation of an object returned by the store.
pub fn from_dynamic<K: Kind>(object: DynamicObject) -> Result<K> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .context(ConvertSnafu { kind: K::KIND })
}
