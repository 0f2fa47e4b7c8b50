use async_trait::async_trait;
use kube::{
    Api,
    api::{DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{DynamicObject, ErrorResponse, Selector},
};
use snafu::{OptionExt, ResultExt};

use super::{
    ConvertSnafu, MissingNameSnafu, MissingNamespaceSnafu, ObjectStore, ResourceKind, Result,
    StoreError,
};

/// An [`ObjectStore`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    post_params: PostParams,
    delete_params: DeleteParams,
}

impl KubeStore {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
            delete_params: DeleteParams {
                propagation_policy: Some(PropagationPolicy::Background),
                ..DeleteParams::default()
            },
        }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

/// Sorts kube API errors into the store's error taxonomy.
fn classify(error: kube::Error, kind: ResourceKind, namespace: &str, name: &str) -> StoreError {
    match &error {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => StoreError::NotFound {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        kube::Error::Api(ErrorResponse {
            code: 409, reason, ..
        }) if reason == "AlreadyExists" => StoreError::AlreadyExists {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        kube::Error::Api(ErrorResponse { code: 409, .. }) => StoreError::Conflict {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        _ => StoreError::Request {
            source: error,
            kind,
            namespace: namespace.to_owned(),
        },
    }
}

fn address(kind: ResourceKind, object: &DynamicObject) -> Result<(String, String)> {
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
    Ok((namespace, name))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|error| classify(error, kind, namespace, name))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let list_params = ListParams::default().labels_from(selector);
        let mut objects = self
            .api(kind, namespace)
            .list(&list_params)
            .await
            .map_err(|error| classify(error, kind, namespace, ""))?
            .items;
        objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(objects)
    }

    async fn create(&self, kind: ResourceKind, object: DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = address(kind, &object)?;
        self.api(kind, &namespace)
            .create(&self.post_params, &object)
            .await
            .map_err(|error| classify(error, kind, &namespace, &name))
    }

    async fn update(&self, kind: ResourceKind, object: DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = address(kind, &object)?;
        self.api(kind, &namespace)
            .replace(&name, &self.post_params, &object)
            .await
            .map_err(|error| classify(error, kind, &namespace, &name))
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let (namespace, name) = address(kind, &object)?;
        let body = serde_json::to_vec(&object).context(ConvertSnafu { kind })?;
        self.api(kind, &namespace)
            .replace_status(&name, &self.post_params, body)
            .await
            .map_err(|error| classify(error, kind, &namespace, &name))
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.api(kind, namespace)
            .delete(name, &self.delete_params)
            .await
            .map(|_| ())
            .map_err(|error| classify(error, kind, namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: String::new(),
            reason: reason.to_owned(),
            code,
        })
    }

    #[rstest]
    #[case(api_error(404, "NotFound"), "NotFound")]
    #[case(api_error(409, "AlreadyExists"), "AlreadyExists")]
    #[case(api_error(409, "Conflict"), "Conflict")]
    #[case(api_error(500, "InternalError"), "Request")]
    fn api_errors_are_classified(#[case] error: kube::Error, #[case] expected: &str) {
        let classified = classify(error, ResourceKind::Secret, "default", "nats.var-password");

        let actual = match classified {
            StoreError::NotFound { .. } => "NotFound",
            StoreError::AlreadyExists { .. } => "AlreadyExists",
            StoreError::Conflict { .. } => "Conflict",
            StoreError::Request { .. } => "Request",
            _ => "Other",
        };
        assert_eq!(actual, expected);
    }
}
