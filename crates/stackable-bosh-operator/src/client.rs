use std::sync::Arc;

use kube::{ResourceExt, core::Selector};

use crate::store::{
    self, Kind, ObjectStore, Result, kubernetes::KubeStore, memory::MemoryStore,
};

/// Typed access to the backing [`ObjectStore`].
///
/// Every operation is namespaced, objects carry their own namespace.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn ObjectStore>,
    kube_client: Option<kube::Client>,
}

impl Client {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            kube_client: None,
        }
    }

    pub fn for_kubernetes(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client.clone(), field_manager)),
            kube_client: Some(client),
        }
    }

    pub fn in_memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Self::new(store.clone()), store)
    }

    /// The underlying [`kube::Client`], if this client talks to a Kubernetes API server.
    pub fn as_kube_client(&self) -> Option<kube::Client> {
        self.kube_client.clone()
    }

    /// Retrieves a single instance of the requested resource type with the given name.
    pub async fn get<K: Kind>(&self, name: &str, namespace: &str) -> Result<K> {
        let object = self.store.get(K::KIND, namespace, name).await?;
        store::from_dynamic(object)
    }

    /// Like [`Client::get`], but a missing object is [`None`] instead of an error.
    pub async fn get_opt<K: Kind>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        match self.get(name, namespace).await {
            Ok(object) => Ok(Some(object)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Lists all objects in `namespace`, ordered by name.
    pub async fn list<K: Kind>(&self, namespace: &str) -> Result<Vec<K>> {
        self.list_with_label_selector(namespace, &Selector::default())
            .await
    }

    /// Lists the objects in `namespace` whose labels match `selector`, ordered by name.
    pub async fn list_with_label_selector<K: Kind>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>> {
        self.store
            .list(K::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(store::from_dynamic)
            .collect()
    }

    pub async fn create<K: Kind>(&self, resource: &K) -> Result<K> {
        let created = self
            .store
            .create(K::KIND, store::to_dynamic(resource)?)
            .await?;
        store::from_dynamic(created)
    }

    /// Replaces a resource, except for its status.
    ///
    /// Fails with a conflict when `resource` was read at an outdated resource version.
    pub async fn update<K: Kind>(&self, resource: &K) -> Result<K> {
        let updated = self
            .store
            .update(K::KIND, store::to_dynamic(resource)?)
            .await?;
        store::from_dynamic(updated)
    }

    /// Replaces only the status of a resource.
    pub async fn update_status<K: Kind>(&self, resource: &K) -> Result<K> {
        let updated = self
            .store
            .update_status(K::KIND, store::to_dynamic(resource)?)
            .await?;
        store::from_dynamic(updated)
    }

    /// Deletes a resource and everything it owns. A resource that is already gone is not an error.
    pub async fn delete<K: Kind>(&self, resource: &K) -> Result<()> {
        let namespace = resource.namespace().unwrap_or_default();
        match self
            .store
            .delete(K::KIND, &namespace, &resource.name_any())
            .await
        {
            Err(error) if error.is_not_found() => Ok(()),
            result => result,
        }
    }
}
