use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use ostrack_common::error::{DeleteError, FetchError};
use ostrack_common::ResourceKind;

use crate::observed::{ObservedLease, ObservedResource};
use crate::{LeaseProvider, ResourceProvider};

/// In-memory provider for tests: preloaded resources, scriptable delete
/// failures, and a switchable fetch failure so reconciliation tests can
/// exercise the failure-containment paths without a network.
#[derive(Default)]
pub struct MockSite {
    site: String,
    resources: Mutex<HashMap<ResourceKind, Vec<ObservedResource>>>,
    leases: Mutex<Vec<ObservedLease>>,
    fail_fetch: Mutex<bool>,
    fail_deletes: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<(ResourceKind, String)>>,
}

impl MockSite {
    pub fn new(site: &str) -> Self {
        Self {
            site: site.to_string(),
            ..Self::default()
        }
    }

    pub fn push_resource(&self, resource: ObservedResource) {
        let kind = resource.details.kind();
        self.resources
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(resource);
    }

    pub fn push_lease(&self, lease: ObservedLease) {
        self.leases.lock().unwrap().push(lease);
    }

    /// All fetches fail with a transient error while set.
    pub fn set_fetch_failure(&self, failing: bool) {
        *self.fail_fetch.lock().unwrap() = failing;
    }

    /// Deletes of this resource id are rejected by the "provider".
    pub fn fail_delete(&self, resource_id: &str) {
        self.fail_deletes.lock().unwrap().insert(resource_id.to_string());
    }

    /// Ids deleted so far, in call order.
    pub fn deleted_ids(&self) -> Vec<(ResourceKind, String)> {
        self.deleted.lock().unwrap().clone()
    }

    fn check_fetch(&self) -> Result<(), FetchError> {
        if *self.fail_fetch.lock().unwrap() {
            Err(FetchError::Transient {
                site: self.site.clone(),
                reason: "mock fetch failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceProvider for MockSite {
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<ObservedResource>, FetchError> {
        self.check_fetch()?;
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<(), DeleteError> {
        if self.fail_deletes.lock().unwrap().contains(resource_id) {
            return Err(DeleteError::Rejected {
                resource_id: resource_id.to_string(),
                reason: "mock provider rejected delete".into(),
            });
        }
        if let Some(list) = self.resources.lock().unwrap().get_mut(&kind) {
            list.retain(|r| r.resource_id != resource_id);
        }
        self.deleted
            .lock()
            .unwrap()
            .push((kind, resource_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl LeaseProvider for MockSite {
    async fn list_leases(&self) -> Result<Vec<ObservedLease>, FetchError> {
        self.check_fetch()?;
        Ok(self.leases.lock().unwrap().clone())
    }
}
