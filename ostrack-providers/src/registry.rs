use std::sync::Arc;

use ostrack_common::settings::SiteSettings;

use crate::blazar::BlazarSite;
use crate::openstack::OpenStackSite;
use crate::{LeaseProvider, ResourceProvider};

/// The callable API client pair for one site.
#[derive(Clone)]
pub struct SiteHandle {
    pub compute: Arc<dyn ResourceProvider>,
    pub lease: Option<Arc<dyn LeaseProvider>>,
}

/// Maps site codes to their client pairs. Built once at startup from
/// configuration; iteration order follows the configured site order.
#[derive(Default)]
pub struct SiteRegistry {
    sites: Vec<(String, SiteHandle)>,
}

impl SiteRegistry {
    pub fn from_settings(sites: &[SiteSettings]) -> Self {
        let mut registry = Self::default();
        for site in sites {
            let compute: Arc<dyn ResourceProvider> =
                Arc::new(OpenStackSite::new(&site.code, site.compute.clone()));
            let lease: Option<Arc<dyn LeaseProvider>> = site
                .lease
                .as_ref()
                .map(|creds| {
                    Arc::new(BlazarSite::new(&site.code, creds.clone())) as Arc<dyn LeaseProvider>
                });
            registry.insert(&site.code, SiteHandle { compute, lease });
        }
        registry
    }

    /// Register a handle directly. Tests use this to slot in mock providers.
    pub fn insert(&mut self, code: &str, handle: SiteHandle) {
        self.sites.retain(|(c, _)| c != code);
        self.sites.push((code.to_string(), handle));
    }

    pub fn get(&self, code: &str) -> Option<&SiteHandle> {
        self.sites
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, handle)| handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SiteHandle)> {
        self.sites.iter().map(|(c, h)| (c.as_str(), h))
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
