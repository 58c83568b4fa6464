use async_trait::async_trait;

use ostrack_common::error::{DeleteError, FetchError};
use ostrack_common::ResourceKind;

/// Fetch/delete contract for a site's compute and network APIs. One
/// implementation per configured site; the reconciler and the cleanup engine
/// only ever see this trait.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// List every resource of the given kind as observed at call time.
    /// Failures are reported as [`FetchError`], never as an empty list.
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<observed::ObservedResource>, FetchError>;

    /// Delete one resource at the provider. Success means the provider
    /// confirmed the delete; anything else is a [`DeleteError`].
    async fn delete_resource(&self, kind: ResourceKind, resource_id: &str)
        -> Result<(), DeleteError>;
}

/// Fetch contract for a site's lease manager (Blazar), where one exists.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    async fn list_leases(&self) -> Result<Vec<observed::ObservedLease>, FetchError>;
}

pub mod observed {
    use chrono::{DateTime, Utc};
    use ostrack_common::ResourceKind;
    use serde_json::Value;

    /// A resource as normalized from a provider payload, before it meets
    /// stored state.
    #[derive(Clone, Debug)]
    pub struct ObservedResource {
        pub resource_id: String,
        pub resource_name: String,
        pub status: String,
        pub created_time: Option<DateTime<Utc>>,
        pub updated_time: Option<DateTime<Utc>>,
        pub details: ResourceDetails,
    }

    #[derive(Clone, Debug)]
    pub enum ResourceDetails {
        Server {
            flavor: Option<String>,
            image: Option<String>,
            security_groups: Vec<String>,
            addresses: Value,
        },
        Network {
            port_security_enabled: Option<bool>,
        },
        Router {
            external_gateway_info: Option<Value>,
        },
        Subnet {
            network_id: Option<String>,
            cidr: Option<String>,
            allocation_pools: Option<Value>,
        },
        FloatingIp {
            floating_ip_address: Option<String>,
            fixed_ip_address: Option<String>,
        },
    }

    impl ResourceDetails {
        pub fn kind(&self) -> ResourceKind {
            match self {
                ResourceDetails::Server { .. } => ResourceKind::Server,
                ResourceDetails::Network { .. } => ResourceKind::Network,
                ResourceDetails::Router { .. } => ResourceKind::Router,
                ResourceDetails::Subnet { .. } => ResourceKind::Subnet,
                ResourceDetails::FloatingIp { .. } => ResourceKind::FloatingIp,
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct ObservedLease {
        pub lease_id: String,
        pub lease_name: String,
        pub user_id: String,
        pub project_id: String,
        pub start_date: Option<DateTime<Utc>>,
        pub end_date: Option<DateTime<Utc>>,
        pub status: String,
        pub degraded: bool,
        pub trust_id: Option<String>,
        pub created_time: Option<DateTime<Utc>>,
        pub updated_time: Option<DateTime<Utc>>,
        pub reservations: Vec<ObservedReservation>,
    }

    #[derive(Clone, Debug)]
    pub struct ObservedReservation {
        pub reservation_id: String,
        pub resource_id: String,
        pub resource_type: String,
        pub status: String,
        pub created_time: Option<DateTime<Utc>>,
        pub updated_time: Option<DateTime<Utc>>,
        /// Flag as reported by the provider; the lease reconcile unit ORs in
        /// its own snapshot comparison.
        pub missing_resources: bool,
        pub resources_changed: bool,
        pub resource_properties: Value,
        pub network_id: Option<String>,
        pub min_hosts: i32,
        pub max_hosts: i32,
    }
}

pub(crate) mod timefmt {
    use chrono::{DateTime, NaiveDateTime, Utc};

    /// Providers are inconsistent about timestamp shapes: Nova/Neutron emit
    /// RFC 3339, Blazar emits naive ISO 8601 with microseconds and no zone.
    /// Naive timestamps are taken as UTC.
    pub fn parse_provider_time(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(naive.and_utc());
            }
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_nova_rfc3339() {
            let dt = parse_provider_time("2025-03-01T12:30:45Z").unwrap();
            assert_eq!(dt.to_rfc3339(), "2025-03-01T12:30:45+00:00");
        }

        #[test]
        fn parses_blazar_naive_microseconds() {
            assert!(parse_provider_time("2025-03-01T12:30:45.123456").is_some());
            assert!(parse_provider_time("2025-03-01 12:30:45").is_some());
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_provider_time("").is_none());
            assert!(parse_provider_time("not-a-time").is_none());
        }
    }
}

mod keystone;

pub mod blazar;
pub mod openstack;
pub mod registry;

#[cfg(feature = "mock")]
pub mod mock;
