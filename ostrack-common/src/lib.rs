use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod settings;

// --- Enums ---

/// The resource kinds tracked per site. GPU leases are a separate entity
/// (see [`GpuLease`]) and are not part of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Server,
    Network,
    Router,
    Subnet,
    FloatingIp,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Server,
        ResourceKind::Network,
        ResourceKind::Router,
        ResourceKind::Subnet,
        ResourceKind::FloatingIp,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::Server => "servers",
            ResourceKind::Network => "networks",
            ResourceKind::Router => "routers",
            ResourceKind::Subnet => "subnets",
            ResourceKind::FloatingIp => "floating_ips",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Server => "server",
            ResourceKind::Network => "network",
            ResourceKind::Router => "router",
            ResourceKind::Subnet => "subnet",
            ResourceKind::FloatingIp => "floating_ip",
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" | "servers" => Ok(ResourceKind::Server),
            "network" | "networks" => Ok(ResourceKind::Network),
            "router" | "routers" => Ok(ResourceKind::Router),
            "subnet" | "subnets" => Ok(ResourceKind::Subnet),
            "floating_ip" | "floating_ips" | "floating-ip" | "floating-ips" => {
                Ok(ResourceKind::FloatingIp)
            }
            other => Err(format!(
                "unknown resource kind '{}' (expected one of: server, network, router, subnet, floating_ip)",
                other
            )),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// --- Entities (SQLx Mapped) ---

/// Common bookkeeping shape shared by every resource table. Queries that only
/// care about lifecycle state (cleanup candidates, stored-state reads) select
/// exactly these columns regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackedResource {
    pub resource_id: String,
    pub resource_name: String,
    pub status: String,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub last_seen_time: DateTime<Utc>,
    pub first_time_not_seen: Option<DateTime<Utc>>,
    pub user_deleted: bool,
    pub system_deleted: bool,
    pub project_site: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GpuLease {
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
    pub last_seen_time: DateTime<Utc>,
    pub first_time_not_seen: Option<DateTime<Utc>>,
    pub user_deleted: bool,
    pub system_deleted: bool,
    pub project_site: String,
}

/// A reservation belongs to exactly one lease; rows cascade with the lease.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GpuLeaseReservation {
    pub reservation_id: String,
    pub lease_id: String,
    pub project_site: String,
    pub resource_id: String,
    pub resource_type: String,
    pub status: String,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub last_seen_time: DateTime<Utc>,
    pub missing_resources: bool,
    pub resources_changed: bool,
    pub resource_properties: serde_json::Value,
    pub network_id: Option<String>,
    pub min_hosts: i32,
    pub max_hosts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn kind_parses_singular_and_plural() {
        assert_eq!(ResourceKind::from_str("server").unwrap(), ResourceKind::Server);
        assert_eq!(ResourceKind::from_str("Servers").unwrap(), ResourceKind::Server);
        assert_eq!(
            ResourceKind::from_str("floating-ips").unwrap(),
            ResourceKind::FloatingIp
        );
        assert!(ResourceKind::from_str("volume").is_err());
    }

    #[test]
    fn kind_table_names_are_distinct() {
        let mut tables: Vec<_> = ResourceKind::ALL.iter().map(|k| k.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), ResourceKind::ALL.len());
    }
}
