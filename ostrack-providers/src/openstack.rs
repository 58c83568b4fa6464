use async_trait::async_trait;
use serde_json::{json, Value};

use ostrack_common::error::{DeleteError, FetchError};
use ostrack_common::settings::KeystoneCredentials;
use ostrack_common::ResourceKind;

use crate::keystone::KeystoneSession;
use crate::observed::{ObservedResource, ResourceDetails};
use crate::timefmt::parse_provider_time;
use crate::ResourceProvider;

/// Compute + network API client for one site, speaking Nova and Neutron
/// through a shared Keystone session.
pub struct OpenStackSite {
    session: KeystoneSession,
}

impl OpenStackSite {
    pub fn new(site: &str, creds: KeystoneCredentials) -> Self {
        Self {
            session: KeystoneSession::new(site, creds),
        }
    }

    fn site(&self) -> &str {
        self.session.site()
    }

    async fn get_json(&self, service: &str, path: &str) -> Result<Value, FetchError> {
        let mut retried = false;
        loop {
            let (token, endpoint) = self.session.token_and_endpoint(service).await?;
            let url = format!("{endpoint}{path}");
            let resp = self
                .session
                .client()
                .get(&url)
                .header("X-Auth-Token", &token)
                .send()
                .await
                .map_err(|e| self.session.transport_error(e))?;

            let status = resp.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && !retried {
                // Token may have been revoked under us; one fresh attempt.
                self.session.invalidate().await;
                retried = true;
                continue;
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                let text = resp.text().await.unwrap_or_default();
                return Err(FetchError::Auth {
                    site: self.site().to_string(),
                    reason: format!("GET {url} returned {status}: {text}"),
                });
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(FetchError::Transient {
                    site: self.site().to_string(),
                    reason: format!("GET {url} returned {status}: {text}"),
                });
            }
            return resp.json().await.map_err(|e| FetchError::Malformed {
                site: self.site().to_string(),
                reason: format!("GET {url} returned non-JSON body: {e}"),
            });
        }
    }

    async fn list_collection(
        &self,
        service: &str,
        path: &str,
        key: &str,
        normalize: fn(&Value) -> Result<ObservedResource, String>,
    ) -> Result<Vec<ObservedResource>, FetchError> {
        let payload = self.get_json(service, path).await?;
        let items = payload[key].as_array().ok_or_else(|| FetchError::Malformed {
            site: self.site().to_string(),
            reason: format!("response missing '{key}' array"),
        })?;
        items
            .iter()
            .map(|item| {
                normalize(item).map_err(|reason| FetchError::Malformed {
                    site: self.site().to_string(),
                    reason,
                })
            })
            .collect()
    }

    async fn send_delete(&self, service: &str, path: &str, resource_id: &str)
        -> Result<(), DeleteError> {
        let (token, endpoint) = self
            .session
            .token_and_endpoint(service)
            .await
            .map_err(|e| fetch_to_delete(e, resource_id))?;
        let url = format!("{endpoint}{path}");
        let resp = self
            .session
            .client()
            .delete(&url)
            .header("X-Auth-Token", &token)
            .send()
            .await
            .map_err(|e| DeleteError::Transient {
                resource_id: resource_id.to_string(),
                reason: e.to_string(),
            })?;
        classify_delete_status(resp, resource_id).await
    }

    async fn send_update(
        &self,
        service: &str,
        path: &str,
        body: &Value,
        resource_id: &str,
    ) -> Result<(), DeleteError> {
        let (token, endpoint) = self
            .session
            .token_and_endpoint(service)
            .await
            .map_err(|e| fetch_to_delete(e, resource_id))?;
        let url = format!("{endpoint}{path}");
        let resp = self
            .session
            .client()
            .put(&url)
            .header("X-Auth-Token", &token)
            .json(body)
            .send()
            .await
            .map_err(|e| DeleteError::Transient {
                resource_id: resource_id.to_string(),
                reason: e.to_string(),
            })?;
        classify_delete_status(resp, resource_id).await
    }

    /// Routers cannot be deleted while they hold an external gateway or
    /// interface ports, so those are cleared first.
    async fn delete_router(&self, router_id: &str) -> Result<(), DeleteError> {
        self.send_update(
            "network",
            &format!("/v2.0/routers/{router_id}"),
            &json!({ "router": { "external_gateway_info": Value::Null } }),
            router_id,
        )
        .await?;

        let ports = self
            .get_json("network", &format!("/v2.0/ports?device_id={router_id}"))
            .await
            .map_err(|e| fetch_to_delete(e, router_id))?;
        if let Some(ports) = ports["ports"].as_array() {
            for port in ports {
                if port["device_owner"].as_str() != Some("network:router_interface") {
                    continue;
                }
                let Some(port_id) = port["id"].as_str() else {
                    continue;
                };
                self.send_update(
                    "network",
                    &format!("/v2.0/routers/{router_id}/remove_router_interface"),
                    &json!({ "port_id": port_id }),
                    router_id,
                )
                .await?;
            }
        }

        self.send_delete("network", &format!("/v2.0/routers/{router_id}"), router_id)
            .await
    }
}

#[async_trait]
impl ResourceProvider for OpenStackSite {
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<ObservedResource>, FetchError> {
        match kind {
            ResourceKind::Server => {
                self.list_collection("compute", "/servers/detail", "servers", normalize_server)
                    .await
            }
            ResourceKind::Network => {
                self.list_collection("network", "/v2.0/networks", "networks", normalize_network)
                    .await
            }
            ResourceKind::Router => {
                self.list_collection("network", "/v2.0/routers", "routers", normalize_router)
                    .await
            }
            ResourceKind::Subnet => {
                self.list_collection("network", "/v2.0/subnets", "subnets", normalize_subnet)
                    .await
            }
            ResourceKind::FloatingIp => {
                self.list_collection(
                    "network",
                    "/v2.0/floatingips",
                    "floatingips",
                    normalize_floating_ip,
                )
                .await
            }
        }
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<(), DeleteError> {
        match kind {
            ResourceKind::Server => {
                self.send_delete("compute", &format!("/servers/{resource_id}"), resource_id)
                    .await
            }
            ResourceKind::Network => {
                self.send_delete(
                    "network",
                    &format!("/v2.0/networks/{resource_id}"),
                    resource_id,
                )
                .await
            }
            ResourceKind::Router => self.delete_router(resource_id).await,
            ResourceKind::Subnet => {
                self.send_delete(
                    "network",
                    &format!("/v2.0/subnets/{resource_id}"),
                    resource_id,
                )
                .await
            }
            ResourceKind::FloatingIp => {
                self.send_delete(
                    "network",
                    &format!("/v2.0/floatingips/{resource_id}"),
                    resource_id,
                )
                .await
            }
        }
    }
}

async fn classify_delete_status(
    resp: reqwest::Response,
    resource_id: &str,
) -> Result<(), DeleteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    let reason = format!("{status}: {text}");
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(DeleteError::Auth {
            resource_id: resource_id.to_string(),
            reason,
        })
    } else if status.is_client_error() {
        Err(DeleteError::Rejected {
            resource_id: resource_id.to_string(),
            reason,
        })
    } else {
        Err(DeleteError::Transient {
            resource_id: resource_id.to_string(),
            reason,
        })
    }
}

fn fetch_to_delete(err: FetchError, resource_id: &str) -> DeleteError {
    match err {
        FetchError::Auth { reason, .. } => DeleteError::Auth {
            resource_id: resource_id.to_string(),
            reason,
        },
        FetchError::Transient { reason, .. } | FetchError::Malformed { reason, .. } => {
            DeleteError::Transient {
                resource_id: resource_id.to_string(),
                reason,
            }
        }
    }
}

// --- Normalization ---
//
// Provider payloads are loosely typed JSON; everything the store persists is
// pinned down here. A record without an id fails the whole fetch rather than
// being dropped on the floor.

fn required_id(v: &Value) -> Result<String, String> {
    v["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("record without an 'id' field: {v}"))
}

fn opt_string(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn time_field(v: &Value, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    v[key].as_str().and_then(parse_provider_time)
}

fn normalize_server(v: &Value) -> Result<ObservedResource, String> {
    let security_groups = v["security_groups"]
        .as_array()
        .map(|sgs| {
            sgs.iter()
                .filter_map(|sg| opt_string(&sg["name"]))
                .collect()
        })
        .unwrap_or_default();

    Ok(ObservedResource {
        resource_id: required_id(v)?,
        resource_name: v["name"].as_str().unwrap_or_default().to_string(),
        status: v["status"].as_str().unwrap_or_default().to_string(),
        created_time: time_field(v, "created"),
        updated_time: time_field(v, "updated"),
        details: ResourceDetails::Server {
            // Boot-from-volume servers report image as "" instead of an object.
            flavor: opt_string(&v["flavor"]["id"]),
            image: opt_string(&v["image"]["id"]),
            security_groups,
            addresses: v["addresses"].clone(),
        },
    })
}

fn normalize_network(v: &Value) -> Result<ObservedResource, String> {
    Ok(ObservedResource {
        resource_id: required_id(v)?,
        resource_name: v["name"].as_str().unwrap_or_default().to_string(),
        status: v["status"].as_str().unwrap_or_default().to_string(),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        details: ResourceDetails::Network {
            port_security_enabled: v["port_security_enabled"].as_bool(),
        },
    })
}

fn normalize_router(v: &Value) -> Result<ObservedResource, String> {
    let gateway = match &v["external_gateway_info"] {
        Value::Null => None,
        other => Some(other.clone()),
    };
    Ok(ObservedResource {
        resource_id: required_id(v)?,
        resource_name: v["name"].as_str().unwrap_or_default().to_string(),
        status: v["status"].as_str().unwrap_or_default().to_string(),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        details: ResourceDetails::Router {
            external_gateway_info: gateway,
        },
    })
}

fn normalize_subnet(v: &Value) -> Result<ObservedResource, String> {
    Ok(ObservedResource {
        resource_id: required_id(v)?,
        resource_name: v["name"].as_str().unwrap_or_default().to_string(),
        // Subnets carry no provider status.
        status: "ACTIVE".to_string(),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        details: ResourceDetails::Subnet {
            network_id: opt_string(&v["network_id"]),
            cidr: opt_string(&v["cidr"]),
            allocation_pools: match &v["allocation_pools"] {
                Value::Null => None,
                other => Some(other.clone()),
            },
        },
    })
}

fn normalize_floating_ip(v: &Value) -> Result<ObservedResource, String> {
    let resource_id = required_id(v)?;
    let floating = opt_string(&v["floating_ip_address"]);
    Ok(ObservedResource {
        // Floating IPs are nameless; the address is the operator-facing name.
        resource_name: floating.clone().unwrap_or_else(|| resource_id.clone()),
        resource_id,
        status: v["status"].as_str().unwrap_or_default().to_string(),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        details: ResourceDetails::FloatingIp {
            floating_ip_address: floating,
            fixed_ip_address: opt_string(&v["fixed_ip_address"]),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_normalizes_nested_fields() {
        let payload = json!({
            "id": "srv-1",
            "name": "my-web-server",
            "status": "ACTIVE",
            "created": "2025-01-10T08:00:00Z",
            "updated": "2025-02-01T09:30:00Z",
            "flavor": {"id": "m1.large"},
            "image": {"id": "ubuntu-22.04"},
            "security_groups": [{"name": "default"}, {"name": "web"}],
            "addresses": {"sharednet1": [{"addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed"}]}
        });
        let rec = normalize_server(&payload).unwrap();
        assert_eq!(rec.resource_id, "srv-1");
        assert_eq!(rec.resource_name, "my-web-server");
        match rec.details {
            ResourceDetails::Server {
                flavor,
                image,
                security_groups,
                addresses,
            } => {
                assert_eq!(flavor.as_deref(), Some("m1.large"));
                assert_eq!(image.as_deref(), Some("ubuntu-22.04"));
                assert_eq!(security_groups, vec!["default", "web"]);
                assert!(addresses["sharednet1"].is_array());
            }
            other => panic!("wrong details: {other:?}"),
        }
    }

    #[test]
    fn boot_from_volume_server_has_no_image() {
        let payload = json!({
            "id": "srv-2",
            "name": "bfv",
            "status": "ACTIVE",
            "image": "",
            "flavor": {"id": "m1.small"}
        });
        let rec = normalize_server(&payload).unwrap();
        match rec.details {
            ResourceDetails::Server { image, .. } => assert!(image.is_none()),
            other => panic!("wrong details: {other:?}"),
        }
    }

    #[test]
    fn record_without_id_is_an_error() {
        assert!(normalize_server(&json!({"name": "ghost"})).is_err());
        assert!(normalize_network(&json!({"name": "ghost"})).is_err());
    }

    #[test]
    fn subnet_status_defaults_to_active() {
        let payload = json!({
            "id": "sub-1",
            "name": "sharednet1-subnet",
            "network_id": "net-1",
            "cidr": "10.0.0.0/24",
            "allocation_pools": [{"start": "10.0.0.2", "end": "10.0.0.254"}]
        });
        let rec = normalize_subnet(&payload).unwrap();
        assert_eq!(rec.status, "ACTIVE");
        match rec.details {
            ResourceDetails::Subnet { cidr, .. } => {
                assert_eq!(cidr.as_deref(), Some("10.0.0.0/24"));
            }
            other => panic!("wrong details: {other:?}"),
        }
    }

    #[test]
    fn floating_ip_uses_address_as_name() {
        let payload = json!({
            "id": "fip-1",
            "floating_ip_address": "192.0.2.17",
            "fixed_ip_address": "10.0.0.5",
            "status": "ACTIVE"
        });
        let rec = normalize_floating_ip(&payload).unwrap();
        assert_eq!(rec.resource_name, "192.0.2.17");
    }

    #[test]
    fn router_null_gateway_is_none() {
        let payload = json!({
            "id": "rtr-1",
            "name": "edge",
            "status": "ACTIVE",
            "external_gateway_info": null
        });
        let rec = normalize_router(&payload).unwrap();
        match rec.details {
            ResourceDetails::Router {
                external_gateway_info,
            } => assert!(external_gateway_info.is_none()),
            other => panic!("wrong details: {other:?}"),
        }
    }
}
