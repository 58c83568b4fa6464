use async_trait::async_trait;
use serde_json::Value;

use ostrack_common::error::FetchError;
use ostrack_common::settings::KeystoneCredentials;

use crate::keystone::KeystoneSession;
use crate::observed::{ObservedLease, ObservedReservation};
use crate::timefmt::parse_provider_time;
use crate::LeaseProvider;

/// Lease-manager (Blazar) client for one site. Authenticates against its own
/// Keystone, which may differ from the compute tuple's.
pub struct BlazarSite {
    session: KeystoneSession,
}

impl BlazarSite {
    pub fn new(site: &str, creds: KeystoneCredentials) -> Self {
        Self {
            session: KeystoneSession::new(site, creds),
        }
    }

    fn site(&self) -> &str {
        self.session.site()
    }
}

#[async_trait]
impl LeaseProvider for BlazarSite {
    async fn list_leases(&self) -> Result<Vec<ObservedLease>, FetchError> {
        let (token, endpoint) = self.session.token_and_endpoint("reservation").await?;
        let url = format!("{endpoint}/leases");
        let resp = self
            .session
            .client()
            .get(&url)
            .header("X-Auth-Token", &token)
            .send()
            .await
            .map_err(|e| self.session.transport_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
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

        let payload: Value = resp.json().await.map_err(|e| FetchError::Malformed {
            site: self.site().to_string(),
            reason: format!("GET {url} returned non-JSON body: {e}"),
        })?;
        let leases = payload["leases"]
            .as_array()
            .ok_or_else(|| FetchError::Malformed {
                site: self.site().to_string(),
                reason: "response missing 'leases' array".into(),
            })?;
        leases
            .iter()
            .map(|lease| {
                normalize_lease(lease).map_err(|reason| FetchError::Malformed {
                    site: self.site().to_string(),
                    reason,
                })
            })
            .collect()
    }
}

fn required_id(v: &Value) -> Result<String, String> {
    v["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("lease record without an 'id' field: {v}"))
}

fn str_field(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().to_string()
}

fn time_field(v: &Value, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    v[key].as_str().and_then(parse_provider_time)
}

fn normalize_lease(v: &Value) -> Result<ObservedLease, String> {
    let lease_id = required_id(v)?;
    let reservations = v["reservations"]
        .as_array()
        .map(|rs| rs.iter().map(normalize_reservation).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    Ok(ObservedLease {
        lease_id,
        lease_name: str_field(v, "name"),
        user_id: str_field(v, "user_id"),
        project_id: str_field(v, "project_id"),
        start_date: time_field(v, "start_date"),
        end_date: time_field(v, "end_date"),
        status: str_field(v, "status"),
        degraded: v["degraded"].as_bool().unwrap_or(false),
        trust_id: v["trust_id"].as_str().map(str::to_string),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        reservations,
    })
}

fn normalize_reservation(v: &Value) -> Result<ObservedReservation, String> {
    Ok(ObservedReservation {
        reservation_id: required_id(v)?,
        resource_id: str_field(v, "resource_id"),
        resource_type: str_field(v, "resource_type"),
        status: str_field(v, "status"),
        created_time: time_field(v, "created_at"),
        updated_time: time_field(v, "updated_at"),
        missing_resources: v["missing_resources"].as_bool().unwrap_or(false),
        resources_changed: v["resources_changed"].as_bool().unwrap_or(false),
        resource_properties: parse_resource_properties(&v["resource_properties"]),
        network_id: v["network_id"].as_str().map(str::to_string),
        min_hosts: v["min"].as_i64().unwrap_or(1) as i32,
        max_hosts: v["max"].as_i64().unwrap_or(1) as i32,
    })
}

/// Blazar double-encodes `resource_properties` as a JSON string; decode it
/// where possible so snapshot comparisons see structure, not quoting.
fn parse_resource_properties(v: &Value) -> Value {
    match v {
        Value::String(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(raw).unwrap_or_else(|_| v.clone())
        }
        Value::Null | Value::String(_) => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lease_normalizes_with_reservations() {
        let payload = json!({
            "id": "lease-1",
            "name": "gpu-experiment",
            "user_id": "u-1",
            "project_id": "p-1",
            "start_date": "2025-03-01T00:00:00.000000",
            "end_date": "2025-03-08T00:00:00.000000",
            "status": "ACTIVE",
            "degraded": false,
            "created_at": "2025-02-28 12:00:00",
            "reservations": [{
                "id": "res-1",
                "resource_id": "host-42",
                "resource_type": "physical:host",
                "status": "active",
                "resource_properties": "{\"gpu.model\": \"A100\"}",
                "min": 2,
                "max": 4
            }]
        });
        let lease = normalize_lease(&payload).unwrap();
        assert_eq!(lease.lease_id, "lease-1");
        assert!(lease.start_date.is_some());
        assert_eq!(lease.reservations.len(), 1);
        let res = &lease.reservations[0];
        assert_eq!(res.min_hosts, 2);
        assert_eq!(res.max_hosts, 4);
        assert_eq!(res.resource_properties["gpu.model"], "A100");
    }

    #[test]
    fn reservation_properties_fall_back_to_empty_object() {
        let res = normalize_reservation(&json!({
            "id": "res-2",
            "resource_type": "virtual:instance",
            "resource_properties": null
        }))
        .unwrap();
        assert!(res.resource_properties.as_object().map(|m| m.is_empty()).unwrap_or(false));
        assert_eq!(res.min_hosts, 1);
    }

    #[test]
    fn lease_without_id_is_an_error() {
        assert!(normalize_lease(&json!({"name": "ghost"})).is_err());
    }
}
