use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use tokio::sync::RwLock;

use ostrack_common::error::FetchError;
use ostrack_common::settings::KeystoneCredentials;

use crate::timefmt::parse_provider_time;

/// Tokens are refreshed this long before their reported expiry so a request
/// never races the expiration.
const EXPIRY_SLACK_SECS: i64 = 120;

#[derive(Clone)]
struct SessionState {
    token: String,
    endpoints: HashMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
}

/// One authenticated Keystone session per (site, credential tuple). Issues
/// application-credential tokens and resolves public service endpoints from
/// the catalog, caching both until expiry.
pub(crate) struct KeystoneSession {
    client: Client,
    site: String,
    creds: KeystoneCredentials,
    state: RwLock<Option<SessionState>>,
}

impl KeystoneSession {
    pub fn new(site: &str, creds: KeystoneCredentials) -> Self {
        // Default reqwest client has no overall timeout. If a site stalls, a
        // cycle can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        Self {
            client,
            site: site.to_string(),
            creds,
            state: RwLock::new(None),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current token plus the public endpoint for a catalog service type
    /// ("compute", "network", "reservation"), authenticating if needed.
    pub async fn token_and_endpoint(
        &self,
        service_type: &str,
    ) -> Result<(String, String), FetchError> {
        if let Some(state) = self.cached_state().await {
            return self.pick_endpoint(&state, service_type);
        }

        let mut guard = self.state.write().await;
        // Another task may have re-authenticated while we waited.
        if let Some(state) = guard.as_ref().filter(|s| state_is_fresh(s)) {
            let state = state.clone();
            drop(guard);
            return self.pick_endpoint(&state, service_type);
        }

        let state = self.authenticate().await?;
        *guard = Some(state.clone());
        drop(guard);
        self.pick_endpoint(&state, service_type)
    }

    /// Drop the cached token so the next call re-authenticates. Used when a
    /// request comes back 401 mid-session.
    pub async fn invalidate(&self) {
        *self.state.write().await = None;
    }

    async fn cached_state(&self) -> Option<SessionState> {
        self.state
            .read()
            .await
            .as_ref()
            .filter(|s| state_is_fresh(s))
            .cloned()
    }

    fn pick_endpoint(
        &self,
        state: &SessionState,
        service_type: &str,
    ) -> Result<(String, String), FetchError> {
        match state.endpoints.get(service_type) {
            Some(url) => Ok((state.token.clone(), url.clone())),
            None => Err(FetchError::Malformed {
                site: self.site.clone(),
                reason: format!("service catalog has no public '{service_type}' endpoint"),
            }),
        }
    }

    async fn authenticate(&self) -> Result<SessionState, FetchError> {
        let url = format!(
            "{}/auth/tokens",
            self.creds.auth_url.trim_end_matches('/')
        );
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {
                        "id": self.creds.application_credential_id,
                        "secret": self.creds.application_credential_secret,
                    }
                }
            }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::Auth {
                site: self.site.clone(),
                reason: format!("keystone returned {status}: {text}"),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::Transient {
                site: self.site.clone(),
                reason: format!("keystone returned {status}: {text}"),
            });
        }

        let token = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Malformed {
                site: self.site.clone(),
                reason: "token response missing X-Subject-Token header".into(),
            })?;

        let payload: serde_json::Value = resp.json().await.map_err(|e| FetchError::Malformed {
            site: self.site.clone(),
            reason: format!("token response is not JSON: {e}"),
        })?;

        let expires_at = payload["token"]["expires_at"]
            .as_str()
            .and_then(parse_provider_time);
        let endpoints = catalog_public_endpoints(&payload["token"]["catalog"]);
        if endpoints.is_empty() {
            return Err(FetchError::Malformed {
                site: self.site.clone(),
                reason: "token response carries an empty service catalog".into(),
            });
        }

        Ok(SessionState {
            token,
            endpoints,
            expires_at,
        })
    }

    pub fn transport_error(&self, err: reqwest::Error) -> FetchError {
        FetchError::Transient {
            site: self.site.clone(),
            reason: err.to_string(),
        }
    }
}

fn state_is_fresh(state: &SessionState) -> bool {
    match state.expires_at {
        Some(at) => (at - Utc::now()).num_seconds() > EXPIRY_SLACK_SECS,
        // Keystone always reports expiry; treat a missing one as stale so we
        // re-authenticate rather than ride an unknown token.
        None => false,
    }
}

fn catalog_public_endpoints(catalog: &serde_json::Value) -> HashMap<String, String> {
    let mut endpoints = HashMap::new();
    let Some(entries) = catalog.as_array() else {
        return endpoints;
    };
    for entry in entries {
        let Some(service_type) = entry["type"].as_str() else {
            continue;
        };
        let Some(urls) = entry["endpoints"].as_array() else {
            continue;
        };
        for ep in urls {
            if ep["interface"].as_str() == Some("public") {
                if let Some(url) = ep["url"].as_str() {
                    endpoints.insert(
                        service_type.to_string(),
                        url.trim_end_matches('/').to_string(),
                    );
                    break;
                }
            }
        }
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_picks_public_interfaces_only() {
        let catalog = json!([
            {
                "type": "compute",
                "endpoints": [
                    {"interface": "internal", "url": "http://internal:8774/v2.1"},
                    {"interface": "public", "url": "https://nova.example:8774/v2.1/"}
                ]
            },
            {
                "type": "network",
                "endpoints": [
                    {"interface": "admin", "url": "http://admin:9696"}
                ]
            }
        ]);
        let endpoints = catalog_public_endpoints(&catalog);
        assert_eq!(
            endpoints.get("compute").map(String::as_str),
            Some("https://nova.example:8774/v2.1")
        );
        assert!(!endpoints.contains_key("network"));
    }

    #[test]
    fn stale_and_missing_expiry_force_reauth() {
        let fresh = SessionState {
            token: "t".into(),
            endpoints: HashMap::new(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        assert!(state_is_fresh(&fresh));

        let nearly_expired = SessionState {
            expires_at: Some(Utc::now() + chrono::Duration::seconds(30)),
            ..fresh.clone()
        };
        assert!(!state_is_fresh(&nearly_expired));

        let unknown = SessionState {
            expires_at: None,
            ..fresh
        };
        assert!(!state_is_fresh(&unknown));
    }
}
