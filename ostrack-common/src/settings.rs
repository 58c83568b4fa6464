use std::collections::HashMap;

use thiserror::Error;

use crate::ResourceKind;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Keystone application-credential tuple for one API endpoint.
#[derive(Debug, Clone)]
pub struct KeystoneCredentials {
    pub auth_url: String,
    pub application_credential_id: String,
    pub application_credential_secret: String,
}

/// One configured site: a compute/network credential tuple and, where the
/// site runs a lease manager, a separate Blazar tuple.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub code: String,
    pub compute: KeystoneCredentials,
    pub lease: Option<KeystoneCredentials>,
}

/// Per-kind resource names that cleanup must never touch (shared networks,
/// infra subnets). Deployment policy, not code.
#[derive(Debug, Clone, Default)]
pub struct ProtectedResources {
    entries: HashMap<ResourceKind, Vec<String>>,
}

impl ProtectedResources {
    pub fn is_protected(&self, kind: ResourceKind, name: &str) -> bool {
        self.entries
            .get(&kind)
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    pub fn insert(&mut self, kind: ResourceKind, names: Vec<String>) {
        if !names.is_empty() {
            self.entries.insert(kind, names);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub sites: Vec<SiteSettings>,
    /// Minimum continuous absence before a resource is marked
    /// `system_deleted`. Spans several poll cycles so one flaky poll never
    /// buries a live resource.
    pub missing_grace: chrono::Duration,
    pub per_site_concurrency: usize,
    pub protected: ProtectedResources,
}

/// Mangle a site code into its env-var form: `chi@uc` -> `CHI_UC`.
pub fn env_code(site: &str) -> String {
    site.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Tests pass a map so
    /// they never mutate process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let required = |key: &str| -> Result<String, SettingsError> {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SettingsError::MissingVar(key.to_string()))
        };

        let database_url = required("DATABASE_URL")?;

        let site_codes = split_csv(&required("OSTRACK_SITES")?);
        if site_codes.is_empty() {
            return Err(SettingsError::Invalid {
                var: "OSTRACK_SITES".into(),
                reason: "no site codes configured".into(),
            });
        }

        let mut sites = Vec::with_capacity(site_codes.len());
        for code in site_codes {
            let prefix = format!("OSTRACK_{}", env_code(&code));
            let compute = KeystoneCredentials {
                auth_url: required(&format!("{prefix}_AUTH_URL"))?,
                application_credential_id: required(&format!("{prefix}_APP_CRED_ID"))?,
                application_credential_secret: required(&format!("{prefix}_APP_CRED_SECRET"))?,
            };
            // The Blazar tuple is optional per site, but once the auth URL is
            // given the id and secret must follow.
            let lease = match get(&format!("{prefix}_BLAZAR_AUTH_URL")) {
                Some(url) if !url.trim().is_empty() => Some(KeystoneCredentials {
                    auth_url: url,
                    application_credential_id: required(&format!("{prefix}_BLAZAR_APP_CRED_ID"))?,
                    application_credential_secret: required(&format!(
                        "{prefix}_BLAZAR_APP_CRED_SECRET"
                    ))?,
                }),
                _ => None,
            };
            sites.push(SiteSettings { code, compute, lease });
        }

        let grace_hours = match get("OSTRACK_MISSING_GRACE_HOURS") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| SettingsError::Invalid {
                var: "OSTRACK_MISSING_GRACE_HOURS".into(),
                reason: e.to_string(),
            })?,
            None => 6,
        };
        if grace_hours < 1 {
            return Err(SettingsError::Invalid {
                var: "OSTRACK_MISSING_GRACE_HOURS".into(),
                reason: "must be at least 1".into(),
            });
        }

        let per_site_concurrency = match get("OSTRACK_PER_SITE_CONCURRENCY") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|e| SettingsError::Invalid {
                var: "OSTRACK_PER_SITE_CONCURRENCY".into(),
                reason: e.to_string(),
            })?,
            None => 2,
        }
        .max(1);

        let mut protected = ProtectedResources::default();
        let protected_vars = [
            (ResourceKind::Server, "OSTRACK_PROTECTED_SERVERS"),
            (ResourceKind::Network, "OSTRACK_PROTECTED_NETWORKS"),
            (ResourceKind::Router, "OSTRACK_PROTECTED_ROUTERS"),
            (ResourceKind::Subnet, "OSTRACK_PROTECTED_SUBNETS"),
            (ResourceKind::FloatingIp, "OSTRACK_PROTECTED_FLOATING_IPS"),
        ];
        for (kind, var) in protected_vars {
            if let Some(raw) = get(var) {
                protected.insert(kind, split_csv(&raw));
            }
        }

        Ok(Settings {
            database_url,
            sites,
            missing_grace: chrono::Duration::hours(grace_hours),
            per_site_concurrency,
            protected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("DATABASE_URL".into(), "postgresql://localhost/ostrack".into());
        vars.insert("OSTRACK_SITES".into(), "chi@uc, kvm@tacc".into());
        for prefix in ["OSTRACK_CHI_UC", "OSTRACK_KVM_TACC"] {
            vars.insert(format!("{prefix}_AUTH_URL"), "https://keystone.example/v3".into());
            vars.insert(format!("{prefix}_APP_CRED_ID"), "cred-id".into());
            vars.insert(format!("{prefix}_APP_CRED_SECRET"), "cred-secret".into());
        }
        vars
    }

    fn load(vars: &HashMap<String, String>) -> Result<Settings, SettingsError> {
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn env_code_mangles_site_names() {
        assert_eq!(env_code("chi@uc"), "CHI_UC");
        assert_eq!(env_code("kvm@tacc"), "KVM_TACC");
        assert_eq!(env_code("chi.edge"), "CHI_EDGE");
    }

    #[test]
    fn loads_two_sites_with_defaults() {
        let settings = load(&base_vars()).unwrap();
        assert_eq!(settings.sites.len(), 2);
        assert_eq!(settings.sites[0].code, "chi@uc");
        assert!(settings.sites[0].lease.is_none());
        assert_eq!(settings.missing_grace, chrono::Duration::hours(6));
        assert_eq!(settings.per_site_concurrency, 2);
    }

    #[test]
    fn missing_site_credentials_fail() {
        let mut vars = base_vars();
        vars.remove("OSTRACK_KVM_TACC_APP_CRED_SECRET");
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, SettingsError::MissingVar(v) if v.contains("KVM_TACC")));
    }

    #[test]
    fn blazar_tuple_requires_id_and_secret() {
        let mut vars = base_vars();
        vars.insert(
            "OSTRACK_CHI_UC_BLAZAR_AUTH_URL".into(),
            "https://blazar.example/v3".into(),
        );
        assert!(load(&vars).is_err());

        vars.insert("OSTRACK_CHI_UC_BLAZAR_APP_CRED_ID".into(), "lease-id".into());
        vars.insert("OSTRACK_CHI_UC_BLAZAR_APP_CRED_SECRET".into(), "lease-secret".into());
        let settings = load(&vars).unwrap();
        assert!(settings.sites[0].lease.is_some());
        assert!(settings.sites[1].lease.is_none());
    }

    #[test]
    fn protected_lists_parse_and_match() {
        let mut vars = base_vars();
        vars.insert(
            "OSTRACK_PROTECTED_NETWORKS".into(),
            "public, sharednet1 ,".into(),
        );
        let settings = load(&vars).unwrap();
        assert!(settings.protected.is_protected(ResourceKind::Network, "public"));
        assert!(settings.protected.is_protected(ResourceKind::Network, "sharednet1"));
        assert!(!settings.protected.is_protected(ResourceKind::Network, "mynet"));
        assert!(!settings.protected.is_protected(ResourceKind::Subnet, "public"));
    }

    #[test]
    fn grace_must_be_positive() {
        let mut vars = base_vars();
        vars.insert("OSTRACK_MISSING_GRACE_HOURS".into(), "0".into());
        assert!(load(&vars).is_err());
    }
}
