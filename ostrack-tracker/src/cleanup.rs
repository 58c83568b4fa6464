//! Age-based reclamation. Candidates come from the history store, protection
//! comes from configuration, deletes go back out through the site providers.
//! One resource's failure never aborts the batch, and nothing is marked
//! `user_deleted` without a confirmed delete.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

use ostrack_common::error::DeleteError;
use ostrack_common::settings::{ProtectedResources, Settings};
use ostrack_common::{ResourceKind, TrackedResource};
use ostrack_providers::registry::SiteRegistry;
use ostrack_providers::ResourceProvider;

use crate::store;

/// Deletion runs in dependency order: servers release their ports before
/// routers and networks go, floating IPs before the networks they point
/// into. Leases are not reclaimed here.
pub const DELETE_ORDER: [ResourceKind; 5] = [
    ResourceKind::Server,
    ResourceKind::FloatingIp,
    ResourceKind::Router,
    ResourceKind::Subnet,
    ResourceKind::Network,
];

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub older_than_hours: i64,
    pub kind: Option<ResourceKind>,
    pub site: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct CleanupItem {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub resource_name: String,
    pub project_site: String,
    pub status: String,
    pub age_hours: i64,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Dry-run only: what a real run would attempt.
    pub candidates: Vec<CleanupItem>,
    /// Matched the age criteria but are protected by policy.
    pub skipped: Vec<CleanupItem>,
    pub deleted: Vec<CleanupItem>,
    pub failed: Vec<(CleanupItem, String)>,
}

pub async fn run_cleanup(
    pool: &Pool<Postgres>,
    registry: &SiteRegistry,
    settings: &Settings,
    options: &CleanupOptions,
) -> anyhow::Result<CleanupReport> {
    if options.older_than_hours < 1 {
        anyhow::bail!("hours must be a positive integer");
    }
    if let Some(site) = options.site.as_deref() {
        if registry.get(site).is_none() {
            anyhow::bail!("site '{site}' is not configured");
        }
    }

    let now = Utc::now();
    let cutoff = now - Duration::hours(options.older_than_hours);
    let mut report = CleanupReport {
        dry_run: options.dry_run,
        ..CleanupReport::default()
    };

    for kind in DELETE_ORDER {
        if options.kind.map_or(false, |k| k != kind) {
            continue;
        }
        let rows =
            store::cleanup_candidates(pool, kind, options.site.as_deref(), cutoff).await?;
        let (protected, deletable) = partition_protected(kind, rows, &settings.protected);

        report
            .skipped
            .extend(protected.iter().map(|row| item_from(kind, row, now)));

        if options.dry_run {
            report
                .candidates
                .extend(deletable.iter().map(|row| item_from(kind, row, now)));
            continue;
        }

        // Group by site so each delete goes through the right client and the
        // confirmed ids are marked per site.
        let mut by_site: BTreeMap<String, Vec<TrackedResource>> = BTreeMap::new();
        for row in deletable {
            by_site.entry(row.project_site.clone()).or_default().push(row);
        }

        for (site, rows) in by_site {
            let Some(handle) = registry.get(&site) else {
                // Rows from a site that has since been dropped from config;
                // nothing can confirm a delete for them.
                for row in &rows {
                    report.failed.push((
                        item_from(kind, row, now),
                        format!("site '{site}' is not configured"),
                    ));
                }
                continue;
            };

            let outcomes = execute_deletes(handle.compute.as_ref(), kind, &rows).await;
            let mut confirmed: Vec<String> = Vec::new();
            for (index, result) in outcomes {
                let row = &rows[index];
                match result {
                    Ok(()) => {
                        info!(site = %site, kind = kind.label(), id = %row.resource_id, name = %row.resource_name, "deleted");
                        confirmed.push(row.resource_id.clone());
                        report.deleted.push(item_from(kind, row, now));
                    }
                    Err(error) => {
                        warn!(site = %site, kind = kind.label(), id = %row.resource_id, %error, "delete failed");
                        report.failed.push((item_from(kind, row, now), error.to_string()));
                    }
                }
            }
            store::mark_user_deleted(pool, kind, &site, &confirmed, now).await?;
        }
    }

    Ok(report)
}

/// Split age-eligible rows into (protected, deletable) by the configured
/// per-kind name lists.
pub fn partition_protected(
    kind: ResourceKind,
    rows: Vec<TrackedResource>,
    protected: &ProtectedResources,
) -> (Vec<TrackedResource>, Vec<TrackedResource>) {
    rows.into_iter()
        .partition(|row| protected.is_protected(kind, &row.resource_name))
}

/// Issue the delete calls one at a time, collecting the per-resource result
/// for each. Index-paired so the caller can line results back up with rows.
pub async fn execute_deletes(
    provider: &dyn ResourceProvider,
    kind: ResourceKind,
    rows: &[TrackedResource],
) -> Vec<(usize, Result<(), DeleteError>)> {
    let mut outcomes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let result = provider.delete_resource(kind, &row.resource_id).await;
        outcomes.push((index, result));
    }
    outcomes
}

fn item_from(kind: ResourceKind, row: &TrackedResource, now: DateTime<Utc>) -> CleanupItem {
    CleanupItem {
        kind,
        resource_id: row.resource_id.clone(),
        resource_name: row.resource_name.clone(),
        project_site: row.project_site.clone(),
        status: row.status.clone(),
        age_hours: row
            .created_time
            .map(|created| (now - created).num_hours())
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostrack_providers::mock::MockSite;
    use ostrack_providers::observed::{ObservedResource, ResourceDetails};

    fn row(id: &str, name: &str) -> TrackedResource {
        TrackedResource {
            resource_id: id.to_string(),
            resource_name: name.to_string(),
            status: "ACTIVE".to_string(),
            created_time: Some(Utc::now() - Duration::hours(100)),
            updated_time: None,
            last_seen_time: Utc::now(),
            first_time_not_seen: None,
            user_deleted: false,
            system_deleted: false,
            project_site: "chi@uc".to_string(),
        }
    }

    fn observed_server(id: &str, name: &str) -> ObservedResource {
        ObservedResource {
            resource_id: id.to_string(),
            resource_name: name.to_string(),
            status: "ACTIVE".to_string(),
            created_time: None,
            updated_time: None,
            details: ResourceDetails::Server {
                flavor: None,
                image: None,
                security_groups: Vec::new(),
                addresses: serde_json::Value::Null,
            },
        }
    }

    #[test]
    fn protected_names_are_partitioned_out() {
        let mut protected = ProtectedResources::default();
        protected.insert(ResourceKind::Network, vec!["public".into(), "sharednet1".into()]);

        let rows = vec![row("n1", "public"), row("n2", "scratch-net"), row("n3", "sharednet1")];
        let (kept, deletable) = partition_protected(ResourceKind::Network, rows, &protected);

        assert_eq!(kept.len(), 2);
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].resource_name, "scratch-net");
    }

    #[test]
    fn protection_is_per_kind() {
        let mut protected = ProtectedResources::default();
        protected.insert(ResourceKind::Network, vec!["public".into()]);

        let rows = vec![row("s1", "public")];
        let (kept, deletable) = partition_protected(ResourceKind::Subnet, rows, &protected);
        assert!(kept.is_empty());
        assert_eq!(deletable.len(), 1);
    }

    #[tokio::test]
    async fn one_rejected_delete_does_not_abort_the_batch() {
        let site = MockSite::new("chi@uc");
        for (id, name) in [("s1", "old-1"), ("s2", "old-2"), ("s3", "old-3")] {
            site.push_resource(observed_server(id, name));
        }
        site.fail_delete("s2");

        let rows = vec![row("s1", "old-1"), row("s2", "old-2"), row("s3", "old-3")];
        let outcomes = execute_deletes(&site, ResourceKind::Server, &rows).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert!(outcomes[2].1.is_ok());

        let deleted = site.deleted_ids();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].1, "s1");
        assert_eq!(deleted[1].1, "s3");
    }
}
