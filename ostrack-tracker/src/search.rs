//! Name search across every resource table and the lease table. The query
//! string splits on `*` into terms; a record matches when its name contains
//! every term, case-insensitively.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use ostrack_common::{GpuLease, ResourceKind, TrackedResource};

use crate::store;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub kind: &'static str,
    pub resource_id: String,
    pub resource_name: String,
    pub status: String,
    pub project_site: String,
    pub created_time: Option<DateTime<Utc>>,
    pub last_seen_time: DateTime<Utc>,
    pub user_deleted: bool,
    pub system_deleted: bool,
}

/// Split a raw query on `*` into trimmed, non-empty terms. An empty query is
/// an input error, not match-all.
pub fn parse_terms(raw: &str) -> anyhow::Result<Vec<String>> {
    let terms: Vec<String> = raw
        .split('*')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        anyhow::bail!("search query must contain at least one non-empty term");
    }
    Ok(terms)
}

/// Scan every table, resource kinds first in their fixed order, leases last.
/// Each table's hits come back name-ordered, so the overall order is kind
/// then name.
pub async fn search(
    pool: &Pool<Postgres>,
    raw_query: &str,
    site: Option<&str>,
) -> anyhow::Result<Vec<SearchHit>> {
    let terms = parse_terms(raw_query)?;
    let mut hits = Vec::new();

    for kind in ResourceKind::ALL {
        let rows = store::search_resources(pool, kind, &terms, site).await?;
        hits.extend(rows.into_iter().map(|row| hit_from(kind.label(), row)));
    }
    let leases = store::search_leases(pool, &terms, site).await?;
    hits.extend(leases.into_iter().map(lease_hit));

    Ok(hits)
}

fn hit_from(kind: &'static str, row: TrackedResource) -> SearchHit {
    SearchHit {
        kind,
        resource_id: row.resource_id,
        resource_name: row.resource_name,
        status: row.status,
        project_site: row.project_site,
        created_time: row.created_time,
        last_seen_time: row.last_seen_time,
        user_deleted: row.user_deleted,
        system_deleted: row.system_deleted,
    }
}

fn lease_hit(row: GpuLease) -> SearchHit {
    SearchHit {
        kind: "gpu_lease",
        resource_id: row.lease_id,
        resource_name: row.lease_name,
        status: row.status,
        project_site: row.project_site,
        created_time: row.created_time,
        last_seen_time: row.last_seen_time,
        user_deleted: row.user_deleted,
        system_deleted: row.system_deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queries_are_rejected() {
        assert!(parse_terms("").is_err());
        assert!(parse_terms("   ").is_err());
        assert!(parse_terms("**").is_err());
    }

    #[test]
    fn single_term_passes_through() {
        assert_eq!(parse_terms("web").unwrap(), vec!["web"]);
    }

    #[test]
    fn star_splits_and_trims_terms() {
        assert_eq!(parse_terms("web * prod").unwrap(), vec!["web", "prod"]);
        assert_eq!(parse_terms("*web**db*").unwrap(), vec!["web", "db"]);
    }
}
