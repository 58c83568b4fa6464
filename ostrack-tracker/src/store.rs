//! The durable history store. Every operation here is an upsert, a flag
//! update, or a read; rows are never physically deleted. All SQL is built
//! with runtime `query`/`query_as` and binds so the crate compiles without a
//! DATABASE_URL. Table and key-column names come from fixed enums, never
//! from input.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Transaction};

use ostrack_common::{GpuLease, GpuLeaseReservation, ResourceKind, TrackedResource};
use ostrack_providers::observed::{
    ObservedLease, ObservedResource, ObservedReservation, ResourceDetails,
};

use crate::diff::StoredMark;

const COMMON_COLUMNS: &str = "resource_id, resource_name, status, created_time, updated_time, \
     last_seen_time, first_time_not_seen, user_deleted, system_deleted, project_site";

type MarkRow = (String, Option<DateTime<Utc>>, bool, bool);

/// Stored bookkeeping for the rows of one (site, kind) pair that are still
/// live, i.e. not yet permanently excluded by a deletion flag.
pub async fn resource_marks(
    tx: &mut Transaction<'_, Postgres>,
    kind: ResourceKind,
    site: &str,
) -> Result<Vec<StoredMark>, sqlx::Error> {
    let sql = format!(
        "SELECT resource_id, first_time_not_seen, system_deleted, user_deleted
         FROM {}
         WHERE project_site = $1 AND NOT system_deleted AND NOT user_deleted",
        kind.table()
    );
    let rows: Vec<MarkRow> = sqlx::query_as(&sql).bind(site).fetch_all(&mut **tx).await?;
    Ok(rows.into_iter().map(mark_from_row).collect())
}

pub async fn lease_marks(
    tx: &mut Transaction<'_, Postgres>,
    site: &str,
) -> Result<Vec<StoredMark>, sqlx::Error> {
    let rows: Vec<MarkRow> = sqlx::query_as(
        "SELECT lease_id, first_time_not_seen, system_deleted, user_deleted
         FROM gpu_leases
         WHERE project_site = $1 AND NOT system_deleted AND NOT user_deleted",
    )
    .bind(site)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(mark_from_row).collect())
}

fn mark_from_row((resource_id, first_time_not_seen, system_deleted, user_deleted): MarkRow) -> StoredMark {
    StoredMark {
        resource_id,
        first_time_not_seen,
        system_deleted,
        user_deleted,
    }
}

/// Write one observed resource. Insert and update share the same statement;
/// the composite key is the sole guard against duplicate rows, so a replayed
/// or overlapping cycle turns into an update, not a second insert. The
/// deletion flags and `created_time` are deliberately left out of the update
/// branch: history survives reappearance.
pub async fn upsert_resource(
    tx: &mut Transaction<'_, Postgres>,
    site: &str,
    resource: &ObservedResource,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    match &resource.details {
        ResourceDetails::Server {
            flavor,
            image,
            security_groups,
            addresses,
        } => {
            sqlx::query(
                "INSERT INTO servers (resource_id, resource_name, status, created_time, \
                     updated_time, last_seen_time, project_site, flavor, image, \
                     security_groups, addresses)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (resource_id, project_site) DO UPDATE SET
                     resource_name = EXCLUDED.resource_name,
                     status = EXCLUDED.status,
                     updated_time = EXCLUDED.updated_time,
                     last_seen_time = EXCLUDED.last_seen_time,
                     first_time_not_seen = NULL,
                     flavor = EXCLUDED.flavor,
                     image = EXCLUDED.image,
                     security_groups = EXCLUDED.security_groups,
                     addresses = EXCLUDED.addresses",
            )
            .bind(&resource.resource_id)
            .bind(&resource.resource_name)
            .bind(&resource.status)
            .bind(resource.created_time)
            .bind(resource.updated_time)
            .bind(now)
            .bind(site)
            .bind(flavor.as_deref())
            .bind(image.as_deref())
            .bind(serde_json::json!(security_groups))
            .bind(addresses)
            .execute(&mut **tx)
            .await?;
        }
        ResourceDetails::Network {
            port_security_enabled,
        } => {
            sqlx::query(
                "INSERT INTO networks (resource_id, resource_name, status, created_time, \
                     updated_time, last_seen_time, project_site, port_security_enabled)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (resource_id, project_site) DO UPDATE SET
                     resource_name = EXCLUDED.resource_name,
                     status = EXCLUDED.status,
                     updated_time = EXCLUDED.updated_time,
                     last_seen_time = EXCLUDED.last_seen_time,
                     first_time_not_seen = NULL,
                     port_security_enabled = EXCLUDED.port_security_enabled",
            )
            .bind(&resource.resource_id)
            .bind(&resource.resource_name)
            .bind(&resource.status)
            .bind(resource.created_time)
            .bind(resource.updated_time)
            .bind(now)
            .bind(site)
            .bind(port_security_enabled)
            .execute(&mut **tx)
            .await?;
        }
        ResourceDetails::Router {
            external_gateway_info,
        } => {
            sqlx::query(
                "INSERT INTO routers (resource_id, resource_name, status, created_time, \
                     updated_time, last_seen_time, project_site, external_gateway_info)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (resource_id, project_site) DO UPDATE SET
                     resource_name = EXCLUDED.resource_name,
                     status = EXCLUDED.status,
                     updated_time = EXCLUDED.updated_time,
                     last_seen_time = EXCLUDED.last_seen_time,
                     first_time_not_seen = NULL,
                     external_gateway_info = EXCLUDED.external_gateway_info",
            )
            .bind(&resource.resource_id)
            .bind(&resource.resource_name)
            .bind(&resource.status)
            .bind(resource.created_time)
            .bind(resource.updated_time)
            .bind(now)
            .bind(site)
            .bind(external_gateway_info.as_ref())
            .execute(&mut **tx)
            .await?;
        }
        ResourceDetails::Subnet {
            network_id,
            cidr,
            allocation_pools,
        } => {
            sqlx::query(
                "INSERT INTO subnets (resource_id, resource_name, status, created_time, \
                     updated_time, last_seen_time, project_site, network_id, cidr, \
                     allocation_pools)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (resource_id, project_site) DO UPDATE SET
                     resource_name = EXCLUDED.resource_name,
                     status = EXCLUDED.status,
                     updated_time = EXCLUDED.updated_time,
                     last_seen_time = EXCLUDED.last_seen_time,
                     first_time_not_seen = NULL,
                     network_id = EXCLUDED.network_id,
                     cidr = EXCLUDED.cidr,
                     allocation_pools = EXCLUDED.allocation_pools",
            )
            .bind(&resource.resource_id)
            .bind(&resource.resource_name)
            .bind(&resource.status)
            .bind(resource.created_time)
            .bind(resource.updated_time)
            .bind(now)
            .bind(site)
            .bind(network_id.as_deref())
            .bind(cidr.as_deref())
            .bind(allocation_pools.as_ref())
            .execute(&mut **tx)
            .await?;
        }
        ResourceDetails::FloatingIp {
            floating_ip_address,
            fixed_ip_address,
        } => {
            sqlx::query(
                "INSERT INTO floating_ips (resource_id, resource_name, status, created_time, \
                     updated_time, last_seen_time, project_site, floating_ip_address, \
                     fixed_ip_address)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (resource_id, project_site) DO UPDATE SET
                     resource_name = EXCLUDED.resource_name,
                     status = EXCLUDED.status,
                     updated_time = EXCLUDED.updated_time,
                     last_seen_time = EXCLUDED.last_seen_time,
                     first_time_not_seen = NULL,
                     floating_ip_address = EXCLUDED.floating_ip_address,
                     fixed_ip_address = EXCLUDED.fixed_ip_address",
            )
            .bind(&resource.resource_id)
            .bind(&resource.resource_name)
            .bind(&resource.status)
            .bind(resource.created_time)
            .bind(resource.updated_time)
            .bind(now)
            .bind(site)
            .bind(floating_ip_address.as_deref())
            .bind(fixed_ip_address.as_deref())
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

pub async fn upsert_lease(
    tx: &mut Transaction<'_, Postgres>,
    site: &str,
    lease: &ObservedLease,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO gpu_leases (lease_id, lease_name, user_id, project_id, start_date, \
             end_date, status, degraded, trust_id, created_time, updated_time, \
             last_seen_time, project_site)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         ON CONFLICT (lease_id, project_site) DO UPDATE SET
             lease_name = EXCLUDED.lease_name,
             start_date = EXCLUDED.start_date,
             end_date = EXCLUDED.end_date,
             status = EXCLUDED.status,
             degraded = EXCLUDED.degraded,
             trust_id = EXCLUDED.trust_id,
             updated_time = EXCLUDED.updated_time,
             last_seen_time = EXCLUDED.last_seen_time,
             first_time_not_seen = NULL",
    )
    .bind(&lease.lease_id)
    .bind(&lease.lease_name)
    .bind(&lease.user_id)
    .bind(&lease.project_id)
    .bind(lease.start_date)
    .bind(lease.end_date)
    .bind(&lease.status)
    .bind(lease.degraded)
    .bind(lease.trust_id.as_deref())
    .bind(lease.created_time)
    .bind(lease.updated_time)
    .bind(now)
    .bind(site)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Stored reservation rows of one lease, for the snapshot comparison the
/// reconciler runs against the fresh fetch.
pub async fn lease_reservations(
    tx: &mut Transaction<'_, Postgres>,
    site: &str,
    lease_id: &str,
) -> Result<Vec<GpuLeaseReservation>, sqlx::Error> {
    sqlx::query_as(
        "SELECT reservation_id, lease_id, project_site, resource_id, resource_type, status, \
             created_time, updated_time, last_seen_time, missing_resources, \
             resources_changed, resource_properties, network_id, min_hosts, max_hosts
         FROM gpu_lease_reservations
         WHERE project_site = $1 AND lease_id = $2",
    )
    .bind(site)
    .bind(lease_id)
    .fetch_all(&mut **tx)
    .await
}

pub async fn upsert_reservation(
    tx: &mut Transaction<'_, Postgres>,
    site: &str,
    lease_id: &str,
    reservation: &ObservedReservation,
    missing_resources: bool,
    resources_changed: bool,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO gpu_lease_reservations (reservation_id, lease_id, project_site, \
             resource_id, resource_type, status, created_time, updated_time, \
             last_seen_time, missing_resources, resources_changed, resource_properties, \
             network_id, min_hosts, max_hosts)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
         ON CONFLICT (reservation_id, project_site) DO UPDATE SET
             status = EXCLUDED.status,
             updated_time = EXCLUDED.updated_time,
             last_seen_time = EXCLUDED.last_seen_time,
             missing_resources = EXCLUDED.missing_resources,
             resources_changed = EXCLUDED.resources_changed,
             resource_properties = EXCLUDED.resource_properties,
             network_id = EXCLUDED.network_id,
             min_hosts = EXCLUDED.min_hosts,
             max_hosts = EXCLUDED.max_hosts",
    )
    .bind(&reservation.reservation_id)
    .bind(lease_id)
    .bind(site)
    .bind(&reservation.resource_id)
    .bind(&reservation.resource_type)
    .bind(&reservation.status)
    .bind(reservation.created_time)
    .bind(reservation.updated_time)
    .bind(now)
    .bind(missing_resources)
    .bind(resources_changed)
    .bind(&reservation.resource_properties)
    .bind(reservation.network_id.as_deref())
    .bind(reservation.min_hosts)
    .bind(reservation.max_hosts)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Stamp the first cycle of absence on rows that were not fetched. The
/// `IS NULL` guard keeps an already-running absence clock untouched.
pub async fn stamp_first_not_seen(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    key_column: &str,
    site: &str,
    ids: &[String],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE {table}
         SET first_time_not_seen = $1
         WHERE project_site = $2 AND {key_column} = ANY($3) AND first_time_not_seen IS NULL"
    );
    sqlx::query(&sql)
        .bind(now)
        .bind(site)
        .bind(ids)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Conclude that rows vanished provider-side. Monotonic: rows already marked
/// are skipped, so the flag is set exactly once.
pub async fn mark_system_deleted(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    key_column: &str,
    site: &str,
    ids: &[String],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE {table}
         SET system_deleted = TRUE, updated_time = $1
         WHERE project_site = $2 AND {key_column} = ANY($3) AND NOT system_deleted"
    );
    sqlx::query(&sql)
        .bind(now)
        .bind(site)
        .bind(ids)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Record deletes this system issued and the provider confirmed.
pub async fn mark_user_deleted(
    pool: &Pool<Postgres>,
    kind: ResourceKind,
    site: &str,
    ids: &[String],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE {}
         SET user_deleted = TRUE, updated_time = $1
         WHERE project_site = $2 AND resource_id = ANY($3)",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(now)
        .bind(site)
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(())
}

/// Rows old enough to reclaim: created before the cutoff, still present at
/// the provider as of the last cycle, and not already reclaimed by us.
pub async fn cleanup_candidates(
    pool: &Pool<Postgres>,
    kind: ResourceKind,
    site: Option<&str>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<TrackedResource>, sqlx::Error> {
    let site_clause = if site.is_some() {
        " AND project_site = $2"
    } else {
        ""
    };
    let sql = format!(
        "SELECT {COMMON_COLUMNS}
         FROM {}
         WHERE created_time IS NOT NULL AND created_time < $1
           AND first_time_not_seen IS NULL
           AND NOT user_deleted{site_clause}
         ORDER BY created_time ASC",
        kind.table()
    );
    let mut query = sqlx::query_as::<_, TrackedResource>(&sql).bind(cutoff);
    if let Some(site) = site {
        query = query.bind(site.to_string());
    }
    query.fetch_all(pool).await
}

/// Case-insensitive name scan over one resource table; a row matches when
/// its name contains every term.
pub async fn search_resources(
    pool: &Pool<Postgres>,
    kind: ResourceKind,
    terms: &[String],
    site: Option<&str>,
) -> Result<Vec<TrackedResource>, sqlx::Error> {
    let sql = format!(
        "SELECT {COMMON_COLUMNS} FROM {} WHERE {} ORDER BY resource_name, project_site",
        kind.table(),
        search_predicate("resource_name", terms.len(), site.is_some()),
    );
    let mut query = sqlx::query_as::<_, TrackedResource>(&sql);
    for term in terms {
        query = query.bind(format!("%{term}%"));
    }
    if let Some(site) = site {
        query = query.bind(site.to_string());
    }
    query.fetch_all(pool).await
}

/// Same scan over the lease table.
pub async fn search_leases(
    pool: &Pool<Postgres>,
    terms: &[String],
    site: Option<&str>,
) -> Result<Vec<GpuLease>, sqlx::Error> {
    let sql = format!(
        "SELECT lease_id, lease_name, user_id, project_id, start_date, end_date, status, \
             degraded, trust_id, created_time, updated_time, last_seen_time, \
             first_time_not_seen, user_deleted, system_deleted, project_site
         FROM gpu_leases WHERE {} ORDER BY lease_name, project_site",
        search_predicate("lease_name", terms.len(), site.is_some()),
    );
    let mut query = sqlx::query_as::<_, GpuLease>(&sql);
    for term in terms {
        query = query.bind(format!("%{term}%"));
    }
    if let Some(site) = site {
        query = query.bind(site.to_string());
    }
    query.fetch_all(pool).await
}

fn search_predicate(name_column: &str, term_count: usize, with_site: bool) -> String {
    let mut clauses: Vec<String> = (1..=term_count)
        .map(|i| format!("{name_column} ILIKE ${i}"))
        .collect();
    if with_site {
        clauses.push(format!("project_site = ${}", term_count + 1));
    }
    clauses.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_predicate_numbers_binds_in_order() {
        assert_eq!(
            search_predicate("resource_name", 2, true),
            "resource_name ILIKE $1 AND resource_name ILIKE $2 AND project_site = $3"
        );
        assert_eq!(
            search_predicate("lease_name", 1, false),
            "lease_name ILIKE $1"
        );
    }
}
