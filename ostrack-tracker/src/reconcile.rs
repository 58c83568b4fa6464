//! One reconciliation cycle: for every configured (site, resource kind)
//! pair, fetch the live view, diff it against stored state, and write the
//! outcome in a single transaction. Units are independent; a failing fetch
//! skips its unit and leaves stored state untouched, while a store failure
//! aborts the whole run.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use sqlx::{Pool, Postgres};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use ostrack_common::error::FetchError;
use ostrack_common::settings::Settings;
use ostrack_common::{GpuLeaseReservation, ResourceKind};
use ostrack_providers::observed::{ObservedLease, ObservedResource};
use ostrack_providers::registry::{SiteHandle, SiteRegistry};

use crate::diff::diff_cycle;
use crate::store;

/// Reservation types whose `resource_id` is expected to show up in the same
/// cycle's compute fetch.
const INSTANCE_RESERVATION_TYPE: &str = "virtual:instance";

#[derive(Debug)]
pub struct UnitOutcome {
    pub site: String,
    pub unit: String,
    pub fetched: usize,
    pub new: usize,
    pub reappeared: usize,
    pub newly_missing: usize,
    pub marked_deleted: usize,
}

#[derive(Debug)]
pub struct UnitFailure {
    pub site: String,
    pub unit: String,
    pub error: FetchError,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<UnitOutcome>,
    pub failures: Vec<UnitFailure>,
}

/// Entry point invoked by the external scheduler (cron calls the `track`
/// subcommand). Sites reconcile in parallel; within a site the compute unit
/// runs first so the lease unit can check reservations against the same
/// cycle's server set.
pub async fn run_cycle(
    pool: &Pool<Postgres>,
    registry: &SiteRegistry,
    settings: &Settings,
    site_filter: Option<&str>,
) -> anyhow::Result<CycleReport> {
    if let Some(site) = site_filter {
        if registry.get(site).is_none() {
            anyhow::bail!("site '{site}' is not configured");
        }
    }

    let now = Utc::now();
    let site_runs = registry
        .iter()
        .filter(|(code, _)| site_filter.map_or(true, |s| *code == s))
        .map(|(code, handle)| {
            reconcile_site(
                pool,
                code,
                handle,
                now,
                settings.missing_grace,
                settings.per_site_concurrency,
            )
        });

    let mut report = CycleReport::default();
    for result in join_all(site_runs).await {
        let (outcomes, failures) = result?;
        report.outcomes.extend(outcomes);
        report.failures.extend(failures);
    }

    info!(
        units = report.outcomes.len(),
        failed_units = report.failures.len(),
        "reconciliation cycle complete"
    );
    Ok(report)
}

async fn reconcile_site(
    pool: &Pool<Postgres>,
    site: &str,
    handle: &SiteHandle,
    now: DateTime<Utc>,
    grace: Duration,
    per_site_concurrency: usize,
) -> Result<(Vec<UnitOutcome>, Vec<UnitFailure>), sqlx::Error> {
    let mut outcomes = Vec::new();
    let mut failures = Vec::new();

    // Servers first: the lease unit checks instance-backed reservations
    // against this cycle's server set.
    let mut server_ids: Option<HashSet<String>> = None;
    match handle.compute.list_resources(ResourceKind::Server).await {
        Ok(fetched) => {
            server_ids = Some(fetched.iter().map(|r| r.resource_id.clone()).collect());
            outcomes
                .push(apply_resource_unit(pool, site, ResourceKind::Server, fetched, now, grace).await?);
        }
        Err(error) => {
            warn!(site, unit = "servers", %error, "fetch failed, unit skipped this cycle");
            failures.push(UnitFailure {
                site: site.to_string(),
                unit: ResourceKind::Server.table().to_string(),
                error,
            });
        }
    }

    // The remaining kinds run concurrently under the per-site cap so one
    // slow site API never sees an unbounded burst.
    let semaphore = Semaphore::new(per_site_concurrency.max(1));
    let rest = [
        ResourceKind::Network,
        ResourceKind::Router,
        ResourceKind::Subnet,
        ResourceKind::FloatingIp,
    ];
    let unit_runs = rest.map(|kind| {
        let semaphore = &semaphore;
        let handle = &handle.compute;
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let fetched = handle.list_resources(kind).await;
            (kind, fetched)
        }
    });
    for (kind, fetched) in join_all(unit_runs).await {
        match fetched {
            Ok(fetched) => {
                outcomes.push(apply_resource_unit(pool, site, kind, fetched, now, grace).await?);
            }
            Err(error) => {
                warn!(site, unit = kind.table(), %error, "fetch failed, unit skipped this cycle");
                failures.push(UnitFailure {
                    site: site.to_string(),
                    unit: kind.table().to_string(),
                    error,
                });
            }
        }
    }

    if let Some(lease_api) = &handle.lease {
        match lease_api.list_leases().await {
            Ok(leases) => {
                outcomes.push(
                    apply_lease_unit(pool, site, leases, server_ids.as_ref(), now, grace).await?,
                );
            }
            Err(error) => {
                warn!(site, unit = "gpu_leases", %error, "fetch failed, unit skipped this cycle");
                failures.push(UnitFailure {
                    site: site.to_string(),
                    unit: "gpu_leases".to_string(),
                    error,
                });
            }
        }
    }

    Ok((outcomes, failures))
}

/// Apply one fetch result to one resource table. Everything between `begin`
/// and `commit` is the unit's atomicity boundary: a crash mid-unit leaves
/// the previous cycle's state, never a half-applied one.
async fn apply_resource_unit(
    pool: &Pool<Postgres>,
    site: &str,
    kind: ResourceKind,
    fetched: Vec<ObservedResource>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<UnitOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let stored = store::resource_marks(&mut tx, kind, site).await?;
    let fetched_ids: HashSet<String> = fetched.iter().map(|r| r.resource_id.clone()).collect();
    let diff = diff_cycle(&fetched_ids, &stored, now, grace);

    for resource in &fetched {
        store::upsert_resource(&mut tx, site, resource, now).await?;
    }
    store::stamp_first_not_seen(&mut tx, kind.table(), "resource_id", site, &diff.newly_missing, now)
        .await?;
    store::mark_system_deleted(&mut tx, kind.table(), "resource_id", site, &diff.expired, now)
        .await?;

    tx.commit().await?;

    let outcome = UnitOutcome {
        site: site.to_string(),
        unit: kind.table().to_string(),
        fetched: fetched.len(),
        new: diff.new.len(),
        reappeared: diff.reappeared.len(),
        newly_missing: diff.newly_missing.len(),
        marked_deleted: diff.expired.len(),
    };
    info!(
        site,
        unit = kind.table(),
        fetched = outcome.fetched,
        new = outcome.new,
        reappeared = outcome.reappeared,
        newly_missing = outcome.newly_missing,
        marked_deleted = outcome.marked_deleted,
        "unit reconciled"
    );
    Ok(outcome)
}

/// The lease unit covers `gpu_leases` and their reservations in one
/// transaction; a lease exclusively owns its reservation rows.
async fn apply_lease_unit(
    pool: &Pool<Postgres>,
    site: &str,
    fetched: Vec<ObservedLease>,
    server_ids: Option<&HashSet<String>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<UnitOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let stored = store::lease_marks(&mut tx, site).await?;
    let fetched_ids: HashSet<String> = fetched.iter().map(|l| l.lease_id.clone()).collect();
    let diff = diff_cycle(&fetched_ids, &stored, now, grace);

    for lease in &fetched {
        store::upsert_lease(&mut tx, site, lease, now).await?;

        let snapshots: HashMap<String, GpuLeaseReservation> =
            store::lease_reservations(&mut tx, site, &lease.lease_id)
                .await?
                .into_iter()
                .map(|row| (row.reservation_id.clone(), row))
                .collect();
        for reservation in &lease.reservations {
            let changed = reservation.resources_changed
                || snapshots
                    .get(&reservation.reservation_id)
                    .map(|prev| prev.resource_properties != reservation.resource_properties)
                    .unwrap_or(false);
            // Only flag missing backing resources when this cycle's server
            // fetch actually succeeded; absence-due-to-failure is not
            // absence.
            let missing = reservation.missing_resources
                || (reservation.resource_type == INSTANCE_RESERVATION_TYPE
                    && server_ids.map_or(false, |ids| !ids.contains(&reservation.resource_id)));
            store::upsert_reservation(&mut tx, site, &lease.lease_id, reservation, missing, changed, now)
                .await?;
        }
    }
    store::stamp_first_not_seen(&mut tx, "gpu_leases", "lease_id", site, &diff.newly_missing, now)
        .await?;
    store::mark_system_deleted(&mut tx, "gpu_leases", "lease_id", site, &diff.expired, now).await?;

    tx.commit().await?;

    let outcome = UnitOutcome {
        site: site.to_string(),
        unit: "gpu_leases".to_string(),
        fetched: fetched.len(),
        new: diff.new.len(),
        reappeared: diff.reappeared.len(),
        newly_missing: diff.newly_missing.len(),
        marked_deleted: diff.expired.len(),
    };
    info!(
        site,
        unit = "gpu_leases",
        fetched = outcome.fetched,
        new = outcome.new,
        newly_missing = outcome.newly_missing,
        marked_deleted = outcome.marked_deleted,
        "unit reconciled"
    );
    Ok(outcome)
}
