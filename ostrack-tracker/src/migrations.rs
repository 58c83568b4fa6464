use sqlx::{Pool, Postgres};
use tracing::info;

use ostrack_common::settings::SiteSettings;

/// Create the history schema inline and seed the `sites` enumeration from
/// configuration. Everything is `IF NOT EXISTS` so startup is idempotent;
/// unlike a live mirror there are no destructive statements here at all.
pub async fn run_inline_migrations(
    pool: &Pool<Postgres>,
    sites: &[SiteSettings],
) -> Result<(), sqlx::Error> {
    info!("running inline schema migrations");

    let schema_sql = r#"
        CREATE TABLE IF NOT EXISTS sites (
            site_code TEXT PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS servers (
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            flavor TEXT,
            image TEXT,
            security_groups JSONB,
            addresses JSONB,
            PRIMARY KEY (resource_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS networks (
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            port_security_enabled BOOLEAN,
            PRIMARY KEY (resource_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS routers (
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            external_gateway_info JSONB,
            PRIMARY KEY (resource_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS subnets (
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            network_id TEXT,
            cidr TEXT,
            allocation_pools JSONB,
            PRIMARY KEY (resource_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS floating_ips (
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            floating_ip_address TEXT,
            fixed_ip_address TEXT,
            PRIMARY KEY (resource_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS gpu_leases (
            lease_id TEXT NOT NULL,
            lease_name TEXT NOT NULL DEFAULT '',
            user_id TEXT NOT NULL DEFAULT '',
            project_id TEXT NOT NULL DEFAULT '',
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT '',
            degraded BOOLEAN NOT NULL DEFAULT FALSE,
            trust_id TEXT,
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            first_time_not_seen TIMESTAMPTZ,
            user_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            system_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            PRIMARY KEY (lease_id, project_site)
        );
        CREATE TABLE IF NOT EXISTS gpu_lease_reservations (
            reservation_id TEXT NOT NULL,
            lease_id TEXT NOT NULL,
            project_site TEXT NOT NULL REFERENCES sites(site_code),
            resource_id TEXT NOT NULL DEFAULT '',
            resource_type TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            created_time TIMESTAMPTZ,
            updated_time TIMESTAMPTZ,
            last_seen_time TIMESTAMPTZ NOT NULL,
            missing_resources BOOLEAN NOT NULL DEFAULT FALSE,
            resources_changed BOOLEAN NOT NULL DEFAULT FALSE,
            resource_properties JSONB NOT NULL DEFAULT '{}'::jsonb,
            network_id TEXT,
            min_hosts INTEGER NOT NULL DEFAULT 1,
            max_hosts INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (reservation_id, project_site),
            FOREIGN KEY (lease_id, project_site)
                REFERENCES gpu_leases (lease_id, project_site)
                ON DELETE CASCADE
        )
    "#;

    // Statements run one at a time; a failure here is a store failure and
    // aborts startup rather than being swallowed.
    for statement in schema_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(pool).await?;
        }
    }

    for site in sites {
        sqlx::query("INSERT INTO sites (site_code) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(&site.code)
            .execute(pool)
            .await?;
    }

    info!(sites = sites.len(), "schema ready");
    Ok(())
}
