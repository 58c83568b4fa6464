use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use ostrack_common::settings::Settings;
use ostrack_common::ResourceKind;
use ostrack_providers::registry::SiteRegistry;
use ostrack_tracker::cleanup::{self, CleanupOptions, CleanupReport};
use ostrack_tracker::search::{self, SearchHit};
use ostrack_tracker::{logging, migrations, reconcile};

#[derive(Parser)]
#[command(
    name = "ostrack",
    version,
    about = "Track, search, and reclaim OpenStack resources across sites"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation cycle across the configured sites
    ///
    /// This is the cron-facing entry point; scheduling lives outside the
    /// binary.
    Track {
        /// Only reconcile this site
        #[arg(long)]
        site: Option<String>,
    },
    /// Search stored resources by name substring(s), '*'-separated
    Search {
        /// Substring(s) the resource name must contain, e.g. "web*prod"
        query: String,

        /// Only match resources tracked from this site
        #[arg(long, short)]
        site: Option<String>,
    },
    /// Reclaim resources older than the given number of hours
    Cleanup {
        /// Delete resources created at least this many hours ago
        hours: i64,

        /// Report what would be deleted without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Restrict to one resource kind (server, network, router, subnet, floating_ip)
        #[arg(long)]
        kind: Option<ResourceKind>,

        /// Restrict to one site
        #[arg(long)]
        site: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let settings = Settings::from_env().context("configuration error")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    migrations::run_inline_migrations(&pool, &settings.sites)
        .await
        .context("failed to apply schema")?;
    let registry = SiteRegistry::from_settings(&settings.sites);

    match cli.command {
        Commands::Track { site } => {
            let report =
                reconcile::run_cycle(&pool, &registry, &settings, site.as_deref()).await?;
            // Per-unit fetch failures are contained and retried next cycle;
            // they do not fail the process.
            info!(
                units = report.outcomes.len(),
                failed_units = report.failures.len(),
                "track finished"
            );
        }
        Commands::Search { query, site } => {
            let hits = search::search(&pool, &query, site.as_deref()).await?;
            print_search_hits(&hits);
        }
        Commands::Cleanup {
            hours,
            dry_run,
            kind,
            site,
        } => {
            let options = CleanupOptions {
                older_than_hours: hours,
                kind,
                site,
                dry_run,
            };
            let report = cleanup::run_cleanup(&pool, &registry, &settings, &options).await?;
            print_cleanup_report(&report);
        }
    }

    Ok(())
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_search_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No matching resources.");
        return;
    }
    println!(
        "{:<12} {:<30} {:<38} {:<10} {:<10} {:<20} {:<20} FLAGS",
        "KIND", "NAME", "RESOURCE ID", "SITE", "STATUS", "CREATED", "LAST SEEN"
    );
    for hit in hits {
        let flags = match (hit.user_deleted, hit.system_deleted) {
            (true, _) => "user_deleted",
            (_, true) => "system_deleted",
            _ => "",
        };
        println!(
            "{:<12} {:<30} {:<38} {:<10} {:<10} {:<20} {:<20} {}",
            hit.kind,
            hit.resource_name,
            hit.resource_id,
            hit.project_site,
            hit.status,
            fmt_time(hit.created_time),
            fmt_time(Some(hit.last_seen_time)),
            flags
        );
    }
    println!("{} match(es)", hits.len());
}

fn print_cleanup_report(report: &CleanupReport) {
    if report.dry_run {
        println!("DRY RUN - no resources were deleted");
        if report.candidates.is_empty() {
            println!("No cleanup candidates.");
        } else {
            println!(
                "{:<12} {:<30} {:<38} {:<10} {:<10} AGE",
                "KIND", "NAME", "RESOURCE ID", "SITE", "STATUS"
            );
            for item in &report.candidates {
                println!(
                    "{:<12} {:<30} {:<38} {:<10} {:<10} {}d {}h",
                    item.kind,
                    item.resource_name,
                    item.resource_id,
                    item.project_site,
                    item.status,
                    item.age_hours / 24,
                    item.age_hours % 24
                );
            }
        }
    } else {
        for item in &report.deleted {
            println!(
                "deleted  {:<12} {} ({}) at {}",
                item.kind, item.resource_name, item.resource_id, item.project_site
            );
        }
        for (item, reason) in &report.failed {
            println!(
                "FAILED   {:<12} {} ({}) at {}: {}",
                item.kind, item.resource_name, item.resource_id, item.project_site, reason
            );
        }
    }
    for item in &report.skipped {
        println!(
            "skipped  {:<12} {} ({}) at {}: protected by policy",
            item.kind, item.resource_name, item.resource_id, item.project_site
        );
    }
    println!(
        "{} deleted, {} skipped, {} failed{}",
        report.deleted.len(),
        report.skipped.len(),
        report.failed.len(),
        if report.dry_run {
            format!(", {} candidate(s)", report.candidates.len())
        } else {
            String::new()
        }
    );
}
