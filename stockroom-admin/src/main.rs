//! Stockroom operator CLI
//!
//! Triggers catalog reconciliation from a spreadsheet export, inspects run
//! history, and writes saved procurement lists out as CSV.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use stockroom_common::config::Config;
use stockroom_common::db::init_database;
use stockroom_common::import::{profile, runs, ImportRequest, ReconciliationEngine, RunMode};
use stockroom_common::users::{self, Role, User};
use stockroom_common::{catalog, export};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod source;

/// Command-line arguments for stockroom-admin
#[derive(Parser, Debug)]
#[command(name = "stockroom-admin")]
#[command(about = "Operator tool for the stockroom catalog")]
#[command(version)]
struct Args {
    /// Root folder holding the database (overrides STOCKROOM_ROOT_FOLDER and config.toml)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the database
    Init,

    /// Grant superadmin to the first operator account
    Bootstrap {
        /// External account id
        #[arg(long)]
        user: i64,
    },

    /// Change a user's role
    SetRole {
        /// External id of the superadmin making the change
        #[arg(long)]
        actor: i64,
        /// External id of the user to change
        #[arg(long)]
        user: i64,
        /// user, admin or superadmin
        #[arg(long)]
        role: String,
    },

    /// Reconcile the catalog against a snapshot file
    Import {
        #[arg(short, long)]
        file: PathBuf,
        /// External id of the admin running the import
        #[arg(short, long)]
        user: i64,
        /// Import profile id; selected by file name when omitted
        #[arg(short, long)]
        profile: Option<i64>,
        /// Report what would change without touching the catalog
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long, default_value_t = ',')]
        delimiter: char,
    },

    /// Most recent reconciliation runs
    Runs {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Anomaly log of one run
    Log { run: i64 },

    /// Departments with active items
    Departments,

    /// Catalog counters
    Stats,

    /// Import profiles and their column bindings
    Profiles,

    /// Write a saved list to `<stem>.csv` and `surplus_<stem>.csv`
    Export {
        #[arg(short, long)]
        list: i64,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, config_problem) = Config::load_deferred(args.root_folder.as_deref());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Some(e) = config_problem {
        warn!("Using default configuration: {}", e);
    }

    info!(
        "Starting stockroom-admin v{} (root folder {})",
        env!("CARGO_PKG_VERSION"),
        config.root_folder.display()
    );

    let db_path = config.database_path();
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    match args.command {
        Command::Init => {
            println!("Database ready at {}", db_path.display());
        }
        Command::Bootstrap { user } => {
            let user = users::bootstrap_superadmin(&pool, user).await?;
            println!("User {} (external id {}) is superadmin", user.id, user.external_id);
        }
        Command::SetRole { actor, user, role } => {
            let actor = lookup_user(&pool, actor).await?;
            let target = lookup_user(&pool, user).await?;
            let role: Role = role.parse()?;
            let updated = users::set_role(&pool, &actor, target.id, role).await?;
            println!("User {} is now {}", updated.external_id, updated.role);
        }
        Command::Import {
            file,
            user,
            profile: profile_id,
            dry_run,
            delimiter,
        } => {
            if !delimiter.is_ascii() {
                bail!("Delimiter must be a single ASCII character");
            }
            let actor = lookup_user(&pool, user).await?;
            let source = source::read_source(&file, delimiter as u8)?;
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Apply };

            let engine = ReconciliationEngine::new(pool.clone(), config.import_timeout);
            let summary = engine
                .run(
                    &actor,
                    ImportRequest {
                        source,
                        mode,
                        profile_id,
                    },
                )
                .await
                .with_context(|| format!("Reconciliation of {} failed", file.display()))?;

            if let Some(previous) = summary.duplicate_of {
                warn!("Same file content was already imported in run {}", previous);
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Runs { limit } => {
            let recent = runs::recent_runs(&pool, limit).await?;
            println!("{}", serde_json::to_string_pretty(&recent)?);
        }
        Command::Log { run } => {
            let entries = runs::run_log(&pool, run).await?;
            for entry in entries {
                let row = entry.row_number.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>6}  {:<14} {:<10} {}",
                    row,
                    entry.kind,
                    entry.raw_sku.as_deref().unwrap_or(""),
                    entry.message
                );
            }
        }
        Command::Departments => {
            for dept in catalog::departments(&pool, &config.departments).await? {
                println!("{:<8} {:<30} {}", dept.code, dept.name, dept.items_count);
            }
        }
        Command::Stats => {
            let stats = catalog::stats(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Profiles => {
            let profiles = profile::list_profiles(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&profiles)?);
        }
        Command::Export { list, out } => {
            let export = export::export_list(&pool, list).await?;
            if export.is_empty() {
                warn!(list_id = list, "List has no exportable lines");
                return Ok(());
            }

            std::fs::create_dir_all(&out).with_context(|| format!("Failed to create {}", out.display()))?;
            let sets = [
                (export.file_stem.clone(), &export.main),
                (export.surplus_stem(), &export.surplus),
            ];
            for (stem, rows) in sets {
                if rows.is_empty() {
                    continue;
                }
                let path = out.join(format!("{}.csv", stem));
                std::fs::write(&path, export::to_csv(rows)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("{} ({} rows)", path.display(), rows.len());
            }
        }
    }

    Ok(())
}

async fn lookup_user(pool: &SqlitePool, external_id: i64) -> Result<User> {
    match users::find_by_external_id(pool, external_id).await? {
        Some(user) => Ok(user),
        None => bail!("No user with external id {}", external_id),
    }
}
