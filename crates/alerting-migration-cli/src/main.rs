use std::path::PathBuf;

use alerting_migration_core::{MigrationConfig, MigrationService};
use alerting_migration_store_sqlite::SqliteStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "UALERT_LOG";

#[derive(Debug, Parser)]
#[command(name = "ualert")]
#[command(about = "Legacy to unified alerting migration")]
struct Cli {
    #[arg(long, default_value = "./grafana.sqlite3")]
    db: PathBuf,

    /// YAML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    /// Desired state: `true` migrates, `false` reverts.
    #[arg(long)]
    unified_alerting: Option<bool>,

    #[arg(long)]
    legacy_alerting: Option<bool>,

    /// Allow reverting, which deletes every unified alerting rule and folder
    /// the migration created.
    #[arg(long, default_value_t = false)]
    force_migration: bool,

    #[arg(long)]
    data_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Migration {
        #[command(subcommand)]
        command: MigrationCommand,
    },
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Folders {
        #[command(subcommand)]
        command: FoldersCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum MigrationCommand {
    /// Migrate, revert or do nothing depending on the configuration.
    Run,
    /// Revert to legacy alerting whatever the configured state; needs
    /// `--force-migration`.
    Revert,
    Status,
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum FoldersCommand {
    List(OrgArgs),
}

#[derive(Debug, Args)]
struct OrgArgs {
    #[arg(long, default_value_t = 1)]
    org_id: i64,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut MigrationConfig) {
        if let Some(enabled) = self.unified_alerting {
            config.unified_alerting.enabled = enabled;
        }
        if let Some(enabled) = self.legacy_alerting {
            config.alerting.enabled = Some(enabled);
        }
        if self.force_migration {
            config.force_migration = true;
        }
        if let Some(data_path) = &self.data_path {
            config.data_path.clone_from(data_path);
        }
    }
}

fn load_config(cli: &Cli) -> Result<MigrationConfig> {
    let mut config = match &cli.config {
        Some(path) => MigrationConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MigrationConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the JSON contract; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match &cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Migration { command } => {
            let config = load_config(&cli)?;
            store.migrate()?;
            run_migration(command, store, config)
        }
        Command::Rules { command: RulesCommand::List } => {
            store.migrate()?;
            emit_json(serde_json::json!({ "rules": store.list_alert_rules()? }))
        }
        Command::Folders { command: FoldersCommand::List(args) } => {
            store.migrate()?;
            emit_json(serde_json::json!({
                "org_id": args.org_id,
                "folders": store.list_folders(args.org_id)?
            }))
        }
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(args, store),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_migration(
    command: &MigrationCommand,
    store: SqliteStore,
    config: MigrationConfig,
) -> Result<()> {
    let mut service = MigrationService::new(store, config);
    match command {
        MigrationCommand::Run => {
            let outcome = service.run()?;
            emit_json(serde_json::to_value(&outcome)?)
        }
        MigrationCommand::Revert => {
            let outcome = service.revert()?;
            emit_json(serde_json::to_value(&outcome)?)
        }
        MigrationCommand::Status => {
            let status = service.status()?;
            emit_json(serde_json::to_value(&status)?)
        }
    }
}
