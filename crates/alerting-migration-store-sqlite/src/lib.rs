use std::path::Path;
use std::time::Duration;

use alerting_migration_core::persist::{MigrationSession, ServerLock, TransactionalStore};
use alerting_migration_core::{
    AlertRule, Dashboard, ExecErrState, Folder, MigrationError, NoDataState, NotificationChannel,
    ResourcePermission,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

mod session;

pub use session::SqliteSession;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS folder (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL,
  org_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(org_id, uid),
  UNIQUE(org_id, title)
);

CREATE TABLE IF NOT EXISTS dashboard (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL,
  org_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  folder_id INTEGER,
  UNIQUE(org_id, uid)
);

CREATE TABLE IF NOT EXISTS resource_permission (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL,
  resource TEXT NOT NULL CHECK (resource IN ('folders','dashboards')),
  resource_uid TEXT NOT NULL,
  role_name TEXT NOT NULL,
  is_managed INTEGER NOT NULL DEFAULT 0,
  user_id INTEGER,
  team_id INTEGER,
  builtin_role TEXT,
  actions_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL,
  dashboard_id INTEGER NOT NULL,
  panel_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  state TEXT NOT NULL,
  settings TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_notification (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL,
  org_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  is_default INTEGER NOT NULL DEFAULT 0,
  settings TEXT NOT NULL,
  UNIQUE(org_id, uid)
);

CREATE TABLE IF NOT EXISTS alert_rule (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL,
  uid TEXT NOT NULL,
  title TEXT NOT NULL,
  rule_group TEXT NOT NULL,
  namespace_uid TEXT NOT NULL,
  condition TEXT NOT NULL,
  data TEXT NOT NULL,
  interval_seconds INTEGER NOT NULL,
  for_seconds INTEGER NOT NULL,
  is_paused INTEGER NOT NULL DEFAULT 0,
  no_data_state TEXT NOT NULL,
  exec_err_state TEXT NOT NULL,
  labels TEXT NOT NULL,
  annotations TEXT NOT NULL,
  dashboard_uid TEXT,
  panel_id INTEGER,
  version INTEGER NOT NULL CHECK (version >= 1),
  updated TEXT NOT NULL,
  UNIQUE(org_id, uid),
  UNIQUE(org_id, namespace_uid, title)
);

CREATE TABLE IF NOT EXISTS alert_rule_version (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  rule_org_id INTEGER NOT NULL,
  rule_uid TEXT NOT NULL,
  rule_namespace_uid TEXT NOT NULL,
  rule_group TEXT NOT NULL,
  version INTEGER NOT NULL,
  title TEXT NOT NULL,
  condition TEXT NOT NULL,
  data TEXT NOT NULL,
  interval_seconds INTEGER NOT NULL,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_instance (
  rule_org_id INTEGER NOT NULL,
  rule_uid TEXT NOT NULL,
  labels_hash TEXT NOT NULL,
  current_state TEXT NOT NULL,
  PRIMARY KEY (rule_org_id, rule_uid, labels_hash)
);

CREATE TABLE IF NOT EXISTS alert_configuration (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL,
  alertmanager_configuration TEXT NOT NULL,
  configuration_version TEXT NOT NULL,
  configuration_hash TEXT NOT NULL,
  is_default INTEGER NOT NULL DEFAULT 0,
  last_applied INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ngalert_configuration (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL UNIQUE,
  alertmanagers TEXT NOT NULL,
  send_alerts_to INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_store (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id INTEGER NOT NULL,
  namespace TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated TEXT NOT NULL,
  UNIQUE(org_id, namespace, key)
);

CREATE TABLE IF NOT EXISTS server_lock (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_uid TEXT NOT NULL UNIQUE,
  version INTEGER NOT NULL,
  last_execution INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dashboard_folder ON dashboard(org_id, folder_id);
CREATE INDEX IF NOT EXISTS idx_resource_permission_resource ON resource_permission(org_id, resource, resource_uid);
CREATE INDEX IF NOT EXISTS idx_alert_org ON alert(org_id, id);
CREATE INDEX IF NOT EXISTS idx_alert_rule_namespace ON alert_rule(org_id, namespace_uid);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Resource an ACL row is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Folders,
    Dashboards,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folders => "folders",
            Self::Dashboards => "dashboards",
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed Grafana store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward schema migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration 1")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 1")?;
            info!(version = 1, "applied schema migration");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert a folder with a caller-chosen uid.
    ///
    /// # Errors
    /// Returns an error when the uid or title is already taken in the org.
    pub fn insert_folder(&self, org_id: i64, uid: &str, title: &str) -> Result<Folder> {
        self.conn
            .execute(
                "INSERT INTO folder(uid, org_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![uid, org_id, title, now_rfc3339()?],
            )
            .with_context(|| format!("failed to insert folder {uid}"))?;
        Ok(Folder {
            id: self.conn.last_insert_rowid(),
            uid: uid.to_string(),
            title: title.to_string(),
            org_id,
        })
    }

    /// # Errors
    /// Returns an error when the uid is already taken in the org.
    pub fn insert_dashboard(
        &self,
        org_id: i64,
        uid: &str,
        title: &str,
        folder_id: Option<i64>,
    ) -> Result<Dashboard> {
        self.conn
            .execute(
                "INSERT INTO dashboard(uid, org_id, title, folder_id) VALUES (?1, ?2, ?3, ?4)",
                params![uid, org_id, title, folder_id],
            )
            .with_context(|| format!("failed to insert dashboard {uid}"))?;
        Ok(Dashboard {
            id: self.conn.last_insert_rowid(),
            uid: uid.to_string(),
            title: title.to_string(),
            folder_id,
            org_id,
        })
    }

    /// Attach an ACL row to a folder or dashboard. `permission.id` and
    /// `permission.is_inherited` are ignored.
    ///
    /// # Errors
    /// Returns an error when the row cannot be encoded or inserted.
    pub fn insert_permission(
        &self,
        org_id: i64,
        kind: ResourceKind,
        resource_uid: &str,
        permission: &ResourcePermission,
    ) -> Result<i64> {
        let actions =
            serde_json::to_string(&permission.actions).context("failed to encode permission actions")?;
        self.conn
            .execute(
                "INSERT INTO resource_permission(
                   org_id, resource, resource_uid, role_name, is_managed,
                   user_id, team_id, builtin_role, actions_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    org_id,
                    kind.as_str(),
                    resource_uid,
                    permission.role_name,
                    permission.is_managed,
                    permission.user_id,
                    permission.team_id,
                    permission.builtin_role,
                    actions,
                ],
            )
            .with_context(|| format!("failed to insert permission on {resource_uid}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the alert cannot be inserted.
    pub fn insert_legacy_alert(
        &self,
        org_id: i64,
        dashboard_id: i64,
        panel_id: i64,
        name: &str,
        settings_json: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO alert(org_id, dashboard_id, panel_id, name, state, settings)
                 VALUES (?1, ?2, ?3, ?4, 'ok', ?5)",
                params![org_id, dashboard_id, panel_id, name, settings_json],
            )
            .with_context(|| format!("failed to insert legacy alert {name:?}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// `channel.id` is ignored and replaced with the generated row id.
    ///
    /// # Errors
    /// Returns an error when the uid is already taken in the org.
    pub fn insert_notification_channel(
        &self,
        channel: &NotificationChannel,
    ) -> Result<NotificationChannel> {
        let settings =
            serde_json::to_string(&channel.settings).context("failed to encode channel settings")?;
        self.conn
            .execute(
                "INSERT INTO alert_notification(uid, org_id, name, type, is_default, settings)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    channel.uid,
                    channel.org_id,
                    channel.name,
                    channel.kind,
                    channel.is_default,
                    settings
                ],
            )
            .with_context(|| format!("failed to insert notification channel {}", channel.uid))?;
        Ok(NotificationChannel { id: self.conn.last_insert_rowid(), ..channel.clone() })
    }

    /// # Errors
    /// Returns an error when the folders cannot be read.
    pub fn list_folders(&self, org_id: i64) -> Result<Vec<Folder>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, uid, title, org_id FROM folder WHERE org_id = ?1 ORDER BY id ASC")
            .context("failed to prepare folder listing")?;
        let rows = stmt.query_map(params![org_id], session::folder_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list folders")
    }

    /// ACL rows stored directly on a resource, without inheritance.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read or decoded.
    pub fn list_permissions(
        &self,
        org_id: i64,
        kind: ResourceKind,
        resource_uid: &str,
    ) -> Result<Vec<ResourcePermission>> {
        session::query_permissions(&self.conn, org_id, kind, resource_uid, false)
    }

    /// # Errors
    /// Returns an error when the channels cannot be read or decoded.
    pub fn list_notification_channels(&self, org_id: i64) -> Result<Vec<NotificationChannel>> {
        session::query_notification_channels(&self.conn, org_id)
    }

    /// Every unified alert rule, ordered by org then insertion.
    ///
    /// # Errors
    /// Returns an error when a rule cannot be read or decoded.
    pub fn list_alert_rules(&self) -> Result<Vec<AlertRule>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT org_id, uid, title, rule_group, namespace_uid, condition, data,
                        interval_seconds, for_seconds, is_paused, no_data_state, exec_err_state,
                        labels, annotations, dashboard_uid, panel_id
                 FROM alert_rule
                 ORDER BY org_id ASC, id ASC",
            )
            .context("failed to prepare alert rule listing")?;
        let mut rows = stmt.query([])?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next()? {
            let uid: String = row.get(1)?;
            let data: String = row.get(6)?;
            let no_data_state: String = row.get(10)?;
            let exec_err_state: String = row.get(11)?;
            let labels: String = row.get(12)?;
            let annotations: String = row.get(13)?;
            rules.push(AlertRule {
                org_id: row.get(0)?,
                title: row.get(2)?,
                rule_group: row.get(3)?,
                folder_uid: row.get(4)?,
                condition: row.get(5)?,
                data: serde_json::from_str(&data)
                    .with_context(|| format!("invalid queries on alert rule {uid}"))?,
                interval_seconds: row.get(7)?,
                for_seconds: row.get(8)?,
                is_paused: row.get(9)?,
                no_data_state: NoDataState::parse(&no_data_state)
                    .ok_or_else(|| anyhow!("invalid no_data_state {no_data_state:?} on {uid}"))?,
                exec_err_state: ExecErrState::parse(&exec_err_state)
                    .ok_or_else(|| anyhow!("invalid exec_err_state {exec_err_state:?} on {uid}"))?,
                labels: serde_json::from_str(&labels)
                    .with_context(|| format!("invalid labels on alert rule {uid}"))?,
                annotations: serde_json::from_str(&annotations)
                    .with_context(|| format!("invalid annotations on alert rule {uid}"))?,
                dashboard_uid: row.get(14)?,
                panel_id: row.get(15)?,
                uid,
            });
        }
        Ok(rules)
    }

    /// Stored alertmanager configuration documents of an org, oldest first.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read.
    pub fn alertmanager_configurations(&self, org_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT alertmanager_configuration FROM alert_configuration
                 WHERE org_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare alertmanager configuration listing")?;
        let rows = stmt.query_map(params![org_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list alertmanager configurations")
    }

    /// # Errors
    /// Returns an error when the value cannot be read.
    pub fn kv_value(&self, org_id: i64, namespace: &str, key: &str) -> Result<Option<String>> {
        session::query_kv(&self.conn, org_id, namespace, key)
    }
}

impl TransactionalStore for SqliteStore {
    fn in_transaction<T, F>(&mut self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn MigrationSession) -> Result<T, MigrationError>,
    {
        let tx = self.conn.transaction().context("failed to begin transaction")?;
        let result = f(&SqliteSession::new(&tx));
        match result {
            Ok(value) => {
                tx.commit().context("failed to commit transaction")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "failed to roll back transaction");
                }
                Err(err)
            }
        }
    }
}

impl ServerLock for SqliteStore {
    fn try_acquire(&mut self, action: &str, ttl: Duration) -> Result<bool> {
        let now = now_unix();
        let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let existing: Option<(i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT id, version, last_execution FROM server_lock WHERE operation_uid = ?1",
                params![action],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .with_context(|| format!("failed to read server lock {action:?}"))?;

        let Some((id, version, last_execution)) = existing else {
            let inserted = self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO server_lock(operation_uid, version, last_execution)
                     VALUES (?1, 1, ?2)",
                    params![action, now],
                )
                .with_context(|| format!("failed to insert server lock {action:?}"))?;
            return Ok(inserted == 1);
        };

        if now.saturating_sub(last_execution) < ttl_seconds {
            return Ok(false);
        }

        // Stale holder; take over only if nobody else bumped the version first.
        let updated = self
            .conn
            .execute(
                "UPDATE server_lock SET version = ?1, last_execution = ?2
                 WHERE id = ?3 AND version = ?4",
                params![version + 1, now, id, version],
            )
            .with_context(|| format!("failed to take over server lock {action:?}"))?;
        if updated == 1 {
            warn!(action, last_execution, "took over expired server lock");
        }
        Ok(updated == 1)
    }

    fn release(&mut self, action: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM server_lock WHERE operation_uid = ?1", params![action])
            .with_context(|| format!("failed to release server lock {action:?}"))?;
        Ok(())
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
