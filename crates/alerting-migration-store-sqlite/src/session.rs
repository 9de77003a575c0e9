use std::collections::BTreeMap;

use alerting_migration_core::alertmanager::SaveAlertmanagerConfigurationCmd;
use alerting_migration_core::dedup::generate_short_uid;
use alerting_migration_core::permissions::folder_actions_for_level;
use alerting_migration_core::persist::{
    AlertingStore, DashboardService, FolderService, KeyValueStore, LegacyAlertStore,
    MigrationSession, PermissionService, RuleStore, UnifiedAlertingCleanup, KV_NAMESPACE,
};
use alerting_migration_core::{
    Actor, AlertRule, Dashboard, Dialect, Folder, LegacyAlert, NormalizedPermission,
    NotificationChannel, PermissionSubject, ResourcePermission, ACTION_DASHBOARDS_PERMISSIONS_READ,
    ACTION_FOLDERS_CREATE, ACTION_FOLDERS_DELETE, ACTION_FOLDERS_PERMISSIONS_READ,
    ACTION_FOLDERS_READ,
};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{now_rfc3339, now_unix, ResourceKind};

/// Key-value namespaces are global; the migration status lives under org 0.
const GLOBAL_ORG_ID: i64 = 0;

/// Every collaborator the migration engine needs, bound to one connection
/// (normally an open transaction).
pub struct SqliteSession<'a> {
    conn: &'a Connection,
    folder_permissions: SqlitePermissions<'a>,
    dashboard_permissions: SqlitePermissions<'a>,
    migration_kv: SqliteKv<'a>,
}

impl<'a> SqliteSession<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            folder_permissions: SqlitePermissions { conn, kind: ResourceKind::Folders },
            dashboard_permissions: SqlitePermissions { conn, kind: ResourceKind::Dashboards },
            migration_kv: SqliteKv { conn, org_id: GLOBAL_ORG_ID, namespace: KV_NAMESPACE },
        }
    }
}

impl MigrationSession for SqliteSession<'_> {
    fn dialect(&self) -> Dialect {
        // BINARY collation: identifiers differing only in case are distinct.
        Dialect { case_insensitive_collation: false }
    }

    fn legacy(&self) -> &dyn LegacyAlertStore {
        self
    }

    fn dashboards(&self) -> &dyn DashboardService {
        self
    }

    fn folders(&self) -> &dyn FolderService {
        self
    }

    fn folder_permissions(&self) -> &dyn PermissionService {
        &self.folder_permissions
    }

    fn dashboard_permissions(&self) -> &dyn PermissionService {
        &self.dashboard_permissions
    }

    fn rules(&self) -> &dyn RuleStore {
        self
    }

    fn alerting(&self) -> &dyn AlertingStore {
        self
    }

    fn migration_kv(&self) -> &dyn KeyValueStore {
        &self.migration_kv
    }

    fn cleanup(&self) -> &dyn UnifiedAlertingCleanup {
        self
    }
}

impl LegacyAlertStore for SqliteSession<'_> {
    fn legacy_alerts(&self) -> Result<Vec<LegacyAlert>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, org_id, dashboard_id, panel_id, name, state, settings
                 FROM alert
                 ORDER BY org_id ASC, id ASC",
            )
            .context("failed to prepare legacy alert query")?;
        let rows = stmt.query_map([], |row| {
            Ok(LegacyAlert {
                id: row.get(0)?,
                org_id: row.get(1)?,
                dashboard_id: row.get(2)?,
                panel_id: row.get(3)?,
                name: row.get(4)?,
                state: row.get(5)?,
                settings_json: row.get(6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read legacy alerts")
    }

    fn notification_channels(&self, org_id: i64) -> Result<Vec<NotificationChannel>> {
        query_notification_channels(self.conn, org_id)
    }
}

impl DashboardService for SqliteSession<'_> {
    fn get_dashboard(&self, org_id: i64, dashboard_id: i64) -> Result<Dashboard> {
        self.conn
            .query_row(
                "SELECT id, uid, title, folder_id, org_id FROM dashboard WHERE org_id = ?1 AND id = ?2",
                params![org_id, dashboard_id],
                dashboard_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read dashboard {dashboard_id}"))?
            .ok_or_else(|| anyhow!("dashboard {dashboard_id} not found in org {org_id}"))
    }
}

impl FolderService for SqliteSession<'_> {
    fn get_by_id(&self, actor: &Actor, folder_id: i64) -> Result<Option<Folder>> {
        require(actor, ACTION_FOLDERS_READ)?;
        self.conn
            .query_row(
                "SELECT id, uid, title, org_id FROM folder WHERE org_id = ?1 AND id = ?2",
                params![actor.org_id, folder_id],
                folder_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read folder {folder_id}"))
    }

    fn get_by_title(&self, actor: &Actor, title: &str) -> Result<Option<Folder>> {
        require(actor, ACTION_FOLDERS_READ)?;
        self.conn
            .query_row(
                "SELECT id, uid, title, org_id FROM folder WHERE org_id = ?1 AND title = ?2",
                params![actor.org_id, title],
                folder_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read folder titled {title:?}"))
    }

    fn create(&self, actor: &Actor, title: &str) -> Result<Folder> {
        require(actor, ACTION_FOLDERS_CREATE)?;
        let uid = generate_short_uid();
        self.conn
            .execute(
                "INSERT INTO folder(uid, org_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![uid, actor.org_id, title, now_rfc3339()?],
            )
            .with_context(|| format!("failed to insert folder {title:?}"))?;
        let id = self.conn.last_insert_rowid();
        debug!(org_id = actor.org_id, folder_uid = %uid, title, "created folder");
        Ok(Folder { id, uid, title: title.to_string(), org_id: actor.org_id })
    }

    fn delete(&self, actor: &Actor, folder_uid: &str) -> Result<()> {
        require(actor, ACTION_FOLDERS_DELETE)?;
        let org_id = actor.org_id;
        let folder_id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM folder WHERE org_id = ?1 AND uid = ?2",
                params![org_id, folder_uid],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up folder {folder_uid}"))?
            .ok_or_else(|| anyhow!("folder {folder_uid} not found in org {org_id}"))?;

        self.conn
            .execute(
                "DELETE FROM alert_rule_version WHERE rule_org_id = ?1 AND rule_namespace_uid = ?2",
                params![org_id, folder_uid],
            )
            .context("failed to delete rule versions in folder")?;
        self.conn
            .execute(
                "DELETE FROM alert_rule WHERE org_id = ?1 AND namespace_uid = ?2",
                params![org_id, folder_uid],
            )
            .context("failed to delete rules in folder")?;
        self.conn
            .execute(
                "DELETE FROM resource_permission
                 WHERE org_id = ?1 AND resource = 'dashboards'
                   AND resource_uid IN (SELECT uid FROM dashboard WHERE org_id = ?1 AND folder_id = ?2)",
                params![org_id, folder_id],
            )
            .context("failed to delete dashboard permissions in folder")?;
        self.conn
            .execute(
                "DELETE FROM alert
                 WHERE dashboard_id IN (SELECT id FROM dashboard WHERE org_id = ?1 AND folder_id = ?2)",
                params![org_id, folder_id],
            )
            .context("failed to delete legacy alerts in folder")?;
        self.conn
            .execute(
                "DELETE FROM dashboard WHERE org_id = ?1 AND folder_id = ?2",
                params![org_id, folder_id],
            )
            .context("failed to delete dashboards in folder")?;
        self.conn
            .execute(
                "DELETE FROM resource_permission WHERE org_id = ?1 AND resource = 'folders' AND resource_uid = ?2",
                params![org_id, folder_uid],
            )
            .context("failed to delete folder permissions")?;
        self.conn
            .execute("DELETE FROM folder WHERE id = ?1", params![folder_id])
            .with_context(|| format!("failed to delete folder {folder_uid}"))?;
        debug!(org_id, folder_uid, "deleted folder");
        Ok(())
    }
}

impl RuleStore for SqliteSession<'_> {
    fn insert_alert_rules(&self, rules: &[AlertRule]) -> Result<BTreeMap<String, i64>> {
        let updated = now_rfc3339()?;
        let mut ids = BTreeMap::new();
        for rule in rules {
            let data = serde_json::to_string(&rule.data).context("failed to encode rule queries")?;
            let labels = serde_json::to_string(&rule.labels).context("failed to encode rule labels")?;
            let annotations = serde_json::to_string(&rule.annotations)
                .context("failed to encode rule annotations")?;

            self.conn
                .execute(
                    "INSERT INTO alert_rule(
                       org_id, uid, title, rule_group, namespace_uid, condition, data,
                       interval_seconds, for_seconds, is_paused, no_data_state, exec_err_state,
                       labels, annotations, dashboard_uid, panel_id, version, updated
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1, ?17)",
                    params![
                        rule.org_id,
                        rule.uid,
                        rule.title,
                        rule.rule_group,
                        rule.folder_uid,
                        rule.condition,
                        data,
                        rule.interval_seconds,
                        rule.for_seconds,
                        rule.is_paused,
                        rule.no_data_state.as_str(),
                        rule.exec_err_state.as_str(),
                        labels,
                        annotations,
                        rule.dashboard_uid,
                        rule.panel_id,
                        updated,
                    ],
                )
                .with_context(|| format!("failed to insert alert rule {}", rule.uid))?;
            ids.insert(rule.uid.clone(), self.conn.last_insert_rowid());

            self.conn
                .execute(
                    "INSERT INTO alert_rule_version(
                       rule_org_id, rule_uid, rule_namespace_uid, rule_group, version,
                       title, condition, data, interval_seconds, created
                     ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        rule.org_id,
                        rule.uid,
                        rule.folder_uid,
                        rule.rule_group,
                        rule.title,
                        rule.condition,
                        data,
                        rule.interval_seconds,
                        updated,
                    ],
                )
                .with_context(|| format!("failed to insert version of alert rule {}", rule.uid))?;
        }
        Ok(ids)
    }
}

impl AlertingStore for SqliteSession<'_> {
    fn save_alertmanager_configuration(&self, cmd: &SaveAlertmanagerConfigurationCmd) -> Result<()> {
        let hash = hex::encode(Sha256::digest(cmd.alertmanager_configuration.as_bytes()));
        self.conn
            .execute(
                "INSERT INTO alert_configuration(
                   org_id, alertmanager_configuration, configuration_version,
                   configuration_hash, is_default, last_applied, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cmd.org_id,
                    cmd.alertmanager_configuration,
                    cmd.configuration_version,
                    hash,
                    cmd.default,
                    cmd.last_applied,
                    now_unix(),
                ],
            )
            .with_context(|| format!("failed to save alertmanager configuration for org {}", cmd.org_id))?;
        Ok(())
    }
}

impl UnifiedAlertingCleanup for SqliteSession<'_> {
    fn delete_alert_rules(&self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM alert_rule; DELETE FROM alert_rule_version;")
            .context("failed to delete alert rules")
    }

    fn delete_alerting_state(&self, kv_namespaces: &[&str]) -> Result<()> {
        self.conn
            .execute_batch(
                "DELETE FROM alert_configuration;
                 DELETE FROM ngalert_configuration;
                 DELETE FROM alert_instance;",
            )
            .context("failed to delete alerting configuration")?;
        for namespace in kv_namespaces {
            self.conn
                .execute("DELETE FROM kv_store WHERE namespace = ?1", params![namespace])
                .with_context(|| format!("failed to delete kv namespace {namespace}"))?;
        }
        Ok(())
    }
}

/// Folder or dashboard ACL service.
pub struct SqlitePermissions<'a> {
    conn: &'a Connection,
    kind: ResourceKind,
}

impl PermissionService for SqlitePermissions<'_> {
    fn get_permissions(&self, actor: &Actor, resource_uid: &str) -> Result<Vec<ResourcePermission>> {
        match self.kind {
            ResourceKind::Folders => {
                require(actor, ACTION_FOLDERS_PERMISSIONS_READ)?;
                query_permissions(self.conn, actor.org_id, self.kind, resource_uid, false)
            }
            ResourceKind::Dashboards => {
                require(actor, ACTION_DASHBOARDS_PERMISSIONS_READ)?;
                let mut permissions =
                    query_permissions(self.conn, actor.org_id, self.kind, resource_uid, false)?;
                // Dashboards inherit the ACL of their folder.
                let parent_uid: Option<String> = self
                    .conn
                    .query_row(
                        "SELECT f.uid FROM dashboard d JOIN folder f ON f.id = d.folder_id
                         WHERE d.org_id = ?1 AND d.uid = ?2",
                        params![actor.org_id, resource_uid],
                        |row| row.get(0),
                    )
                    .optional()
                    .with_context(|| format!("failed to look up folder of dashboard {resource_uid}"))?;
                if let Some(parent_uid) = parent_uid {
                    permissions.extend(query_permissions(
                        self.conn,
                        actor.org_id,
                        ResourceKind::Folders,
                        &parent_uid,
                        true,
                    )?);
                }
                Ok(permissions)
            }
        }
    }

    fn set_permissions(
        &self,
        org_id: i64,
        resource_uid: &str,
        permissions: &[NormalizedPermission],
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM resource_permission
                 WHERE org_id = ?1 AND resource = ?2 AND resource_uid = ?3 AND is_managed = 1",
                params![org_id, self.kind.as_str(), resource_uid],
            )
            .with_context(|| format!("failed to clear managed permissions of {resource_uid}"))?;

        for permission in permissions {
            let (user_id, team_id, builtin_role) = match &permission.subject {
                PermissionSubject::User(id) => (Some(*id), None, None),
                PermissionSubject::Team(id) => (None, Some(*id), None),
                PermissionSubject::BuiltinRole(role) => (None, None, Some(role.as_str())),
            };
            let actions = serde_json::to_string(&folder_actions_for_level(permission.level))
                .context("failed to encode permission actions")?;
            self.conn
                .execute(
                    "INSERT INTO resource_permission(
                       org_id, resource, resource_uid, role_name, is_managed,
                       user_id, team_id, builtin_role, actions_json
                     ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
                    params![
                        org_id,
                        self.kind.as_str(),
                        resource_uid,
                        managed_role_name(&permission.subject),
                        user_id,
                        team_id,
                        builtin_role,
                        actions,
                    ],
                )
                .with_context(|| format!("failed to grant {} on {resource_uid}", permission.subject))?;
        }
        Ok(())
    }
}

/// Key-value rows of one `(org_id, namespace)` pair.
pub struct SqliteKv<'a> {
    conn: &'a Connection,
    org_id: i64,
    namespace: &'static str,
}

impl KeyValueStore for SqliteKv<'_> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        query_kv(self.conn, self.org_id, self.namespace, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv_store(org_id, namespace, key, value, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(org_id, namespace, key)
                 DO UPDATE SET value = excluded.value, updated = excluded.updated",
                params![self.org_id, self.namespace, key, value, now_rfc3339()?],
            )
            .with_context(|| format!("failed to set {}/{key}", self.namespace))?;
        Ok(())
    }
}

fn require(actor: &Actor, action: &str) -> Result<()> {
    if !actor.can(action) {
        bail!("{} in org {} is not allowed to perform {action}", actor.login, actor.org_id);
    }
    Ok(())
}

fn managed_role_name(subject: &PermissionSubject) -> String {
    match subject {
        PermissionSubject::User(id) => format!("managed:users:{id}:permissions"),
        PermissionSubject::Team(id) => format!("managed:teams:{id}:permissions"),
        PermissionSubject::BuiltinRole(role) => {
            format!("managed:builtins:{}:permissions", role.to_lowercase())
        }
    }
}

pub(crate) fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder { id: row.get(0)?, uid: row.get(1)?, title: row.get(2)?, org_id: row.get(3)? })
}

pub(crate) fn dashboard_from_row(row: &Row<'_>) -> rusqlite::Result<Dashboard> {
    Ok(Dashboard {
        id: row.get(0)?,
        uid: row.get(1)?,
        title: row.get(2)?,
        folder_id: row.get(3)?,
        org_id: row.get(4)?,
    })
}

pub(crate) fn query_permissions(
    conn: &Connection,
    org_id: i64,
    kind: ResourceKind,
    resource_uid: &str,
    inherited: bool,
) -> Result<Vec<ResourcePermission>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, role_name, is_managed, user_id, team_id, builtin_role, actions_json
             FROM resource_permission
             WHERE org_id = ?1 AND resource = ?2 AND resource_uid = ?3
             ORDER BY id ASC",
        )
        .context("failed to prepare permission query")?;
    let rows = stmt.query_map(params![org_id, kind.as_str(), resource_uid], |row| {
        Ok((
            ResourcePermission {
                id: row.get(0)?,
                role_name: row.get(1)?,
                is_managed: row.get(2)?,
                is_inherited: inherited,
                user_id: row.get(3)?,
                team_id: row.get(4)?,
                builtin_role: row.get(5)?,
                actions: Vec::new(),
            },
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut permissions = Vec::new();
    for row in rows {
        let (mut permission, actions_json) =
            row.with_context(|| format!("failed to read permissions of {resource_uid}"))?;
        permission.actions = serde_json::from_str(&actions_json)
            .with_context(|| format!("invalid actions on permission {}", permission.id))?;
        permissions.push(permission);
    }
    Ok(permissions)
}

pub(crate) fn query_notification_channels(
    conn: &Connection,
    org_id: i64,
) -> Result<Vec<NotificationChannel>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, uid, org_id, name, type, is_default, settings
             FROM alert_notification
             WHERE org_id = ?1
             ORDER BY id ASC",
        )
        .context("failed to prepare notification channel query")?;
    let rows = stmt.query_map(params![org_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut channels = Vec::new();
    for row in rows {
        let (id, uid, org_id, name, kind, is_default, settings) =
            row.context("failed to read notification channel")?;
        let settings = serde_json::from_str(&settings)
            .with_context(|| format!("invalid settings on notification channel {uid}"))?;
        channels.push(NotificationChannel { id, uid, org_id, name, kind, is_default, settings });
    }
    Ok(channels)
}

pub(crate) fn query_kv(
    conn: &Connection,
    org_id: i64,
    namespace: &str,
    key: &str,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM kv_store WHERE org_id = ?1 AND namespace = ?2 AND key = ?3",
        params![org_id, namespace, key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to get {namespace}/{key}"))
}
