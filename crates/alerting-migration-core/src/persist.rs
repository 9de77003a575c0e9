//! Capabilities the migration consumes from the outside world.
//!
//! None of these are implemented in this crate; `alerting-migration-store-sqlite`
//! provides a SQLite-backed implementation and the tests use in-memory fakes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;

use crate::alertmanager::SaveAlertmanagerConfigurationCmd;
use crate::error::MigrationError;
use crate::models::{
    Actor, AlertRule, Dashboard, Dialect, Folder, LegacyAlert, NormalizedPermission,
    NotificationChannel, PermissionLevel, ResourcePermission,
};
use crate::permissions::map_actions_to_level;

/// Key-value namespace holding the migration status.
pub const KV_NAMESPACE: &str = "ngalert.migration";

/// Key-value namespace owned by the unified Alertmanager (silences, notification log).
pub const ALERTMANAGER_KV_NAMESPACE: &str = "alertmanager";

const MIGRATED_KEY: &str = "migrated";
const CREATED_FOLDERS_KEY: &str = "createdFolders";

pub trait LegacyAlertStore {
    /// All legacy alerts across every organization, ordered by org then id.
    ///
    /// # Errors
    /// Returns an error when the legacy alert table cannot be read.
    fn legacy_alerts(&self) -> anyhow::Result<Vec<LegacyAlert>>;

    /// # Errors
    /// Returns an error when the legacy notification channels cannot be read.
    fn notification_channels(&self, org_id: i64) -> anyhow::Result<Vec<NotificationChannel>>;
}

pub trait DashboardService {
    /// # Errors
    /// Returns an error when the dashboard does not exist or cannot be read.
    fn get_dashboard(&self, org_id: i64, dashboard_id: i64) -> anyhow::Result<Dashboard>;
}

pub trait FolderService {
    /// # Errors
    /// Returns an error on storage failure; a missing folder is `Ok(None)`.
    fn get_by_id(&self, actor: &Actor, folder_id: i64) -> anyhow::Result<Option<Folder>>;

    /// # Errors
    /// Returns an error on storage failure; a missing folder is `Ok(None)`.
    fn get_by_title(&self, actor: &Actor, title: &str) -> anyhow::Result<Option<Folder>>;

    /// # Errors
    /// Returns an error when the actor may not create folders or the insert fails.
    fn create(&self, actor: &Actor, title: &str) -> anyhow::Result<Folder>;

    /// Delete a folder together with its permissions and the rules it contains.
    ///
    /// # Errors
    /// Returns an error when the actor may not delete folders or the delete fails.
    fn delete(&self, actor: &Actor, folder_uid: &str) -> anyhow::Result<()>;
}

pub trait PermissionService {
    /// # Errors
    /// Returns an error when the permissions cannot be read.
    fn get_permissions(
        &self,
        actor: &Actor,
        resource_uid: &str,
    ) -> anyhow::Result<Vec<ResourcePermission>>;

    /// Replace the managed permissions of a resource.
    ///
    /// # Errors
    /// Returns an error when the permissions cannot be written.
    fn set_permissions(
        &self,
        org_id: i64,
        resource_uid: &str,
        permissions: &[NormalizedPermission],
    ) -> anyhow::Result<()>;

    fn map_actions(&self, permission: &ResourcePermission) -> Option<PermissionLevel> {
        map_actions_to_level(&permission.actions)
    }
}

pub trait RuleStore {
    /// Insert rules and return the generated row id per rule UID.
    ///
    /// # Errors
    /// Returns an error when any insert fails.
    fn insert_alert_rules(&self, rules: &[AlertRule]) -> anyhow::Result<BTreeMap<String, i64>>;
}

pub trait AlertingStore {
    /// # Errors
    /// Returns an error when the configuration cannot be saved.
    fn save_alertmanager_configuration(
        &self,
        cmd: &SaveAlertmanagerConfigurationCmd,
    ) -> anyhow::Result<()>;
}

/// Key-value store already bound to a namespace.
pub trait KeyValueStore {
    /// # Errors
    /// Returns an error when the value cannot be read.
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// # Errors
    /// Returns an error when the value cannot be written.
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Bulk removal of unified alerting data, used by revert.
pub trait UnifiedAlertingCleanup {
    /// Delete every alert rule and rule version.
    ///
    /// # Errors
    /// Returns an error when a delete fails.
    fn delete_alert_rules(&self) -> anyhow::Result<()>;

    /// Delete alertmanager and ngalert configuration, alert instances and every
    /// key-value row in `kv_namespaces`.
    ///
    /// # Errors
    /// Returns an error when a delete fails.
    fn delete_alerting_state(&self, kv_namespaces: &[&str]) -> anyhow::Result<()>;
}

/// Every capability the engine needs, scoped to one open transaction.
pub trait MigrationSession {
    fn dialect(&self) -> Dialect;
    fn legacy(&self) -> &dyn LegacyAlertStore;
    fn dashboards(&self) -> &dyn DashboardService;
    fn folders(&self) -> &dyn FolderService;
    fn folder_permissions(&self) -> &dyn PermissionService;
    fn dashboard_permissions(&self) -> &dyn PermissionService;
    fn rules(&self) -> &dyn RuleStore;
    fn alerting(&self) -> &dyn AlertingStore;
    fn migration_kv(&self) -> &dyn KeyValueStore;
    fn cleanup(&self) -> &dyn UnifiedAlertingCleanup;
}

pub trait TransactionalStore {
    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// # Errors
    /// Returns the error produced by `f`, or a collaborator error when the
    /// transaction cannot be opened or committed.
    fn in_transaction<T, F>(&mut self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn MigrationSession) -> Result<T, MigrationError>;
}

/// Cluster-wide named lock with a hard TTL.
pub trait ServerLock {
    /// `Ok(false)` when another holder owns a lock younger than `ttl`.
    ///
    /// # Errors
    /// Returns an error when the lock row cannot be read or written.
    fn try_acquire(&mut self, action: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// # Errors
    /// Returns an error when the lock row cannot be removed.
    fn release(&mut self, action: &str) -> anyhow::Result<()>;
}

/// Typed access to the migration status records.
pub struct InfoStore<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> InfoStore<'a> {
    #[must_use]
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    /// # Errors
    /// Returns an error when the flag cannot be read or is not a boolean.
    pub fn is_migrated(&self) -> Result<bool, MigrationError> {
        let Some(content) = self.kv.get(MIGRATED_KEY).context("getting migration status")? else {
            return Ok(false);
        };
        content
            .parse::<bool>()
            .map_err(|err| MigrationError::InvalidStatus(format!("{MIGRATED_KEY}={content}: {err}")))
    }

    /// # Errors
    /// Returns an error when the flag cannot be written.
    pub fn set_migrated(&self, migrated: bool) -> Result<(), MigrationError> {
        self.kv
            .set(MIGRATED_KEY, &migrated.to_string())
            .context("setting migration status")?;
        Ok(())
    }

    /// Org id to the folder UIDs created by the migration.
    ///
    /// # Errors
    /// Returns an error when the record cannot be read or decoded.
    pub fn created_folders(&self) -> Result<BTreeMap<i64, Vec<String>>, MigrationError> {
        let Some(content) = self.kv.get(CREATED_FOLDERS_KEY).context("getting created folders")?
        else {
            return Ok(BTreeMap::new());
        };
        serde_json::from_str(&content)
            .map_err(|err| MigrationError::InvalidStatus(format!("{CREATED_FOLDERS_KEY}: {err}")))
    }

    /// # Errors
    /// Returns an error when the record cannot be encoded or written.
    pub fn set_created_folders(
        &self,
        folders: &BTreeMap<i64, Vec<String>>,
    ) -> Result<(), MigrationError> {
        let raw = serde_json::to_string(folders).context("encoding created folders")?;
        self.kv.set(CREATED_FOLDERS_KEY, &raw).context("setting created folders")?;
        Ok(())
    }
}
