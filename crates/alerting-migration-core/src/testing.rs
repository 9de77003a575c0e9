//! In-memory collaborators for unit tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::json;

use crate::alertmanager::SaveAlertmanagerConfigurationCmd;
use crate::error::MigrationError;
use crate::models::{
    Actor, AlertRule, Dashboard, Dialect, ExecErrState, Folder, LegacyAlert, NoDataState,
    NormalizedPermission, NotificationChannel, PermissionLevel, ResourcePermission,
    ACTION_FOLDERS_CREATE, ACTION_FOLDERS_DELETE,
};
use crate::permissions::folder_actions_for_level;
use crate::persist::{
    AlertingStore, DashboardService, FolderService, KeyValueStore, LegacyAlertStore,
    MigrationSession, PermissionService, RuleStore, ServerLock, TransactionalStore,
    UnifiedAlertingCleanup, KV_NAMESPACE,
};

pub(crate) const SIMPLE_SETTINGS: &str = r#"{
  "conditions": [{
    "evaluator": {"type": "gt", "params": [80]},
    "operator": {"type": "and"},
    "query": {"params": ["A", "5m", "now"], "datasourceUid": "prom", "model": {"refId": "A", "expr": "cpu"}},
    "reducer": {"type": "avg"}
  }],
  "noDataState": "no_data",
  "executionErrorState": "alerting",
  "frequency": "60s",
  "notifications": []
}"#;

#[derive(Debug, Default)]
pub(crate) struct FakeKv {
    values: RefCell<BTreeMap<String, String>>,
}

impl FakeKv {
    pub(crate) fn raw(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }
}

impl KeyValueStore for FakeKv {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.raw(key))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeState {
    pub(crate) folders: Vec<Folder>,
    pub(crate) dashboards: Vec<Dashboard>,
    pub(crate) folder_permissions: BTreeMap<String, Vec<ResourcePermission>>,
    pub(crate) dashboard_permissions: BTreeMap<String, Vec<ResourcePermission>>,
    pub(crate) set_permissions: BTreeMap<String, Vec<NormalizedPermission>>,
    pub(crate) alerts: Vec<LegacyAlert>,
    pub(crate) channels: Vec<NotificationChannel>,
    pub(crate) rules: Vec<AlertRule>,
    pub(crate) am_configs: Vec<SaveAlertmanagerConfigurationCmd>,
    /// The migration namespace.
    pub(crate) kv: BTreeMap<String, String>,
    pub(crate) cleared_namespaces: Vec<String>,
    pub(crate) deleted_folders: Vec<String>,
    pub(crate) writes: usize,
    pub(crate) fail_rule_insert: bool,
    next_id: i64,
}

impl FakeState {
    pub(crate) fn add_folder(&mut self, org_id: i64, title: &str) -> Folder {
        self.next_id += 1;
        let id = 1_000 + self.next_id;
        let folder = Folder { id, uid: format!("fake-folder-{id}"), title: title.to_string(), org_id };
        self.folders.push(folder.clone());
        self.writes += 1;
        folder
    }
}

pub(crate) struct FakeSession {
    state: Rc<RefCell<FakeState>>,
    dialect: Dialect,
    folder_permissions: FakePermissions,
    dashboard_permissions: FakePermissions,
}

impl FakeSession {
    pub(crate) fn new(state: FakeState) -> Self {
        Self::with_dialect(state, Dialect::default())
    }

    pub(crate) fn with_dialect(state: FakeState, dialect: Dialect) -> Self {
        let state = Rc::new(RefCell::new(state));
        Self {
            folder_permissions: FakePermissions { state: Rc::clone(&state), dashboards: false },
            dashboard_permissions: FakePermissions { state: Rc::clone(&state), dashboards: true },
            state,
            dialect,
        }
    }

    pub(crate) fn dashboard(&self, id: i64) -> Option<Dashboard> {
        self.state.borrow().dashboards.iter().find(|dashboard| dashboard.id == id).cloned()
    }

    pub(crate) fn permissions_set_on(&self, uid: &str) -> Vec<NormalizedPermission> {
        self.state.borrow().set_permissions.get(uid).cloned().unwrap_or_default()
    }

    pub(crate) fn into_state(self) -> FakeState {
        self.state.take()
    }
}

impl MigrationSession for FakeSession {
    fn dialect(&self) -> Dialect {
        self.dialect
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
        self
    }

    fn cleanup(&self) -> &dyn UnifiedAlertingCleanup {
        self
    }
}

impl LegacyAlertStore for FakeSession {
    fn legacy_alerts(&self) -> anyhow::Result<Vec<LegacyAlert>> {
        let mut alerts = self.state.borrow().alerts.clone();
        alerts.sort_by_key(|alert| (alert.org_id, alert.id));
        Ok(alerts)
    }

    fn notification_channels(&self, org_id: i64) -> anyhow::Result<Vec<NotificationChannel>> {
        Ok(self
            .state
            .borrow()
            .channels
            .iter()
            .filter(|channel| channel.org_id == org_id)
            .cloned()
            .collect())
    }
}

impl DashboardService for FakeSession {
    fn get_dashboard(&self, org_id: i64, dashboard_id: i64) -> anyhow::Result<Dashboard> {
        self.state
            .borrow()
            .dashboards
            .iter()
            .find(|dashboard| dashboard.org_id == org_id && dashboard.id == dashboard_id)
            .cloned()
            .ok_or_else(|| anyhow!("dashboard not found"))
    }
}

impl FolderService for FakeSession {
    fn get_by_id(&self, actor: &Actor, folder_id: i64) -> anyhow::Result<Option<Folder>> {
        Ok(self
            .state
            .borrow()
            .folders
            .iter()
            .find(|folder| folder.org_id == actor.org_id && folder.id == folder_id)
            .cloned())
    }

    fn get_by_title(&self, actor: &Actor, title: &str) -> anyhow::Result<Option<Folder>> {
        Ok(self
            .state
            .borrow()
            .folders
            .iter()
            .find(|folder| folder.org_id == actor.org_id && folder.title == title)
            .cloned())
    }

    fn create(&self, actor: &Actor, title: &str) -> anyhow::Result<Folder> {
        if !actor.can(ACTION_FOLDERS_CREATE) {
            bail!("{} may not create folders", actor.login);
        }
        Ok(self.state.borrow_mut().add_folder(actor.org_id, title))
    }

    fn delete(&self, actor: &Actor, folder_uid: &str) -> anyhow::Result<()> {
        if !actor.can(ACTION_FOLDERS_DELETE) {
            bail!("{} may not delete folders", actor.login);
        }
        let mut state = self.state.borrow_mut();
        let before = state.folders.len();
        state.folders.retain(|folder| !(folder.org_id == actor.org_id && folder.uid == folder_uid));
        if state.folders.len() == before {
            bail!("folder {folder_uid} not found");
        }
        state.rules.retain(|rule| rule.folder_uid != folder_uid);
        state.set_permissions.remove(folder_uid);
        state.folder_permissions.remove(folder_uid);
        state.deleted_folders.push(folder_uid.to_string());
        state.writes += 1;
        Ok(())
    }
}

impl RuleStore for FakeSession {
    fn insert_alert_rules(&self, rules: &[AlertRule]) -> anyhow::Result<BTreeMap<String, i64>> {
        let mut state = self.state.borrow_mut();
        if state.fail_rule_insert {
            bail!("rule insert failed");
        }
        let mut ids = BTreeMap::new();
        for rule in rules {
            state.rules.push(rule.clone());
            ids.insert(rule.uid.clone(), i64::try_from(state.rules.len())?);
        }
        state.writes += 1;
        Ok(ids)
    }
}

impl AlertingStore for FakeSession {
    fn save_alertmanager_configuration(
        &self,
        cmd: &SaveAlertmanagerConfigurationCmd,
    ) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.am_configs.push(cmd.clone());
        state.writes += 1;
        Ok(())
    }
}

impl KeyValueStore for FakeSession {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.state.borrow().kv.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.kv.insert(key.to_string(), value.to_string());
        state.writes += 1;
        Ok(())
    }
}

impl UnifiedAlertingCleanup for FakeSession {
    fn delete_alert_rules(&self) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.rules.clear();
        state.writes += 1;
        Ok(())
    }

    fn delete_alerting_state(&self, kv_namespaces: &[&str]) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.am_configs.clear();
        if kv_namespaces.contains(&KV_NAMESPACE) {
            state.kv.clear();
        }
        state.cleared_namespaces.extend(kv_namespaces.iter().map(|namespace| (*namespace).to_string()));
        state.writes += 1;
        Ok(())
    }
}

struct FakePermissions {
    state: Rc<RefCell<FakeState>>,
    dashboards: bool,
}

impl PermissionService for FakePermissions {
    fn get_permissions(&self, _: &Actor, resource_uid: &str) -> anyhow::Result<Vec<ResourcePermission>> {
        let state = self.state.borrow();
        let source = if self.dashboards { &state.dashboard_permissions } else { &state.folder_permissions };
        Ok(source.get(resource_uid).cloned().unwrap_or_default())
    }

    fn set_permissions(
        &self,
        _: i64,
        resource_uid: &str,
        permissions: &[NormalizedPermission],
    ) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.set_permissions.insert(resource_uid.to_string(), permissions.to_vec());
        state.writes += 1;
        Ok(())
    }
}

/// Transactional wrapper: each transaction works on a copy that replaces the
/// committed state only on success.
pub(crate) struct FakeStore {
    state: FakeState,
    dialect: Dialect,
    pub(crate) commits: usize,
    lock_holder: Option<String>,
    held_elsewhere: bool,
}

impl FakeStore {
    pub(crate) fn new(state: FakeState) -> Self {
        Self { state, dialect: Dialect::default(), commits: 0, lock_holder: None, held_elsewhere: false }
    }

    pub(crate) fn state(&self) -> &FakeState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut FakeState {
        &mut self.state
    }

    pub(crate) fn hold_lock_elsewhere(&mut self) {
        self.held_elsewhere = true;
    }

    pub(crate) fn lock_held(&self) -> bool {
        self.lock_holder.is_some()
    }
}

impl TransactionalStore for FakeStore {
    fn in_transaction<T, F>(&mut self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn MigrationSession) -> Result<T, MigrationError>,
    {
        let session = FakeSession::with_dialect(self.state.clone(), self.dialect);
        let result = f(&session);
        if result.is_ok() {
            self.state = session.into_state();
            self.commits += 1;
        }
        result
    }
}

impl ServerLock for FakeStore {
    fn try_acquire(&mut self, action: &str, _ttl: Duration) -> anyhow::Result<bool> {
        if self.held_elsewhere || self.lock_holder.is_some() {
            return Ok(false);
        }
        self.lock_holder = Some(action.to_string());
        Ok(true)
    }

    fn release(&mut self, _action: &str) -> anyhow::Result<()> {
        self.lock_holder = None;
        Ok(())
    }
}

pub(crate) fn folder(id: i64, uid: &str, title: &str) -> Folder {
    Folder { id, uid: uid.to_string(), title: title.to_string(), org_id: 1 }
}

pub(crate) fn dashboard(id: i64, uid: &str, title: &str, folder_id: Option<i64>) -> Dashboard {
    Dashboard { id, uid: uid.to_string(), title: title.to_string(), folder_id, org_id: 1 }
}

pub(crate) fn legacy_alert(
    id: i64,
    org_id: i64,
    dashboard_id: i64,
    panel_id: i64,
    name: &str,
    settings_json: &str,
) -> LegacyAlert {
    LegacyAlert {
        id,
        org_id,
        dashboard_id,
        panel_id,
        name: name.to_string(),
        state: "ok".to_string(),
        settings_json: settings_json.to_string(),
    }
}

pub(crate) fn channel(id: i64, uid: &str, name: &str, is_default: bool) -> NotificationChannel {
    NotificationChannel {
        id,
        uid: uid.to_string(),
        org_id: 1,
        name: name.to_string(),
        kind: "email".to_string(),
        is_default,
        settings: json!({ "addresses": format!("{uid}@example.com") }),
    }
}

pub(crate) fn rule(org_id: i64, uid: &str, folder_uid: &str) -> AlertRule {
    AlertRule {
        org_id,
        uid: uid.to_string(),
        title: uid.to_string(),
        rule_group: "group".to_string(),
        folder_uid: folder_uid.to_string(),
        condition: "B".to_string(),
        data: Vec::new(),
        interval_seconds: 60,
        for_seconds: 0,
        is_paused: false,
        no_data_state: NoDataState::NoData,
        exec_err_state: ExecErrState::Error,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        dashboard_uid: None,
        panel_id: None,
    }
}

fn permission(role_name: String, level: PermissionLevel) -> ResourcePermission {
    ResourcePermission {
        id: 0,
        role_name,
        is_managed: true,
        is_inherited: false,
        user_id: None,
        team_id: None,
        builtin_role: None,
        actions: folder_actions_for_level(level).into_iter().map(str::to_string).collect(),
    }
}

pub(crate) fn managed_user(user_id: i64, level: PermissionLevel) -> ResourcePermission {
    ResourcePermission {
        user_id: Some(user_id),
        ..permission(format!("managed:users:{user_id}:permissions"), level)
    }
}

pub(crate) fn managed_team(team_id: i64, level: PermissionLevel) -> ResourcePermission {
    ResourcePermission {
        team_id: Some(team_id),
        ..permission(format!("managed:teams:{team_id}:permissions"), level)
    }
}

pub(crate) fn managed_builtin(role: &str, level: PermissionLevel) -> ResourcePermission {
    ResourcePermission {
        builtin_role: Some(role.to_string()),
        ..permission(format!("managed:builtins:{}:permissions", role.to_lowercase()), level)
    }
}

pub(crate) fn basic_role(role: &str, level: PermissionLevel) -> ResourcePermission {
    ResourcePermission {
        is_managed: false,
        builtin_role: Some(role.to_string()),
        ..permission(format!("basic:{}", role.to_lowercase()), level)
    }
}

pub(crate) fn fixed_role(role_name: &str, actions: &[&str]) -> ResourcePermission {
    ResourcePermission {
        is_managed: false,
        builtin_role: Some("Editor".to_string()),
        actions: actions.iter().map(|action| (*action).to_string()).collect(),
        ..permission(role_name.to_string(), PermissionLevel::View)
    }
}
