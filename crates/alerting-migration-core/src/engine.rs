use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info};

use crate::alertmanager::{AlertmanagerConfigSynthesizer, SaveAlertmanagerConfigurationCmd};
use crate::dedup::Deduplicator;
use crate::error::MigrationError;
use crate::models::{AlertRule, ChannelRef, Dialect, Silence};
use crate::permissions::FolderHelper;
use crate::persist::{InfoStore, MigrationSession};
use crate::service::CancellationToken;

/// A migrated rule paired with the legacy channels it notified.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedRule {
    pub rule: AlertRule,
    pub channels: Vec<ChannelRef>,
}

/// Result of a forward migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub alerts: usize,
    /// Org id -> number of rules inserted.
    pub rules: BTreeMap<i64, usize>,
    /// Org id -> uids of the folders created for this run.
    pub created_folders: BTreeMap<i64, Vec<String>>,
}

/// State for migrating the alerts of one organization.
#[derive(Debug)]
pub(crate) struct OrgMigration {
    pub(crate) org_id: i64,
    pub(crate) dialect: Dialect,
    pub(crate) folder_helper: FolderHelper,
    pub(crate) silences: Vec<Silence>,
    /// Folder uid -> title deduplicator.
    pub(crate) title_dedup: BTreeMap<String, Deduplicator>,
}

impl OrgMigration {
    pub(crate) fn new(org_id: i64, dialect: Dialect) -> Self {
        Self {
            org_id,
            dialect,
            folder_helper: FolderHelper::new(org_id),
            silences: Vec::new(),
            title_dedup: BTreeMap::new(),
        }
    }
}

/// One forward migration over every organization, bound to an open session.
pub struct Migration<'a> {
    session: &'a dyn MigrationSession,
    synthesizer: &'a dyn AlertmanagerConfigSynthesizer,
    cancel: &'a CancellationToken,
    data_path: PathBuf,
    seen_uids: Deduplicator,
}

impl<'a> Migration<'a> {
    #[must_use]
    pub fn new(
        session: &'a dyn MigrationSession,
        synthesizer: &'a dyn AlertmanagerConfigSynthesizer,
        cancel: &'a CancellationToken,
        data_path: &Path,
    ) -> Self {
        Self {
            session,
            synthesizer,
            cancel,
            data_path: data_path.to_path_buf(),
            seen_uids: Deduplicator::new(false, 0),
        }
    }

    /// Migrate every legacy alert, then record the created folders, insert the
    /// rules and write each organization's Alertmanager configuration.
    ///
    /// # Errors
    /// Returns the first collaborator, settings or deduplication error, or
    /// [`MigrationError::Cancelled`]. Nothing is rolled back here; the caller's
    /// transaction does that.
    pub fn exec(mut self) -> Result<MigrationSummary, MigrationError> {
        let session = self.session;
        let alerts = session.legacy().legacy_alerts().context("failed to load legacy alerts")?;
        info!(count = alerts.len(), "alerts found to migrate");

        let mut orgs: BTreeMap<i64, OrgMigration> = BTreeMap::new();
        let mut rules_per_org: BTreeMap<i64, BTreeMap<String, MigratedRule>> = BTreeMap::new();

        for alert in &alerts {
            self.cancel.check()?;
            let org = orgs
                .entry(alert.org_id)
                .or_insert_with(|| OrgMigration::new(alert.org_id, session.dialect()));

            let dashboard = session
                .dashboards()
                .get_dashboard(alert.org_id, alert.dashboard_id)
                .with_context(|| {
                    format!(
                        "failed to get dashboard [ID: {}] for alert {} [ID: {}]",
                        alert.dashboard_id, alert.name, alert.id
                    )
                })?;

            let folder = org
                .folder_helper
                .get_or_create_migrated_folder(session, &dashboard)
                .map_err(|err| {
                    err.context(format!(
                        "failed to get or create folder for alert {} [ID: {}] on dashboard {} [ID: {}]",
                        alert.name, alert.id, dashboard.title, dashboard.id
                    ))
                })?;

            let migrated = org
                .migrate_alert(alert, &dashboard, &folder, &mut self.seen_uids)
                .map_err(|err| {
                    err.context(format!(
                        "failed to migrate alert {} [ID: {}] on dashboard {} [ID: {}]",
                        alert.name, alert.id, dashboard.title, dashboard.id
                    ))
                })?;

            rules_per_org
                .entry(alert.org_id)
                .or_default()
                .entry(migrated.rule.uid.clone())
                .or_insert(migrated);
        }

        self.cancel.check()?;

        let created_folders = orgs
            .iter()
            .map(|(org_id, org)| (*org_id, org.folder_helper.created_folders().to_vec()))
            .collect::<BTreeMap<_, _>>();
        InfoStore::new(session.migration_kv()).set_created_folders(&created_folders)?;

        let am_configs = self.setup_alertmanager_configs(&rules_per_org)?;
        let rules = self.insert_rules(&rules_per_org)?;

        for cmd in &am_configs {
            info!(org_id = cmd.org_id, "writing alertmanager config");
            session
                .alerting()
                .save_alertmanager_configuration(cmd)
                .with_context(|| format!("failed to save alertmanager config for org {}", cmd.org_id))?;
        }

        for org in orgs.values().filter(|org| !org.silences.is_empty()) {
            if let Err(err) = write_silences_file(&self.data_path, org.org_id, &org.silences) {
                error!(org_id = org.org_id, error = %format!("{err:#}"), "failed to write silence file");
            }
        }

        Ok(MigrationSummary { alerts: alerts.len(), rules, created_folders })
    }

    fn setup_alertmanager_configs(
        &self,
        rules_per_org: &BTreeMap<i64, BTreeMap<String, MigratedRule>>,
    ) -> Result<Vec<SaveAlertmanagerConfigurationCmd>, MigrationError> {
        let mut commands = Vec::with_capacity(rules_per_org.len());
        for (org_id, rules) in rules_per_org {
            let channels = self
                .session
                .legacy()
                .notification_channels(*org_id)
                .with_context(|| format!("failed to load notification channels for org {org_id}"))?;
            let config = self
                .synthesizer
                .synthesize(*org_id, rules, &channels)
                .with_context(|| format!("failed to create alertmanager config for org {org_id}"))?;
            commands.push(SaveAlertmanagerConfigurationCmd::for_migration(*org_id, &config)?);
        }
        Ok(commands)
    }

    fn insert_rules(
        &self,
        rules_per_org: &BTreeMap<i64, BTreeMap<String, MigratedRule>>,
    ) -> Result<BTreeMap<i64, usize>, MigrationError> {
        let mut inserted = BTreeMap::new();
        for (org_id, rules) in rules_per_org {
            info!(org_id, count = rules.len(), "inserting migrated alert rules");
            let batch = rules.values().map(|migrated| migrated.rule.clone()).collect::<Vec<_>>();
            let ids = self
                .session
                .rules()
                .insert_alert_rules(&batch)
                .with_context(|| format!("failed to insert alert rules for org {org_id}"))?;
            inserted.insert(*org_id, ids.len());
        }
        Ok(inserted)
    }
}

/// `<data_path>/alerting/<org_id>/silences`.
#[must_use]
pub fn silences_file_path(data_path: &Path, org_id: i64) -> PathBuf {
    data_path.join("alerting").join(org_id.to_string()).join("silences")
}

fn write_silences_file(data_path: &Path, org_id: i64, silences: &[Silence]) -> anyhow::Result<()> {
    let path = silences_file_path(data_path, org_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_vec(silences).context("failed to encode silences")?;
    fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alertmanager::ChannelRoutingSynthesizer;
    use crate::models::PermissionLevel;
    use crate::testing::{
        channel, dashboard, folder, legacy_alert, managed_builtin, managed_user, FakeSession, FakeState,
        SIMPLE_SETTINGS,
    };

    fn run(session: &FakeSession, data_path: &Path) -> Result<MigrationSummary, MigrationError> {
        let cancel = CancellationToken::default();
        Migration::new(session, &ChannelRoutingSynthesizer, &cancel, data_path).exec()
    }

    fn infra_state() -> FakeState {
        let mut state = FakeState::default();
        state.folders.push(folder(10, "infra-folder", "Infra Folder"));
        state.dashboards.push(dashboard(1, "infra", "Infra", Some(10)));
        let acl = vec![managed_builtin("Viewer", PermissionLevel::View)];
        state.folder_permissions.insert("infra-folder".to_string(), acl.clone());
        state.dashboard_permissions.insert(
            "infra".to_string(),
            acl.into_iter()
                .map(|mut permission| {
                    permission.is_managed = false;
                    permission.is_inherited = true;
                    permission
                })
                .collect(),
        );
        state.alerts.push(legacy_alert(5, 1, 1, 7, "cpu-alert", SIMPLE_SETTINGS));
        state
    }

    #[test]
    fn cpu_alert_on_infra_dashboard_lands_in_parent_folder() -> Result<(), MigrationError> {
        let data = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let session = FakeSession::new(infra_state());

        let summary = run(&session, data.path())?;
        assert_eq!(summary.alerts, 1);
        assert_eq!(summary.rules.get(&1), Some(&1));
        assert_eq!(summary.created_folders.get(&1), Some(&Vec::new()));

        let state = session.into_state();
        let rule = &state.rules[0];
        assert_eq!(rule.title, "cpu-alert");
        assert_eq!(rule.rule_group, "Infra - 7");
        assert_eq!(rule.folder_uid, "infra-folder");
        assert_eq!(rule.annotations.get("__dashboardUid__").map(String::as_str), Some("infra"));
        assert_eq!(rule.annotations.get("__panelId__").map(String::as_str), Some("7"));
        assert!(!rule.is_paused);
        assert_eq!(state.am_configs.len(), 1);
        assert_eq!(state.kv.get("createdFolders").map(String::as_str), Some(r#"{"1":[]}"#));
        Ok(())
    }

    #[test]
    fn created_folders_only_lists_folders_made_by_the_run() -> Result<(), MigrationError> {
        let data = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let mut state = infra_state();
        state.dashboards.push(dashboard(2, "private", "Private", Some(10)));
        state.dashboards.push(dashboard(3, "general", "General", None));
        state
            .dashboard_permissions
            .insert("private".to_string(), vec![managed_user(9, PermissionLevel::Admin)]);
        state.alerts.push(legacy_alert(6, 1, 2, 1, "private-alert", SIMPLE_SETTINGS));
        state.alerts.push(legacy_alert(7, 1, 3, 1, "general-alert", SIMPLE_SETTINGS));
        let session = FakeSession::new(state);

        let summary = run(&session, data.path())?;
        let created = summary.created_folders.get(&1).cloned().unwrap_or_default();
        assert_eq!(created.len(), 2);
        assert!(!created.contains(&"infra-folder".to_string()));

        let state = session.into_state();
        let folders_of = |title: &str| state.rules.iter().find(|rule| rule.title == title).map(|rule| rule.folder_uid.clone());
        assert_eq!(folders_of("cpu-alert").as_deref(), Some("infra-folder"));
        assert_eq!(folders_of("private-alert").as_deref(), Some(created[0].as_str()));
        assert_eq!(folders_of("general-alert").as_deref(), Some(created[1].as_str()));
        Ok(())
    }

    #[test]
    fn identical_alerts_in_one_folder_get_distinct_titles() -> Result<(), MigrationError> {
        let data = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let mut state = infra_state();
        state.alerts.push(legacy_alert(6, 1, 1, 8, "cpu-alert", SIMPLE_SETTINGS));
        let session = FakeSession::new(state);

        run(&session, data.path())?;
        let state = session.into_state();
        assert_eq!(state.rules.len(), 2);
        assert_ne!(state.rules[0].title, state.rules[1].title);
        assert_ne!(state.rules[0].uid, state.rules[1].uid);
        Ok(())
    }

    #[test]
    fn orgs_without_rules_get_no_alertmanager_config() -> Result<(), MigrationError> {
        let data = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let mut state = FakeState::default();
        state.channels.push(channel(1, "email", "Email", true));
        let session = FakeSession::new(state);

        let summary = run(&session, data.path())?;
        assert_eq!(summary.alerts, 0);
        assert!(session.into_state().am_configs.is_empty());
        Ok(())
    }

    #[test]
    fn keep_state_alerts_write_silence_file() -> Result<(), MigrationError> {
        let data = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let mut state = infra_state();
        state.alerts[0].settings_json = serde_json::json!({
            "conditions": [{"evaluator": {"type": "gt", "params": [1]}, "query": {"params": ["A", "5m", "now"]}, "reducer": {"type": "avg"}}],
            "noDataState": "keep_state",
        })
        .to_string();
        let session = FakeSession::new(state);

        run(&session, data.path())?;
        let raw = fs::read_to_string(silences_file_path(data.path(), 1)).map_err(anyhow::Error::from)?;
        let silences: Vec<Silence> = serde_json::from_str(&raw).map_err(anyhow::Error::from)?;
        assert_eq!(silences.len(), 1);
        assert_eq!(silences[0].matchers[1].value, "DatasourceNoData");
        Ok(())
    }

    #[test]
    fn missing_dashboard_error_names_the_alert() {
        let mut state = FakeState::default();
        state.alerts.push(legacy_alert(11, 1, 404, 1, "lost", SIMPLE_SETTINGS));
        let session = FakeSession::new(state);
        let data = std::env::temp_dir();

        let err = match run(&session, &data) {
            Ok(_) => panic!("migration of an alert without dashboard succeeded"),
            Err(err) => err,
        };
        let message = format!("{err:#}");
        assert!(message.contains("[ID: 404]"), "{message}");
        assert!(message.contains("lost [ID: 11]"), "{message}");
    }

    #[test]
    fn cancelled_run_stops_before_processing() {
        let session = FakeSession::new(infra_state());
        let cancel = CancellationToken::default();
        cancel.cancel();
        let data = std::env::temp_dir();
        let result = Migration::new(&session, &ChannelRoutingSynthesizer, &cancel, &data).exec();
        assert!(matches!(result, Err(MigrationError::Cancelled)));
        assert!(session.into_state().rules.is_empty());
    }
}
