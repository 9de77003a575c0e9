//! Orchestration: cluster lock, migrate/revert/no-op decision and the
//! transaction boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::alertmanager::{AlertmanagerConfigSynthesizer, ChannelRoutingSynthesizer};
use crate::config::MigrationConfig;
use crate::engine::{Migration, MigrationSummary};
use crate::error::MigrationError;
use crate::models::Actor;
use crate::persist::{
    InfoStore, MigrationSession, ServerLock, TransactionalStore, ALERTMANAGER_KV_NAMESPACE,
    KV_NAMESPACE,
};

/// Row-level lock name shared by every node.
pub const ACTION_NAME: &str = "alerting migration";

pub const LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Cooperative cancellation flag shared between a caller and a running migration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// # Errors
    /// Returns [`MigrationError::Cancelled`] once [`CancellationToken::cancel`] was called.
    pub fn check(&self) -> Result<(), MigrationError> {
        if self.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum LockOutcome<T> {
    Executed(T),
    /// Another holder owns the lock; nothing ran.
    Held,
}

/// Run `f` only while holding `action`, releasing the lock afterwards whether
/// `f` succeeded or not. A lock that cannot be acquired, including one whose
/// row cannot be read, yields [`LockOutcome::Held`].
///
/// # Errors
/// Returns whatever `f` returns.
pub fn lock_execute_and_release<L, T, E, F>(
    lock: &mut L,
    action: &str,
    ttl: Duration,
    f: F,
) -> Result<LockOutcome<T>, E>
where
    L: ServerLock + ?Sized,
    F: FnOnce(&mut L) -> Result<T, E>,
{
    match lock.try_acquire(action, ttl) {
        Ok(true) => {}
        Ok(false) => return Ok(LockOutcome::Held),
        Err(err) => {
            warn!(action, error = %format!("{err:#}"), "failed to acquire server lock");
            return Ok(LockOutcome::Held);
        }
    }

    let result = f(lock);
    if let Err(err) = lock.release(action) {
        error!(action, error = %format!("{err:#}"), "failed to release server lock");
    }
    result.map(LockOutcome::Executed)
}

/// What a run should do given the persisted status and the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Noop,
    Migrate,
    Revert,
}

/// # Errors
/// Returns [`MigrationError::ForceMigrationRequired`] when a revert is needed
/// but `force_migration` is off.
pub fn decide(migrated: bool, config: &MigrationConfig) -> Result<Plan, MigrationError> {
    let desired = config.unified_alerting.enabled;
    if migrated == desired {
        return Ok(Plan::Noop);
    }
    if !migrated {
        return Ok(Plan::Migrate);
    }
    // Nothing to go back to.
    if config.legacy_alerting_disabled() {
        return Ok(Plan::Noop);
    }
    if !config.force_migration {
        return Err(MigrationError::ForceMigrationRequired);
    }
    Ok(Plan::Revert)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevertSummary {
    /// Org id -> folder uids deleted.
    pub deleted_folders: BTreeMap<i64, Vec<String>>,
    pub removed_silence_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    LockHeld,
    Noop,
    Migrated(MigrationSummary),
    Reverted(RevertSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub migrated: bool,
    pub created_folders: BTreeMap<i64, Vec<String>>,
    /// What the next run would do with the current configuration.
    pub plan: Option<Plan>,
    pub plan_error: Option<String>,
}

pub struct MigrationService<S> {
    store: S,
    config: MigrationConfig,
    synthesizer: Box<dyn AlertmanagerConfigSynthesizer>,
    cancel: CancellationToken,
}

impl<S> MigrationService<S>
where
    S: TransactionalStore + ServerLock,
{
    #[must_use]
    pub fn new(store: S, config: MigrationConfig) -> Self {
        Self {
            store,
            config,
            synthesizer: Box::new(ChannelRoutingSynthesizer),
            cancel: CancellationToken::default(),
        }
    }

    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Box<dyn AlertmanagerConfigSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Migrate, revert or do nothing, depending on the persisted status and the
    /// configuration. Losing the lock race is a success.
    ///
    /// # Errors
    /// Returns [`MigrationError::ForceMigrationRequired`] when reverting needs
    /// the force flag, or the error that aborted the transaction.
    pub fn run(&mut self) -> Result<RunOutcome, MigrationError> {
        let Self { store, config, synthesizer, cancel } = self;
        let (config, cancel, synthesizer) = (&*config, &*cancel, &**synthesizer);

        let outcome = lock_execute_and_release(store, ACTION_NAME, LOCK_TTL, |store| {
            info!("starting");
            store.in_transaction(|session| {
                let info_store = InfoStore::new(session.migration_kv());
                let migrated = info_store.is_migrated().map_err(|err| err.context("getting migration status"))?;

                match decide(migrated, config)? {
                    Plan::Noop => {
                        info!("no migrations to run");
                        Ok(RunOutcome::Noop)
                    }
                    Plan::Revert => {
                        info!("reverting legacy migration");
                        let summary =
                            revert_in_session(session, &config.data_path).map_err(|err| err.context("reverting migration"))?;
                        info!("legacy migration reverted");
                        Ok(RunOutcome::Reverted(summary))
                    }
                    Plan::Migrate => {
                        info!("starting legacy migration");
                        let summary = Migration::new(session, synthesizer, cancel, &config.data_path)
                            .exec()
                            .map_err(|err| err.context("executing migration"))?;
                        cancel.check()?;
                        info_store.set_migrated(true).map_err(|err| err.context("setting migration status"))?;
                        info!("completed legacy migration");
                        Ok(RunOutcome::Migrated(summary))
                    }
                }
            })
        })?;

        match outcome {
            LockOutcome::Executed(outcome) => Ok(outcome),
            LockOutcome::Held => {
                warn!("server lock for alerting migration already exists");
                Ok(RunOutcome::LockHeld)
            }
        }
    }

    /// Delete every unified alerting row, the folders the migration created and
    /// the silence files, then clear the migrated flag, regardless of the
    /// persisted status. Needs `force_migration` and the cluster lock like a
    /// reverting [`MigrationService::run`].
    ///
    /// # Errors
    /// Returns [`MigrationError::ForceMigrationRequired`] without touching
    /// anything when the force flag is off, or the error that aborted the
    /// transaction.
    pub fn revert(&mut self) -> Result<RunOutcome, MigrationError> {
        if !self.config.force_migration {
            return Err(MigrationError::ForceMigrationRequired);
        }
        let data_path = self.config.data_path.as_path();

        let outcome = lock_execute_and_release(&mut self.store, ACTION_NAME, LOCK_TTL, |store| {
            info!("reverting legacy migration on request");
            store.in_transaction(|session| {
                revert_in_session(session, data_path).map_err(|err| err.context("reverting migration"))
            })
        })?;

        match outcome {
            LockOutcome::Executed(summary) => {
                info!("legacy migration reverted");
                Ok(RunOutcome::Reverted(summary))
            }
            LockOutcome::Held => {
                warn!("server lock for alerting migration already exists");
                Ok(RunOutcome::LockHeld)
            }
        }
    }

    /// Read-only view of the persisted migration status.
    ///
    /// # Errors
    /// Returns an error when the status records cannot be read or decoded.
    pub fn status(&mut self) -> Result<MigrationStatus, MigrationError> {
        let config = &self.config;
        self.store.in_transaction(|session| {
            let info_store = InfoStore::new(session.migration_kv());
            let migrated = info_store.is_migrated()?;
            let created_folders = info_store.created_folders()?;
            let (plan, plan_error) = match decide(migrated, config) {
                Ok(plan) => (Some(plan), None),
                Err(err) => (None, Some(err.to_string())),
            };
            Ok(MigrationStatus { migrated, created_folders, plan, plan_error })
        })
    }
}

fn revert_in_session(
    session: &dyn MigrationSession,
    data_path: &Path,
) -> Result<RevertSummary, MigrationError> {
    session.cleanup().delete_alert_rules().context("failed to delete alert rules")?;

    let info_store = InfoStore::new(session.migration_kv());
    let created_folders = info_store.created_folders()?;
    for (org_id, folder_uids) in &created_folders {
        let actor = Actor::revert(*org_id);
        for folder_uid in folder_uids {
            session
                .folders()
                .delete(&actor, folder_uid)
                .with_context(|| format!("failed to delete folder {folder_uid} in org {org_id}"))?;
        }
    }

    session
        .cleanup()
        .delete_alerting_state(&[ALERTMANAGER_KV_NAMESPACE, KV_NAMESPACE])
        .context("failed to delete alerting state")?;

    let removed_silence_files = remove_silence_files(data_path);
    info_store.set_migrated(false).map_err(|err| err.context("setting migration status"))?;

    Ok(RevertSummary { deleted_folders: created_folders, removed_silence_files })
}

/// Remove `<data_path>/alerting/*/silences`; failures are logged only.
fn remove_silence_files(data_path: &Path) -> usize {
    let root = data_path.join("alerting");
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(err) => {
            error!(dir = %root.display(), error = %err, "failed to list alerting data directory");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let file = entry.path().join("silences");
        if !file.is_file() {
            continue;
        }
        match fs::remove_file(&file) {
            Ok(()) => removed += 1,
            Err(err) => error!(file = %file.display(), error = %err, "failed to remove silence file"),
        }
    }
    removed
}
