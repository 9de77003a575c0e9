//! One-shot, reversible migration of legacy dashboard alerts to unified,
//! folder-scoped alert rules.
//!
//! [`MigrationService`] is the entry point. Every external capability it needs
//! (folders, permissions, rules, key-value status, the cluster lock) is a trait
//! in [`persist`]; `alerting-migration-store-sqlite` implements them on SQLite.

pub mod alert_rule;
pub mod alertmanager;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod models;
pub mod permissions;
pub mod persist;
pub mod service;

#[cfg(test)]
mod testing;

pub use alertmanager::{
    AlertmanagerConfig, AlertmanagerConfigSynthesizer, ChannelRoutingSynthesizer,
    SaveAlertmanagerConfigurationCmd,
};
pub use config::{ConfigError, MigrationConfig};
pub use dedup::Deduplicator;
pub use engine::{Migration, MigratedRule, MigrationSummary};
pub use error::{MigrationError, FORCE_MIGRATION_MESSAGE};
pub use models::*;
pub use permissions::{FolderHelper, PermissionHash};
pub use persist::{InfoStore, MigrationSession, ServerLock, TransactionalStore};
pub use service::{
    CancellationToken, MigrationService, MigrationStatus, Plan, RevertSummary, RunOutcome,
};
