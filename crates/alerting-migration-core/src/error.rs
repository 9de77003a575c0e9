use thiserror::Error;

/// Message surfaced when a revert is requested without `force_migration`.
pub const FORCE_MIGRATION_MESSAGE: &str = "Grafana has already been migrated to Unified Alerting. \
Any alert rules created while using Unified Alerting will be deleted by rolling back. \
Set force_migration=true in your configuration and restart to roll back and delete \
Unified Alerting configuration data.";

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Reverting would drop unified alerting data and the operator did not opt in.
    #[error("{}", FORCE_MIGRATION_MESSAGE)]
    ForceMigrationRequired,
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
    #[error("migration cancelled")]
    Cancelled,
    #[error("invalid settings for legacy alert {alert_id}: {reason}")]
    InvalidSettings { alert_id: i64, reason: String },
    #[error("invalid migration status: {0}")]
    InvalidStatus(String),
    #[error("could not generate a unique value for {candidate:?}")]
    DeduplicationExhausted { candidate: String },
}

impl MigrationError {
    /// True for the configuration-safety gate; callers surface it verbatim.
    #[must_use]
    pub fn is_force_migration_required(&self) -> bool {
        matches!(self, Self::ForceMigrationRequired)
    }

    /// Attach `context` to collaborator failures; other variants pass through.
    #[must_use]
    pub fn context<C>(self, context: C) -> Self
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        match self {
            Self::Collaborator(err) => Self::Collaborator(err.context(context)),
            other => other,
        }
    }
}
