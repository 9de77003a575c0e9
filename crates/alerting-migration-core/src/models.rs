use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const ACTION_FOLDERS_READ: &str = "folders:read";
pub const ACTION_FOLDERS_WRITE: &str = "folders:write";
pub const ACTION_FOLDERS_CREATE: &str = "folders:create";
pub const ACTION_FOLDERS_DELETE: &str = "folders:delete";
pub const ACTION_FOLDERS_PERMISSIONS_READ: &str = "folders.permissions:read";
pub const ACTION_FOLDERS_PERMISSIONS_WRITE: &str = "folders.permissions:write";
pub const ACTION_DASHBOARDS_READ: &str = "dashboards:read";
pub const ACTION_DASHBOARDS_WRITE: &str = "dashboards:write";
pub const ACTION_DASHBOARDS_CREATE: &str = "dashboards:create";
pub const ACTION_DASHBOARDS_DELETE: &str = "dashboards:delete";
pub const ACTION_DASHBOARDS_PERMISSIONS_READ: &str = "dashboards.permissions:read";
pub const ACTION_DASHBOARDS_PERMISSIONS_WRITE: &str = "dashboards.permissions:write";
pub const ACTION_ORG_USERS_READ: &str = "org.users:read";
pub const ACTION_TEAMS_READ: &str = "teams:read";

/// Dashboard-embedded alert definition. Never mutated by the migration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LegacyAlert {
    pub id: i64,
    pub org_id: i64,
    pub dashboard_id: i64,
    pub panel_id: i64,
    pub name: String,
    pub state: String,
    pub settings_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dashboard {
    pub id: i64,
    pub uid: String,
    pub title: String,
    /// `None` for dashboards living in the legacy "General" root.
    pub folder_id: Option<i64>,
    pub org_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Folder {
    pub id: i64,
    pub uid: String,
    pub title: String,
    pub org_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PermissionLevel {
    View,
    Edit,
    Admin,
}

impl PermissionLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "View",
            Self::Edit => "Edit",
            Self::Admin => "Admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "View" => Some(Self::View),
            "Edit" => Some(Self::Edit),
            "Admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl Display for PermissionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PermissionSubject {
    User(i64),
    Team(i64),
    BuiltinRole(String),
}

impl Display for PermissionSubject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Team(id) => write!(f, "team:{id}"),
            Self::BuiltinRole(role) => write!(f, "builtin:{role}"),
        }
    }
}

/// Raw ACL entry as returned by a folder or dashboard permission service.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResourcePermission {
    pub id: i64,
    pub role_name: String,
    pub is_managed: bool,
    pub is_inherited: bool,
    pub user_id: Option<i64>,
    pub team_id: Option<i64>,
    pub builtin_role: Option<String>,
    pub actions: Vec<String>,
}

impl ResourcePermission {
    #[must_use]
    pub fn subject(&self) -> Option<PermissionSubject> {
        if let Some(user_id) = self.user_id {
            return Some(PermissionSubject::User(user_id));
        }
        if let Some(team_id) = self.team_id {
            return Some(PermissionSubject::Team(team_id));
        }
        self.builtin_role.clone().map(PermissionSubject::BuiltinRole)
    }

    /// True when every action in `actions` is granted by this entry.
    #[must_use]
    pub fn contains(&self, actions: &[&str]) -> bool {
        actions.iter().all(|wanted| self.actions.iter().any(|action| action == wanted))
    }
}

/// Origin of a role, which decides whether it can be folded into a migrated folder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Managed,
    Inherited,
    Basic,
    Fixed,
    Custom,
}

impl RoleKind {
    #[must_use]
    pub fn classify(permission: &ResourcePermission) -> Self {
        if permission.is_managed {
            Self::Managed
        } else if permission.is_inherited {
            Self::Inherited
        } else if permission.role_name.starts_with("basic:") {
            Self::Basic
        } else if permission.role_name.starts_with("fixed:") {
            Self::Fixed
        } else {
            Self::Custom
        }
    }

    #[must_use]
    pub fn is_foldable(self) -> bool {
        matches!(self, Self::Managed | Self::Inherited | Self::Basic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct NormalizedPermission {
    pub subject: PermissionSubject,
    pub level: PermissionLevel,
}

impl NormalizedPermission {
    /// Canonical ordering: builtin role, then user id, then team id, then level.
    #[must_use]
    pub fn sort_key(&self) -> (&str, i64, i64, &'static str) {
        match &self.subject {
            PermissionSubject::BuiltinRole(role) => (role.as_str(), 0, 0, self.level.as_str()),
            PermissionSubject::User(id) => ("", *id, 0, self.level.as_str()),
            PermissionSubject::Team(id) => ("", 0, *id, self.level.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum NoDataState {
    Alerting,
    NoData,
    #[serde(rename = "OK")]
    Ok,
}

impl NoDataState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Ok => "OK",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Alerting" => Some(Self::Alerting),
            "NoData" => Some(Self::NoData),
            "OK" => Some(Self::Ok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ExecErrState {
    Alerting,
    Error,
}

impl ExecErrState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alerting => "Alerting",
            Self::Error => "Error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Alerting" => Some(Self::Alerting),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RelativeTimeRange {
    pub from_seconds: i64,
    pub to_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertQuery {
    pub ref_id: String,
    pub query_type: String,
    pub relative_time_range: RelativeTimeRange,
    pub datasource_uid: String,
    pub model: serde_json::Value,
}

/// Standalone, folder-scoped rule produced by the migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub org_id: i64,
    pub uid: String,
    pub title: String,
    pub rule_group: String,
    pub folder_uid: String,
    pub condition: String,
    pub data: Vec<AlertQuery>,
    pub interval_seconds: i64,
    pub for_seconds: i64,
    pub is_paused: bool,
    pub no_data_state: NoDataState,
    pub exec_err_state: ExecErrState,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub dashboard_uid: Option<String>,
    pub panel_id: Option<i64>,
}

/// Reference to a legacy notification channel, by uid or by numeric id. An
/// empty uid falls back to the id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(untagged, try_from = "RawChannelRef")]
pub enum ChannelRef {
    Uid { uid: String },
    Id { id: i64 },
}

#[derive(Deserialize)]
struct RawChannelRef {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    id: Option<i64>,
}

impl TryFrom<RawChannelRef> for ChannelRef {
    type Error = String;

    fn try_from(raw: RawChannelRef) -> Result<Self, Self::Error> {
        match (raw.uid, raw.id) {
            (Some(uid), _) if !uid.is_empty() => Ok(Self::Uid { uid }),
            (_, Some(id)) => Ok(Self::Id { id }),
            _ => Err("notification needs a uid or an id".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationChannel {
    pub id: i64,
    pub uid: String,
    pub org_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub is_default: bool,
    pub settings: serde_json::Value,
}

impl NotificationChannel {
    #[must_use]
    pub fn matches(&self, reference: &ChannelRef) -> bool {
        match reference {
            ChannelRef::Uid { uid } => &self.uid == uid,
            ChannelRef::Id { id } => self.id == *id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SilenceMatcher {
    pub name: String,
    pub value: String,
    pub is_equal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Silence {
    pub id: String,
    pub matchers: Vec<SilenceMatcher>,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub created_by: String,
    pub comment: String,
}

/// Background identity the migration acts as when calling collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub login: String,
    pub org_id: i64,
    pub org_role: String,
    pub actions: Vec<String>,
}

impl Actor {
    /// Identity used while migrating: read access plus folder creation.
    #[must_use]
    pub fn migration(org_id: i64) -> Self {
        Self::background(
            org_id,
            &[
                ACTION_FOLDERS_READ,
                ACTION_DASHBOARDS_READ,
                ACTION_FOLDERS_PERMISSIONS_READ,
                ACTION_DASHBOARDS_PERMISSIONS_READ,
                ACTION_FOLDERS_CREATE,
                ACTION_FOLDERS_PERMISSIONS_WRITE,
                ACTION_ORG_USERS_READ,
                ACTION_TEAMS_READ,
            ],
        )
    }

    /// Identity used while reverting: folder deletion only.
    #[must_use]
    pub fn revert(org_id: i64) -> Self {
        Self::background(org_id, &[ACTION_FOLDERS_DELETE])
    }

    fn background(org_id: i64, actions: &[&str]) -> Self {
        Self {
            login: "ngalert_migration".to_string(),
            org_id,
            org_role: "Admin".to_string(),
            actions: actions.iter().map(|action| (*action).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn can(&self, action: &str) -> bool {
        self.actions.iter().any(|granted| granted == action)
    }
}

/// Properties of the backing database that affect identifier uniqueness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Dialect {
    pub case_insensitive_collation: bool,
}
