//! Folder placement for migrated rules.
//!
//! Legacy alerts inherit access from their dashboard, which may grant more than
//! its parent folder. Unified rules only have folder-level access, so every
//! dashboard whose effective ACL differs from its folder's gets its rules moved
//! into a sibling folder carrying the dashboard's ACL. Dashboards under the same
//! parent that share an ACL share one such folder, keyed by [`PermissionHash`].
//!
//! Only managed, inherited and basic roles are folded. Fixed and custom roles
//! can be redefined at any time, so copying their grants onto a new folder would
//! drift; they are reported by [`potential_overrides`] instead.

use std::collections::BTreeMap;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::dedup::{char_len, truncate_chars};
use crate::error::MigrationError;
use crate::models::{
    Actor, Dashboard, Folder, NormalizedPermission, PermissionLevel, PermissionSubject,
    ResourcePermission, RoleKind, ACTION_DASHBOARDS_CREATE, ACTION_DASHBOARDS_DELETE,
    ACTION_DASHBOARDS_PERMISSIONS_READ, ACTION_DASHBOARDS_PERMISSIONS_WRITE,
    ACTION_DASHBOARDS_READ, ACTION_DASHBOARDS_WRITE, ACTION_FOLDERS_DELETE,
    ACTION_FOLDERS_PERMISSIONS_READ, ACTION_FOLDERS_PERMISSIONS_WRITE, ACTION_FOLDERS_READ,
    ACTION_FOLDERS_WRITE,
};
use crate::persist::{MigrationSession, PermissionService};

/// Folder receiving alerts from dashboards in the legacy "General" root.
pub const GENERAL_ALERTING_FOLDER_TITLE: &str = "General Alerting";

/// Maximum length of a generated folder title.
pub const MAX_FOLDER_NAME: usize = 255;

const ALERT_FOLDER_INFIX: &str = " Alerts - ";

/// Highest level granted by an action set, or `None` when it grants no read access.
#[must_use]
pub fn map_actions_to_level(actions: &[String]) -> Option<PermissionLevel> {
    let has = |wanted: &[&str]| actions.iter().any(|action| wanted.contains(&action.as_str()));
    if has(&[ACTION_DASHBOARDS_PERMISSIONS_WRITE, ACTION_FOLDERS_PERMISSIONS_WRITE]) {
        Some(PermissionLevel::Admin)
    } else if has(&[ACTION_DASHBOARDS_WRITE, ACTION_FOLDERS_WRITE]) {
        Some(PermissionLevel::Edit)
    } else if has(&[ACTION_DASHBOARDS_READ, ACTION_FOLDERS_READ]) {
        Some(PermissionLevel::View)
    } else {
        None
    }
}

/// Folder-scoped action set granted for a level.
#[must_use]
pub fn folder_actions_for_level(level: PermissionLevel) -> Vec<&'static str> {
    let mut actions = vec![ACTION_FOLDERS_READ, ACTION_DASHBOARDS_READ];
    if level >= PermissionLevel::Edit {
        actions.extend([
            ACTION_FOLDERS_WRITE,
            ACTION_FOLDERS_DELETE,
            ACTION_DASHBOARDS_WRITE,
            ACTION_DASHBOARDS_CREATE,
            ACTION_DASHBOARDS_DELETE,
        ]);
    }
    if level == PermissionLevel::Admin {
        actions.extend([
            ACTION_FOLDERS_PERMISSIONS_READ,
            ACTION_FOLDERS_PERMISSIONS_WRITE,
            ACTION_DASHBOARDS_PERMISSIONS_READ,
            ACTION_DASHBOARDS_PERMISSIONS_WRITE,
        ]);
    }
    actions
}

/// Hex digest of a canonically ordered permission set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermissionHash(String);

impl PermissionHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PermissionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of `permissions`, which must already be in canonical order
/// (as returned by [`convert_resource_perms`]).
#[must_use]
pub fn create_hash(permissions: &[NormalizedPermission]) -> PermissionHash {
    let mut hasher = Sha256::new();
    for permission in permissions {
        hasher.update([0xFF]);
        hasher.update(format!("{}={}", permission.subject, permission.level).as_bytes());
    }
    PermissionHash(hex::encode(hasher.finalize()))
}

/// Fold raw ACL entries into one highest-wins level per subject, sorted
/// canonically. Fixed and custom role entries are returned untouched as the
/// second element.
#[must_use]
pub fn convert_resource_perms(
    service: &dyn PermissionService,
    permissions: &[ResourcePermission],
) -> (Vec<NormalizedPermission>, Vec<ResourcePermission>) {
    let mut keep: BTreeMap<PermissionSubject, PermissionLevel> = BTreeMap::new();
    let mut unused = Vec::new();

    for permission in permissions {
        if !RoleKind::classify(permission).is_foldable() {
            unused.push(permission.clone());
            continue;
        }
        let (Some(level), Some(subject)) = (service.map_actions(permission), permission.subject())
        else {
            continue;
        };
        keep.entry(subject)
            .and_modify(|current| {
                if level > *current {
                    *current = level;
                }
            })
            .or_insert(level);
    }

    let mut normalized = keep
        .into_iter()
        .map(|(subject, level)| NormalizedPermission { subject, level })
        .collect::<Vec<_>>();
    normalized.sort_by(|lhs, rhs| lhs.sort_key().cmp(&rhs.sort_key()));
    (normalized, unused)
}

/// Fixed or custom roles whose dashboard access exceeds what the basic Editor
/// and Viewer roles get on the new folder. These grants are not copied, so the
/// roles may end up with less access to the migrated rules than they had.
///
/// The baseline is the lowest level among the Editor/Viewer entries of
/// `new_permissions`; when neither role is granted anything, any read access
/// counts as exceeding it.
#[must_use]
pub fn potential_overrides(
    unused: &[ResourcePermission],
    new_permissions: &[NormalizedPermission],
) -> BTreeMap<String, PermissionLevel> {
    let baseline = new_permissions
        .iter()
        .filter(|permission| {
            matches!(&permission.subject, PermissionSubject::BuiltinRole(role) if role == "Editor" || role == "Viewer")
        })
        .map(|permission| permission.level)
        .min();

    let mut overrides: BTreeMap<String, PermissionLevel> = BTreeMap::new();
    for permission in unused {
        let effective = if permission.contains(&[ACTION_DASHBOARDS_WRITE]) {
            PermissionLevel::Edit
        } else if permission.contains(&[ACTION_DASHBOARDS_READ]) {
            PermissionLevel::View
        } else {
            continue;
        };
        if baseline.is_some_and(|lowest| effective <= lowest) {
            continue;
        }
        let entry = overrides.entry(permission.role_name.clone()).or_insert(effective);
        if effective > *entry {
            *entry = effective;
        }
    }
    overrides
}

/// `"<parent title> Alerts - <hash>"`, with the parent title truncated so the
/// whole name fits [`MAX_FOLDER_NAME`]. The hash is always kept whole.
#[must_use]
pub fn generate_alert_folder_name(parent: &Folder, hash: &PermissionHash) -> String {
    let budget = MAX_FOLDER_NAME.saturating_sub(char_len(ALERT_FOLDER_INFIX) + char_len(hash.as_str()));
    let title = truncate_chars(&parent.title, budget);
    format!("{title}{ALERT_FOLDER_INFIX}{hash}")
}

/// Per-organization folder resolution state. Lives for one run only.
#[derive(Debug)]
pub struct FolderHelper {
    org_id: i64,
    general_folder: Option<Folder>,
    /// Folder id -> folder.
    folder_cache: BTreeMap<i64, Folder>,
    /// Dashboard id -> folder its rules migrate to.
    migrated_folders: BTreeMap<i64, Folder>,
    /// Parent folder uid -> permission hash -> folder with that ACL.
    permissions_map: BTreeMap<String, BTreeMap<PermissionHash, Folder>>,
    dashboard_permission_cache: BTreeMap<String, Vec<ResourcePermission>>,
    folder_permission_cache: BTreeMap<String, Vec<ResourcePermission>>,
    created_folders: Vec<String>,
}

impl FolderHelper {
    #[must_use]
    pub fn new(org_id: i64) -> Self {
        Self {
            org_id,
            general_folder: None,
            folder_cache: BTreeMap::new(),
            migrated_folders: BTreeMap::new(),
            permissions_map: BTreeMap::new(),
            dashboard_permission_cache: BTreeMap::new(),
            folder_permission_cache: BTreeMap::new(),
            created_folders: Vec::new(),
        }
    }

    /// UIDs of the folders this helper created, in creation order.
    #[must_use]
    pub fn created_folders(&self) -> &[String] {
        &self.created_folders
    }

    /// Folder the rules of `dashboard` should live in, creating a permission
    /// folder when the dashboard's ACL differs from every folder known under
    /// its parent.
    ///
    /// # Errors
    /// Returns an error when folders or permissions cannot be read or written.
    pub fn get_or_create_migrated_folder(
        &mut self,
        session: &dyn MigrationSession,
        dashboard: &Dashboard,
    ) -> Result<Folder, MigrationError> {
        if let Some(folder) = self.migrated_folders.get(&dashboard.id) {
            return Ok(folder.clone());
        }

        let Some(parent) = self.parent_folder(session, dashboard)? else {
            warn!(
                org_id = self.org_id,
                dashboard_uid = %dashboard.uid,
                missing_folder_id = ?dashboard.folder_id,
                "failed to find folder for dashboard, migrating rules to the general alerting folder"
            );
            let general = self.get_or_create_general_alerting_folder(session)?;
            self.migrated_folders.insert(dashboard.id, general.clone());
            return Ok(general);
        };

        if !self.permissions_map.contains_key(&parent.uid) {
            let folder_permissions = self.folder_permissions(session, &parent)?;
            let (normalized, _) =
                convert_resource_perms(session.dashboard_permissions(), &folder_permissions);
            let baseline = create_hash(&normalized);
            self.permissions_map
                .insert(parent.uid.clone(), BTreeMap::from([(baseline, parent.clone())]));
        }

        let dashboard_permissions = self.dashboard_permissions(session, dashboard)?;
        let (normalized, unused) =
            convert_resource_perms(session.dashboard_permissions(), &dashboard_permissions);
        let hash = create_hash(&normalized);

        let known = self.permissions_map.get(&parent.uid).and_then(|by_hash| by_hash.get(&hash)).cloned();
        if let Some(folder) = known {
            self.migrated_folders.insert(dashboard.id, folder.clone());
            return Ok(folder);
        }

        let folder_name = generate_alert_folder_name(&parent, &hash);
        info!(
            org_id = self.org_id,
            dashboard_uid = %dashboard.uid,
            new_folder = %folder_name,
            "dashboard has custom permissions, creating a new folder for its alerts"
        );
        let folder = self
            .create_folder(session, &folder_name, &normalized)
            .with_context(|| format!("failed to create folder {folder_name:?}"))?;

        let overrides = potential_overrides(&unused, &normalized);
        if !overrides.is_empty() {
            warn!(
                org_id = self.org_id,
                roles = ?overrides,
                new_folder = %folder_name,
                "some roles were not migrated but had the potential to allow additional access, verify the permissions of the new folder"
            );
        }

        self.permissions_map.entry(parent.uid).or_default().insert(hash, folder.clone());
        self.migrated_folders.insert(dashboard.id, folder.clone());
        Ok(folder)
    }

    /// `Ok(None)` when the dashboard points at a folder that no longer exists.
    fn parent_folder(
        &mut self,
        session: &dyn MigrationSession,
        dashboard: &Dashboard,
    ) -> Result<Option<Folder>, MigrationError> {
        let folder_id = match dashboard.folder_id {
            Some(id) if id > 0 => id,
            _ => return self.get_or_create_general_alerting_folder(session).map(Some),
        };
        if let Some(folder) = self.folder_cache.get(&folder_id) {
            return Ok(Some(folder.clone()));
        }

        let found = session
            .folders()
            .get_by_id(&Actor::migration(self.org_id), folder_id)
            .with_context(|| format!("failed to get folder {folder_id}"))?;
        if let Some(folder) = &found {
            self.folder_cache.insert(folder_id, folder.clone());
        }
        Ok(found)
    }

    fn get_or_create_general_alerting_folder(
        &mut self,
        session: &dyn MigrationSession,
    ) -> Result<Folder, MigrationError> {
        if let Some(folder) = &self.general_folder {
            return Ok(folder.clone());
        }

        let existing = session
            .folders()
            .get_by_title(&Actor::migration(self.org_id), GENERAL_ALERTING_FOLDER_TITLE)
            .with_context(|| format!("failed to get folder {GENERAL_ALERTING_FOLDER_TITLE:?}"))?;
        let folder = match existing {
            Some(folder) => folder,
            // No permissions, mirroring the legacy General folder.
            None => self
                .create_folder(session, GENERAL_ALERTING_FOLDER_TITLE, &[])
                .context("failed to create general alerting folder")?,
        };
        self.general_folder = Some(folder.clone());
        Ok(folder)
    }

    fn create_folder(
        &mut self,
        session: &dyn MigrationSession,
        title: &str,
        permissions: &[NormalizedPermission],
    ) -> anyhow::Result<Folder> {
        let folder = session
            .folders()
            .create(&Actor::migration(self.org_id), title)
            .context("failed to save")?;
        if !permissions.is_empty() {
            session
                .folder_permissions()
                .set_permissions(self.org_id, &folder.uid, permissions)
                .context("failed to set permissions")?;
        }
        self.created_folders.push(folder.uid.clone());
        Ok(folder)
    }

    fn folder_permissions(
        &mut self,
        session: &dyn MigrationSession,
        folder: &Folder,
    ) -> Result<Vec<ResourcePermission>, MigrationError> {
        if let Some(permissions) = self.folder_permission_cache.get(&folder.uid) {
            return Ok(permissions.clone());
        }
        let permissions = session
            .folder_permissions()
            .get_permissions(&Actor::migration(self.org_id), &folder.uid)
            .with_context(|| format!("failed to get permissions of folder {}", folder.uid))?;
        self.folder_permission_cache.insert(folder.uid.clone(), permissions.clone());
        Ok(permissions)
    }

    fn dashboard_permissions(
        &mut self,
        session: &dyn MigrationSession,
        dashboard: &Dashboard,
    ) -> Result<Vec<ResourcePermission>, MigrationError> {
        if let Some(permissions) = self.dashboard_permission_cache.get(&dashboard.uid) {
            return Ok(permissions.clone());
        }
        let permissions = session
            .dashboard_permissions()
            .get_permissions(&Actor::migration(self.org_id), &dashboard.uid)
            .with_context(|| format!("failed to get permissions of dashboard {}", dashboard.uid))?;
        self.dashboard_permission_cache.insert(dashboard.uid.clone(), permissions.clone());
        Ok(permissions)
    }
}
