use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::MigratedRule;
use crate::models::{ChannelRef, NotificationChannel};

/// Root receiver of every migrated configuration.
pub const DEFAULT_RECEIVER: &str = "autogen-contact-point-default";

/// Label carrying the rule uid on every unified alert instance.
pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";

pub const CONFIGURATION_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveAlertmanagerConfigurationCmd {
    pub org_id: i64,
    pub alertmanager_configuration: String,
    pub configuration_version: String,
    pub default: bool,
    pub last_applied: i64,
}

impl SaveAlertmanagerConfigurationCmd {
    /// Non-default, never-applied configuration for `org_id`.
    ///
    /// # Errors
    /// Returns an error when the configuration cannot be encoded.
    pub fn for_migration(org_id: i64, config: &AlertmanagerConfig) -> anyhow::Result<Self> {
        let raw = serde_json::to_string(&PostableUserConfig { alertmanager_config: config })?;
        Ok(Self {
            org_id,
            alertmanager_configuration: raw,
            configuration_version: CONFIGURATION_VERSION.to_string(),
            default: false,
            last_applied: 0,
        })
    }
}

#[derive(Serialize)]
struct PostableUserConfig<'a> {
    alertmanager_config: &'a AlertmanagerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertmanagerConfig {
    pub route: Route,
    pub receivers: Vec<Receiver>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Route {
    pub receiver: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    /// `[label, operator, value]` triples.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_matchers: Vec<[String; 3]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(rename = "continue", default)]
    pub continue_matching: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receiver {
    pub name: String,
    pub grafana_managed_receiver_configs: Vec<ManagedReceiver>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedReceiver {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub disable_resolve_message: bool,
    pub settings: serde_json::Value,
}

impl From<&NotificationChannel> for ManagedReceiver {
    fn from(channel: &NotificationChannel) -> Self {
        Self {
            uid: channel.uid.clone(),
            name: channel.name.clone(),
            kind: channel.kind.clone(),
            disable_resolve_message: false,
            settings: channel.settings.clone(),
        }
    }
}

/// Turns the channel bindings of one organization's migrated rules into an
/// Alertmanager routing tree.
pub trait AlertmanagerConfigSynthesizer {
    /// # Errors
    /// Returns an error when the bindings cannot be expressed as a configuration.
    fn synthesize(
        &self,
        org_id: i64,
        rules: &BTreeMap<String, MigratedRule>,
        channels: &[NotificationChannel],
    ) -> anyhow::Result<AlertmanagerConfig>;
}

/// One receiver per legacy channel and one child route per bound channel,
/// matching the uids of the rules bound to it. Default channels receive
/// every rule through a leading catch-all route.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelRoutingSynthesizer;

impl AlertmanagerConfigSynthesizer for ChannelRoutingSynthesizer {
    fn synthesize(
        &self,
        org_id: i64,
        rules: &BTreeMap<String, MigratedRule>,
        channels: &[NotificationChannel],
    ) -> anyhow::Result<AlertmanagerConfig> {
        let defaults = channels.iter().filter(|channel| channel.is_default).collect::<Vec<_>>();

        let mut receivers = vec![Receiver {
            name: DEFAULT_RECEIVER.to_string(),
            grafana_managed_receiver_configs: defaults.iter().map(|channel| ManagedReceiver::from(*channel)).collect(),
        }];
        receivers.extend(channels.iter().map(|channel| Receiver {
            name: channel.name.clone(),
            grafana_managed_receiver_configs: vec![ManagedReceiver::from(channel)],
        }));

        // Channel id -> uids of the rules explicitly bound to it.
        let mut bound: BTreeMap<i64, BTreeSet<&str>> = BTreeMap::new();
        for (uid, migrated) in rules {
            for reference in &migrated.channels {
                match resolve_channel(channels, reference) {
                    Some(channel) if channel.is_default => {}
                    Some(channel) => {
                        bound.entry(channel.id).or_default().insert(uid.as_str());
                    }
                    None => warn!(
                        org_id,
                        rule_uid = %uid,
                        channel = ?reference,
                        "rule references an unknown notification channel, skipping"
                    ),
                }
            }
        }

        let mut routes = Vec::new();
        if !defaults.is_empty() {
            routes.push(Route {
                receiver: DEFAULT_RECEIVER.to_string(),
                continue_matching: true,
                ..Route::default()
            });
        }
        for channel in channels {
            let Some(uids) = bound.get(&channel.id) else {
                continue;
            };
            let alternatives = uids.iter().copied().collect::<Vec<_>>().join("|");
            routes.push(Route {
                receiver: channel.name.clone(),
                object_matchers: vec![[
                    RULE_UID_LABEL.to_string(),
                    "=~".to_string(),
                    format!("^({alternatives})$"),
                ]],
                continue_matching: true,
                ..Route::default()
            });
        }

        Ok(AlertmanagerConfig {
            route: Route {
                receiver: DEFAULT_RECEIVER.to_string(),
                group_by: vec!["grafana_folder".to_string(), "alertname".to_string()],
                routes,
                ..Route::default()
            },
            receivers,
        })
    }
}

fn resolve_channel<'a>(
    channels: &'a [NotificationChannel],
    reference: &ChannelRef,
) -> Option<&'a NotificationChannel> {
    channels.iter().find(|channel| channel.matches(reference))
}
