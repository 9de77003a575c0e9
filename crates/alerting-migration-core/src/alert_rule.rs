//! Translation of one legacy alert into a unified rule.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::dedup::{char_len, generate_short_uid, truncate_chars, Deduplicator};
use crate::engine::{MigratedRule, OrgMigration};
use crate::error::MigrationError;
use crate::models::{
    AlertQuery, AlertRule, ChannelRef, Dashboard, ExecErrState, Folder, LegacyAlert, NoDataState,
    RelativeTimeRange, Silence, SilenceMatcher,
};

/// Column width of `alert_rule.title` and `alert_rule.rule_group`.
pub const ALERT_RULE_MAX_TITLE_LENGTH: usize = 190;

pub const EXPRESSION_DATASOURCE_UID: &str = "__expr__";

pub const ANNOTATION_ALERT_ID: &str = "__alertId__";
pub const ANNOTATION_DASHBOARD_UID: &str = "__dashboardUid__";
pub const ANNOTATION_PANEL_ID: &str = "__panelId__";
pub const ANNOTATION_MESSAGE: &str = "message";

const DEFAULT_INTERVAL_SECONDS: i64 = 60;
const MIN_INTERVAL_SECONDS: i64 = 10;
const SILENCE_YEARS: i64 = 10;

const NO_DATA_ALERTNAME: &str = "DatasourceNoData";
const ERROR_ALERTNAME: &str = "DatasourceError";

/// The subset of a legacy alert's settings document the migration reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyAlertSettings {
    pub conditions: Vec<LegacyCondition>,
    pub no_data_state: String,
    pub execution_error_state: String,
    pub frequency: Option<Value>,
    #[serde(rename = "for")]
    pub for_duration: Option<Value>,
    pub notifications: Vec<ChannelRef>,
    pub alert_rule_tags: Value,
    pub message: String,
}

impl LegacyAlertSettings {
    /// # Errors
    /// Returns [`MigrationError::InvalidSettings`] when the document is not valid JSON
    /// of the expected shape.
    pub fn parse(alert: &LegacyAlert) -> Result<Self, MigrationError> {
        serde_json::from_str(&alert.settings_json).map_err(|err| MigrationError::InvalidSettings {
            alert_id: alert.id,
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacyCondition {
    pub evaluator: TypedParams,
    pub operator: Typed,
    pub query: ConditionQuery,
    pub reducer: Typed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Typed {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TypedParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionQuery {
    /// `[refId, from, to]`.
    pub params: Vec<String>,
    pub datasource_uid: Option<String>,
    pub model: Value,
}

/// Queries plus the ref id of the classic-conditions expression evaluating them.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedCondition {
    pub condition: String,
    pub data: Vec<AlertQuery>,
}

/// Build the query list and classic-conditions expression for a legacy alert.
///
/// Each distinct `(refId, from, to)` becomes one query. A ref id reused with a
/// different time range is given the next free letter.
///
/// # Errors
/// Returns [`MigrationError::InvalidSettings`] for alerts without conditions or
/// with malformed query parameters.
pub fn translate_conditions(
    alert_id: i64,
    settings: &LegacyAlertSettings,
) -> Result<TranslatedCondition, MigrationError> {
    let invalid = |reason: String| MigrationError::InvalidSettings { alert_id, reason };
    if settings.conditions.is_empty() {
        return Err(invalid("alert has no conditions".to_string()));
    }

    let mut used = settings
        .conditions
        .iter()
        .filter_map(|condition| condition.query.params.first().cloned())
        .collect::<BTreeSet<_>>();
    let mut assigned: BTreeMap<(String, RelativeTimeRange), String> = BTreeMap::new();
    let mut claimed: BTreeSet<String> = BTreeSet::new();
    let mut data = Vec::new();
    let mut classic = Vec::new();

    for condition in &settings.conditions {
        let [ref_id, from, to] = condition.query.params.as_slice() else {
            return Err(invalid(format!(
                "query params must be [refId, from, to], got {:?}",
                condition.query.params
            )));
        };
        let range = RelativeTimeRange {
            from_seconds: parse_relative_time(from).map_err(&invalid)?,
            to_seconds: parse_relative_time(to).map_err(&invalid)?,
        };

        let key = (ref_id.clone(), range);
        let new_ref = if let Some(existing) = assigned.get(&key) {
            existing.clone()
        } else {
            let new_ref = if claimed.contains(ref_id) {
                next_free_ref_id(&used)
            } else {
                ref_id.clone()
            };
            used.insert(new_ref.clone());
            claimed.insert(new_ref.clone());
            assigned.insert(key, new_ref.clone());

            let mut model = migrate_query_model(condition.query.model.clone());
            if let Value::Object(fields) = &mut model {
                fields.insert("refId".to_string(), Value::String(new_ref.clone()));
            }
            let datasource_uid = condition
                .query
                .datasource_uid
                .clone()
                .or_else(|| model.pointer("/datasource/uid").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            data.push(AlertQuery {
                ref_id: new_ref.clone(),
                query_type: String::new(),
                relative_time_range: range,
                datasource_uid,
                model,
            });
            new_ref
        };

        let operator = if condition.operator.kind.is_empty() { "and" } else { condition.operator.kind.as_str() };
        classic.push(json!({
            "evaluator": { "type": condition.evaluator.kind, "params": condition.evaluator.params },
            "operator": { "type": operator },
            "query": { "params": [new_ref] },
            "reducer": { "type": condition.reducer.kind },
        }));
    }

    let condition_ref = next_free_ref_id(&used);
    data.push(AlertQuery {
        ref_id: condition_ref.clone(),
        query_type: String::new(),
        relative_time_range: RelativeTimeRange::default(),
        datasource_uid: EXPRESSION_DATASOURCE_UID.to_string(),
        model: json!({
            "refId": condition_ref,
            "type": "classic_conditions",
            "datasource": { "uid": EXPRESSION_DATASOURCE_UID, "type": EXPRESSION_DATASOURCE_UID },
            "conditions": classic,
        }),
    });

    Ok(TranslatedCondition { condition: condition_ref, data })
}

/// `A`..`Z`, then `AA`, `AB`, ...: the first not in `used`.
fn next_free_ref_id(used: &BTreeSet<String>) -> String {
    (0usize..)
        .map(ref_id_for_index)
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_default()
}

fn ref_id_for_index(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + u8::try_from(index % 26).unwrap_or(0));
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().map(|letter| char::from(*letter)).collect()
}

/// Normalize a legacy query model for unified evaluation.
#[must_use]
pub fn migrate_query_model(model: Value) -> Value {
    let Value::Object(mut fields) = model else {
        return model;
    };

    if let Some(full) = fields.remove("targetFull") {
        fields.insert("target".to_string(), full);
    }
    fields.remove("hide");

    let is_prometheus = fields
        .get("datasource")
        .and_then(|datasource| datasource.get("type"))
        .and_then(Value::as_str)
        == Some("prometheus");
    let flag = |fields: &Map<String, Value>, name: &str| fields.get(name).and_then(Value::as_bool).unwrap_or(false);
    if is_prometheus && flag(&fields, "instant") && flag(&fields, "range") {
        fields.insert("instant".to_string(), Value::Bool(false));
    }

    Value::Object(fields)
}

/// Seconds before now for `now`, `now-5m`, `5m`, `90s`, `1h30m` or a bare number.
fn parse_relative_time(value: &str) -> Result<i64, String> {
    let trimmed = value.trim();
    if trimmed == "now" {
        return Ok(0);
    }
    let offset = trimmed.strip_prefix("now-").unwrap_or(trimmed);
    parse_duration_seconds(offset).map_err(|err| format!("invalid relative time {value:?}: {err}"))
}

fn parse_duration_seconds(value: &str) -> Result<i64, String> {
    if value.is_empty() {
        return Ok(0);
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }

    let mut total = 0i64;
    let mut digits = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            other => return Err(format!("unknown unit {other:?}")),
        };
        let amount = digits.parse::<i64>().map_err(|_| "missing amount before unit".to_string())?;
        total = total.saturating_add(amount.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err("trailing amount without unit".to_string());
    }
    Ok(total)
}

fn duration_setting(alert_id: i64, field: &str, value: Option<&Value>) -> Result<i64, MigrationError> {
    let parsed = match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number.as_i64().ok_or_else(|| format!("{number} is not whole seconds")),
        Some(Value::String(text)) => parse_duration_seconds(text.trim()),
        Some(other) => Err(format!("unexpected value {other}")),
    };
    parsed.map_err(|reason| MigrationError::InvalidSettings {
        alert_id,
        reason: format!("{field}: {reason}"),
    })
}

/// Evaluation interval: 60s when unset, at least 10s, rounded up to a multiple of 10s.
#[must_use]
pub fn evaluation_interval(frequency_seconds: i64) -> i64 {
    if frequency_seconds <= 0 {
        return DEFAULT_INTERVAL_SECONDS;
    }
    let floored = frequency_seconds.max(MIN_INTERVAL_SECONDS);
    let rounded = floored.saturating_add(MIN_INTERVAL_SECONDS - 1) / MIN_INTERVAL_SECONDS;
    rounded.saturating_mul(MIN_INTERVAL_SECONDS)
}

/// Unified no-data state, and whether a silence is needed to keep the legacy
/// `keep_state` behavior.
#[must_use]
pub fn trans_no_data(state: &str) -> (NoDataState, bool) {
    match state {
        "ok" => (NoDataState::Ok, false),
        "alerting" => (NoDataState::Alerting, false),
        "keep_state" => (NoDataState::NoData, true),
        _ => (NoDataState::NoData, false),
    }
}

#[must_use]
pub fn trans_exec_err(state: &str) -> (ExecErrState, bool) {
    match state {
        "alerting" => (ExecErrState::Alerting, false),
        "keep_state" => (ExecErrState::Error, true),
        _ => (ExecErrState::Error, false),
    }
}

/// Labels from object-shaped `alertRuleTags`, and the provenance annotations.
#[must_use]
pub fn add_migration_info(
    alert: &LegacyAlert,
    settings: &LegacyAlertSettings,
    dashboard_uid: &str,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = BTreeMap::new();
    if let Value::Object(tags) = &settings.alert_rule_tags {
        for (key, value) in tags {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            labels.insert(key.clone(), value);
        }
    }

    let mut annotations = BTreeMap::from([
        (ANNOTATION_ALERT_ID.to_string(), alert.id.to_string()),
        (ANNOTATION_DASHBOARD_UID.to_string(), dashboard_uid.to_string()),
        (ANNOTATION_PANEL_ID.to_string(), alert.panel_id.to_string()),
    ]);
    if !settings.message.is_empty() {
        annotations.insert(ANNOTATION_MESSAGE.to_string(), settings.message.clone());
    }
    (labels, annotations)
}

/// `"<dashboard title> - <panel id>"`, title truncated to fit the column.
#[must_use]
pub fn rule_group_name(dashboard_title: &str, panel_id: i64) -> String {
    let suffix = format!(" - {panel_id}");
    let budget = ALERT_RULE_MAX_TITLE_LENGTH.saturating_sub(char_len(&suffix));
    format!("{}{suffix}", truncate_chars(dashboard_title, budget))
}

fn keep_state_silence(rule_uid: &str, alertname: &str, now: OffsetDateTime) -> Silence {
    Silence {
        id: generate_short_uid(),
        matchers: vec![
            SilenceMatcher {
                name: crate::alertmanager::RULE_UID_LABEL.to_string(),
                value: rule_uid.to_string(),
                is_equal: true,
            },
            SilenceMatcher { name: "alertname".to_string(), value: alertname.to_string(), is_equal: true },
        ],
        starts_at: now,
        ends_at: now + time::Duration::days(365 * SILENCE_YEARS),
        created_by: "Grafana Migration".to_string(),
        comment: "Created during auto migration to unified alerting".to_string(),
    }
}

impl OrgMigration {
    /// Translate `alert` into a rule placed in `folder`, recording any silences
    /// its `keep_state` settings require.
    pub(crate) fn migrate_alert(
        &mut self,
        alert: &LegacyAlert,
        dashboard: &Dashboard,
        folder: &Folder,
        seen_uids: &mut Deduplicator,
    ) -> Result<MigratedRule, MigrationError> {
        let settings = LegacyAlertSettings::parse(alert)?;
        let translated = translate_conditions(alert.id, &settings)?;
        let rule = self.make_alert_rule(alert, &settings, translated, dashboard, &folder.uid, seen_uids)?;

        let now = OffsetDateTime::now_utc();
        if trans_no_data(&settings.no_data_state).1 {
            self.silences.push(keep_state_silence(&rule.uid, NO_DATA_ALERTNAME, now));
        }
        if trans_exec_err(&settings.execution_error_state).1 {
            self.silences.push(keep_state_silence(&rule.uid, ERROR_ALERTNAME, now));
        }

        Ok(MigratedRule { rule, channels: settings.notifications })
    }

    pub(crate) fn make_alert_rule(
        &mut self,
        alert: &LegacyAlert,
        settings: &LegacyAlertSettings,
        translated: TranslatedCondition,
        dashboard: &Dashboard,
        folder_uid: &str,
        seen_uids: &mut Deduplicator,
    ) -> Result<AlertRule, MigrationError> {
        let mut uid = generate_short_uid();
        if seen_uids.contains(&uid) {
            uid = seen_uids.deduplicate(&uid)?;
        }
        seen_uids.add(&uid);

        let case_insensitive = self.dialect.case_insensitive_collation;
        let titles = self
            .title_dedup
            .entry(folder_uid.to_string())
            .or_insert_with(|| Deduplicator::new(case_insensitive, ALERT_RULE_MAX_TITLE_LENGTH));
        let mut title = alert.name.clone();
        if char_len(&title) > ALERT_RULE_MAX_TITLE_LENGTH || titles.contains(&title) {
            title = titles.deduplicate(&alert.name)?;
        }
        titles.add(&title);

        let (labels, annotations) = add_migration_info(alert, settings, &dashboard.uid);
        let frequency = duration_setting(alert.id, "frequency", settings.frequency.as_ref())?;
        let for_seconds = duration_setting(alert.id, "for", settings.for_duration.as_ref())?;

        Ok(AlertRule {
            org_id: alert.org_id,
            uid,
            title,
            rule_group: rule_group_name(&dashboard.title, alert.panel_id),
            folder_uid: folder_uid.to_string(),
            condition: translated.condition,
            data: translated.data,
            interval_seconds: evaluation_interval(frequency),
            for_seconds,
            is_paused: alert.state == "paused",
            no_data_state: trans_no_data(&settings.no_data_state).0,
            exec_err_state: trans_exec_err(&settings.execution_error_state).0,
            labels,
            annotations,
            dashboard_uid: Some(dashboard.uid.clone()),
            panel_id: Some(alert.panel_id),
        })
    }
}
