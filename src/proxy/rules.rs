//! Response filtering for the rules and alerts APIs.
//!
//! The upstream response is decoded into typed data, pruned down to the
//! entries carrying the enforced label with a tenant value, and re-encoded.
//! Unknown fields are preserved through `serde(flatten)` so the proxy does
//! not strip data added by newer upstreams.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::response::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct RulesData {
    pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    pub file: String,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub interval: f64,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A rule is discriminated by its `type` field.
#[derive(Debug, Clone)]
pub enum Rule {
    Alerting(AlertingRule),
    Recording(RecordingRule),
}

impl Rule {
    pub fn labels(&self) -> &Map<String, Value> {
        match self {
            Rule::Alerting(r) => &r.labels,
            Rule::Recording(r) => &r.labels,
        }
    }
}

impl Serialize for Rule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Rule::Alerting(r) => r.serialize(serializer),
            Rule::Recording(r) => r.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        match value.get("type").and_then(Value::as_str) {
            Some("alerting") => serde_json::from_value(value)
                .map(Rule::Alerting)
                .map_err(D::Error::custom),
            Some("recording") => serde_json::from_value(value)
                .map(Rule::Recording)
                .map_err(D::Error::custom),
            Some(other) => Err(D::Error::custom(format!(
                "failed to unmarshal rule: unknown type {:?}",
                other
            ))),
            None => Err(D::Error::custom("failed to unmarshal rule: missing type")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingRule {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(default)]
    pub annotations: Map<String, Value>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub health: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingRule {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(default)]
    pub health: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertsData {
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(default)]
    pub annotations: Map<String, Value>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub value: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn labels_match(labels: &Map<String, Value>, label: &str, values: &[String]) -> bool {
    labels
        .get(label)
        .and_then(Value::as_str)
        .map(|v| values.iter().any(|want| want == v))
        .unwrap_or(false)
}

fn rule_matches(rule: &Rule, label: &str, values: &[String], with_active_alerts: bool) -> bool {
    if labels_match(rule.labels(), label, values) {
        return true;
    }
    // An alerting rule templated per-alert may carry the tenant label only on
    // its active alerts.
    if with_active_alerts {
        if let Rule::Alerting(r) = rule {
            return r
                .alerts
                .iter()
                .any(|a| labels_match(&a.labels, label, values));
        }
    }
    false
}

/// Keep only rule groups that retain at least one matching rule.
pub fn filter_rules(
    data: Value,
    label: &str,
    values: &[String],
    with_active_alerts: bool,
) -> Result<Value, ApiError> {
    let mut rules: RulesData = serde_json::from_value(data)
        .map_err(|e| ApiError::bad_gateway(format!("can't decode rules data: {}", e)))?;

    rules.groups.retain_mut(|group| {
        group
            .rules
            .retain(|rule| rule_matches(rule, label, values, with_active_alerts));
        !group.rules.is_empty()
    });

    serde_json::to_value(&rules)
        .map_err(|e| ApiError::bad_gateway(format!("can't encode rules data: {}", e)))
}

/// Keep only alerts carrying the enforced label with a tenant value.
pub fn filter_alerts(data: Value, label: &str, values: &[String]) -> Result<Value, ApiError> {
    let mut alerts: AlertsData = serde_json::from_value(data)
        .map_err(|e| ApiError::bad_gateway(format!("can't decode alerts data: {}", e)))?;

    alerts
        .alerts
        .retain(|alert| labels_match(&alert.labels, label, values));

    serde_json::to_value(&alerts)
        .map_err(|e| ApiError::bad_gateway(format!("can't encode alerts data: {}", e)))
}
