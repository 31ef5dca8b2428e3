//! Alertmanager silence handling: `filter=` query rewriting, the silence
//! write guard, and the silences response filter.
//!
//! Alertmanager's v2 API has no `{status, data}` envelope; silence listings
//! are bare JSON arrays and are filtered as such.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::enforce::join_label_values;
use super::http::ProxyRequest;
use super::response::ApiError;
use crate::promql::{MatchOp, Matcher};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceMatcher {
    pub name: String,
    pub value: String,
    #[serde(rename = "isRegex")]
    pub is_regex: bool,
    #[serde(rename = "isEqual", default = "default_true")]
    pub is_equal: bool,
}

fn default_true() -> bool {
    true
}

/// A silence submitted by a client (create or update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostableSilence {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub matchers: Vec<SilenceMatcher>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A silence as returned by the Alertmanager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GettableSilence {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub matchers: Vec<SilenceMatcher>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Canonical matcher value for silence operations: the raw pattern in
/// regex-match mode, otherwise the escaped `|`-join of the tenant values.
pub fn matcher_value(values: &[String], regex_match: bool) -> String {
    if regex_match {
        values.first().cloned().unwrap_or_default()
    } else {
        join_label_values(values)
    }
}

/// Whether the silence's matcher set pins the enforced label to the tenant
/// set. The first matcher on the label decides.
pub fn has_tenant_matcher(matchers: &[SilenceMatcher], label: &str, expected: &str) -> bool {
    for m in matchers {
        if m.name == label {
            return m.is_regex && m.value == expected;
        }
    }
    false
}

/// Prepend the enforced matcher to a submitted silence. Rejects a silence
/// that would end up with the tenant matcher alone, since it would silence
/// every alert of the tenant.
pub fn inject_silence_matcher(
    silence: &mut PostableSilence,
    label: &str,
    value: &str,
) -> Result<(), ApiError> {
    let mut matchers = Vec::with_capacity(silence.matchers.len() + 1);
    matchers.push(SilenceMatcher {
        name: label.to_string(),
        value: value.to_string(),
        is_regex: true,
        is_equal: true,
    });
    matchers.extend(silence.matchers.drain(..));

    if matchers.len() < 2 {
        return Err(ApiError::bad_request(
            "need at least one matcher besides the enforced label",
        ));
    }
    silence.matchers = matchers;
    Ok(())
}

/// Parse an Alertmanager filter matcher like `namespace=~"default"` or
/// `alertname=foo`.
pub fn parse_filter_matcher(input: &str) -> Result<Matcher, ApiError> {
    let s = input.trim();
    let s = s
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(s);

    let op_at = s
        .find(['=', '!'])
        .ok_or_else(|| ApiError::bad_request(format!("can't parse filter {:?}", input)))?;
    let name = s[..op_at].trim();
    if name.is_empty() {
        return Err(ApiError::bad_request(format!(
            "can't parse filter {:?}",
            input
        )));
    }

    let rest = &s[op_at..];
    let (op, value) = if let Some(v) = rest.strip_prefix("=~") {
        (MatchOp::Regex, v)
    } else if let Some(v) = rest.strip_prefix("!~") {
        (MatchOp::NotRegex, v)
    } else if let Some(v) = rest.strip_prefix("!=") {
        (MatchOp::NotEqual, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (MatchOp::Equal, v)
    } else {
        return Err(ApiError::bad_request(format!(
            "can't parse filter {:?}",
            input
        )));
    };

    let value = value.trim();
    let value = if value.starts_with('"') {
        unquote(value)
            .ok_or_else(|| ApiError::bad_request(format!("can't parse filter {:?}", input)))?
    } else {
        value.to_string()
    };

    Ok(Matcher::new(op, name, value))
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '\\' => out.push('\\'),
                '"' => out.push('"'),
                other => out.push(other),
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Rewrite the `filter` query parameters of an Alertmanager read endpoint:
/// drop client filters on the enforced label and prepend the enforced
/// matcher.
pub fn rewrite_filter_params(
    req: &mut ProxyRequest,
    label: &str,
    enforced: &Matcher,
) -> Result<(), ApiError> {
    let mut filters = vec![enforced.to_string()];
    for filter in req.query_values("filter") {
        let m = parse_filter_matcher(&filter)
            .map_err(|e| ApiError::bad_request(format!("bad request: {}", e.message)))?;
        if m.name == label {
            continue;
        }
        filters.push(filter);
    }

    req.set_query_values("filter", filters);
    req.remove_query(label);
    Ok(())
}

/// Filter a silence listing down to silences scoped to the tenant.
pub fn filter_silences(body: &[u8], label: &str, expected: &str) -> Result<Vec<u8>, ApiError> {
    let mut silences: Vec<GettableSilence> = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_gateway(format!("can't decode silences: {}", e)))?;

    silences.retain(|s| has_tenant_matcher(&s.matchers, label, expected));

    let mut out = serde_json::to_vec(&silences)
        .map_err(|e| ApiError::bad_gateway(format!("can't encode silences: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use http::Method;
    use serde_json::json;

    fn silence_json(matchers: Value) -> Value {
        json!({
            "matchers": matchers,
            "startsAt": "2026-08-01T00:00:00Z",
            "endsAt": "2026-08-02T00:00:00Z",
            "createdBy": "bob",
            "comment": "maintenance",
        })
    }

    #[test]
    fn test_matcher_value() {
        assert_eq!(matcher_value(&["default".into()], false), "default");
        assert_eq!(
            matcher_value(&["default".into(), "some|thing".into()], false),
            r"default|some\|thing"
        );
        assert_eq!(matcher_value(&["tenant-.*".into()], true), "tenant-.*");
    }

    #[test]
    fn test_has_tenant_matcher() {
        let matchers = vec![
            SilenceMatcher {
                name: "namespace".into(),
                value: "default".into(),
                is_regex: true,
                is_equal: true,
            },
            SilenceMatcher {
                name: "alertname".into(),
                value: "Watchdog".into(),
                is_regex: false,
                is_equal: true,
            },
        ];
        assert!(has_tenant_matcher(&matchers, "namespace", "default"));
        assert!(!has_tenant_matcher(&matchers, "namespace", "other"));
        assert!(!has_tenant_matcher(&matchers, "cluster", "default"));

        // A non-regex matcher on the label does not count.
        let plain = vec![SilenceMatcher {
            name: "namespace".into(),
            value: "default".into(),
            is_regex: false,
            is_equal: true,
        }];
        assert!(!has_tenant_matcher(&plain, "namespace", "default"));
    }

    #[test]
    fn test_inject_silence_matcher() {
        let mut silence: PostableSilence = serde_json::from_value(silence_json(json!([
            {"name": "alertname", "value": "Watchdog", "isRegex": false, "isEqual": true}
        ])))
        .unwrap();

        inject_silence_matcher(&mut silence, "namespace", "default").unwrap();
        assert_eq!(silence.matchers.len(), 2);
        assert_eq!(silence.matchers[0].name, "namespace");
        assert!(silence.matchers[0].is_regex);
        assert!(silence.matchers[0].is_equal);
        assert_eq!(silence.matchers[1].name, "alertname");

        // Unknown silence fields survive re-encoding.
        let out = serde_json::to_value(&silence).unwrap();
        assert_eq!(out["comment"], "maintenance");
        assert!(out.get("id").is_none());
    }

    #[test]
    fn test_inject_rejects_tenant_only_silence() {
        let mut silence: PostableSilence =
            serde_json::from_value(silence_json(json!([]))).unwrap();
        let err = inject_silence_matcher(&mut silence, "namespace", "default").unwrap_err();
        assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_filter_matcher() {
        let m = parse_filter_matcher(r#"namespace=~"default""#).unwrap();
        assert_eq!(m, Matcher::new(MatchOp::Regex, "namespace", "default"));

        let m = parse_filter_matcher("alertname=Watchdog").unwrap();
        assert_eq!(m, Matcher::new(MatchOp::Equal, "alertname", "Watchdog"));

        let m = parse_filter_matcher(r#"{severity!="critical"}"#).unwrap();
        assert_eq!(m, Matcher::new(MatchOp::NotEqual, "severity", "critical"));

        assert!(parse_filter_matcher("justtext").is_err());
        assert!(parse_filter_matcher(r#"=~"x""#).is_err());
    }

    #[test]
    fn test_rewrite_filter_params() {
        let mut req = ProxyRequest::new(
            Method::GET,
            "/api/v2/silences?filter=alertname%3D%22Watchdog%22&filter=namespace%3D%22evil%22",
            HeaderMap::new(),
            Vec::new(),
        );
        let enforced = Matcher::new(MatchOp::Equal, "namespace", "default");
        rewrite_filter_params(&mut req, "namespace", &enforced).unwrap();

        let filters = req.query_values("filter");
        assert_eq!(
            filters,
            vec![r#"namespace="default""#, r#"alertname="Watchdog""#]
        );
    }

    #[test]
    fn test_rewrite_filter_params_bad_filter() {
        let mut req = ProxyRequest::new(
            Method::GET,
            "/api/v2/silences?filter=%3D%3Dbroken",
            HeaderMap::new(),
            Vec::new(),
        );
        let enforced = Matcher::new(MatchOp::Equal, "namespace", "default");
        assert!(rewrite_filter_params(&mut req, "namespace", &enforced).is_err());
    }

    #[test]
    fn test_filter_silences() {
        let body = serde_json::to_vec(&json!([
            {
                "id": "s1",
                "matchers": [
                    {"name": "namespace", "value": "default", "isRegex": true, "isEqual": true},
                    {"name": "alertname", "value": "A", "isRegex": false, "isEqual": true}
                ],
                "status": {"state": "active"}
            },
            {
                "id": "s2",
                "matchers": [
                    {"name": "namespace", "value": "other", "isRegex": true, "isEqual": true}
                ],
                "status": {"state": "active"}
            }
        ]))
        .unwrap();

        let out = filter_silences(&body, "namespace", "default").unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let list = v.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], "s1");
        assert_eq!(list[0]["status"]["state"], "active");
    }

    #[test]
    fn test_filter_silences_bad_body() {
        assert_eq!(
            filter_silences(b"<html>", "namespace", "default")
                .unwrap_err()
                .status,
            http::StatusCode::BAD_GATEWAY
        );
    }
}
