//! End-to-end tests driving the proxy binary against a mock upstream.

mod common;

use common::{
    rules_fixture, spawn_proxy, spawn_upstream, Recorded, FOREIGN_SILENCE, OWNED_SILENCE,
};
use serde_json::{json, Value};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Decode the values of a parameter from a raw query string.
fn param_values(raw_query: &str, name: &str) -> Vec<String> {
    url::form_urlencoded::parse(raw_query.as_bytes())
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .collect()
}

fn single_request(requests: &[Recorded]) -> Recorded {
    assert_eq!(requests.len(), 1, "expected exactly one upstream request");
    requests[0].clone()
}

#[tokio::test]
async fn query_rewrite_with_multiple_static_values() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(
        &upstream_url,
        &["--label-value", "default", "--label-value", "second"],
    )
    .await;

    let resp = client()
        .get(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", r#"up{namespace="other"}"#)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v1/query"));
    assert_eq!(
        param_values(&req.query, "query"),
        vec![r#"up{namespace=~"default|second"}"#]
    );
}

#[tokio::test]
async fn series_escapes_regex_metacharacters_in_tenant_values() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .get(format!("{}/api/v1/series", proxy.base_url))
        .query(&[("namespace", "default"), ("namespace", "some|thing")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v1/series"));
    assert_eq!(
        param_values(&req.query, "match[]"),
        vec![r#"{namespace=~"default|some\\|thing"}"#]
    );
    // The proxy's own tenant parameter never reaches the upstream.
    assert!(param_values(&req.query, "namespace").is_empty());
}

#[tokio::test]
async fn federate_appends_to_existing_matchers() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &["--label-value", "default"]).await;

    let resp = client()
        .get(format!("{}/federate", proxy.base_url))
        .query(&[
            ("match[]", r#"{namespace=~"foo|default"}"#),
            ("match[]", "up"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/federate"));
    assert_eq!(
        param_values(&req.query, "match[]"),
        vec![
            r#"{namespace=~"foo|default",namespace="default"}"#,
            r#"{__name__="up",namespace="default"}"#,
        ]
    );
}

#[tokio::test]
async fn post_query_rewrites_form_body_independently() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .post(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", "up")])
        .form(&[("query", "foo"), ("namespace", "default")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v1/query"));
    assert_eq!(
        param_values(&req.query, "query"),
        vec![r#"up{namespace="default"}"#]
    );
    assert_eq!(
        param_values(&req.body, "query"),
        vec![r#"foo{namespace="default"}"#]
    );
    assert!(param_values(&req.body, "namespace").is_empty());
}

#[tokio::test]
async fn rules_filter_drops_foreign_groups() {
    let (upstream_url, _upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .get(format!("{}/api/v1/rules", proxy.base_url))
        .query(&[("namespace", "ns1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let content_length: usize = resp
        .headers()
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(content_length, body.len());

    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "success");
    let groups = v["data"]["groups"].as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["file"], "rules1.yml");

    // Sanity check against the fixture: the other group was really there.
    let fixture_groups = rules_fixture()["data"]["groups"].as_array().unwrap().len();
    assert_eq!(fixture_groups, 2);
}

#[tokio::test]
async fn rules_filter_handles_gzip_upstream() {
    let (upstream_url, _upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .get(format!("{}/api/v1/rules", proxy.base_url))
        .query(&[("namespace", "ns1")])
        .header("x-test-gzip", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // The rewritten body is served uncompressed.
    assert!(resp.headers().get("content-encoding").is_none());

    let content_length: usize = resp
        .headers()
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(content_length, body.len());

    let v: Value = serde_json::from_slice(&body).unwrap();
    let groups = v["data"]["groups"].as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["file"], "rules1.yml");
}

#[tokio::test]
async fn alerts_filter_keeps_only_tenant_alerts() {
    let (upstream_url, _upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let v: Value = client()
        .get(format!("{}/api/v1/alerts", proxy.base_url))
        .query(&[("namespace", "ns1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let alerts = v["data"]["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["labels"]["alertname"], "A1");
}

#[tokio::test]
async fn silences_get_rewrites_filter_and_prunes_response() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .get(format!("{}/api/v2/silences", proxy.base_url))
        .query(&[
            ("namespace", "default"),
            ("filter", r#"alertname="Watchdog""#),
            ("filter", r#"namespace="evil""#),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v2/silences"));
    assert_eq!(
        param_values(&req.query, "filter"),
        vec![r#"namespace="default""#, r#"alertname="Watchdog""#]
    );

    let v: Value = resp.json().await.unwrap();
    let silences = v.as_array().unwrap();
    assert_eq!(silences.len(), 1);
    assert_eq!(silences[0]["id"], OWNED_SILENCE);
}

#[tokio::test]
async fn silence_post_injects_tenant_matcher() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .post(format!("{}/api/v2/silences", proxy.base_url))
        .query(&[("namespace", "default")])
        .json(&json!({
            "matchers": [
                {"name": "alertname", "value": "Watchdog", "isRegex": false, "isEqual": true}
            ],
            "startsAt": "2026-08-01T00:00:00Z",
            "endsAt": "2026-08-02T00:00:00Z",
            "createdBy": "tests",
            "comment": "maintenance"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v2/silences"));
    assert_eq!(req.method, "POST");
    let sent: Value = serde_json::from_str(&req.body).unwrap();
    let matchers = sent["matchers"].as_array().unwrap();
    assert_eq!(matchers.len(), 2);
    assert_eq!(matchers[0]["name"], "namespace");
    assert_eq!(matchers[0]["value"], "default");
    assert_eq!(matchers[0]["isRegex"], true);
    assert_eq!(matchers[1]["name"], "alertname");
    assert_eq!(sent["comment"], "maintenance");
}

#[tokio::test]
async fn silence_post_rejects_tenant_only_matchers() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .post(format!("{}/api/v2/silences", proxy.base_url))
        .query(&[("namespace", "default")])
        .json(&json!({"matchers": [], "comment": "too broad"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(upstream.requests_for("/api/v2/silences").is_empty());
}

#[tokio::test]
async fn silence_update_of_foreign_silence_is_forbidden() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .post(format!("{}/api/v2/silences", proxy.base_url))
        .query(&[("namespace", "default")])
        .json(&json!({
            "id": FOREIGN_SILENCE,
            "matchers": [
                {"name": "alertname", "value": "Watchdog", "isRegex": false, "isEqual": true}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // The proxy looked the silence up but never issued the POST.
    assert_eq!(
        upstream
            .requests_for(&format!("/api/v2/silence/{}", FOREIGN_SILENCE))
            .len(),
        1
    );
    assert!(upstream.requests_for("/api/v2/silences").is_empty());
}

#[tokio::test]
async fn silence_delete_guards_by_tenant() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &[]).await;

    let resp = client()
        .delete(format!(
            "{}/api/v2/silence/{}",
            proxy.base_url, OWNED_SILENCE
        ))
        .query(&[("namespace", "default")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let owned = upstream.requests_for(&format!("/api/v2/silence/{}", OWNED_SILENCE));
    assert!(owned.iter().any(|r| r.method == "DELETE"));

    let resp = client()
        .delete(format!(
            "{}/api/v2/silence/{}",
            proxy.base_url, FOREIGN_SILENCE
        ))
        .query(&[("namespace", "default")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let foreign = upstream.requests_for(&format!("/api/v2/silence/{}", FOREIGN_SILENCE));
    assert!(foreign.iter().all(|r| r.method != "DELETE"));
}

#[tokio::test]
async fn silence_writes_reject_multi_value_and_regex_tenants() {
    let (upstream_url, _upstream, _guard) = spawn_upstream().await;

    let proxy = spawn_proxy(
        &upstream_url,
        &["--label-value", "default", "--label-value", "second"],
    )
    .await;
    let resp = client()
        .post(format!("{}/api/v2/silences", proxy.base_url))
        .json(&json!({"matchers": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    drop(proxy);

    let proxy = spawn_proxy(
        &upstream_url,
        &["--regex-match", "--label-value", "tenant-.+"],
    )
    .await;
    let resp = client()
        .post(format!("{}/api/v2/silences", proxy.base_url))
        .json(&json!({"matchers": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 501);
}

#[tokio::test]
async fn error_on_replace_rejects_conflicting_matcher() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(
        &upstream_url,
        &["--label-value", "default", "--error-on-replace"],
    )
    .await;

    let resp = client()
        .get(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", r#"up{namespace="other"}"#)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["status"], "error");
    assert_eq!(v["errorType"], "prom-label-proxy");
    assert!(v["error"].as_str().unwrap().contains("conflict"));

    // Nothing was forwarded.
    assert!(upstream.requests_for("/api/v1/query").is_empty());
}

#[tokio::test]
async fn passthrough_coexists_with_enforcement() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &["--unsafe-passthrough-paths", "/api1"]).await;

    // The allow-listed path goes through untouched, no tenant required.
    let resp = client()
        .get(format!("{}/api1", proxy.base_url))
        .query(&[("yolo", "ns1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "passthrough ok");
    let req = single_request(&upstream.requests_for("/api1"));
    assert_eq!(param_values(&req.query, "yolo"), vec!["ns1"]);

    // Enforced endpoints still demand a tenant.
    let resp = client()
        .get(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", "up")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["status"], "error");
    assert_eq!(v["errorType"], "prom-label-proxy");
}

#[tokio::test]
async fn header_extractor_with_list_syntax() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(
        &upstream_url,
        &["--header-name", "X-Namespace", "--header-uses-list-syntax"],
    )
    .await;

    let resp = client()
        .get(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", "up")])
        .header("X-Namespace", "default, second")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v1/query"));
    assert_eq!(
        param_values(&req.query, "query"),
        vec![r#"up{namespace=~"default|second"}"#]
    );

    // Missing header is a 400.
    let resp = client()
        .get(format!("{}/api/v1/query", proxy.base_url))
        .query(&[("query", "up")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn label_apis_are_gated() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;

    let proxy = spawn_proxy(&upstream_url, &[]).await;
    let resp = client()
        .get(format!("{}/api/v1/labels", proxy.base_url))
        .query(&[("namespace", "default")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    drop(proxy);

    let proxy = spawn_proxy(&upstream_url, &["--enable-label-apis"]).await;
    let resp = client()
        .get(format!("{}/api/v1/labels", proxy.base_url))
        .query(&[("namespace", "default")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let req = single_request(&upstream.requests_for("/api/v1/labels"));
    assert_eq!(
        param_values(&req.query, "match[]"),
        vec![r#"{namespace="default"}"#]
    );
}

#[tokio::test]
async fn unknown_paths_and_methods_are_not_found() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &["--label-value", "default"]).await;

    let resp = client()
        .get(format!("{}/api/v1/admin/tsdb/snapshot", proxy.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Known path, unsupported method.
    let resp = client()
        .delete(format!("{}/api/v1/query", proxy.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn healthz_never_reaches_upstream() {
    let (upstream_url, upstream, _guard) = spawn_upstream().await;
    let proxy = spawn_proxy(&upstream_url, &["--label-value", "default"]).await;

    let resp = client()
        .get(format!("{}/healthz", proxy.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(upstream.requests().is_empty());
}
