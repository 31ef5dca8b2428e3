//! Shared test infrastructure for the integration tests.
//!
//! Provides a mock Prometheus/Alertmanager upstream (axum) that records
//! every request it receives, plus a helper that spawns the proxy binary
//! with a given flag set and waits for it to become ready.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;

/// A request observed by the mock upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

#[derive(Clone, Default)]
pub struct UpstreamState {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl UpstreamState {
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests for a path, as `(method, query, body)` tuples.
    pub fn requests_for(&self, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    fn record(&self, method: &str, path: &str, query: &str, body: &str) {
        self.requests.lock().unwrap().push(Recorded {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            body: body.to_string(),
        });
    }
}

fn success_envelope() -> serde_json::Value {
    json!({"status": "success", "data": {"resultType": "vector", "result": []}})
}

pub fn rules_fixture() -> serde_json::Value {
    json!({
        "status": "success",
        "data": {
            "groups": [
                {
                    "name": "group1",
                    "file": "rules1.yml",
                    "interval": 60.0,
                    "rules": [
                        {
                            "type": "recording",
                            "name": "metric1",
                            "query": "vector(1)",
                            "labels": {"namespace": "ns1"},
                            "health": "ok"
                        },
                        {
                            "type": "alerting",
                            "name": "Alert1",
                            "query": "metric1 == 0",
                            "duration": 0.0,
                            "labels": {"namespace": "ns1"},
                            "annotations": {},
                            "alerts": [],
                            "state": "inactive",
                            "health": "ok"
                        }
                    ]
                },
                {
                    "name": "group2",
                    "file": "rules2.yml",
                    "interval": 60.0,
                    "rules": [
                        {
                            "type": "recording",
                            "name": "metric2",
                            "query": "vector(2)",
                            "labels": {"namespace": "ns2"},
                            "health": "ok"
                        }
                    ]
                }
            ]
        }
    })
}

fn alerts_fixture() -> serde_json::Value {
    json!({
        "status": "success",
        "data": {
            "alerts": [
                {"labels": {"alertname": "A1", "namespace": "ns1"}, "annotations": {}, "state": "firing", "value": "1"},
                {"labels": {"alertname": "A2", "namespace": "ns2"}, "annotations": {}, "state": "firing", "value": "1"}
            ]
        }
    })
}

fn silence(id: &str, namespace: &str) -> serde_json::Value {
    json!({
        "id": id,
        "matchers": [
            {"name": "namespace", "value": namespace, "isRegex": true, "isEqual": true},
            {"name": "alertname", "value": "Watchdog", "isRegex": false, "isEqual": true}
        ],
        "startsAt": "2026-08-01T00:00:00Z",
        "endsAt": "2026-08-02T00:00:00Z",
        "createdBy": "tests",
        "comment": "fixture",
        "status": {"state": "active"}
    })
}

/// Silence id owned by the `default` tenant.
pub const OWNED_SILENCE: &str = "11111111-1111-1111-1111-111111111111";
/// Silence id owned by another tenant.
pub const FOREIGN_SILENCE: &str = "22222222-2222-2222-2222-222222222222";

async fn handle_query(
    State(state): State<UpstreamState>,
    RawQuery(query): RawQuery,
    path: &'static str,
    body: Bytes,
) -> Response {
    state.record(
        "GET/POST",
        path,
        query.as_deref().unwrap_or(""),
        &String::from_utf8_lossy(&body),
    );
    axum::Json(success_envelope()).into_response()
}

fn maybe_gzip(headers: &HeaderMap, payload: Vec<u8>) -> Response {
    if headers.contains_key("x-test-gzip") {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).unwrap();
        let gz = enc.finish().unwrap();
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            gz,
        )
            .into_response()
    } else {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            payload,
        )
            .into_response()
    }
}

/// Spawn the mock upstream; returns its base URL, the recorder, and the
/// server task.
pub async fn spawn_upstream() -> (String, UpstreamState, tokio::task::JoinHandle<()>) {
    let state = UpstreamState::default();

    let record_query = |path: &'static str| {
        let handler = move |state: State<UpstreamState>, query: RawQuery, body: Bytes| async move {
            handle_query(state, query, path, body).await
        };
        get(handler.clone()).post(handler)
    };

    let app = Router::new()
        .route("/federate", record_query("/federate"))
        .route("/api/v1/query", record_query("/api/v1/query"))
        .route("/api/v1/query_range", record_query("/api/v1/query_range"))
        .route("/api/v1/series", record_query("/api/v1/series"))
        .route("/api/v1/labels", record_query("/api/v1/labels"))
        .route(
            "/api/v1/rules",
            get(
                |State(state): State<UpstreamState>, RawQuery(q): RawQuery, headers: HeaderMap| async move {
                    state.record("GET", "/api/v1/rules", q.as_deref().unwrap_or(""), "");
                    maybe_gzip(&headers, serde_json::to_vec(&rules_fixture()).unwrap())
                },
            ),
        )
        .route(
            "/api/v1/alerts",
            get(|State(state): State<UpstreamState>| async move {
                state.record("GET", "/api/v1/alerts", "", "");
                axum::Json(alerts_fixture())
            }),
        )
        .route(
            "/api/v2/silences",
            get(
                |State(state): State<UpstreamState>, RawQuery(q): RawQuery| async move {
                    state.record("GET", "/api/v2/silences", q.as_deref().unwrap_or(""), "");
                    axum::Json(json!([
                        silence(OWNED_SILENCE, "default"),
                        silence(FOREIGN_SILENCE, "other"),
                    ]))
                },
            )
            .post(
                |State(state): State<UpstreamState>, body: String| async move {
                    state.record("POST", "/api/v2/silences", "", &body);
                    axum::Json(json!({"silenceID": "33333333-3333-3333-3333-333333333333"}))
                },
            ),
        )
        .route(
            "/api/v2/silence/{id}",
            get(
                |State(state): State<UpstreamState>, Path(id): Path<String>| async move {
                    state.record("GET", &format!("/api/v2/silence/{}", id), "", "");
                    match id.as_str() {
                        OWNED_SILENCE => axum::Json(silence(OWNED_SILENCE, "default")).into_response(),
                        FOREIGN_SILENCE => {
                            axum::Json(silence(FOREIGN_SILENCE, "other")).into_response()
                        }
                        _ => StatusCode::NOT_FOUND.into_response(),
                    }
                },
            )
            .delete(
                |State(state): State<UpstreamState>, Path(id): Path<String>| async move {
                    state.record("DELETE", &format!("/api/v2/silence/{}", id), "", "");
                    StatusCode::OK.into_response()
                },
            ),
        )
        .route(
            "/api1",
            get(
                |State(state): State<UpstreamState>, RawQuery(q): RawQuery| async move {
                    state.record("GET", "/api1", q.as_deref().unwrap_or(""), "");
                    "passthrough ok"
                },
            ),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });

    (format!("http://{}", addr), state, handle)
}

/// Find an available port for the proxy to listen on.
pub async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// A proxy process under test.
pub struct Proxy {
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the proxy binary with the given extra flags and wait for its
/// health endpoint to come up.
pub async fn spawn_proxy(upstream_url: &str, extra_args: &[&str]) -> Proxy {
    let port = find_available_port().await;
    let listen = format!("127.0.0.1:{}", port);
    let base_url = format!("http://{}", listen);

    let mut args = vec![
        "--insecure-listen-address".to_string(),
        listen,
        "--upstream".to_string(),
        upstream_url.to_string(),
        "--label".to_string(),
        "namespace".to_string(),
    ];
    args.extend(extra_args.iter().map(|s| s.to_string()));

    let handle = tokio::spawn(async move {
        let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_prom-label-proxy"))
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await;
        let _ = status;
    });

    // Wait for readiness.
    let client = reqwest::Client::new();
    let health = format!("{}/healthz", base_url);
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(resp) = client.get(&health).send().await {
            if resp.status().is_success() {
                return Proxy { base_url, handle };
            }
        }
    }
    panic!("proxy did not become ready");
}
