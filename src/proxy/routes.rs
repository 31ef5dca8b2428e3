//! Route dispatch: maps `{method, path}` to the enforcement pipeline and
//! orchestrates extract, rewrite, forward, and response filtering.

use anyhow::{bail, Result};
use http::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, StatusCode};
use std::collections::HashSet;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::enforce::{rewrite_matchers, tenant_matcher, EnforceError, PromqlEnforcer};
use super::http::{
    content_length, is_chunked, stream_body_chunked, stream_body_fixed, write_api_error,
    write_response, ProxyRequest,
};
use super::response::{modify_api_response, ApiError};
use super::rules::{filter_alerts, filter_rules};
use super::silences::{
    filter_silences, has_tenant_matcher, inject_silence_matcher, matcher_value,
    rewrite_filter_params, PostableSilence,
};
use super::upstream::{read_response_body, read_response_head};
use super::ProxyState;
use crate::promql::Matcher;

const QUERY_PARAM: &str = "query";
const MATCHERS_PARAM: &str = "match[]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    /// PromQL enforcement on the `query` parameter.
    Query,
    /// `match[]` rewriting (federate, series, labels APIs).
    MatchRewrite,
    /// Rules API: optional request-side `match[]` rewrite plus response filter.
    Rules,
    /// Alerts v1 API: response filter only.
    AlertsV1,
    /// Alertmanager silences: filter rewrite + response filter on GET,
    /// write guard on POST.
    Silences,
    /// Alertmanager silence deletion guard.
    SilenceDelete,
    /// Alertmanager alert listings: filter rewrite only.
    AlertsV2,
}

struct Route {
    name: &'static str,
    methods: &'static [Method],
    handler: Handler,
}

const GET: &[Method] = &[Method::GET];
const GET_POST: &[Method] = &[Method::GET, Method::POST];
const DELETE: &[Method] = &[Method::DELETE];

fn find_route(path: &str, enable_label_apis: bool) -> Option<Route> {
    let r = |name, methods, handler| {
        Some(Route {
            name,
            methods,
            handler,
        })
    };
    match path {
        "/federate" => r("federate", GET, Handler::MatchRewrite),
        "/api/v1/query" => r("query", GET_POST, Handler::Query),
        "/api/v1/query_range" => r("query_range", GET_POST, Handler::Query),
        "/api/v1/query_exemplars" => r("query_exemplars", GET_POST, Handler::Query),
        "/api/v1/series" => r("series", GET_POST, Handler::MatchRewrite),
        "/api/v1/rules" => r("rules", GET, Handler::Rules),
        "/api/v1/alerts" => r("alerts", GET, Handler::AlertsV1),
        "/api/v1/labels" if enable_label_apis => r("labels", GET_POST, Handler::MatchRewrite),
        "/api/v2/silences" | "/api/v2/silences/" => r("silences", GET_POST, Handler::Silences),
        "/api/v2/alerts" | "/api/v2/alerts/groups" => r("alerts_v2", GET, Handler::AlertsV2),
        p if p.starts_with("/api/v2/silence/") => r("silence", DELETE, Handler::SilenceDelete),
        p if enable_label_apis
            && p.starts_with("/api/v1/label/")
            && p.ends_with("/values") =>
        {
            r("label_values", GET, Handler::MatchRewrite)
        }
        _ => None,
    }
}

/// Validate the passthrough allow-list once at startup.
pub fn validate_passthrough_paths(
    paths: &[String],
    enable_label_apis: bool,
) -> Result<HashSet<String>> {
    let mut set = HashSet::new();
    for path in paths {
        if !path.starts_with('/') || path.contains('?') || path.contains('#') {
            bail!("passthrough path {:?} is not a valid URI path", path);
        }
        if path == "/" {
            bail!("passthrough path {:?} is not allowed", path);
        }
        if path == "/healthz" || find_route(path, enable_label_apis).is_some() {
            bail!(
                "passthrough path {:?} would shadow an enforced route",
                path
            );
        }
        if !set.insert(path.clone()) {
            bail!("duplicated passthrough path {:?}", path);
        }
    }
    Ok(set)
}

/// Post-response filters, applied only to 200 responses.
#[derive(Debug, Clone, Copy)]
enum ResponseFilter {
    Rules,
    Alerts,
    Silences,
}

/// Handle one request end to end, writing exactly one response. Returns
/// `false` when the client connection must be closed afterwards (the relayed
/// response had no length framing).
pub async fn handle<W: AsyncWrite + Unpin>(
    state: &ProxyState,
    req: ProxyRequest,
    writer: &mut W,
    client_addr: &str,
) -> Result<bool> {
    let method = req.method.clone();
    let path = req.path.clone();

    let (route, status, keep_alive) = dispatch(state, req, writer, client_addr).await?;
    state
        .metrics
        .requests_total
        .with_label_values(&[route, method.as_str(), &status.to_string()])
        .inc();
    info!(method = %method, path = %path, status, route, "handled request");
    Ok(keep_alive)
}

async fn respond_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &ApiError) -> Result<u16> {
    debug!(status = err.status.as_u16(), error = %err.message, "rejecting request");
    write_api_error(writer, err).await?;
    Ok(err.status.as_u16())
}

async fn dispatch<W: AsyncWrite + Unpin>(
    state: &ProxyState,
    mut req: ProxyRequest,
    writer: &mut W,
    client_addr: &str,
) -> Result<(&'static str, u16, bool)> {
    // Health checks never reach the upstream.
    if req.path == "/healthz" {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        write_response(writer, StatusCode::OK, &headers, b"OK").await?;
        return Ok(("healthz", 200, true));
    }

    // Passthrough paths skip enforcement entirely, tenant extraction
    // included.
    if state.passthrough.contains(&req.path) {
        let (status, keep_alive) = forward(state, &req, None, &[], writer, client_addr).await?;
        return Ok(("passthrough", status, keep_alive));
    }

    let Some(route) = find_route(&req.path, state.cfg.enable_label_apis) else {
        let status = respond_error(writer, &ApiError::not_found()).await?;
        return Ok(("unknown", status, true));
    };
    // Unknown methods on known paths are a 404, like the upstream behaves.
    if !route.methods.contains(&req.method) {
        let status = respond_error(writer, &ApiError::not_found()).await?;
        return Ok((route.name, status, true));
    }

    let values = match state.extractor.extract(&mut req) {
        Ok(values) => values,
        Err(e) => {
            let status = respond_error(writer, &e).await?;
            return Ok((route.name, status, true));
        }
    };
    let matcher = match tenant_matcher(&state.cfg.label, &values, state.cfg.regex_match) {
        Ok(m) => m,
        Err(e) => {
            let status = respond_error(writer, &enforce_to_api_error(e)).await?;
            return Ok((route.name, status, true));
        }
    };

    let prepared: Result<Option<ResponseFilter>, ApiError> = match route.handler {
        Handler::Query => rewrite_query(
            &mut req,
            &matcher,
            state.cfg.error_on_replace,
            state.cfg.parser_options,
        )
        .map(|_| None),
        Handler::MatchRewrite => rewrite_match_params(&mut req, &matcher).map(|_| None),
        Handler::Rules => {
            let res = if state.cfg.label_matchers_for_rules_api {
                rewrite_match_params(&mut req, &matcher)
            } else {
                Ok(())
            };
            res.map(|_| Some(ResponseFilter::Rules))
        }
        Handler::AlertsV1 => Ok(Some(ResponseFilter::Alerts)),
        Handler::AlertsV2 => {
            rewrite_filter_params(&mut req, &state.cfg.label, &matcher).map(|_| None)
        }
        Handler::Silences if req.method == Method::GET => {
            rewrite_filter_params(&mut req, &state.cfg.label, &matcher)
                .map(|_| Some(ResponseFilter::Silences))
        }
        Handler::Silences => prepare_silence_post(state, &mut req, &values)
            .await
            .map(|_| None),
        Handler::SilenceDelete => prepare_silence_delete(state, &mut req, &values)
            .await
            .map(|_| None),
    };

    let filter = match prepared {
        Ok(filter) => filter,
        Err(e) => {
            let status = respond_error(writer, &e).await?;
            return Ok((route.name, status, true));
        }
    };

    let (status, keep_alive) = forward(state, &req, filter, &values, writer, client_addr).await?;
    Ok((route.name, status, keep_alive))
}

fn enforce_to_api_error(err: EnforceError) -> ApiError {
    ApiError::bad_request(err.to_string())
}

/// Enforce the matcher on the `query` parameter, in the URL query string
/// and, for POST form bodies, in the body as well.
fn rewrite_query(
    req: &mut ProxyRequest,
    matcher: &Matcher,
    error_on_replace: bool,
    options: crate::promql::Options,
) -> Result<(), ApiError> {
    let enforcer = PromqlEnforcer::new(matcher.clone(), error_on_replace, options);

    if let Some(q) = req.query_values(QUERY_PARAM).first() {
        if !q.is_empty() {
            let rewritten = enforcer.enforce(q).map_err(enforce_to_api_error)?;
            req.set_query_value(QUERY_PARAM, rewritten);
        }
    }

    if req.has_form_body() {
        let mut pairs = req.form_pairs();
        let original = pairs
            .iter()
            .find(|(k, v)| k == QUERY_PARAM && !v.is_empty())
            .map(|(_, v)| v.clone());
        if let Some(q) = original {
            let rewritten = enforcer.enforce(&q).map_err(enforce_to_api_error)?;
            pairs.retain(|(k, _)| k != QUERY_PARAM);
            pairs.push((QUERY_PARAM.to_string(), rewritten));
            req.set_form(&pairs);
        }
    }

    Ok(())
}

/// Inject the matcher into every `match[]` selector, synthesizing one when
/// none is present. Applies to the URL query and, for POST form bodies, to
/// the body as well.
fn rewrite_match_params(req: &mut ProxyRequest, matcher: &Matcher) -> Result<(), ApiError> {
    let current = req.query_values(MATCHERS_PARAM);
    let rewritten = rewrite_matchers(&current, matcher).map_err(enforce_to_api_error)?;
    req.set_query_values(MATCHERS_PARAM, rewritten);

    if req.has_form_body() {
        let mut pairs = req.form_pairs();
        let current: Vec<String> = pairs
            .iter()
            .filter(|(k, _)| k == MATCHERS_PARAM)
            .map(|(_, v)| v.clone())
            .collect();
        let rewritten = rewrite_matchers(&current, matcher).map_err(enforce_to_api_error)?;
        pairs.retain(|(k, _)| k != MATCHERS_PARAM);
        pairs.extend(
            rewritten
                .into_iter()
                .map(|v| (MATCHERS_PARAM.to_string(), v)),
        );
        req.set_form(&pairs);
    }

    Ok(())
}

/// Guard a silence create/update: verify tenant ownership of the target
/// silence and inject the enforced matcher into the submitted body.
async fn prepare_silence_post(
    state: &ProxyState,
    req: &mut ProxyRequest,
    values: &[String],
) -> Result<(), ApiError> {
    check_silence_write_supported(state, values)?;

    let mut silence: PostableSilence = serde_json::from_slice(&req.body)
        .map_err(|e| ApiError::bad_request(format!("bad request: can't decode silence: {}", e)))?;

    let expected = matcher_value(values, state.cfg.regex_match);

    if !silence.id.is_empty() {
        // Updating an existing silence: the target must already belong to
        // the tenant.
        let existing = state.upstream.get_silence(&silence.id).await?;
        if !has_tenant_matcher(&existing.matchers, &state.cfg.label, &expected) {
            return Err(ApiError::forbidden());
        }
    }

    inject_silence_matcher(&mut silence, &state.cfg.label, &expected)?;

    let body = serde_json::to_vec(&silence)
        .map_err(|e| ApiError::bad_gateway(format!("can't encode silence: {}", e)))?;
    req.set_body(body);
    req.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    req.query.clear();
    Ok(())
}

/// Guard a silence deletion: only silences scoped to the tenant may go.
async fn prepare_silence_delete(
    state: &ProxyState,
    req: &mut ProxyRequest,
    values: &[String],
) -> Result<(), ApiError> {
    check_silence_write_supported(state, values)?;

    let id = req
        .path
        .strip_prefix("/api/v2/silence/")
        .unwrap_or_default();
    if id.is_empty() {
        return Err(ApiError::bad_request("bad request: missing silence ID"));
    }

    let existing = state.upstream.get_silence(id).await?;
    let expected = matcher_value(values, state.cfg.regex_match);
    if !has_tenant_matcher(&existing.matchers, &state.cfg.label, &expected) {
        return Err(ApiError::forbidden());
    }

    req.query.clear();
    Ok(())
}

fn check_silence_write_supported(state: &ProxyState, values: &[String]) -> Result<(), ApiError> {
    if state.cfg.regex_match {
        return Err(ApiError::not_implemented(
            "regex-match mode is not supported for silence operations",
        ));
    }
    if values.len() > 1 {
        return Err(ApiError::unprocessable(
            "multiple tenant values are not supported for silence operations",
        ));
    }
    Ok(())
}

/// Forward the request upstream and relay the response. Filtered responses
/// are buffered, rewritten, and re-framed; everything else streams through.
/// Returns the relayed status and whether the client connection can be kept
/// alive.
async fn forward<W: AsyncWrite + Unpin>(
    state: &ProxyState,
    req: &ProxyRequest,
    filter: Option<ResponseFilter>,
    values: &[String],
    writer: &mut W,
    client_addr: &str,
) -> Result<(u16, bool)> {
    let mut upstream = match state.upstream.start_request(req, Some(client_addr)).await {
        Ok(r) => r,
        Err(e) => return Ok((respond_error(writer, &e).await?, true)),
    };
    let head = match read_response_head(&mut upstream).await {
        Ok(h) => h,
        Err(e) => return Ok((respond_error(writer, &e).await?, true)),
    };
    let status = head.status;

    // Only successful responses are filtered; errors pass through verbatim.
    if let (Some(filter), StatusCode::OK) = (filter, status) {
        let raw = match read_response_body(&mut upstream, &head).await {
            Ok(b) => b,
            Err(e) => return Ok((respond_error(writer, &e).await?, true)),
        };
        let decoded = super::http::decompress_gzip_if_needed(&head.headers, &raw);
        let was_gzip = decoded.is_some();
        let body = decoded.unwrap_or(raw);

        let filtered = match apply_filter(filter, &body, state, values) {
            Ok(b) => b,
            Err(e) => return Ok((respond_error(writer, &e).await?, true)),
        };

        let mut headers = head.headers.clone();
        if was_gzip {
            headers.remove(CONTENT_ENCODING);
        }
        write_response(writer, status, &headers, &filtered).await?;
        return Ok((status.as_u16(), true));
    }

    // Stream the response through, preserving its framing. Without any
    // framing the upstream signals the end by closing (the upstream leg is
    // Connection: close), so the client connection has to close too.
    let fixed = content_length(&head.headers);
    let chunked = is_chunked(&head.headers);
    let eof_framed = fixed.is_none() && !chunked;

    writer
        .write_all(&encode_passthrough_head(&head, eof_framed))
        .await?;
    writer.flush().await?;

    if let Some(len) = fixed {
        stream_body_fixed(&mut upstream, writer, len).await?;
    } else if chunked {
        stream_body_chunked(&mut upstream, writer).await?;
    } else {
        tokio::io::copy(&mut upstream, writer).await?;
        writer.flush().await?;
    }

    Ok((status.as_u16(), !eof_framed))
}

fn encode_passthrough_head(head: &super::http::ResponseHead, close: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            head.status.as_u16(),
            head.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in &head.headers {
        if name == http::header::CONNECTION || name.as_str() == "keep-alive" {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if close {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn apply_filter(
    filter: ResponseFilter,
    body: &[u8],
    state: &ProxyState,
    values: &[String],
) -> Result<Vec<u8>, ApiError> {
    let label = &state.cfg.label;
    match filter {
        ResponseFilter::Rules => modify_api_response(body, |data| {
            filter_rules(data, label, values, state.cfg.rules_with_active_alerts)
        }),
        ResponseFilter::Alerts => {
            modify_api_response(body, |data| filter_alerts(data, label, values))
        }
        ResponseFilter::Silences => {
            filter_silences(body, label, &matcher_value(values, state.cfg.regex_match))
        }
    }
}
