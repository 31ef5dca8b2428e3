//! Command-line flags and validated runtime configuration.

use anyhow::{bail, Context, Result};
use clap::Parser;
use http::HeaderName;
use url::Url;

use crate::promql;
use crate::proxy::extract::Extractor;

#[derive(Parser, Debug)]
#[command(
    name = "prom-label-proxy",
    about = "A reverse proxy that enforces a tenant label on Prometheus and Alertmanager APIs"
)]
pub struct Args {
    /// The address the proxy HTTP server should listen on.
    #[arg(long = "insecure-listen-address", required = true)]
    pub insecure_listen_address: String,

    /// The address the internal HTTP server (metrics) should listen on.
    #[arg(long)]
    pub internal_listen_address: Option<String>,

    /// The upstream URL to proxy to.
    #[arg(long, required = true)]
    pub upstream: String,

    /// The label name to enforce in all proxied PromQL queries.
    #[arg(long, required = true)]
    pub label: String,

    /// A fixed label value to enforce in all proxied PromQL queries. Can be
    /// repeated, in which case the proxy enforces the union of values. At
    /// most one of --query-param, --header-name and --label-value may be
    /// used.
    #[arg(long = "label-value")]
    pub label_values: Vec<String>,

    /// Name of the HTTP parameter that contains the tenant value. Defaults
    /// to the value of --label if no other extractor is configured.
    #[arg(long)]
    pub query_param: Option<String>,

    /// Name of the HTTP header that contains the tenant value.
    #[arg(long)]
    pub header_name: Option<String>,

    /// Parse the tenant header value as a comma-separated list.
    #[arg(long)]
    pub header_uses_list_syntax: bool,

    /// Allow the label APIs /api/v1/labels and /api/v1/label/<name>/values.
    /// The injected matcher has no effect on upstreams that do not support
    /// selectors on these endpoints.
    #[arg(long)]
    pub enable_label_apis: bool,

    /// Comma-delimited allow-list of exact paths forwarded upstream without
    /// enforcement. Enforced API endpoints cannot be overridden.
    #[arg(long)]
    pub unsafe_passthrough_paths: Option<String>,

    /// Return 400 when a query contains a label matcher that differs from
    /// the one the proxy would inject.
    #[arg(long)]
    pub error_on_replace: bool,

    /// Treat the tenant value as a regular expression (single value only).
    #[arg(long)]
    pub regex_match: bool,

    /// Keep alerting rules whose active alerts match the tenant even when
    /// the rule's own labels do not.
    #[arg(long)]
    pub rules_with_active_alerts: bool,

    /// Also rewrite /api/v1/rules requests with match[] label matchers.
    #[arg(long)]
    pub enable_label_matchers_for_rules_api: bool,

    /// Skip validation of the upstream's TLS certificate.
    #[arg(long)]
    pub insecure_skip_verify: bool,

    /// Allow arithmetic on durations in PromQL expressions.
    #[arg(long)]
    pub enable_promql_duration_expression_parsing: bool,

    /// Allow experimental functions in PromQL expressions.
    #[arg(long)]
    pub enable_promql_experimental_functions: bool,

    /// Output logs as JSON (default: human-readable).
    #[arg(long)]
    pub json: bool,
}

/// Validated runtime configuration, immutable after startup.
#[derive(Debug)]
pub struct Config {
    pub listen_address: String,
    pub internal_listen_address: Option<String>,
    pub upstream: Url,
    pub label: String,
    extractor: Extractor,
    pub enable_label_apis: bool,
    pub passthrough_paths: Vec<String>,
    pub error_on_replace: bool,
    pub regex_match: bool,
    pub rules_with_active_alerts: bool,
    pub label_matchers_for_rules_api: bool,
    pub insecure_skip_verify: bool,
    pub parser_options: promql::Options,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.label.is_empty() {
            bail!("--label cannot be empty");
        }

        let configured = [
            !args.label_values.is_empty(),
            args.query_param.is_some(),
            args.header_name.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if configured > 1 {
            bail!("at most one of --query-param, --header-name and --label-value must be set");
        }

        let extractor = if !args.label_values.is_empty() {
            Extractor::Static(args.label_values.clone())
        } else if let Some(header) = &args.header_name {
            let name: HeaderName = header
                .parse()
                .with_context(|| format!("invalid header name {:?}", header))?;
            Extractor::Header {
                name,
                list_syntax: args.header_uses_list_syntax,
            }
        } else {
            // An unset query parameter falls back to the label name itself.
            Extractor::Form {
                param: args
                    .query_param
                    .clone()
                    .unwrap_or_else(|| args.label.clone()),
            }
        };

        if args.regex_match && !args.label_values.is_empty() {
            if args.label_values.len() > 1 {
                bail!("regex-match mode accepts only one label value");
            }
            let pattern = &args.label_values[0];
            let re = regex::Regex::new(&format!("^(?:{})$", pattern))
                .with_context(|| format!("invalid regular expression {:?}", pattern))?;
            if re.is_match("") {
                bail!("the label value regular expression must not match the empty string");
            }
        }

        let upstream = Url::parse(&args.upstream)
            .with_context(|| format!("failed to parse upstream URL {:?}", args.upstream))?;
        if upstream.scheme() != "http" && upstream.scheme() != "https" {
            bail!(
                "invalid scheme for upstream URL {:?}, only 'http' and 'https' are supported",
                args.upstream
            );
        }

        let passthrough_paths = args
            .unsafe_passthrough_paths
            .as_deref()
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            listen_address: args.insecure_listen_address,
            internal_listen_address: args.internal_listen_address,
            upstream,
            label: args.label,
            extractor,
            enable_label_apis: args.enable_label_apis,
            passthrough_paths,
            error_on_replace: args.error_on_replace,
            regex_match: args.regex_match,
            rules_with_active_alerts: args.rules_with_active_alerts,
            label_matchers_for_rules_api: args.enable_label_matchers_for_rules_api,
            insecure_skip_verify: args.insecure_skip_verify,
            parser_options: promql::Options {
                duration_expressions: args.enable_promql_duration_expression_parsing,
                experimental_functions: args.enable_promql_experimental_functions,
            },
        })
    }

    pub fn extractor(&self) -> Extractor {
        self.extractor.clone()
    }
}
