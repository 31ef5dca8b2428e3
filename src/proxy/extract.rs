//! Tenant value extraction.
//!
//! Exactly one extraction mode is active per process. Form mode also strips
//! the tenant parameter from the forwarded request so that the proxy's own
//! parameter never reaches the upstream.

use http::{HeaderName, Method};

use super::http::ProxyRequest;
use super::response::ApiError;

#[derive(Debug, Clone)]
pub enum Extractor {
    /// Fixed values configured at startup. A query parameter with the same
    /// name is ignored, never authoritative.
    Static(Vec<String>),
    /// Named query parameter (and form field for POST bodies).
    Form { param: String },
    /// Named HTTP header, optionally using comma-separated list syntax.
    Header {
        name: HeaderName,
        list_syntax: bool,
    },
}

impl Extractor {
    /// Extract the tenant values for a request, removing the carrier
    /// parameter from the forwarded request where applicable.
    pub fn extract(&self, req: &mut ProxyRequest) -> Result<Vec<String>, ApiError> {
        match self {
            Extractor::Static(values) => Ok(values.clone()),
            Extractor::Form { param } => {
                let mut values = req.query_values(param);
                if req.method == Method::POST && req.has_form_body() {
                    values.extend(
                        req.form_pairs()
                            .into_iter()
                            .filter(|(k, _)| k == param)
                            .map(|(_, v)| v),
                    );
                }
                values.retain(|v| !v.is_empty());
                if values.is_empty() {
                    return Err(ApiError::bad_request(format!(
                        "the {:?} query parameter must be provided",
                        param
                    )));
                }

                // Strip the parameter before the request goes upstream.
                req.remove_query(param);
                if req.method == Method::POST && req.has_form_body() {
                    let pairs: Vec<(String, String)> = req
                        .form_pairs()
                        .into_iter()
                        .filter(|(k, _)| k != param)
                        .collect();
                    req.set_form(&pairs);
                }

                Ok(values)
            }
            Extractor::Header { name, list_syntax } => {
                let mut values: Vec<String> = req
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(str::to_string)
                    .collect();
                if *list_syntax {
                    values = values
                        .iter()
                        .flat_map(|v| v.split(','))
                        .map(|v| v.trim().to_string())
                        .collect();
                }
                values.retain(|v| !v.is_empty());
                if values.is_empty() {
                    return Err(ApiError::bad_request(format!(
                        "missing HTTP header {:?}",
                        name.as_str()
                    )));
                }
                Ok(values)
            }
        }
    }
}
