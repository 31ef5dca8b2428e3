//! Label matcher enforcement for PromQL queries and `match[]` selectors.

use crate::promql::{self, Expr, MatchOp, Matcher, Options};
use std::fmt;

/// Failure modes of the enforcement engine. All of them surface as 400 to
/// the client.
#[derive(Debug)]
pub enum EnforceError {
    /// The input query does not parse.
    QueryParse(promql::ParseError),
    /// A conflicting matcher was found while `error_on_replace` is active.
    IllegalLabelMatcher(String),
    /// Any other enforcement failure.
    EnforceLabel(String),
}

impl fmt::Display for EnforceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforceError::QueryParse(e) => write!(f, "failed to parse query string: {}", e),
            EnforceError::IllegalLabelMatcher(msg) => {
                write!(f, "conflicting label matcher: {}", msg)
            }
            EnforceError::EnforceLabel(msg) => write!(f, "failed to enforce label: {}", msg),
        }
    }
}

impl std::error::Error for EnforceError {}

/// Join tenant values into an alternation pattern, escaping regex
/// metacharacters in each value (`some|thing` becomes `some\|thing`).
pub fn join_label_values(values: &[String]) -> String {
    values
        .iter()
        .map(|v| regex::escape(v))
        .collect::<Vec<_>>()
        .join("|")
}

/// Build the matcher enforced for a tenant value set. A single value yields
/// an equality matcher; multiple values or regex-match mode yield a regex
/// matcher.
pub fn tenant_matcher(
    label: &str,
    values: &[String],
    regex_match: bool,
) -> Result<Matcher, EnforceError> {
    if regex_match {
        if values.len() != 1 {
            return Err(EnforceError::EnforceLabel(
                "only one label value is allowed in regex-match mode".to_string(),
            ));
        }
        return Ok(Matcher::new(MatchOp::Regex, label, values[0].clone()));
    }
    if values.len() == 1 {
        Ok(Matcher::new(MatchOp::Equal, label, values[0].clone()))
    } else {
        Ok(Matcher::new(MatchOp::Regex, label, join_label_values(values)))
    }
}

/// Enforces a label matcher on every selector of a PromQL expression.
pub struct PromqlEnforcer {
    matcher: Matcher,
    error_on_replace: bool,
    options: Options,
}

impl PromqlEnforcer {
    pub fn new(matcher: Matcher, error_on_replace: bool, options: Options) -> Self {
        Self {
            matcher,
            error_on_replace,
            options,
        }
    }

    /// Parse the query, inject the matcher into every vector and matrix
    /// selector, and return the rewritten query text.
    pub fn enforce(&self, query: &str) -> Result<String, EnforceError> {
        let mut expr =
            promql::parse_expr(query, self.options).map_err(EnforceError::QueryParse)?;
        expr.walk_selectors(&mut |vs| {
            let existing = std::mem::take(&mut vs.matchers);
            vs.matchers = enforce_matchers(existing, &self.matcher, self.error_on_replace)?;
            Ok(())
        })?;
        Ok(expr.to_string())
    }
}

/// Apply the enforced matcher to an existing matcher list.
///
/// Same-named matchers are handled by conflict policy:
/// * with `error_on_replace`, any same-named matcher that differs from the
///   enforced one fails the request;
/// * an enforced `=` replaces same-named matchers outright;
/// * an enforced `=~` replaces a same-named equality matcher (the fixed
///   value would dodge the tenant set otherwise) and coexists with other
///   operators;
/// * identical matchers are not duplicated.
///
/// The enforced matcher is always appended.
pub fn enforce_matchers(
    existing: Vec<Matcher>,
    enforced: &Matcher,
    error_on_replace: bool,
) -> Result<Vec<Matcher>, EnforceError> {
    let mut res = Vec::with_capacity(existing.len() + 1);

    for m in existing {
        if m.name == enforced.name {
            if error_on_replace && m != *enforced {
                return Err(EnforceError::IllegalLabelMatcher(format!(
                    "label matcher value ({}) conflicts with injected value ({})",
                    m, enforced
                )));
            }
            if enforced.op == MatchOp::Equal {
                continue;
            }
            if m == *enforced {
                continue;
            }
            if enforced.op == MatchOp::Regex && m.op == MatchOp::Equal {
                continue;
            }
        }
        res.push(m);
    }

    res.push(enforced.clone());
    Ok(res)
}

/// Rewrite a list of series selectors (the `match[]` family), appending the
/// enforced matcher to each. An empty list yields a single synthesized
/// selector carrying only the enforced matcher.
pub fn rewrite_matchers(
    selectors: &[String],
    enforced: &Matcher,
) -> Result<Vec<String>, EnforceError> {
    if selectors.is_empty() {
        return Ok(vec![promql::matchers_to_string(std::slice::from_ref(
            enforced,
        ))]);
    }

    selectors
        .iter()
        .map(|s| {
            let mut matchers = promql::parse_selector(s).map_err(EnforceError::QueryParse)?;
            matchers.push(enforced.clone());
            Ok(promql::matchers_to_string(&matchers))
        })
        .collect()
}
