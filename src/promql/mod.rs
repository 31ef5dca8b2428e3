//! PromQL expression parsing and printing.
//!
//! The proxy needs to rewrite label matchers inside arbitrary PromQL
//! expressions, so it carries its own parser: a lexer, a precedence-climbing
//! expression parser, and an AST whose vector selectors are mutable in place.
//! Printing follows the canonical Prometheus expression printer so that
//! rewritten queries stay readable and stable (matchers inside a selector are
//! printed in sorted order, grouping labels join with `, `).

mod functions;
mod lexer;
mod parser;

pub use parser::{parse_expr, parse_selector, ParseError};

use std::fmt;

/// Parser feature toggles, fixed once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Allow arithmetic on durations inside range and offset positions.
    pub duration_expressions: bool,
    /// Allow functions marked experimental.
    pub experimental_functions: bool,
}

/// Label matching operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        })
    }
}

/// A single label matcher: `name <op> "value"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if is_label_name(&self.name) {
            write!(f, "{}{}{}", self.name, self.op, quote_string(&self.value))
        } else {
            write!(
                f,
                "{}{}{}",
                quote_string(&self.name),
                self.op,
                quote_string(&self.value)
            )
        }
    }
}

/// Render a list of matchers as a series selector, e.g. `{a="b",c=~"d"}`.
pub fn matchers_to_string(matchers: &[Matcher]) -> String {
    let parts: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
    format!("{{{}}}", parts.join(","))
}

/// A duration with millisecond precision, printed in compact `1h30m` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromDuration {
    millis: i64,
}

impl PromDuration {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn as_millis(&self) -> i64 {
        self.millis
    }
}

impl fmt::Display for PromDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ms = self.millis;
        if ms == 0 {
            return f.write_str("0s");
        }
        if ms < 0 {
            f.write_str("-")?;
            ms = -ms;
        }
        const UNITS: &[(i64, &str)] = &[
            (1000 * 60 * 60 * 24 * 365, "y"),
            (1000 * 60 * 60 * 24 * 7, "w"),
            (1000 * 60 * 60 * 24, "d"),
            (1000 * 60 * 60, "h"),
            (1000 * 60, "m"),
            (1000, "s"),
            (1, "ms"),
        ];
        for &(factor, unit) in UNITS {
            let n = ms / factor;
            if n > 0 {
                write!(f, "{}{}", n, unit)?;
                ms -= n * factor;
            }
        }
        Ok(())
    }
}

/// A duration position in an expression. Plain literals outside of the
/// duration-expression feature; full arithmetic when it is enabled.
#[derive(Debug, Clone, PartialEq)]
pub enum DurationExpr {
    Literal(PromDuration),
    /// Bare number, interpreted as seconds.
    Number(f64),
    Paren(Box<DurationExpr>),
    Neg(Box<DurationExpr>),
    Binary {
        op: char,
        lhs: Box<DurationExpr>,
        rhs: Box<DurationExpr>,
    },
}

impl fmt::Display for DurationExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationExpr::Literal(d) => d.fmt(f),
            DurationExpr::Number(n) => f.write_str(&format_number(*n)),
            DurationExpr::Paren(inner) => write!(f, "({})", inner),
            DurationExpr::Neg(inner) => write!(f, "-{}", inner),
            DurationExpr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
        }
    }
}

/// `@` modifier on a selector or subquery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtModifier {
    /// Unix timestamp in seconds.
    Timestamp(f64),
    Start,
    End,
}

impl fmt::Display for AtModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtModifier::Timestamp(t) => write!(f, "@ {:.3}", t),
            AtModifier::Start => f.write_str("@ start()"),
            AtModifier::End => f.write_str("@ end()"),
        }
    }
}

/// Instant vector selector: metric name and/or label matchers.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<Matcher>,
    pub offset: Option<DurationExpr>,
    pub at: Option<AtModifier>,
}

impl VectorSelector {
    fn fmt_base(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if !self.matchers.is_empty() || self.name.is_none() {
            let mut parts: Vec<String> = self.matchers.iter().map(|m| m.to_string()).collect();
            parts.sort();
            write!(f, "{{{}}}", parts.join(","))?;
        }
        Ok(())
    }

    fn fmt_modifiers(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(at) = &self.at {
            write!(f, " {}", at)?;
        }
        if let Some(off) = &self.offset {
            write!(f, " offset {}", off)?;
        }
        Ok(())
    }
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_base(f)?;
        self.fmt_modifiers(f)
    }
}

/// Range vector selector: a vector selector with a `[range]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    pub range: DurationExpr,
}

impl fmt::Display for MatrixSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.selector.fmt_base(f)?;
        write!(f, "[{}]", self.range)?;
        self.selector.fmt_modifiers(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryExpr {
    pub expr: Box<Expr>,
    pub range: DurationExpr,
    pub step: Option<DurationExpr>,
    pub offset: Option<DurationExpr>,
    pub at: Option<AtModifier>,
}

impl fmt::Display for SubqueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:", self.expr, self.range)?;
        if let Some(step) = &self.step {
            step.fmt(f)?;
        }
        f.write_str("]")?;
        if let Some(at) = &self.at {
            write!(f, " {}", at)?;
        }
        if let Some(off) = &self.offset {
            write!(f, " offset {}", off)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: String,
    pub args: Vec<Expr>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.func, args.join(", "))
    }
}

/// Aggregation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Min,
    Max,
    Avg,
    Group,
    Stddev,
    Stdvar,
    Count,
    CountValues,
    Bottomk,
    Topk,
    Quantile,
    Limitk,
    LimitRatio,
}

impl AggOp {
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "sum" => AggOp::Sum,
            "min" => AggOp::Min,
            "max" => AggOp::Max,
            "avg" => AggOp::Avg,
            "group" => AggOp::Group,
            "stddev" => AggOp::Stddev,
            "stdvar" => AggOp::Stdvar,
            "count" => AggOp::Count,
            "count_values" => AggOp::CountValues,
            "bottomk" => AggOp::Bottomk,
            "topk" => AggOp::Topk,
            "quantile" => AggOp::Quantile,
            "limitk" => AggOp::Limitk,
            "limit_ratio" => AggOp::LimitRatio,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggOp::Sum => "sum",
            AggOp::Min => "min",
            AggOp::Max => "max",
            AggOp::Avg => "avg",
            AggOp::Group => "group",
            AggOp::Stddev => "stddev",
            AggOp::Stdvar => "stdvar",
            AggOp::Count => "count",
            AggOp::CountValues => "count_values",
            AggOp::Bottomk => "bottomk",
            AggOp::Topk => "topk",
            AggOp::Quantile => "quantile",
            AggOp::Limitk => "limitk",
            AggOp::LimitRatio => "limit_ratio",
        }
    }

    /// Operators taking a scalar parameter before the inner expression.
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            AggOp::CountValues
                | AggOp::Bottomk
                | AggOp::Topk
                | AggOp::Quantile
                | AggOp::Limitk
                | AggOp::LimitRatio
        )
    }

    /// Operators only available with experimental functions enabled.
    pub fn experimental(&self) -> bool {
        matches!(self, AggOp::Limitk | AggOp::LimitRatio)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: AggOp,
    pub expr: Box<Expr>,
    pub param: Option<Box<Expr>>,
    pub grouping: Vec<String>,
    pub without: bool,
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.as_str())?;
        if self.without {
            write!(f, " without ({}) ", self.grouping.join(", "))?;
        } else if !self.grouping.is_empty() {
            write!(f, " by ({}) ", self.grouping.join(", "))?;
        }
        f.write_str("(")?;
        if let Some(param) = &self.param {
            write!(f, "{}, ", param)?;
        }
        write!(f, "{})", self.expr)
    }
}

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eql,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    Unless,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Atan2 => "atan2",
            BinOp::Eql => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Lte => "<=",
            BinOp::Gte => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Unless => "unless",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eql | BinOp::Neq | BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
}

/// `on`/`ignoring` and `group_left`/`group_right` modifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatching {
    pub on: bool,
    pub labels: Vec<String>,
    pub card: MatchCardinality,
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub return_bool: bool,
    pub matching: Option<VectorMatching>,
}

impl fmt::Display for BinaryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.lhs, self.op.as_str())?;
        if self.return_bool {
            f.write_str(" bool")?;
        }
        if let Some(vm) = &self.matching {
            if vm.on || !vm.labels.is_empty() {
                if vm.on {
                    write!(f, " on ({})", vm.labels.join(", "))?;
                } else {
                    write!(f, " ignoring ({})", vm.labels.join(", "))?;
                }
            }
            match vm.card {
                MatchCardinality::ManyToOne => {
                    f.write_str(" group_left")?;
                    if !vm.include.is_empty() {
                        write!(f, " ({})", vm.include.join(", "))?;
                    }
                }
                MatchCardinality::OneToMany => {
                    f.write_str(" group_right")?;
                    if !vm.include.is_empty() {
                        write!(f, " ({})", vm.include.join(", "))?;
                    }
                }
                MatchCardinality::OneToOne => {}
            }
        }
        write!(f, " {}", self.rhs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub negative: bool,
    pub expr: Box<Expr>,
}

impl fmt::Display for UnaryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.negative { "-" } else { "+" }, self.expr)
    }
}

/// A parsed PromQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(String),
    Vector(VectorSelector),
    Matrix(MatrixSelector),
    Subquery(SubqueryExpr),
    Paren(Box<Expr>),
    Unary(UnaryExpr),
    Call(Call),
    Aggregate(AggregateExpr),
    Binary(BinaryExpr),
}

impl Expr {
    /// Walk the expression tree and apply `f` to every vector selector,
    /// including the one inside each matrix selector. The callback may
    /// mutate the selector's matchers in place; the first error aborts the
    /// walk.
    pub fn walk_selectors<E>(
        &mut self,
        f: &mut impl FnMut(&mut VectorSelector) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Expr::Number(_) | Expr::String(_) => Ok(()),
            Expr::Vector(vs) => f(vs),
            Expr::Matrix(ms) => f(&mut ms.selector),
            Expr::Subquery(sq) => sq.expr.walk_selectors(f),
            Expr::Paren(inner) => inner.walk_selectors(f),
            Expr::Unary(u) => u.expr.walk_selectors(f),
            Expr::Call(call) => {
                for arg in &mut call.args {
                    arg.walk_selectors(f)?;
                }
                Ok(())
            }
            Expr::Aggregate(agg) => {
                if let Some(param) = &mut agg.param {
                    param.walk_selectors(f)?;
                }
                agg.expr.walk_selectors(f)
            }
            Expr::Binary(bin) => {
                bin.lhs.walk_selectors(f)?;
                bin.rhs.walk_selectors(f)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => f.write_str(&format_number(*n)),
            Expr::String(s) => f.write_str(&quote_string(s)),
            Expr::Vector(vs) => vs.fmt(f),
            Expr::Matrix(ms) => ms.fmt(f),
            Expr::Subquery(sq) => sq.fmt(f),
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::Unary(u) => u.fmt(f),
            Expr::Call(c) => c.fmt(f),
            Expr::Aggregate(a) => a.fmt(f),
            Expr::Binary(b) => b.fmt(f),
        }
    }
}

fn format_number(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else {
        format!("{}", v)
    }
}

/// Double-quote a string with PromQL escaping.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// True if `s` is a valid bare label name (`[a-zA-Z_][a-zA-Z0-9_]*`).
pub fn is_label_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
