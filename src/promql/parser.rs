//! Recursive-descent PromQL parser.
//!
//! Binary operators are parsed by precedence climbing (`^` right-associative,
//! unary minus binding between `*` and `^`), selector modifiers
//! (`[range]`, `[range:step]`, `offset`, `@`) as postfix operators.

use super::functions;
use super::lexer::{tokenize, Token};
use super::{
    AggOp, AggregateExpr, AtModifier, BinOp, BinaryExpr, Call, DurationExpr, Expr,
    MatchCardinality, MatchOp, Matcher, MatrixSelector, Options, SubqueryExpr, UnaryExpr,
    VectorMatching, VectorSelector,
};
use std::fmt;

/// Error produced by the lexer or parser, with a character offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub pos: usize,
    pub msg: String,
}

impl ParseError {
    pub fn new(pos: usize, msg: impl Into<String>) -> Self {
        Self {
            pos,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: parse error: {}", self.pos, self.msg)
    }
}

impl std::error::Error for ParseError {}

/// Parse a full PromQL expression.
pub fn parse_expr(input: &str, opts: Options) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut p = Parser {
        tokens,
        idx: 0,
        opts,
    };
    if matches!(p.peek(), Token::Eof) {
        return Err(ParseError::new(0, "no expression found in input"));
    }
    let expr = p.parse_binary(0)?;
    match p.peek() {
        Token::Eof => Ok(expr),
        t => Err(ParseError::new(
            p.peek_pos(),
            format!("unexpected {}", t.describe()),
        )),
    }
}

/// Parse a metric selector (the `match[]` form): `metric`, `metric{...}` or
/// `{...}`. A metric name is returned as an equality matcher on `__name__`.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>, ParseError> {
    let expr = parse_expr(input, Options::default())?;
    match expr {
        Expr::Vector(vs) if vs.offset.is_none() && vs.at.is_none() => {
            let mut matchers = Vec::with_capacity(vs.matchers.len() + 1);
            if let Some(name) = vs.name {
                matchers.push(Matcher::new(MatchOp::Equal, "__name__", name));
            }
            matchers.extend(vs.matchers);
            Ok(matchers)
        }
        _ => Err(ParseError::new(0, "expected label matchers or metric name")),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    idx: usize,
    opts: Options,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.idx].0
    }

    fn peek_pos(&self) -> usize {
        self.tokens[self.idx].1
    }

    fn next(&mut self) -> Token {
        let tok = self.tokens[self.idx].0.clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn expect(&mut self, want: &Token, context: &str) -> Result<(), ParseError> {
        if self.peek() == want {
            self.next();
            Ok(())
        } else {
            Err(ParseError::new(
                self.peek_pos(),
                format!("unexpected {} in {}", self.peek().describe(), context),
            ))
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.next();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Binary expressions
    // ------------------------------------------------------------------

    fn peek_binop(&self) -> Option<BinOp> {
        Some(match self.peek() {
            Token::Add => BinOp::Add,
            Token::Sub => BinOp::Sub,
            Token::Mul => BinOp::Mul,
            Token::Div => BinOp::Div,
            Token::Mod => BinOp::Mod,
            Token::Pow => BinOp::Pow,
            Token::Eql => BinOp::Eql,
            Token::Neq => BinOp::Neq,
            Token::Lt => BinOp::Lt,
            Token::Gt => BinOp::Gt,
            Token::Lte => BinOp::Lte,
            Token::Gte => BinOp::Gte,
            Token::Ident(s) => match s.as_str() {
                "and" => BinOp::And,
                "or" => BinOp::Or,
                "unless" => BinOp::Unless,
                "atan2" => BinOp::Atan2,
                _ => return None,
            },
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;

        while let Some(op) = self.peek_binop() {
            let prec = binop_prec(op);
            if prec < min_prec {
                break;
            }
            let op_pos = self.peek_pos();
            self.next();

            let return_bool = self.eat_keyword("bool");
            if return_bool && !op.is_comparison() {
                return Err(ParseError::new(
                    op_pos,
                    "bool modifier can only be used on comparison operators",
                ));
            }
            let matching = self.parse_vector_matching()?;

            // `^` is right-associative.
            let next_min = if op == BinOp::Pow { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;

            lhs = Expr::Binary(BinaryExpr {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                return_bool,
                matching,
            });
        }

        Ok(lhs)
    }

    fn parse_vector_matching(&mut self) -> Result<Option<VectorMatching>, ParseError> {
        let on = if self.eat_keyword("on") {
            true
        } else if self.eat_keyword("ignoring") {
            false
        } else {
            return Ok(None);
        };
        let labels = self.parse_label_list()?;

        let (card, include) = if self.eat_keyword("group_left") {
            let include = if matches!(self.peek(), Token::LParen) {
                self.parse_label_list()?
            } else {
                Vec::new()
            };
            (MatchCardinality::ManyToOne, include)
        } else if self.eat_keyword("group_right") {
            let include = if matches!(self.peek(), Token::LParen) {
                self.parse_label_list()?
            } else {
                Vec::new()
            };
            (MatchCardinality::OneToMany, include)
        } else {
            (MatchCardinality::OneToOne, Vec::new())
        };

        Ok(Some(VectorMatching {
            on,
            labels,
            card,
            include,
        }))
    }

    // ------------------------------------------------------------------
    // Unary and postfix
    // ------------------------------------------------------------------

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Add | Token::Sub => {
                let negative = matches!(self.peek(), Token::Sub);
                self.next();
                // Unary binds tighter than any binary operator except `^`.
                let operand = self.parse_binary(binop_prec(BinOp::Pow))?;
                if !negative {
                    // Unary plus is a no-op, like the upstream parser.
                    return Ok(operand);
                }
                if let Expr::Number(n) = operand {
                    return Ok(Expr::Number(-n));
                }
                Ok(Expr::Unary(UnaryExpr {
                    negative,
                    expr: Box::new(operand),
                }))
            }
            _ => {
                let expr = self.parse_primary()?;
                self.parse_postfix(expr)
            }
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.peek() {
                Token::LBracket => {
                    let pos = self.peek_pos();
                    self.next();
                    let range = self.parse_duration_expr()?;
                    if matches!(self.peek(), Token::Colon) {
                        self.next();
                        let step = if matches!(self.peek(), Token::RBracket) {
                            None
                        } else {
                            Some(self.parse_duration_expr()?)
                        };
                        self.expect(&Token::RBracket, "subquery selector")?;
                        if matches!(expr, Expr::Matrix(_)) {
                            return Err(ParseError::new(
                                pos,
                                "subquery is only allowed on instant vector",
                            ));
                        }
                        expr = Expr::Subquery(SubqueryExpr {
                            expr: Box::new(expr),
                            range,
                            step,
                            offset: None,
                            at: None,
                        });
                    } else {
                        self.expect(&Token::RBracket, "range selector")?;
                        match expr {
                            Expr::Vector(vs) => {
                                expr = Expr::Matrix(MatrixSelector {
                                    selector: vs,
                                    range,
                                })
                            }
                            _ => {
                                return Err(ParseError::new(
                                    pos,
                                    "ranges only allowed for vector selectors",
                                ))
                            }
                        }
                    }
                }
                Token::At => {
                    let pos = self.peek_pos();
                    self.next();
                    let at = self.parse_at_modifier()?;
                    set_at(&mut expr, at, pos)?;
                }
                Token::Ident(s) if s == "offset" => {
                    let pos = self.peek_pos();
                    self.next();
                    let dur = self.parse_offset_duration()?;
                    set_offset(&mut expr, dur, pos)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_at_modifier(&mut self) -> Result<AtModifier, ParseError> {
        let pos = self.peek_pos();
        match self.next() {
            Token::Number(n) => Ok(AtModifier::Timestamp(n)),
            Token::Sub => match self.next() {
                Token::Number(n) => Ok(AtModifier::Timestamp(-n)),
                t => Err(ParseError::new(
                    pos,
                    format!("unexpected {} in @ modifier", t.describe()),
                )),
            },
            Token::Ident(s) if s == "start" => {
                self.expect(&Token::LParen, "@ modifier")?;
                self.expect(&Token::RParen, "@ modifier")?;
                Ok(AtModifier::Start)
            }
            Token::Ident(s) if s == "end" => {
                self.expect(&Token::LParen, "@ modifier")?;
                self.expect(&Token::RParen, "@ modifier")?;
                Ok(AtModifier::End)
            }
            t => Err(ParseError::new(
                pos,
                format!("unexpected {} in @ modifier", t.describe()),
            )),
        }
    }

    fn parse_offset_duration(&mut self) -> Result<DurationExpr, ParseError> {
        if self.opts.duration_expressions {
            return self.parse_duration_expr();
        }
        let negative = matches!(self.peek(), Token::Sub);
        if negative {
            self.next();
        }
        let dur = self.parse_duration_expr()?;
        Ok(if negative {
            DurationExpr::Neg(Box::new(dur))
        } else {
            dur
        })
    }

    // ------------------------------------------------------------------
    // Durations
    // ------------------------------------------------------------------

    fn parse_duration_expr(&mut self) -> Result<DurationExpr, ParseError> {
        if self.opts.duration_expressions {
            self.parse_duration_add()
        } else {
            let pos = self.peek_pos();
            match self.next() {
                Token::Duration(d) => Ok(DurationExpr::Literal(d)),
                t => Err(ParseError::new(
                    pos,
                    format!("unexpected {}, expected duration", t.describe()),
                )),
            }
        }
    }

    fn parse_duration_add(&mut self) -> Result<DurationExpr, ParseError> {
        let mut lhs = self.parse_duration_mul()?;
        loop {
            let op = match self.peek() {
                Token::Add => '+',
                Token::Sub => '-',
                _ => break,
            };
            self.next();
            let rhs = self.parse_duration_mul()?;
            lhs = DurationExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_duration_mul(&mut self) -> Result<DurationExpr, ParseError> {
        let mut lhs = self.parse_duration_atom()?;
        loop {
            let op = match self.peek() {
                Token::Mul => '*',
                Token::Div => '/',
                Token::Mod => '%',
                _ => break,
            };
            self.next();
            let rhs = self.parse_duration_atom()?;
            lhs = DurationExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_duration_atom(&mut self) -> Result<DurationExpr, ParseError> {
        let pos = self.peek_pos();
        match self.next() {
            Token::Duration(d) => Ok(DurationExpr::Literal(d)),
            Token::Number(n) => Ok(DurationExpr::Number(n)),
            Token::Sub => Ok(DurationExpr::Neg(Box::new(self.parse_duration_atom()?))),
            Token::LParen => {
                let inner = self.parse_duration_add()?;
                self.expect(&Token::RParen, "duration expression")?;
                Ok(DurationExpr::Paren(Box::new(inner)))
            }
            t => Err(ParseError::new(
                pos,
                format!("unexpected {} in duration expression", t.describe()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Primary expressions
    // ------------------------------------------------------------------

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.peek_pos();
        match self.next() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::String(s)),
            Token::LParen => {
                let inner = self.parse_binary(0)?;
                self.expect(&Token::RParen, "parenthesized expression")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Token::LBrace => {
                let matchers = self.parse_matchers()?;
                self.vector_selector(None, matchers, pos)
            }
            Token::Ident(name) => self.parse_ident(name, pos),
            t => Err(ParseError::new(
                pos,
                format!("unexpected {}", t.describe()),
            )),
        }
    }

    fn parse_ident(&mut self, name: String, pos: usize) -> Result<Expr, ParseError> {
        if let Some(op) = AggOp::from_str(&name) {
            if !op.experimental() || self.opts.experimental_functions {
                return self.parse_aggregate(op);
            }
        }

        const RESERVED: &[&str] = &[
            "and",
            "or",
            "unless",
            "bool",
            "on",
            "ignoring",
            "group_left",
            "group_right",
            "offset",
            "by",
            "without",
        ];
        if RESERVED.contains(&name.as_str()) {
            return Err(ParseError::new(
                pos,
                format!("unexpected keyword {:?}", name),
            ));
        }

        if matches!(self.peek(), Token::LParen) {
            if !functions::is_function(&name) {
                return Err(ParseError::new(
                    pos,
                    format!("unknown function with name {:?}", name),
                ));
            }
            if functions::is_experimental_function(&name) && !self.opts.experimental_functions {
                return Err(ParseError::new(
                    pos,
                    format!(
                        "function {:?} is not enabled, experimental functions are disabled",
                        name
                    ),
                ));
            }
            self.next();
            let mut args = Vec::new();
            if !matches!(self.peek(), Token::RParen) {
                loop {
                    args.push(self.parse_binary(0)?);
                    if matches!(self.peek(), Token::Comma) {
                        self.next();
                    } else {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen, "function call")?;
            return Ok(Expr::Call(Call { func: name, args }));
        }

        let matchers = if matches!(self.peek(), Token::LBrace) {
            self.next();
            self.parse_matchers()?
        } else {
            Vec::new()
        };
        self.vector_selector(Some(name), matchers, pos)
    }

    fn vector_selector(
        &mut self,
        name: Option<String>,
        matchers: Vec<Matcher>,
        pos: usize,
    ) -> Result<Expr, ParseError> {
        // A selector whose matchers all match the empty string could select
        // every series; reject it like the upstream parser does. A metric
        // name implies a non-empty __name__ matcher.
        if name.is_none() && matchers.iter().all(matcher_matches_empty) {
            return Err(ParseError::new(
                pos,
                "vector selector must contain at least one non-empty matcher",
            ));
        }
        Ok(Expr::Vector(VectorSelector {
            name,
            matchers,
            offset: None,
            at: None,
        }))
    }

    fn parse_aggregate(&mut self, op: AggOp) -> Result<Expr, ParseError> {
        let mut grouping = Vec::new();
        let mut without = false;
        let mut seen_modifier = false;

        if self.eat_keyword("by") {
            grouping = self.parse_label_list()?;
            seen_modifier = true;
        } else if self.eat_keyword("without") {
            without = true;
            grouping = self.parse_label_list()?;
            seen_modifier = true;
        }

        self.expect(&Token::LParen, "aggregation")?;
        let first = self.parse_binary(0)?;
        let (param, inner) = if op.takes_param() {
            self.expect(&Token::Comma, "aggregation")?;
            let inner = self.parse_binary(0)?;
            (Some(Box::new(first)), inner)
        } else {
            (None, first)
        };
        self.expect(&Token::RParen, "aggregation")?;

        if !seen_modifier {
            if self.eat_keyword("by") {
                grouping = self.parse_label_list()?;
            } else if self.eat_keyword("without") {
                without = true;
                grouping = self.parse_label_list()?;
            }
        }

        Ok(Expr::Aggregate(AggregateExpr {
            op,
            expr: Box::new(inner),
            param,
            grouping,
            without,
        }))
    }

    fn parse_label_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(&Token::LParen, "grouping opts")?;
        let mut labels = Vec::new();
        if matches!(self.peek(), Token::RParen) {
            self.next();
            return Ok(labels);
        }
        loop {
            let pos = self.peek_pos();
            match self.next() {
                Token::Ident(s) => labels.push(s),
                Token::Str(s) => labels.push(s),
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!("unexpected {} in grouping opts", t.describe()),
                    ))
                }
            }
            match self.next() {
                Token::Comma => continue,
                Token::RParen => break,
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!("unexpected {} in grouping opts", t.describe()),
                    ))
                }
            }
        }
        Ok(labels)
    }

    /// Parse matchers after the opening `{` has been consumed.
    fn parse_matchers(&mut self) -> Result<Vec<Matcher>, ParseError> {
        let mut matchers = Vec::new();
        if matches!(self.peek(), Token::RBrace) {
            self.next();
            return Ok(matchers);
        }
        loop {
            let pos = self.peek_pos();
            let name = match self.next() {
                Token::Ident(s) => s,
                Token::Str(s) => s,
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!("unexpected {} in label matching, expected label name", t.describe()),
                    ))
                }
            };
            let op = match self.next() {
                Token::EqlSingle => MatchOp::Equal,
                Token::Neq => MatchOp::NotEqual,
                Token::EqlRegex => MatchOp::Regex,
                Token::NeqRegex => MatchOp::NotRegex,
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!(
                            "unexpected {} in label matching, expected label matching operator",
                            t.describe()
                        ),
                    ))
                }
            };
            let value = match self.next() {
                Token::Str(s) => s,
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!("unexpected {} in label matching, expected string", t.describe()),
                    ))
                }
            };
            if matches!(op, MatchOp::Regex | MatchOp::NotRegex) && anchored_regex(&value).is_none()
            {
                return Err(ParseError::new(
                    pos,
                    format!("invalid regular expression in label matcher: {:?}", value),
                ));
            }
            matchers.push(Matcher { name, op, value });

            match self.next() {
                Token::Comma => {
                    if matches!(self.peek(), Token::RBrace) {
                        self.next();
                        break;
                    }
                }
                Token::RBrace => break,
                t => {
                    return Err(ParseError::new(
                        pos,
                        format!("unexpected {} in label matching", t.describe()),
                    ))
                }
            }
        }
        Ok(matchers)
    }
}

fn anchored_regex(pattern: &str) -> Option<regex::Regex> {
    regex::Regex::new(&format!("^(?:{})$", pattern)).ok()
}

/// Whether a matcher matches the empty label value, i.e. also selects series
/// without the label.
fn matcher_matches_empty(m: &Matcher) -> bool {
    match m.op {
        MatchOp::Equal => m.value.is_empty(),
        MatchOp::NotEqual => !m.value.is_empty(),
        MatchOp::Regex => anchored_regex(&m.value).is_some_and(|re| re.is_match("")),
        MatchOp::NotRegex => !anchored_regex(&m.value).is_some_and(|re| re.is_match("")),
    }
}

fn binop_prec(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 1,
        BinOp::And | BinOp::Unless => 2,
        BinOp::Eql | BinOp::Neq | BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte => 3,
        BinOp::Add | BinOp::Sub => 4,
        BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Atan2 => 5,
        BinOp::Pow => 6,
    }
}

fn set_offset(expr: &mut Expr, dur: DurationExpr, pos: usize) -> Result<(), ParseError> {
    let slot = match expr {
        Expr::Vector(vs) => &mut vs.offset,
        Expr::Matrix(ms) => &mut ms.selector.offset,
        Expr::Subquery(sq) => &mut sq.offset,
        _ => {
            return Err(ParseError::new(
                pos,
                "offset modifier must be preceded by an instant vector selector or range vector selector or a subquery",
            ))
        }
    };
    if slot.is_some() {
        return Err(ParseError::new(pos, "offset may not be set multiple times"));
    }
    *slot = Some(dur);
    Ok(())
}

fn set_at(expr: &mut Expr, at: AtModifier, pos: usize) -> Result<(), ParseError> {
    let slot = match expr {
        Expr::Vector(vs) => &mut vs.at,
        Expr::Matrix(ms) => &mut ms.selector.at,
        Expr::Subquery(sq) => &mut sq.at,
        _ => {
            return Err(ParseError::new(
                pos,
                "@ modifier must be preceded by an instant vector selector or range vector selector or a subquery",
            ))
        }
    };
    if slot.is_some() {
        return Err(ParseError::new(
            pos,
            "@ <timestamp> may not be set multiple times",
        ));
    }
    *slot = Some(at);
    Ok(())
}
