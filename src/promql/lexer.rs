//! PromQL tokenizer.
//!
//! Durations are lexed as their own token kind so that `5m` and `5` stay
//! distinct. Inside brackets `:` is a standalone token (subquery step
//! separator); outside it is a valid metric-name character.

use super::parser::ParseError;
use super::PromDuration;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Duration(PromDuration),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    At,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    EqlSingle,
    Neq,
    EqlRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier {:?}", s),
            Token::Number(n) => format!("number {}", n),
            Token::Duration(d) => format!("duration {}", d),
            Token::Str(_) => "string literal".to_string(),
            Token::Eof => "end of input".to_string(),
            t => format!("{:?}", t),
        }
    }
}

pub fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0usize;
    let mut bracket_depth = 0usize;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        if c == '#' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        let token = match c {
            '(' => {
                pos += 1;
                Token::LParen
            }
            ')' => {
                pos += 1;
                Token::RParen
            }
            '{' => {
                pos += 1;
                Token::LBrace
            }
            '}' => {
                pos += 1;
                Token::RBrace
            }
            '[' => {
                pos += 1;
                bracket_depth += 1;
                Token::LBracket
            }
            ']' => {
                pos += 1;
                bracket_depth = bracket_depth.saturating_sub(1);
                Token::RBracket
            }
            ',' => {
                pos += 1;
                Token::Comma
            }
            '@' => {
                pos += 1;
                Token::At
            }
            '+' => {
                pos += 1;
                Token::Add
            }
            '-' => {
                pos += 1;
                Token::Sub
            }
            '*' => {
                pos += 1;
                Token::Mul
            }
            '/' => {
                pos += 1;
                Token::Div
            }
            '%' => {
                pos += 1;
                Token::Mod
            }
            '^' => {
                pos += 1;
                Token::Pow
            }
            ':' if bracket_depth > 0 => {
                pos += 1;
                Token::Colon
            }
            '=' => {
                pos += 1;
                if pos < chars.len() && chars[pos] == '=' {
                    pos += 1;
                    Token::Eql
                } else if pos < chars.len() && chars[pos] == '~' {
                    pos += 1;
                    Token::EqlRegex
                } else {
                    Token::EqlSingle
                }
            }
            '!' => {
                pos += 1;
                if pos < chars.len() && chars[pos] == '=' {
                    pos += 1;
                    Token::Neq
                } else if pos < chars.len() && chars[pos] == '~' {
                    pos += 1;
                    Token::NeqRegex
                } else {
                    return Err(ParseError::new(start, "unexpected character '!'"));
                }
            }
            '<' => {
                pos += 1;
                if pos < chars.len() && chars[pos] == '=' {
                    pos += 1;
                    Token::Lte
                } else {
                    Token::Lt
                }
            }
            '>' => {
                pos += 1;
                if pos < chars.len() && chars[pos] == '=' {
                    pos += 1;
                    Token::Gte
                } else {
                    Token::Gt
                }
            }
            '"' | '\'' => {
                let (s, next) = scan_string(&chars, pos, c)?;
                pos = next;
                Token::Str(s)
            }
            '`' => {
                let mut end = pos + 1;
                while end < chars.len() && chars[end] != '`' {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ParseError::new(start, "unterminated raw string"));
                }
                let s: String = chars[pos + 1..end].iter().collect();
                pos = end + 1;
                Token::Str(s)
            }
            c if c.is_ascii_digit() || c == '.' => {
                if let Some((dur, next)) = scan_duration(&chars, pos) {
                    pos = next;
                    Token::Duration(dur)
                } else {
                    let (n, next) = scan_number(&chars, pos)?;
                    pos = next;
                    Token::Number(n)
                }
            }
            c if is_ident_start(c) => {
                let mut end = pos + 1;
                while end < chars.len() && is_ident_char(chars[end], bracket_depth == 0) {
                    end += 1;
                }
                let ident: String = chars[pos..end].iter().collect();
                pos = end;
                match ident.to_ascii_lowercase().as_str() {
                    "inf" => Token::Number(f64::INFINITY),
                    "nan" => Token::Number(f64::NAN),
                    _ => Token::Ident(ident),
                }
            }
            c => {
                return Err(ParseError::new(
                    start,
                    format!("unexpected character {:?}", c),
                ))
            }
        };

        tokens.push((token, start));
    }

    tokens.push((Token::Eof, chars.len()));
    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char, allow_colon: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':')
}

/// Scan `123`, `1.5`, `.5`, `1e-3`, `0x1f`.
fn scan_number(chars: &[char], start: usize) -> Result<(f64, usize), ParseError> {
    let mut pos = start;

    // Hex literal.
    if chars[pos] == '0'
        && pos + 1 < chars.len()
        && (chars[pos + 1] == 'x' || chars[pos + 1] == 'X')
    {
        pos += 2;
        let digits_start = pos;
        while pos < chars.len() && chars[pos].is_ascii_hexdigit() {
            pos += 1;
        }
        if pos == digits_start {
            return Err(ParseError::new(start, "malformed hexadecimal literal"));
        }
        let text: String = chars[digits_start..pos].iter().collect();
        let v = i64::from_str_radix(&text, 16)
            .map_err(|_| ParseError::new(start, "malformed hexadecimal literal"))?;
        return Ok((v as f64, pos));
    }

    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < chars.len() && chars[pos] == '.' {
        pos += 1;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
        let mut exp = pos + 1;
        if exp < chars.len() && (chars[exp] == '+' || chars[exp] == '-') {
            exp += 1;
        }
        if exp < chars.len() && chars[exp].is_ascii_digit() {
            pos = exp;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }

    let text: String = chars[start..pos].iter().collect();
    let v: f64 = text
        .parse()
        .map_err(|_| ParseError::new(start, format!("malformed number {:?}", text)))?;
    Ok((v, pos))
}

/// Scan a duration literal like `5m`, `1h30m` or `250ms`. Returns `None`
/// when the text at `start` is not a complete duration (e.g. `1e5`, `0x1f`,
/// or a duration glued to more identifier characters).
fn scan_duration(chars: &[char], start: usize) -> Option<(PromDuration, usize)> {
    let mut pos = start;
    let mut millis: i64 = 0;
    let mut groups = 0;

    loop {
        let digits_start = pos;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == digits_start {
            break;
        }
        let n: i64 = chars[digits_start..pos]
            .iter()
            .collect::<String>()
            .parse()
            .ok()?;

        let factor = if pos + 1 < chars.len() && chars[pos] == 'm' && chars[pos + 1] == 's' {
            pos += 2;
            1
        } else if pos < chars.len() {
            let f = match chars[pos] {
                's' => 1000,
                'm' => 60 * 1000,
                'h' => 60 * 60 * 1000,
                'd' => 24 * 60 * 60 * 1000,
                'w' => 7 * 24 * 60 * 60 * 1000,
                'y' => 365 * 24 * 60 * 60 * 1000,
                _ => return None,
            };
            pos += 1;
            f
        } else {
            return None;
        };

        millis += n * factor;
        groups += 1;

        if pos >= chars.len() || !chars[pos].is_ascii_digit() {
            break;
        }
    }

    if groups == 0 {
        return None;
    }
    // A trailing identifier character means this was not a duration after all
    // (e.g. `5mx` is a malformed identifier, not `5m` + `x`).
    if pos < chars.len() && (is_ident_char(chars[pos], true) || chars[pos] == '.') {
        return None;
    }
    Some((PromDuration::from_millis(millis), pos))
}

fn scan_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize), ParseError> {
    let mut pos = start + 1;
    let mut out = String::new();

    while pos < chars.len() {
        let c = chars[pos];
        if c == quote {
            return Ok((out, pos + 1));
        }
        if c == '\n' {
            break;
        }
        if c == '\\' {
            pos += 1;
            if pos >= chars.len() {
                break;
            }
            match chars[pos] {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'a' => out.push('\x07'),
                'b' => out.push('\x08'),
                'f' => out.push('\x0c'),
                'v' => out.push('\x0b'),
                'x' => {
                    let v = scan_hex(chars, pos + 1, 2)
                        .ok_or_else(|| ParseError::new(pos, "invalid hex escape"))?;
                    out.push(
                        char::from_u32(v).ok_or_else(|| ParseError::new(pos, "invalid escape"))?,
                    );
                    pos += 2;
                }
                'u' => {
                    let v = scan_hex(chars, pos + 1, 4)
                        .ok_or_else(|| ParseError::new(pos, "invalid unicode escape"))?;
                    out.push(
                        char::from_u32(v).ok_or_else(|| ParseError::new(pos, "invalid escape"))?,
                    );
                    pos += 4;
                }
                'U' => {
                    let v = scan_hex(chars, pos + 1, 8)
                        .ok_or_else(|| ParseError::new(pos, "invalid unicode escape"))?;
                    out.push(
                        char::from_u32(v).ok_or_else(|| ParseError::new(pos, "invalid escape"))?,
                    );
                    pos += 8;
                }
                c => {
                    return Err(ParseError::new(
                        pos,
                        format!("unknown escape sequence {:?}", c),
                    ))
                }
            }
            pos += 1;
            continue;
        }
        out.push(c);
        pos += 1;
    }

    Err(ParseError::new(start, "unterminated string literal"))
}

fn scan_hex(chars: &[char], start: usize, len: usize) -> Option<u32> {
    if start + len > chars.len() {
        return None;
    }
    let text: String = chars[start..start + len].iter().collect();
    u32::from_str_radix(&text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_simple_selector() {
        assert_eq!(
            kinds(r#"up{namespace="default"}"#),
            vec![
                Token::Ident("up".into()),
                Token::LBrace,
                Token::Ident("namespace".into()),
                Token::EqlSingle,
                Token::Str("default".into()),
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_durations_vs_numbers() {
        assert_eq!(
            kinds("5m"),
            vec![Token::Duration(PromDuration::from_millis(300_000)), Token::Eof]
        );
        assert_eq!(
            kinds("1h30m"),
            vec![Token::Duration(PromDuration::from_millis(5_400_000)), Token::Eof]
        );
        assert_eq!(kinds("1e5"), vec![Token::Number(100_000.0), Token::Eof]);
        assert_eq!(kinds("0x1f"), vec![Token::Number(31.0), Token::Eof]);
        assert_eq!(kinds(".5"), vec![Token::Number(0.5), Token::Eof]);
    }

    #[test]
    fn test_colon_inside_brackets() {
        // Outside brackets a colon is part of the metric name.
        assert_eq!(
            kinds("job:rate5m:sum"),
            vec![Token::Ident("job:rate5m:sum".into()), Token::Eof]
        );
        // Inside brackets it separates range and step.
        assert_eq!(
            kinds("[5m:1m]"),
            vec![
                Token::LBracket,
                Token::Duration(PromDuration::from_millis(300_000)),
                Token::Colon,
                Token::Duration(PromDuration::from_millis(60_000)),
                Token::RBracket,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("=~ != !~ == <= >="),
            vec![
                Token::EqlRegex,
                Token::Neq,
                Token::NeqRegex,
                Token::Eql,
                Token::Lte,
                Token::Gte,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\\|b""#),
            vec![Token::Str("a\\|b".into()), Token::Eof]
        );
        assert_eq!(kinds(r#""a\"b""#), vec![Token::Str("a\"b".into()), Token::Eof]);
        assert!(tokenize(r#""unterminated"#).is_err());
    }

    #[test]
    fn test_comment() {
        assert_eq!(
            kinds("up # a comment\n"),
            vec![Token::Ident("up".into()), Token::Eof]
        );
    }
}
