//! Scheduler label expressions.
//!
//! Templates advertise a set of labels (`docker jdk17 linux`). A capacity
//! request may carry an expression over those labels:
//!
//! ```text
//! expr  := or
//! or    := and ( "||" and )*
//! and   := unary ( "&&" unary )*
//! unary := "!" unary | "(" expr ")" | atom
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Label expression parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label expression is empty")]
    Empty,

    #[error("unexpected '{found}' at offset {offset}")]
    Unexpected { found: String, offset: usize },

    #[error("unexpected end of label expression")]
    UnexpectedEnd,
}

/// A parsed label expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    /// Evaluate against a label set.
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            Self::Atom(label) => labels.contains(label),
            Self::Not(inner) => !inner.matches(labels),
            Self::And(l, r) => l.matches(labels) && r.matches(labels),
            Self::Or(l, r) => l.matches(labels) || r.matches(labels),
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(label) => f.write_str(label),
            Self::Not(inner) => write!(f, "!{inner}"),
            Self::And(l, r) => write!(f, "({l} && {r})"),
            Self::Or(l, r) => write!(f, "({l} || {r})"),
        }
    }
}

impl FromStr for LabelExpr {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Err(SelectorError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((offset, token)) => Err(SelectorError::Unexpected {
                found: token.to_string(),
                offset: *offset,
            }),
        }
    }
}

/// Split a whitespace-separated label string into a set.
pub fn label_set(labels: &str) -> BTreeSet<String> {
    labels.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Atom(a) => f.write_str(a),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn tokenize(s: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = s.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::Open,
            ')' => Token::Close,
            '!' => Token::Not,
            '&' | '|' => match chars.next() {
                Some((_, next)) if next == c => {
                    if c == '&' {
                        Token::And
                    } else {
                        Token::Or
                    }
                }
                _ => {
                    return Err(SelectorError::Unexpected {
                        found: c.to_string(),
                        offset,
                    })
                }
            },
            _ => {
                let mut atom = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_whitespace() || "()!&|".contains(*next) {
                        break;
                    }
                    atom.push(*next);
                    chars.next();
                }
                Token::Atom(atom)
            }
        };
        tokens.push((offset, token));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), SelectorError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn or(&mut self) -> Result<LabelExpr, SelectorError> {
        let mut expr = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            expr = LabelExpr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<LabelExpr, SelectorError> {
        let mut expr = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            expr = LabelExpr::And(Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<LabelExpr, SelectorError> {
        match self.next()? {
            (_, Token::Not) => Ok(LabelExpr::Not(Box::new(self.unary()?))),
            (_, Token::Atom(label)) => Ok(LabelExpr::Atom(label)),
            (_, Token::Open) => {
                let expr = self.or()?;
                match self.next()? {
                    (_, Token::Close) => Ok(expr),
                    (offset, token) => Err(SelectorError::Unexpected {
                        found: token.to_string(),
                        offset,
                    }),
                }
            }
            (offset, token) => Err(SelectorError::Unexpected {
                found: token.to_string(),
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("docker", "docker jdk17", true)]
    #[case("docker", "jdk17", false)]
    #[case("docker && jdk17", "docker jdk17", true)]
    #[case("docker && jdk21", "docker jdk17", false)]
    #[case("jdk21 || jdk17", "docker jdk17", true)]
    #[case("!windows", "docker linux", true)]
    #[case("docker && !(windows || arm64)", "docker arm64", false)]
    #[case("a || b && c", "a", true)]
    #[case("(a || b) && c", "a", false)]
    fn test_matches(#[case] expr: &str, #[case] labels: &str, #[case] expected: bool) {
        let expr: LabelExpr = expr.parse().unwrap();
        assert_eq!(expr.matches(&label_set(labels)), expected);
    }

    #[rstest]
    #[case("", SelectorError::Empty)]
    #[case("a &&", SelectorError::UnexpectedEnd)]
    #[case("(a", SelectorError::UnexpectedEnd)]
    #[case("a b", SelectorError::Unexpected { found: "b".into(), offset: 2 })]
    #[case("a & b", SelectorError::Unexpected { found: "&".into(), offset: 2 })]
    #[case(")", SelectorError::Unexpected { found: ")".into(), offset: 0 })]
    fn test_parse_errors(#[case] expr: &str, #[case] expected: SelectorError) {
        assert_eq!(expr.parse::<LabelExpr>().unwrap_err(), expected);
    }

    #[test]
    fn test_display_is_reparseable() {
        let expr: LabelExpr = "a && !b || c".parse().unwrap();
        let shown = expr.to_string();
        assert_eq!(shown, "((a && !b) || c)");
        assert_eq!(shown.parse::<LabelExpr>().unwrap(), expr);
    }
}
