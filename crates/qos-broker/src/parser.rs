//! Recursive-descent parser for rule expressions and rule files.
//!
//! The scanner works character by character with one-character lookahead and
//! tracks the current line for error reporting. In the default mode it skips
//! whitespace and `#`-to-end-of-line comments; string bodies are read in
//! "space" mode where every character is significant.
//!
//! Grammar, lowest precedence first: `||`, `&&`, comparison
//! (`<` `<=` `>` `>=` `==` `!=` `~`), additive, multiplicative, `^`
//! (right-associative), unary `-`/`!`, atom. Operators are resolved to their
//! named function form through the [`FunctionRegistry`], so the produced AST
//! contains only literals and calls.
//!
//! A rules file is a sequence of statements:
//!
//! ```text
//! limit      "cap"  true            : 2
//! priority   "vip"  (user == "ada") : 100
//! permission "none" (user == "bob") : false
//! user       "per"  true            : 1
//! ```

use std::path::Path;

use thiserror::Error;

use crate::expr::{Expr, FunctionRegistry};
use crate::rules::RuleSet;

/// A parse failure with the 1-based line it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (line {line})")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

/// Maps an operator token to its function name.
fn operator_function(op: &str) -> Option<&'static str> {
    Some(match op {
        "+" => "add",
        "-" => "sub",
        "*" => "mul",
        "/" => "div",
        "^" => "pow",
        ">" => "gt",
        ">=" => "ge",
        "<" => "lt",
        "<=" => "le",
        "==" => "eq",
        "!=" => "ne",
        "&&" => "and",
        "||" => "or",
        "~" => "match",
        _ => return None,
    })
}

/// Parser over an in-memory rules text or single expression.
pub struct RulesParser {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    registry: FunctionRegistry,
}

impl RulesParser {
    pub fn new(text: &str, registry: &FunctionRegistry) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 0,
            registry: registry.clone(),
        }
    }

    /// Reads the file at `path` and returns a parser over its contents.
    pub fn from_path(path: impl AsRef<Path>, registry: &FunctionRegistry) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(&text, registry))
    }

    // ── Scanner ──────────────────────────────────────────────────────────────

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line + 1,
        }
    }

    /// Consumes the current character, maintaining the line counter.
    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skips a `#` comment through its terminating newline.
    fn skip_comment(&mut self) {
        while let Some(c) = self.advance() {
            if c == '\n' {
                break;
            }
        }
    }

    /// One-character lookahead. With `spaces` false, whitespace and comments
    /// are skipped first; with `spaces` true every character is significant
    /// (string bodies).
    fn peek(&mut self, spaces: bool) -> Option<char> {
        loop {
            let c = self.chars.get(self.pos).copied()?;
            if !spaces && c == '#' {
                self.skip_comment();
                continue;
            }
            if spaces || !c.is_whitespace() {
                return Some(c);
            }
            self.advance();
        }
    }

    /// Consumes and returns the next significant character; end of input is a
    /// parse error.
    fn next_char(&mut self, spaces: bool) -> Result<char, ParseError> {
        match self.peek(spaces) {
            Some(_) => Ok(self.advance().expect("peek saw a character")),
            None => Err(self.error_here("unexpected end of input")),
        }
    }

    /// Consumes exactly the characters of `expected`.
    fn consume(&mut self, expected: &str) -> Result<(), ParseError> {
        for want in expected.chars() {
            let got = self.next_char(false).map_err(|_| {
                self.error_here(format!("expected '{want}', got end of input"))
            })?;
            if got != want {
                return Err(self.error_here(format!("expected '{want}', got '{got}'")));
            }
        }
        Ok(())
    }

    // ── Tokens ───────────────────────────────────────────────────────────────

    /// An identifier: letters/underscore, then letters/digits/underscore/`.`.
    /// Callers position the scanner on the first character (whitespace
    /// already skipped); the body is read in space mode so the identifier
    /// ends at the first insignificant character.
    fn parse_ident(&mut self) -> Result<String, ParseError> {
        let mut s = String::new();
        while let Some(c) = self.peek(true) {
            let valid = if s.is_empty() {
                c.is_alphabetic() || c == '_'
            } else {
                c.is_alphanumeric() || c == '_' || c == '.'
            };
            if !valid {
                break;
            }
            s.push(self.advance().expect("peek saw a character"));
        }
        if s.is_empty() {
            return Err(self.error_here("expected an identifier"));
        }
        Ok(s)
    }

    /// A number literal: digits, optional `.digits`, optional
    /// `[eE][+-]?digits` exponent.
    fn parse_number(&mut self) -> Result<Expr, ParseError> {
        let mut s = String::new();
        while matches!(self.peek(true), Some(c) if c.is_ascii_digit()) {
            s.push(self.advance().expect("peek saw a digit"));
        }
        if self.peek(true) == Some('.') {
            s.push(self.advance().expect("peek saw '.'"));
            if !matches!(self.peek(true), Some(c) if c.is_ascii_digit()) {
                return Err(self.error_here("malformed number: expected digit after '.'"));
            }
            while matches!(self.peek(true), Some(c) if c.is_ascii_digit()) {
                s.push(self.advance().expect("peek saw a digit"));
            }
        }
        if matches!(self.peek(true), Some('e') | Some('E')) {
            s.push(self.advance().expect("peek saw exponent marker"));
            if matches!(self.peek(true), Some('+') | Some('-')) {
                s.push(self.advance().expect("peek saw sign"));
            }
            if !matches!(self.peek(true), Some(c) if c.is_ascii_digit()) {
                return Err(self.error_here("malformed number: expected exponent digits"));
            }
            while matches!(self.peek(true), Some(c) if c.is_ascii_digit()) {
                s.push(self.advance().expect("peek saw a digit"));
            }
        }
        let value: f64 = s
            .parse()
            .map_err(|_| self.error_here(format!("malformed number '{s}'")))?;
        Ok(Expr::Number(value))
    }

    /// A string literal in `'` or `"`. No escape processing; the quote is
    /// preserved on the AST node for faithful printing.
    fn parse_string(&mut self) -> Result<Expr, ParseError> {
        let quote = match self.peek(false) {
            Some(q @ ('\'' | '"')) => q,
            Some(c) => return Err(self.error_here(format!("invalid quote '{c}'"))),
            None => return Err(self.error_here("expected a string")),
        };
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                Some(c) if c == quote => break,
                Some(c) => value.push(c),
                None => return Err(self.error_here("unterminated string literal")),
            }
        }
        Ok(Expr::Str { value, quote })
    }

    fn make_call(&self, name: &str, args: Vec<Expr>) -> Result<Expr, ParseError> {
        let callable = self
            .registry
            .lookup(name)
            .ok_or_else(|| self.error_here(format!("unknown function '{name}'")))?;
        Ok(Expr::call(name, callable, args))
    }

    fn make_operator(&self, op: &str, args: Vec<Expr>) -> Result<Expr, ParseError> {
        let name = operator_function(op)
            .ok_or_else(|| self.error_here(format!("unknown operator '{op}'")))?;
        self.make_call(name, args)
    }

    // ── Grammar ──────────────────────────────────────────────────────────────

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek(false) {
            None => Err(self.error_here("unexpected end of input")),
            Some('(') => {
                self.consume("(")?;
                let e = self.parse_disjunction()?;
                self.consume(")")
                    .map_err(|_| self.error_here("unmatched '('"))?;
                Ok(e)
            }
            Some('-') => {
                self.consume("-")?;
                let inner = self.parse_atom()?;
                self.make_call("neg", vec![inner])
            }
            Some('!') => {
                self.consume("!")?;
                let inner = self.parse_atom()?;
                self.make_call("not", vec![inner])
            }
            Some('\'' | '"') => self.parse_string(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.parse_ident()?;
                if self.peek(false) == Some('(') {
                    let args = self.parse_list()?;
                    self.make_call(&name, args)
                } else {
                    self.make_call(&name, vec![])
                }
            }
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some(c) => Err(self.error_here(format!("unexpected character '{c}'"))),
        }
    }

    /// `(a, b, …)` argument list.
    fn parse_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        self.consume("(")?;
        while self.peek(false) != Some(')') {
            args.push(self.parse_expression()?);
            if self.peek(false) == Some(')') {
                break;
            }
            self.consume(",")?;
        }
        self.consume(")")?;
        Ok(args)
    }

    /// `^` is right-associative: `2^3^2` is `pow(2,pow(3,2))`.
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_atom()?;
        if self.peek(false) == Some('^') {
            self.consume("^")?;
            let exponent = self.parse_power()?;
            return self.make_operator("^", vec![base, exponent]);
        }
        Ok(base)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut result = self.parse_power()?;
        while let Some(c @ ('*' | '/')) = self.peek(false) {
            self.consume(&c.to_string())?;
            let rhs = self.parse_power()?;
            result = self.make_operator(&c.to_string(), vec![result, rhs])?;
        }
        Ok(result)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut result = self.parse_factor()?;
        while let Some(c @ ('+' | '-')) = self.peek(false) {
            self.consume(&c.to_string())?;
            let rhs = self.parse_factor()?;
            result = self.make_operator(&c.to_string(), vec![result, rhs])?;
        }
        Ok(result)
    }

    fn parse_test(&mut self) -> Result<Expr, ParseError> {
        let mut result = self.parse_term()?;
        while let Some(c @ ('<' | '>' | '=' | '!' | '~')) = self.peek(false) {
            self.consume(&c.to_string())?;
            let op = match c {
                '~' => "~".to_string(),
                '<' | '>' => {
                    if self.peek(false) == Some('=') {
                        self.consume("=")?;
                        format!("{c}=")
                    } else {
                        c.to_string()
                    }
                }
                // '==' and '!=' require the second '='.
                _ => {
                    self.consume("=")
                        .map_err(|_| self.error_here(format!("expected '{c}='")))?;
                    format!("{c}=")
                }
            };
            let rhs = self.parse_term()?;
            result = self.make_operator(&op, vec![result, rhs])?;
        }
        Ok(result)
    }

    fn parse_conjunction(&mut self) -> Result<Expr, ParseError> {
        let mut result = self.parse_test()?;
        while self.peek(false) == Some('&') {
            self.consume("&&")?;
            let rhs = self.parse_test()?;
            result = self.make_operator("&&", vec![result, rhs])?;
        }
        Ok(result)
    }

    fn parse_disjunction(&mut self) -> Result<Expr, ParseError> {
        let mut result = self.parse_conjunction()?;
        while self.peek(false) == Some('|') {
            self.consume("||")?;
            let rhs = self.parse_conjunction()?;
            result = self.make_operator("||", vec![result, rhs])?;
        }
        Ok(result)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_disjunction()
    }

    /// Parses the whole input as a single expression; trailing characters are
    /// an error. Used by tests and the rules-checking CLI.
    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        let result = self.parse_expression()?;
        if let Some(c) = self.peek(false) {
            return Err(self.error_here(format!("trailing input starting at '{c}'")));
        }
        Ok(result)
    }

    // ── Rules files ──────────────────────────────────────────────────────────

    /// `<string info> <condition> : <conclusion>`.
    fn parse_rule_body(&mut self) -> Result<(Expr, Expr, Expr), ParseError> {
        let info = self.parse_string()?;
        let condition = self.parse_expression()?;
        self.consume(":")?;
        let conclusion = self.parse_expression()?;
        Ok((info, condition, conclusion))
    }

    /// Parses a rules file into `rules`, appending statements in declaration
    /// order.
    pub fn parse_rules(&mut self, rules: &mut RuleSet) -> Result<(), ParseError> {
        while self.peek(false).is_some() {
            let keyword = self.parse_ident()?;
            let (info, condition, conclusion) = match keyword.as_str() {
                "limit" | "priority" | "permission" | "user" => self.parse_rule_body()?,
                _ => return Err(self.error_here(format!("unknown rule keyword '{keyword}'"))),
            };
            match keyword.as_str() {
                "limit" => rules.add_global_limit(info, condition, conclusion),
                "priority" => rules.add_priority(info, condition, conclusion),
                "permission" => rules.add_permission(info, condition, conclusion),
                "user" => rules.add_user_limit(info, condition, conclusion),
                _ => unreachable!("keyword validated above"),
            }
        }
        Ok(())
    }
}
