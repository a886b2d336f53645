//! Parser for the schema text format.
//!
//! Line-oriented, case-sensitive, UTF-8. Comment lines begin with `#`.
//! Statements end with a period and may span lines:
//!
//! ```text
//! Decl edge(A.Type<name>, B.Type<name>).
//! path(X, Y) :- edge(X, Y).
//! total(X, T) :- score(X, Y) |> do fn:group_by(X), let T = fn:Sum(Y).
//! regular(U) :- user(U), !admin(U).
//! edge(/a, /b).
//! ```

use crate::datalog::schema::{
    AggFunc, AggSpec, CompareOp, DeclParam, Literal, Pipeline, PredicateDecl, Rule, Transform,
};
use crate::datalog::term::{Atom, Const, Fact, Term, TypeTag};
use crate::error::{Error, Result};

/// A parsed top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Predicate declaration
    Decl(PredicateDecl),
    /// Horn clause
    Rule(Rule),
    /// Ground fact
    Fact(Fact),
}

/// Parse a full schema text into statements.
pub fn parse_program(text: &str) -> Result<Vec<Statement>> {
    Parser::new(text)?.parse_program()
}

/// Parse a single statement (a control-channel update): one fact or rule,
/// trailing period required.
pub fn parse_statement(text: &str) -> Result<Statement> {
    let mut statements = Parser::new(text)?.parse_program()?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        n => Err(Error::parse_failure(
            1,
            format!("expected exactly one statement, found {}", n),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Var(String),
    Name(String),
    Str(String),
    Number(i64),
    Float(f64),
    Bytes(Vec<u8>),
    LParen,
    RParen,
    Comma,
    Dot,
    Turnstile,
    Bang,
    Pipe,
    Colon,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Ne,
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Result<Self> {
        Ok(Self {
            toks: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos.min(self.toks.len().saturating_sub(1)))
            .map(|(_, l)| *l)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        let line = self.line();
        match self.next() {
            Some(t) if t == tok => Ok(()),
            other => Err(Error::parse_failure(
                line,
                format!("expected {}, found {:?}", what, other),
            )),
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Statement>> {
        let mut out = Vec::new();
        while self.peek().is_some() {
            out.push(self.parse_statement()?);
        }
        Ok(out)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek() {
            Some(Tok::Var(v)) if v == "Decl" => self.parse_decl(),
            _ => self.parse_clause(),
        }
    }

    /// `Decl p(X.Type<name>, ...).`
    fn parse_decl(&mut self) -> Result<Statement> {
        self.next(); // Decl
        let line = self.line();
        let name = match self.next() {
            Some(Tok::Ident(name)) => name,
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("expected predicate name after Decl, found {:?}", other),
                ))
            }
        };
        self.expect(Tok::LParen, "(")?;
        let mut params = Vec::new();
        loop {
            let line = self.line();
            let var = match self.next() {
                Some(Tok::Var(v)) => v,
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected parameter variable, found {:?}", other),
                    ))
                }
            };
            self.expect(Tok::Dot, ".")?;
            match self.next() {
                Some(Tok::Var(t)) if t == "Type" => {}
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("missing type tag for parameter {}: found {:?}", var, other),
                    ))
                }
            }
            self.expect(Tok::Lt, "<")?;
            let tag = match self.next() {
                Some(Tok::Ident(t)) => TypeTag::parse(&t).ok_or_else(|| {
                    Error::parse_failure(line, format!("unknown type tag: {}", t))
                })?,
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected type tag, found {:?}", other),
                    ))
                }
            };
            self.expect(Tok::Gt, ">")?;
            params.push(DeclParam { var, tag });
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break,
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected , or ) in declaration, found {:?}", other),
                    ))
                }
            }
        }
        self.expect(Tok::Dot, "terminating period")?;
        Ok(Statement::Decl(PredicateDecl { name, params }))
    }

    /// Fact `p(...).` or rule `h(...) :- body.`
    fn parse_clause(&mut self) -> Result<Statement> {
        let head = self.parse_atom()?;
        match self.next() {
            Some(Tok::Dot) => {
                let line = self.line();
                let fact = head.to_fact().ok_or_else(|| {
                    Error::parse_failure(line, "facts must be ground".to_string())
                })?;
                Ok(Statement::Fact(fact))
            }
            Some(Tok::Turnstile) => {
                let (body, pipeline) = self.parse_body()?;
                Ok(Statement::Rule(Rule {
                    head,
                    body,
                    pipeline,
                }))
            }
            other => Err(Error::parse_failure(
                self.line(),
                format!("expected . or :- after head atom, found {:?}", other),
            )),
        }
    }

    fn parse_body(&mut self) -> Result<(Vec<Literal>, Option<Pipeline>)> {
        let mut body = vec![self.parse_literal()?];
        let mut pipeline = None;
        loop {
            match self.next() {
                Some(Tok::Comma) => body.push(self.parse_literal()?),
                Some(Tok::Pipe) => {
                    pipeline = Some(self.parse_pipeline()?);
                    break;
                }
                Some(Tok::Dot) => break,
                other => {
                    return Err(Error::parse_failure(
                        self.line(),
                        format!("expected , |> or . in rule body, found {:?}", other),
                    ))
                }
            }
        }
        Ok((body, pipeline))
    }

    /// `do fn:group_by(K, ...), let T = fn:Sum(X), ... .`
    fn parse_pipeline(&mut self) -> Result<Pipeline> {
        let line = self.line();
        match self.next() {
            Some(Tok::Ident(kw)) if kw == "do" => {}
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("expected do after |>, found {:?}", other),
                ))
            }
        }
        let func = self.parse_fn_name()?;
        if func != "group_by" {
            return Err(Error::parse_failure(
                line,
                format!("expected fn:group_by, found fn:{}", func),
            ));
        }
        self.expect(Tok::LParen, "(")?;
        let mut group_by = Vec::new();
        loop {
            match self.next() {
                Some(Tok::Var(v)) => group_by.push(v),
                Some(Tok::RParen) if group_by.is_empty() => break,
                other => {
                    return Err(Error::parse_failure(
                        self.line(),
                        format!("expected grouping variable, found {:?}", other),
                    ))
                }
            }
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break,
                other => {
                    return Err(Error::parse_failure(
                        self.line(),
                        format!("expected , or ) in group_by, found {:?}", other),
                    ))
                }
            }
        }

        let mut lets = Vec::new();
        loop {
            match self.next() {
                Some(Tok::Dot) => break,
                Some(Tok::Comma) => {}
                other => {
                    return Err(Error::parse_failure(
                        self.line(),
                        format!("expected , or . in pipeline, found {:?}", other),
                    ))
                }
            }
            let line = self.line();
            match self.next() {
                Some(Tok::Ident(kw)) if kw == "let" => {}
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected let binding in pipeline, found {:?}", other),
                    ))
                }
            }
            let var = match self.next() {
                Some(Tok::Var(v)) => v,
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected variable after let, found {:?}", other),
                    ))
                }
            };
            self.expect(Tok::Assign, "=")?;
            let func_name = self.parse_fn_name()?;
            let func = AggFunc::parse(&func_name).ok_or_else(|| {
                Error::parse_failure(line, format!("unknown aggregation fn:{}", func_name))
            })?;
            self.expect(Tok::LParen, "(")?;
            let input = match self.next() {
                Some(Tok::Var(v)) => {
                    self.expect(Tok::RParen, ")")?;
                    Some(v)
                }
                Some(Tok::RParen) => None,
                other => {
                    return Err(Error::parse_failure(
                        line,
                        format!("expected aggregation input, found {:?}", other),
                    ))
                }
            };
            lets.push(AggSpec { var, func, input });
        }
        if lets.is_empty() {
            return Err(Error::parse_failure(
                line,
                "aggregation pipeline requires at least one let binding".to_string(),
            ));
        }
        Ok(Pipeline { group_by, lets })
    }

    fn parse_fn_name(&mut self) -> Result<String> {
        let line = self.line();
        match self.next() {
            Some(Tok::Ident(f)) if f == "fn" => {}
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("expected fn: prefix, found {:?}", other),
                ))
            }
        }
        self.expect(Tok::Colon, ":")?;
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            Some(Tok::Var(name)) => Ok(name),
            other => Err(Error::parse_failure(
                line,
                format!("expected function name, found {:?}", other),
            )),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.peek() {
            Some(Tok::Bang) => {
                self.next();
                Ok(Literal::Neg(self.parse_atom()?))
            }
            Some(Tok::Ident(kw)) if kw == "let" => {
                self.next();
                let line = self.line();
                let var = match self.next() {
                    Some(Tok::Var(v)) => v,
                    other => {
                        return Err(Error::parse_failure(
                            line,
                            format!("expected variable after let, found {:?}", other),
                        ))
                    }
                };
                self.expect(Tok::Assign, "=")?;
                let func_name = self.parse_fn_name()?;
                let func = Transform::parse(&func_name).ok_or_else(|| {
                    Error::parse_failure(line, format!("unknown transform fn:{}", func_name))
                })?;
                self.expect(Tok::LParen, "(")?;
                let mut args = Vec::new();
                loop {
                    args.push(self.parse_term()?);
                    match self.next() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RParen) => break,
                        other => {
                            return Err(Error::parse_failure(
                                self.line(),
                                format!("expected , or ) in transform args, found {:?}", other),
                            ))
                        }
                    }
                }
                Ok(Literal::Let { var, func, args })
            }
            Some(Tok::Ident(_)) => {
                // Atom when followed by '('; otherwise a comparison lhs.
                if matches!(self.toks.get(self.pos + 1), Some((Tok::LParen, _))) {
                    Ok(Literal::Pos(self.parse_atom()?))
                } else {
                    self.parse_compare()
                }
            }
            _ => self.parse_compare(),
        }
    }

    fn parse_compare(&mut self) -> Result<Literal> {
        let lhs = self.parse_term()?;
        let line = self.line();
        let op = match self.next() {
            Some(Tok::Lt) => CompareOp::Lt,
            Some(Tok::Le) => CompareOp::Le,
            Some(Tok::Gt) => CompareOp::Gt,
            Some(Tok::Ge) => CompareOp::Ge,
            Some(Tok::Assign) => CompareOp::Eq,
            Some(Tok::Ne) => CompareOp::Ne,
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("expected comparison operator, found {:?}", other),
                ))
            }
        };
        let rhs = self.parse_term()?;
        Ok(Literal::Compare { op, lhs, rhs })
    }

    fn parse_atom(&mut self) -> Result<Atom> {
        let line = self.line();
        let predicate = match self.next() {
            Some(Tok::Ident(name)) => name,
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("expected predicate name, found {:?}", other),
                ))
            }
        };
        self.expect(Tok::LParen, "(")?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Tok::RParen)) {
            self.next();
            return Ok(Atom::new(predicate, args));
        }
        loop {
            args.push(self.parse_term()?);
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break,
                other => {
                    return Err(Error::parse_failure(
                        self.line(),
                        format!("expected , or ) in atom, found {:?}", other),
                    ))
                }
            }
        }
        Ok(Atom::new(predicate, args))
    }

    fn parse_term(&mut self) -> Result<Term> {
        let line = self.line();
        match self.next() {
            Some(Tok::Var(v)) => Ok(Term::Var(v)),
            Some(Tok::Name(n)) => Ok(Term::Const(Const::Name(n))),
            Some(Tok::Str(s)) => Ok(Term::Const(Const::Str(s))),
            Some(Tok::Number(n)) => Ok(Term::Const(Const::Number(n))),
            Some(Tok::Float(f)) => Ok(Term::Const(Const::Float(f))),
            Some(Tok::Bytes(b)) => Ok(Term::Const(Const::Bytes(b))),
            Some(Tok::Ident(id)) if id == "true" => Ok(Term::Const(Const::Bool(true))),
            Some(Tok::Ident(id)) if id == "false" => Ok(Term::Const(Const::Bool(false))),
            other => Err(Error::parse_failure(
                line,
                format!("expected term, found {:?}", other),
            )),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(Tok, usize)>> {
    let mut toks = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1usize;
    let mut at_line_start = true;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                line += 1;
                at_line_start = true;
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '#' if at_line_start => {
                // Comment line: consume to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
                at_line_start = true;
                continue;
            }
            _ => {}
        }
        at_line_start = false;

        match c {
            '(' => {
                chars.next();
                toks.push((Tok::LParen, line));
            }
            ')' => {
                chars.next();
                toks.push((Tok::RParen, line));
            }
            ',' => {
                chars.next();
                toks.push((Tok::Comma, line));
            }
            '.' => {
                chars.next();
                toks.push((Tok::Dot, line));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    toks.push((Tok::Ne, line));
                } else {
                    toks.push((Tok::Bang, line));
                }
            }
            ':' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    chars.next();
                    toks.push((Tok::Turnstile, line));
                } else {
                    toks.push((Tok::Colon, line));
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    toks.push((Tok::Pipe, line));
                } else {
                    return Err(Error::parse_failure(line, "stray | character".to_string()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    toks.push((Tok::Le, line));
                } else {
                    toks.push((Tok::Lt, line));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    toks.push((Tok::Ge, line));
                } else {
                    toks.push((Tok::Gt, line));
                }
            }
            '=' => {
                chars.next();
                toks.push((Tok::Assign, line));
            }
            '/' => {
                chars.next();
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
                {
                    return Err(Error::parse_failure(
                        line,
                        "atom names must be lowercase after /".to_string(),
                    ));
                }
                toks.push((Tok::Name(name), line));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            other => {
                                return Err(Error::parse_failure(
                                    line,
                                    format!("invalid escape: \\{:?}", other),
                                ))
                            }
                        },
                        '\n' => {
                            return Err(Error::parse_failure(
                                line,
                                "unterminated string".to_string(),
                            ))
                        }
                        c => s.push(c),
                    }
                }
                if !closed {
                    return Err(Error::parse_failure(line, "unterminated string".to_string()));
                }
                toks.push((Tok::Str(s), line));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut raw = String::new();
                if c == '-' {
                    raw.push(c);
                    chars.next();
                }
                // 0x prefix: bytes literal
                if chars.peek() == Some(&'0') {
                    let mut look = chars.clone();
                    look.next();
                    if look.peek() == Some(&'x') && raw.is_empty() {
                        chars.next();
                        chars.next();
                        let mut hex = String::new();
                        while let Some(&c) = chars.peek() {
                            if c.is_ascii_hexdigit() {
                                hex.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        if hex.len() % 2 != 0 {
                            return Err(Error::parse_failure(
                                line,
                                "bytes literal needs an even number of hex digits".to_string(),
                            ));
                        }
                        let bytes = (0..hex.len())
                            .step_by(2)
                            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
                            .collect();
                        toks.push((Tok::Bytes(bytes), line));
                        continue;
                    }
                }
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        raw.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Float only when a digit follows the dot, so `42.` stays
                // a number plus statement terminator.
                let mut is_float = false;
                if chars.peek() == Some(&'.') {
                    let mut look = chars.clone();
                    look.next();
                    if look.peek().is_some_and(|c| c.is_ascii_digit()) {
                        is_float = true;
                        raw.push('.');
                        chars.next();
                        while let Some(&c) = chars.peek() {
                            if c.is_ascii_digit() {
                                raw.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                }
                if is_float {
                    let f = raw.parse::<f64>().map_err(|e| {
                        Error::parse_failure(line, format!("bad float {}: {}", raw, e))
                    })?;
                    toks.push((Tok::Float(f), line));
                } else {
                    let n = raw.parse::<i64>().map_err(|e| {
                        Error::parse_failure(line, format!("bad number {}: {}", raw, e))
                    })?;
                    toks.push((Tok::Number(n), line));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let first_upper = ident.chars().next().is_some_and(|c| c.is_ascii_uppercase());
                if first_upper {
                    toks.push((Tok::Var(ident), line));
                } else {
                    toks.push((Tok::Ident(ident), line));
                }
            }
            other => {
                return Err(Error::parse_failure(
                    line,
                    format!("unexpected character: {:?}", other),
                ))
            }
        }
    }
    Ok(toks)
}
