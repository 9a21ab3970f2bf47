//! LDAP-style requirement filters.
//!
//! Requirements select capabilities with filters such as
//! `(&(package=org.example)(version>=1.0.0)(!(version>=2.0.0)))`.
//! Filters are parsed once and evaluated against capability attributes,
//! either directly or through a capability index.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::attribute::{Attributes, Comparison};
use super::version::VersionRange;

/// Parsed requirement filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Matches everything, written `(*)` or an empty filter
    MatchAll,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal { attr: String, value: String },
    Approx { attr: String, value: String },
    GreaterEq { attr: String, value: String },
    LessEq { attr: String, value: String },
    Present { attr: String },
    /// Value split on `*`; the first and last pieces anchor the match
    Substring { attr: String, pieces: Vec<String> },
}

/// Filter parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Unexpected end of filter: {input}")]
    UnexpectedEnd { input: String },

    #[error("Unexpected character '{found}' at position {position} in filter: {input}")]
    UnexpectedChar {
        found: char,
        position: usize,
        input: String,
    },

    #[error("Missing attribute name at position {position} in filter: {input}")]
    MissingAttribute { position: usize, input: String },
}

impl Filter {
    /// Equality leaf
    pub fn equal(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equal {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Conjunction that collapses trivial cases
    pub fn and(mut filters: Vec<Filter>) -> Self {
        filters.retain(|f| *f != Filter::MatchAll);
        match filters.len() {
            0 => Filter::MatchAll,
            1 => filters.remove(0),
            _ => Filter::And(filters),
        }
    }

    /// Filter selecting versions of `attr` inside `range`
    pub fn from_range(attr: &str, range: &VersionRange) -> Self {
        if range.is_any() {
            return Filter::MatchAll;
        }

        let mut parts = Vec::new();
        let floor = Filter::GreaterEq {
            attr: attr.to_string(),
            value: range.floor.to_string(),
        };
        if range.floor_inclusive {
            parts.push(floor);
        } else {
            parts.push(Filter::Not(Box::new(Filter::LessEq {
                attr: attr.to_string(),
                value: range.floor.to_string(),
            })));
        }

        if let Some(ceiling) = &range.ceiling {
            if range.ceiling_inclusive {
                parts.push(Filter::LessEq {
                    attr: attr.to_string(),
                    value: ceiling.to_string(),
                });
            } else {
                parts.push(Filter::Not(Box::new(Filter::GreaterEq {
                    attr: attr.to_string(),
                    value: ceiling.to_string(),
                })));
            }
        }

        Filter::and(parts)
    }

    /// Evaluate the filter against an attribute map
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Filter::MatchAll => true,
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not(filter) => !filter.matches(attributes),
            Filter::Equal { attr, value } => compare(attributes, attr, Comparison::Equal, value),
            Filter::Approx { attr, value } => compare(attributes, attr, Comparison::Approx, value),
            Filter::GreaterEq { attr, value } => {
                compare(attributes, attr, Comparison::GreaterEq, value)
            }
            Filter::LessEq { attr, value } => compare(attributes, attr, Comparison::LessEq, value),
            Filter::Present { attr } => attributes.contains_key(attr),
            Filter::Substring { attr, pieces } => attributes
                .get(attr)
                .map(|v| v.matches_substring(pieces))
                .unwrap_or(false),
        }
    }

    /// Names of every attribute the filter mentions
    pub fn attribute_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Filter::MatchAll => {}
            Filter::And(filters) | Filter::Or(filters) => {
                for filter in filters {
                    filter.collect_names(names);
                }
            }
            Filter::Not(filter) => filter.collect_names(names),
            Filter::Equal { attr, .. }
            | Filter::Approx { attr, .. }
            | Filter::GreaterEq { attr, .. }
            | Filter::LessEq { attr, .. }
            | Filter::Present { attr }
            | Filter::Substring { attr, .. } => names.push(attr),
        }
    }
}

fn compare(attributes: &Attributes, attr: &str, op: Comparison, operand: &str) -> bool {
    attributes
        .get(attr)
        .map(|value| value.compare(op, operand))
        .unwrap_or(false)
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Filter::MatchAll);
        }
        let mut parser = Parser::new(trimmed);
        let filter = parser.parse_filter()?;
        parser.skip_whitespace();
        match parser.peek() {
            None => Ok(filter),
            Some(found) => Err(parser.unexpected(found)),
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn end(&self) -> FilterError {
        FilterError::UnexpectedEnd {
            input: self.input.to_string(),
        }
    }

    fn unexpected(&self, found: char) -> FilterError {
        FilterError::UnexpectedChar {
            found,
            position: self.pos,
            input: self.input.to_string(),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.unexpected(c)),
            None => Err(self.end()),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterError> {
        self.expect('(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some('*') if self.chars.get(self.pos + 1) == Some(&')') => {
                self.pos += 1;
                Filter::MatchAll
            }
            Some(_) => self.parse_leaf()?,
            None => return Err(self.end()),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('(') => filters.push(self.parse_filter()?),
                Some(_) => break,
                None => return Err(self.end()),
            }
        }
        Ok(filters)
    }

    fn parse_leaf(&mut self) -> Result<Filter, FilterError> {
        let start = self.pos;
        let mut attr = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '~' | '<' | '>' | '(' | ')') {
                break;
            }
            attr.push(c);
            self.pos += 1;
        }
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(FilterError::MissingAttribute {
                position: start,
                input: self.input.to_string(),
            });
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                Comparison::Equal
            }
            Some(c @ ('~' | '<' | '>')) => {
                self.pos += 1;
                match self.peek() {
                    Some('=') => self.pos += 1,
                    Some(other) => return Err(self.unexpected(other)),
                    None => return Err(self.end()),
                }
                match c {
                    '~' => Comparison::Approx,
                    '<' => Comparison::LessEq,
                    _ => Comparison::GreaterEq,
                }
            }
            Some(other) => return Err(self.unexpected(other)),
            None => return Err(self.end()),
        };

        let (pieces, has_wildcard) = self.parse_value()?;
        Ok(match op {
            Comparison::Equal if has_wildcard => {
                if pieces.iter().all(String::is_empty) && pieces.len() == 2 {
                    Filter::Present { attr }
                } else {
                    Filter::Substring { attr, pieces }
                }
            }
            Comparison::Equal => Filter::Equal {
                attr,
                value: pieces.concat(),
            },
            Comparison::Approx => Filter::Approx {
                attr,
                value: pieces.concat(),
            },
            Comparison::GreaterEq => Filter::GreaterEq {
                attr,
                value: pieces.concat(),
            },
            Comparison::LessEq => Filter::LessEq {
                attr,
                value: pieces.concat(),
            },
        })
    }

    /// Value up to the closing parenthesis, split on unescaped `*`
    fn parse_value(&mut self) -> Result<(Vec<String>, bool), FilterError> {
        let mut pieces = vec![String::new()];
        let mut has_wildcard = false;
        loop {
            match self.peek() {
                Some(')') => break,
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.end())?;
                    if let Some(last) = pieces.last_mut() {
                        last.push(escaped);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    has_wildcard = true;
                    pieces.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(last) = pieces.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
                None => return Err(self.end()),
            }
        }
        Ok((pieces, has_wildcard))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::MatchAll => f.write_str("(*)"),
            Filter::And(filters) => write_list(f, '&', filters),
            Filter::Or(filters) => write_list(f, '|', filters),
            Filter::Not(filter) => write!(f, "(!{})", filter),
            Filter::Equal { attr, value } => write!(f, "({}={})", attr, escape(value)),
            Filter::Approx { attr, value } => write!(f, "({}~={})", attr, escape(value)),
            Filter::GreaterEq { attr, value } => write!(f, "({}>={})", attr, escape(value)),
            Filter::LessEq { attr, value } => write!(f, "({}<={})", attr, escape(value)),
            Filter::Present { attr } => write!(f, "({}=*)", attr),
            Filter::Substring { attr, pieces } => {
                let escaped: Vec<String> = pieces.iter().map(|p| escape(p)).collect();
                write!(f, "({}={})", attr, escaped.join("*"))
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, op: char, filters: &[Filter]) -> fmt::Result {
    write!(f, "({}", op)?;
    for filter in filters {
        write!(f, "{}", filter)?;
    }
    f.write_str(")")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
