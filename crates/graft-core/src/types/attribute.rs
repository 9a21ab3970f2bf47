//! Typed capability attribute values and filter comparisons.

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::fmt;

use super::version::Version;

/// Ordered attribute map of a capability
pub type Attributes = IndexMap<String, AttributeValue>;

/// Ordered directive map of a capability or requirement
pub type Directives = IndexMap<String, String>;

/// A typed attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Version(Version),
    Long(i64),
    List(Vec<String>),
}

/// Comparison requested by a filter leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Approx,
    GreaterEq,
    LessEq,
}

impl AttributeValue {
    /// Values under which this attribute is stored in an attribute index
    pub fn index_keys(&self) -> Vec<String> {
        match self {
            AttributeValue::List(items) => items.clone(),
            other => vec![other.to_string()],
        }
    }

    /// Compare against the textual value of a filter leaf.
    ///
    /// The filter operand is coerced to this value's type; an operand that
    /// cannot be coerced never matches.
    pub fn compare(&self, op: Comparison, operand: &str) -> bool {
        match self {
            AttributeValue::String(value) => compare_strings(value, op, operand),
            AttributeValue::Version(value) => match operand.parse::<Version>() {
                Ok(operand) => compare_ordering(value.cmp(&operand), op),
                Err(_) => false,
            },
            AttributeValue::Long(value) => match operand.trim().parse::<i64>() {
                Ok(operand) => compare_ordering(value.cmp(&operand), op),
                Err(_) => false,
            },
            AttributeValue::List(items) => {
                items.iter().any(|item| compare_strings(item, op, operand))
            }
        }
    }

    /// Match a substring pattern split on `*` (first and last pieces anchor)
    pub fn matches_substring(&self, pieces: &[String]) -> bool {
        match self {
            AttributeValue::String(value) => substring_match(value, pieces),
            AttributeValue::List(items) => items.iter().any(|item| substring_match(item, pieces)),
            other => substring_match(&other.to_string(), pieces),
        }
    }

    /// View as a version, if this is a version attribute
    pub fn as_version(&self) -> Option<&Version> {
        match self {
            AttributeValue::Version(version) => Some(version),
            _ => None,
        }
    }

    /// View as a string, if this is a string attribute
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(value) => f.write_str(value),
            AttributeValue::Version(version) => write!(f, "{}", version),
            AttributeValue::Long(value) => write!(f, "{}", value),
            AttributeValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<Version> for AttributeValue {
    fn from(value: Version) -> Self {
        AttributeValue::Version(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Long(value)
    }
}

fn compare_ordering(ordering: Ordering, op: Comparison) -> bool {
    match op {
        Comparison::Equal | Comparison::Approx => ordering == Ordering::Equal,
        Comparison::GreaterEq => ordering != Ordering::Less,
        Comparison::LessEq => ordering != Ordering::Greater,
    }
}

fn compare_strings(value: &str, op: Comparison, operand: &str) -> bool {
    match op {
        Comparison::Equal => value == operand,
        Comparison::Approx => normalize(value) == normalize(operand),
        Comparison::GreaterEq => value >= operand,
        Comparison::LessEq => value <= operand,
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_match(value: &str, pieces: &[String]) -> bool {
    let Some((first, rest)) = pieces.split_first() else {
        return true;
    };
    let Some(remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };

    let mut cursor = remaining;
    for piece in middle {
        match cursor.find(piece.as_str()) {
            Some(at) => cursor = &cursor[at + piece.len()..],
            None => return false,
        }
    }
    cursor.ends_with(last.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_version_coercion() {
        let value = AttributeValue::Version(Version::new(1, 2, 0));
        assert!(value.compare(Comparison::Equal, "1.2"));
        assert!(value.compare(Comparison::GreaterEq, "1.0.0"));
        assert!(!value.compare(Comparison::LessEq, "1.1"));
        assert!(!value.compare(Comparison::Equal, "not-a-version"));
    }

    #[test]
    fn test_long_and_list_comparison() {
        let long = AttributeValue::Long(42);
        assert!(long.compare(Comparison::GreaterEq, "41"));
        assert!(!long.compare(Comparison::Equal, "forty-two"));

        let list = AttributeValue::List(pieces(&["a", "b"]));
        assert!(list.compare(Comparison::Equal, "b"));
        assert!(!list.compare(Comparison::Equal, "c"));
        assert_eq!(list.index_keys(), pieces(&["a", "b"]));
    }

    #[test]
    fn test_approx_ignores_case_and_whitespace() {
        let value = AttributeValue::from("Acme Corp");
        assert!(value.compare(Comparison::Approx, "acmecorp"));
    }

    #[test]
    fn test_substring_patterns() {
        let value = AttributeValue::from("org.example.util");
        assert!(value.matches_substring(&pieces(&["org.", ""])));
        assert!(value.matches_substring(&pieces(&["", "example", ""])));
        assert!(value.matches_substring(&pieces(&["org", "util"])));
        assert!(!value.matches_substring(&pieces(&["com.", ""])));
        assert!(!value.matches_substring(&pieces(&["", "core"])));
    }
}
