use crate::object::Object;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

/// Numbers closer than this compare equal.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Nil,
    String(Rc<str>),
    Obj(Object),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() < EPSILON,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Boolean(false) | Value::Nil)
    }

    pub fn string(s: &str) -> Self {
        Value::String(Rc::from(s))
    }

    /// Exact sameness: numbers by bit pattern, objects by identity.
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(num) => write!(f, "{num}"),
            Value::Boolean(bool) => write!(f, "{bool}"),
            Value::Nil => write!(f, "nil"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Obj(object) => write!(f, "{object}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_with_tolerance() {
        assert_eq!(Value::Number(0.1 + 0.2), Value::Number(0.3));
        assert_ne!(Value::Number(1.0), Value::Number(1.001));
    }

    #[test]
    fn identical_numbers_ignore_tolerance() {
        assert!(Value::Number(1.0).is_identical(&Value::Number(1.0)));
        assert!(!Value::Number(1.0).is_identical(&Value::Number(1.0000000001)));
        assert!(!Value::Number(0.0).is_identical(&Value::Number(-0.0)));
        assert!(Value::string("a").is_identical(&Value::string("a")));
    }

    #[test]
    fn equality_requires_same_tag() {
        assert_ne!(Value::Nil, Value::Boolean(false));
        assert_ne!(Value::Number(0.0), Value::Boolean(false));
        assert_ne!(Value::string("1"), Value::Number(1.0));
    }

    #[test]
    fn strings_compare_by_content() {
        assert_eq!(Value::string("ab"), Value::String(Rc::from(format!("a{}", "b"))));
    }

    #[test]
    fn display() {
        assert_eq!(Value::Number(7.0).to_string(), "7");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Boolean(true).to_string(), "true");
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::string("ab").to_string(), "\"ab\"");
    }

    #[test]
    fn falsiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Boolean(false).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::string("").is_falsey());
    }
}
