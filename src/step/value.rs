// src/step/value.rs
//
// Canonical property values. Anything stored here has already been through
// unit conversion: numbers are in canonical units, volumes may also be "all"
// or a percentage of the source contents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Flag(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Text(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::Text(s)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Number(v)
    }
}

impl From<usize> for PropValue {
    fn from(v: usize) -> Self {
        PropValue::Number(v as f64)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Flag(v)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(v: Vec<String>) -> Self {
        PropValue::List(v)
    }
}

impl From<Amount> for PropValue {
    fn from(a: Amount) -> Self {
        match a {
            Amount::Ml(v) => PropValue::Number(v),
            Amount::All => PropValue::Text(ALL.to_string()),
            Amount::Fraction(f) => PropValue::Text(format!("{}%", f * 100.0)),
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Flag(b) => write!(f, "{}", b),
            PropValue::Number(n) => write!(f, "{}", n),
            PropValue::Text(s) => write!(f, "{}", s),
            PropValue::List(l) => write!(f, "[{}]", l.join(", ")),
        }
    }
}

pub const ALL: &str = "all";

/// How much liquid a transfer moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Amount {
    /// Metered volume in mL.
    Ml(f64),
    /// Entire contents of the source.
    All,
    /// Share of the current source contents, 0 < f <= 1.
    Fraction(f64),
}

impl Amount {
    pub fn from_value(value: &PropValue) -> Option<Self> {
        match value {
            PropValue::Number(v) => Some(Amount::Ml(*v)),
            PropValue::Text(s) if s == ALL => Some(Amount::All),
            PropValue::Text(s) => s
                .strip_suffix('%')
                .and_then(|p| p.trim().parse::<f64>().ok())
                .map(|p| Amount::Fraction(p / 100.0)),
            _ => None,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Amount::All)
    }
}

/// Ordered name -> value map of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropValue>);

impl Properties {
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: PropValue) {
        self.0.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<PropValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropValue)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, PropValue> {
        &self.0
    }
}
