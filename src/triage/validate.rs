use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Missing,
    NotArray,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("no result"),
            Self::NotArray => f.write_str("result is not an array"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(Vec<Value>),
    Rejected(Rejection),
}

/// Accepts any JSON array. Element shapes, lengths and label membership are
/// left to the applier.
pub fn check(parsed_result: Option<Value>) -> Verdict {
    match parsed_result {
        None | Some(Value::Null) => Verdict::Rejected(Rejection::Missing),
        Some(Value::Array(entries)) => Verdict::Accepted(entries),
        Some(_) => Verdict::Rejected(Rejection::NotArray),
    }
}
