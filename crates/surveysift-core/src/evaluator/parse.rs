//! Strict parsing of model replies.
//!
//! The reply must contain one JSON object, bare or inside a Markdown code
//! fence. Every schema field is required, typed, and range-checked; nothing
//! is defaulted. Extra keys (the model's own overall score, for example) are
//! ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::domain::Assessment;

/// Why a reply did not satisfy the schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("reply contains no JSON object")]
    NoJsonObject,

    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` is null")]
    NullField(&'static str),

    #[error("field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field `{field}` must be an integer, got {value}")]
    NotIntegral { field: &'static str, value: String },

    #[error("field `{field}` = {value} is outside 1..=10")]
    OutOfRange { field: &'static str, value: String },
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").ok())
        .as_ref()
}

/// Locate the JSON object inside a reply.
pub fn extract_json_block(reply: &str) -> Result<&str, ParseError> {
    let fenced = fence_regex()
        .and_then(|re| re.captures(reply))
        .and_then(|c| c.get(1));
    let body = match fenced {
        Some(inner) => inner.as_str().trim(),
        None => reply.trim(),
    };
    let start = body.find('{').ok_or(ParseError::NoJsonObject)?;
    let end = body.rfind('}').ok_or(ParseError::NoJsonObject)?;
    if end < start {
        return Err(ParseError::NoJsonObject);
    }
    Ok(&body[start..=end])
}

/// Parse and validate a reply into an [`Assessment`].
pub fn parse_assessment(reply: &str) -> Result<Assessment, ParseError> {
    let block = extract_json_block(reply)?;
    let value: Value =
        serde_json::from_str(block).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(ParseError::NoJsonObject)?;

    Ok(Assessment {
        relevance_score: score(object, "relevance_score")?,
        survey_score: score(object, "survey_score")?,
        quality_score: score(object, "quality_score")?,
        is_survey: boolean(object, "is_survey")?,
        reasoning: string(object, "reasoning")?,
        survey_indicators: string_list(object, "survey_indicators")?,
        key_topics: string_list(object, "key_topics")?,
    })
}

fn field<'a>(object: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, ParseError> {
    match object.get(name) {
        None => Err(ParseError::MissingField(name)),
        Some(Value::Null) => Err(ParseError::NullField(name)),
        Some(v) => Ok(v),
    }
}

fn score(object: &Map<String, Value>, name: &'static str) -> Result<u8, ParseError> {
    let value = field(object, name)?;
    let number = value.as_f64().ok_or(ParseError::WrongType {
        field: name,
        expected: "integer",
    })?;
    if number.fract() != 0.0 {
        return Err(ParseError::NotIntegral {
            field: name,
            value: value.to_string(),
        });
    }
    if !(1.0..=10.0).contains(&number) {
        return Err(ParseError::OutOfRange {
            field: name,
            value: value.to_string(),
        });
    }
    Ok(number as u8)
}

fn boolean(object: &Map<String, Value>, name: &'static str) -> Result<bool, ParseError> {
    field(object, name)?.as_bool().ok_or(ParseError::WrongType {
        field: name,
        expected: "boolean",
    })
}

fn string(object: &Map<String, Value>, name: &'static str) -> Result<String, ParseError> {
    field(object, name)?
        .as_str()
        .map(str::to_string)
        .ok_or(ParseError::WrongType {
            field: name,
            expected: "string",
        })
}

fn string_list(object: &Map<String, Value>, name: &'static str) -> Result<Vec<String>, ParseError> {
    let wrong = ParseError::WrongType {
        field: name,
        expected: "array of strings",
    };
    let items = field(object, name)?.as_array().ok_or_else(|| wrong.clone())?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(|| wrong.clone()))
        .collect()
}
