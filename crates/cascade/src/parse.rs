//! Parsing of structured collaborator output.
//!
//! Generation output is supposed to be a JSON document but often arrives
//! wrapped in prose or code fences, or with trailing commas. Parsing yields
//! a [`ParseResult`]; a `Repairable` result gets exactly one [`repair`]
//! attempt.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

static RE_TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult<T> {
    Ok(T),
    /// Not valid as-is, but contains something that looks like JSON.
    Repairable(String),
    /// Nothing to work with.
    Malformed(String),
}

impl<T> ParseResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ParseResult::Ok(_))
    }
}

/// Parses raw output strictly.
pub fn parse_output<T: DeserializeOwned>(raw: &str) -> ParseResult<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParseResult::Malformed("empty output".to_string());
    }
    match serde_json::from_str::<T>(trimmed) {
        Ok(value) => ParseResult::Ok(value),
        Err(e) if trimmed.contains('{') || trimmed.contains('[') => {
            log::debug!("Output not directly parseable ({}), marking repairable", e);
            ParseResult::Repairable(raw.to_string())
        }
        Err(e) => ParseResult::Malformed(e.to_string()),
    }
}

/// The single repair attempt: strip code fences, cut the first balanced
/// JSON value out of surrounding text, drop trailing commas, re-parse.
/// Never returns `Repairable`.
pub fn repair<T: DeserializeOwned>(raw: &str) -> ParseResult<T> {
    let unfenced = strip_code_fences(raw);
    let extracted = extract_json(&unfenced);
    let cleaned = drop_trailing_commas(extracted);
    match serde_json::from_str::<T>(&cleaned) {
        Ok(value) => ParseResult::Ok(value),
        Err(e) => ParseResult::Malformed(format!("unrepairable output: {}", e)),
    }
}

/// Strict parse, then one repair if it looked salvageable.
pub fn parse_with_repair<T: DeserializeOwned>(raw: &str) -> ParseResult<T> {
    match parse_output(raw) {
        ParseResult::Repairable(text) => repair(&text),
        other => other,
    }
}

fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes commas directly before a closing bracket. String literals are
/// copied untouched, so `",}"` inside a value survives.
fn drop_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in json.char_indices() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                out.push_str(&json[segment_start..=i]);
                segment_start = i + 1;
                in_string = false;
            }
        } else if c == '"' {
            out.push_str(&RE_TRAILING_COMMA.replace_all(&json[segment_start..i], "$1"));
            segment_start = i;
            in_string = true;
        }
    }

    let tail = &json[segment_start..];
    if in_string {
        out.push_str(tail);
    } else {
        out.push_str(&RE_TRAILING_COMMA.replace_all(tail, "$1"));
    }
    out
}

/// Returns the first balanced `{...}` or `[...]`, tracking string
/// boundaries and escapes. Returns the input unchanged if none starts.
fn extract_json(response: &str) -> &str {
    let start = match response.find(['{', '[']) {
        Some(idx) => idx,
        None => return response,
    };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut end = response.len();

    for (i, c) in response[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    &response[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    type Object = Map<String, Value>;

    #[test]
    fn test_clean_json_is_ok() {
        let result: ParseResult<Object> = parse_output(r#"{"title": "Hi"}"#);
        assert!(result.is_ok());
    }

    #[test]
    fn test_prose_wrapped_json_is_repairable() {
        let raw = "Sure! Here you go:\n```json\n{\"title\": \"Hi\",}\n```\nEnjoy.";
        let result: ParseResult<Object> = parse_output(raw);
        assert!(matches!(result, ParseResult::Repairable(_)));

        match repair::<Object>(raw) {
            ParseResult::Ok(obj) => assert_eq!(obj["title"], "Hi"),
            other => panic!("expected repair to succeed, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_is_malformed() {
        let result: ParseResult<Object> = parse_output("I cannot help with that.");
        assert!(matches!(result, ParseResult::Malformed(_)));
        let empty: ParseResult<Object> = parse_output("   ");
        assert!(matches!(empty, ParseResult::Malformed(_)));
    }

    #[test]
    fn test_truncated_json_stays_malformed_after_repair() {
        let result: ParseResult<Object> = parse_with_repair(r#"{"title": "Hi", "body": "#);
        assert!(matches!(result, ParseResult::Malformed(_)));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let raw = r#"note {"title": "a } tricky { one", "n": 1} trailing"#;
        match parse_with_repair::<Object>(raw) {
            ParseResult::Ok(obj) => assert_eq!(obj["title"], "a } tricky { one"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trailing_comma_repair_leaves_string_values_alone() {
        let raw = "Result:\n{\"title\": \"a,} b ,]\", \"tags\": [\"x\", ],}";
        match parse_with_repair::<Object>(raw) {
            ParseResult::Ok(obj) => {
                assert_eq!(obj["title"], "a,} b ,]");
                assert_eq!(obj["tags"], serde_json::json!(["x"]));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(drop_trailing_commas(r#"{"q": "\\",}"#), r#"{"q": "\\"}"#);
    }

    #[test]
    fn test_wrong_shape_is_not_ok() {
        // An array is valid JSON but not an object.
        let result: ParseResult<Object> = parse_with_repair("[1, 2]");
        assert!(!result.is_ok());
    }
}
