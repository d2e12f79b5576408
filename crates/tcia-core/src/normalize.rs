//! Coercion of loosely typed feed values into string, integer, date, and
//! string-list shapes.
//!
//! Every function here is total: hostile input degrades to an empty value,
//! never to a panic. The `parse_*` variants additionally report what was
//! recovered so callers can count anomalies.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::CountValue;

/// A value that could not be coerced into the shape a field expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldAnomaly {
    #[error("expected {expected}, got {raw:?}")]
    Unparseable { expected: &'static str, raw: String },
    #[error("negative value {0} where a count was expected")]
    Negative(i64),
}

impl FieldAnomaly {
    fn unparseable(expected: &'static str, value: &Value) -> Self {
        Self::Unparseable {
            expected,
            raw: match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Shape of a list-ish feed value after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListShape {
    Empty,
    Scalar(String),
    List(Vec<String>),
}

impl ListShape {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::Scalar(text) => vec![text],
            Self::List(items) => items,
        }
    }
}

pub fn classify_list(value: Option<&Value>) -> ListShape {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => ListShape::Empty,
        Some(Value::Array(items)) => ListShape::List(items.iter().filter_map(value_to_text).collect()),
        Some(Value::String(text)) => classify_text(text),
        Some(other) => value_to_text(other).map_or(ListShape::Empty, ListShape::Scalar),
    }
}

fn classify_text(text: &str) -> ListShape {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
        return ListShape::Empty;
    }
    match parse_literal(trimmed) {
        Some(Value::Array(items)) => ListShape::List(items.iter().filter_map(value_to_text).collect()),
        _ => ListShape::Scalar(trimmed.to_string()),
    }
}

pub fn normalize_list(value: Option<&Value>) -> Vec<String> {
    classify_list(value).into_vec()
}

/// Text form of a list element; `null` has none.
fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Scalar text; `null`, missing, and WordPress' `false` all become `""`.
pub fn normalize_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => value_to_text(other).unwrap_or_default(),
    }
}

/// Unwraps `{"rendered": ...}` title objects, including ones that arrive
/// stringified as a dict literal.
pub fn normalize_title(value: Option<&Value>) -> String {
    match value {
        Some(Value::Object(map)) => rendered_text(map).unwrap_or_else(|| normalize_string(value)),
        Some(Value::String(text)) => match parse_literal(text.trim()) {
            Some(Value::Object(map)) => rendered_text(&map).unwrap_or_else(|| text.trim().to_string()),
            _ => text.trim().to_string(),
        },
        other => normalize_string(other),
    }
}

fn rendered_text(map: &Map<String, Value>) -> Option<String> {
    map.get("rendered").map(|rendered| normalize_string(Some(rendered)))
}

pub fn parse_count(value: Option<&Value>) -> Result<u64, FieldAnomaly> {
    let Some(value) = value else {
        return Ok(0);
    };
    match value {
        Value::Null | Value::Bool(false) => Ok(0),
        Value::Number(n) => count_from_number(n).ok_or_else(|| FieldAnomaly::unparseable("count", value)),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
                return Ok(0);
            }
            if let Ok(n) = trimmed.parse::<u64>() {
                return Ok(n);
            }
            if let Ok(n) = trimmed.parse::<i64>() {
                return Err(FieldAnomaly::Negative(n));
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() && f >= 0.0 => Ok(f.trunc() as u64),
                Ok(f) if f.is_finite() => Err(FieldAnomaly::Negative(f.trunc() as i64)),
                _ => Err(FieldAnomaly::unparseable("count", value)),
            }
        }
        other => Err(FieldAnomaly::unparseable("count", other)),
    }
}

fn count_from_number(n: &Number) -> Option<u64> {
    if let Some(u) = n.as_u64() {
        return Some(u);
    }
    let f = n.as_f64()?;
    (f.is_finite() && f >= 0.0).then(|| f.trunc() as u64)
}

pub fn normalize_count(value: Option<&Value>) -> u64 {
    parse_count(value).unwrap_or(0)
}

/// Numeric value where upstream provides one, verbatim text otherwise.
pub fn normalize_count_value(value: Option<&Value>) -> CountValue {
    match value {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => CountValue::Int(i),
            None => CountValue::Text(n.to_string()),
        },
        Some(Value::String(text)) => match text.trim().parse::<i64>() {
            Ok(i) => CountValue::Int(i),
            Err(_) => CountValue::Text(text.trim().to_string()),
        },
        other => CountValue::Text(normalize_string(other)),
    }
}

/// Strict id parsing: ASCII digits only, so `"7.0"`, `"-1"` and `"abc"` are rejected.
pub fn parse_id(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

pub fn parse_id_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().filter(|id| *id >= 0),
        Value::String(text) => parse_id(text),
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn parse_date(value: Option<&Value>) -> Result<Option<NaiveDate>, FieldAnomaly> {
    let text = normalize_string(value);
    if text.is_empty() {
        return Ok(None);
    }
    parse_date_text(&text)
        .map(Some)
        .ok_or_else(|| FieldAnomaly::Unparseable { expected: "date", raw: text })
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        let year = text[0..4].parse().ok()?;
        let month = text[4..6].parse().ok()?;
        let day = text[6..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok().map(|dt| dt.date()))
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        })
}

pub fn normalize_date(value: Option<&Value>) -> Option<NaiveDate> {
    parse_date(value).ok().flatten()
}

/// First candidate that is non-empty once trimmed.
pub fn coalesce_non_empty(candidates: &[&str]) -> String {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Deepest container nesting [`parse_literal`] accepts, matching serde_json.
pub const MAX_LITERAL_DEPTH: usize = 128;

/// Parses a Python- or JSON-style literal: lists, tuples, dicts, quoted
/// strings, numbers, `True`/`False`/`None` and their JSON spellings.
/// Input nested deeper than [`MAX_LITERAL_DEPTH`] is rejected.
pub fn parse_literal(text: &str) -> Option<Value> {
    let mut parser = LiteralParser {
        chars: text.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    (parser.pos == parser.chars.len()).then_some(value)
}

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl LiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '[' => self.nested(|p| p.sequence('[', ']')),
            '(' => self.nested(|p| p.sequence('(', ')')),
            '{' => self.nested(Self::dict),
            '\'' | '"' => self.string().map(Value::String),
            c if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Option<Value>) -> Option<Value> {
        if self.depth >= MAX_LITERAL_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn sequence(&mut self, open: char, close: char) -> Option<Value> {
        if !self.eat(open) {
            return None;
        }
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Some(Value::Array(items));
            }
            items.push(self.value()?);
            if self.eat(',') {
                continue;
            }
            return self.eat(close).then_some(Value::Array(items));
        }
    }

    fn dict(&mut self) -> Option<Value> {
        if !self.eat('{') {
            return None;
        }
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Some(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(text) => text,
                other => other.to_string(),
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            if self.eat(',') {
                continue;
            }
            return self.eat('}').then_some(Value::Object(map));
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(out),
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'u' => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let code = u32::from_str_radix(&hex, 16).ok()?;
                        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                    other => out.push(other),
                },
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Ok(i) = text.parse::<i64>() {
            return Some(Value::from(i));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    }

    fn keyword(&mut self) -> Option<Value> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" | "true" => Some(Value::Bool(true)),
            "False" | "false" => Some(Value::Bool(false)),
            "None" | "null" | "nan" | "NaN" => Some(Value::Null),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list(value: Value) -> Vec<String> {
        normalize_list(Some(&value))
    }

    #[test]
    fn lists_pass_through_with_nulls_dropped() {
        assert_eq!(list(json!(["Lung", null, 3])), vec!["Lung", "3"]);
        assert_eq!(list(json!([])), Vec::<String>::new());
    }

    #[test]
    fn falsy_values_become_empty_lists() {
        assert!(normalize_list(None).is_empty());
        assert!(list(Value::Null).is_empty());
        assert!(list(json!(false)).is_empty());
        assert!(list(json!("")).is_empty());
        assert!(list(json!("  ")).is_empty());
        assert!(list(json!("FALSE")).is_empty());
    }

    #[test]
    fn stringified_literals_are_parsed() {
        assert_eq!(list(json!("['CT', 'MR']")), vec!["CT", "MR"]);
        assert_eq!(list(json!("[12, 13]")), vec!["12", "13"]);
        assert_eq!(list(json!(r#"["it's", "x"]"#)), vec!["it's", "x"]);
        assert_eq!(list(json!("('a', None,)")), vec!["a"]);
    }

    #[test]
    fn scalars_are_wrapped() {
        assert_eq!(list(json!("Breast")), vec!["Breast"]);
        assert_eq!(list(json!(4521)), vec!["4521"]);
        assert_eq!(list(json!("[broken")), vec!["[broken"]);
        assert_eq!(list(json!("42")), vec!["42"]);
        assert_eq!(
            classify_list(Some(&json!("{'a': 1}"))),
            ListShape::Scalar("{'a': 1}".into())
        );
    }

    #[test]
    fn normalize_list_is_idempotent() {
        let inputs = [
            json!(["a", null, 1, true, ["nested"]]),
            json!("['x', 'y']"),
            json!("plain"),
            json!(false),
            json!(null),
            json!("[oops"),
            json!(17),
            json!({"rendered": "x"}),
        ];
        for input in inputs {
            let once = list(input.clone());
            let twice = list(Value::from(once.clone()));
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn titles_unwrap_rendered() {
        assert_eq!(normalize_title(Some(&json!({"rendered": "CPTAC-LUAD"}))), "CPTAC-LUAD");
        assert_eq!(normalize_title(Some(&json!("{'rendered': 'LIDC-IDRI'}"))), "LIDC-IDRI");
        assert_eq!(normalize_title(Some(&json!(" Plain "))), "Plain");
        assert_eq!(normalize_title(None), "");
        assert_eq!(normalize_title(Some(&Value::Null)), "");
        assert_eq!(normalize_title(Some(&json!({"raw": "x"}))), r#"{"raw":"x"}"#);
    }

    #[test]
    fn counts_default_to_zero() {
        assert_eq!(normalize_count(Some(&json!("N/A"))), 0);
        assert_eq!(normalize_count(Some(&json!("1,010"))), 0);
        assert_eq!(normalize_count(None), 0);
        assert_eq!(normalize_count(Some(&json!(false))), 0);
        assert_eq!(normalize_count(Some(&json!(-4))), 0);
        assert_eq!(normalize_count(Some(&json!("512"))), 512);
        assert_eq!(normalize_count(Some(&json!(" 12.0 "))), 12);
        assert_eq!(normalize_count(Some(&json!(98))), 98);
    }

    #[test]
    fn count_anomalies_are_reported() {
        assert!(matches!(
            parse_count(Some(&json!("N/A"))),
            Err(FieldAnomaly::Unparseable { expected: "count", .. })
        ));
        assert_eq!(parse_count(Some(&json!("-3"))), Err(FieldAnomaly::Negative(-3)));
        assert_eq!(parse_count(Some(&json!(""))), Ok(0));
    }

    #[test]
    fn count_values_keep_text() {
        assert_eq!(normalize_count_value(Some(&json!("  41 "))), CountValue::Int(41));
        assert_eq!(normalize_count_value(Some(&json!(7))), CountValue::Int(7));
        assert_eq!(
            normalize_count_value(Some(&json!("see notes"))),
            CountValue::Text("see notes".into())
        );
        assert_eq!(normalize_count_value(None), CountValue::Text(String::new()));
    }

    #[test]
    fn ids_must_be_plain_digits() {
        assert_eq!(parse_id("43723"), Some(43723));
        assert_eq!(parse_id(" 7 "), Some(7));
        assert_eq!(parse_id("7.0"), None);
        assert_eq!(parse_id("-1"), None);
        assert_eq!(parse_id(""), None);
        assert_eq!(parse_id_value(Some(&json!(-2))), None);
        assert_eq!(parse_id_value(Some(&json!(11))), Some(11));
    }

    #[test]
    fn dates_accept_common_shapes() {
        let expected = NaiveDate::from_ymd_opt(2023, 5, 1);
        for raw in [
            "2023-05-01",
            "20230501",
            "2023-05-01T10:11:12",
            "2023-05-01 10:11:12",
            "2023-05-01T10:11:12+02:00",
            "05/01/2023",
            "May 1, 2023",
        ] {
            assert_eq!(normalize_date(Some(&json!(raw))), expected, "{raw}");
        }
        assert_eq!(normalize_date(Some(&json!("soon"))), None);
        assert_eq!(normalize_date(Some(&json!(false))), None);
        assert!(parse_date(Some(&json!("soon"))).is_err());
        assert_eq!(parse_date(None), Ok(None));
    }

    #[test]
    fn coalesce_picks_first_non_blank() {
        assert_eq!(coalesce_non_empty(&["", "  ", " Title ", "slug"]), "Title");
        assert_eq!(coalesce_non_empty(&["", " "]), "");
        assert_eq!(coalesce_non_empty(&[]), "");
    }

    #[test]
    fn literal_parser_handles_nesting_and_rejects_trailing_garbage() {
        assert_eq!(
            parse_literal("{'rendered': 'A', 'n': [1, 2.5, True]}"),
            Some(json!({"rendered": "A", "n": [1, 2.5, true]}))
        );
        assert_eq!(parse_literal("[1, 2] x"), None);
        assert_eq!(parse_literal("['unterminated]"), None);
        assert_eq!(parse_literal("'caf\\u00e9'"), Some(json!("café")));
    }

    #[test]
    fn deeply_nested_literals_degrade_to_scalars() {
        let depth = 200_000;
        let hostile = format!("{}{}", "[".repeat(depth), "]".repeat(depth));
        assert_eq!(parse_literal(&hostile), None);
        assert_eq!(
            classify_list(Some(&Value::String(hostile.clone()))),
            ListShape::Scalar(hostile)
        );

        let dicts = "{'a': ".repeat(depth);
        assert_eq!(parse_literal(&dicts), None);

        let limit = MAX_LITERAL_DEPTH;
        let deepest = format!("{}{}", "[".repeat(limit), "]".repeat(limit));
        assert!(matches!(parse_literal(&deepest), Some(Value::Array(_))));
        let too_deep = format!("{}{}", "[".repeat(limit + 1), "]".repeat(limit + 1));
        assert_eq!(parse_literal(&too_deep), None);
    }
}
