//! Pulling a JSON object out of free-form oracle text.

use super::oracle::truncate_str;
use crate::error::AgentError;
use serde_json::{Map, Value};

/// Interior of the first fenced block, skipping a language tag on the
/// opening line. Text without a fence is returned trimmed.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    // Language tag runs up to the first newline, e.g. ```json
    let body = match after_open.find('\n') {
        Some(nl)
            if after_open[..nl]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            &after_open[nl + 1..]
        }
        _ => after_open
            .strip_prefix("json")
            .unwrap_or(after_open),
    };
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Try to fix common JSON issues from LLM responses
fn fix_json_issues(json: &str) -> String {
    let mut fixed = String::with_capacity(json.len());
    let chars: Vec<char> = json.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        // Trailing commas before ] or }, allowing whitespace in between
        if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        let c = match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        };
        if c.is_control() && c != '\n' && c != '\t' && c != '\r' {
            continue;
        }
        fixed.push(c);
    }
    fixed
}

fn into_record(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => {
            let mut map = Map::new();
            map.insert("items".to_string(), Value::Array(items));
            Some(map)
        }
        _ => None,
    }
}

fn parse_fragment(fragment: &str) -> Option<Map<String, Value>> {
    serde_json::from_str::<Value>(fragment)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&fix_json_issues(fragment)).ok())
        .and_then(into_record)
}

/// Parse the structured record an oracle answer carries.
///
/// Whichever of `{` or `[` opens first decides the preferred shape; the
/// other is tried if that fails. A top-level array, even with a single
/// element, comes back as `{"items": [...]}`. Anything else is
/// `AgentError::MalformedOutput`.
pub fn parse_structured_record(text: &str) -> Result<Map<String, Value>, AgentError> {
    let clean = strip_markdown_fences(text);

    let array_first = match (clean.find('['), clean.find('{')) {
        (Some(bracket), Some(brace)) => bracket < brace,
        (Some(_), None) => true,
        _ => false,
    };
    let order = if array_first {
        [('[', ']'), ('{', '}')]
    } else {
        [('{', '}'), ('[', ']')]
    };
    for (open, close) in order {
        if let Some(record) = extract_json_fragment(clean, open, close).and_then(parse_fragment) {
            return Ok(record);
        }
    }

    if text.trim().is_empty() {
        return Err(AgentError::malformed("empty response"));
    }
    Err(AgentError::malformed(format!(
        "no JSON object found in response: {}",
        truncate_str(clean, 120)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        let record = parse_structured_record(r#"{"summary": "ok", "progress": 40}"#).unwrap();
        assert_eq!(record["summary"], "ok");
        assert_eq!(record["progress"], 40);
    }

    #[test]
    fn test_json_fence_with_prose() {
        let text = "Here is my analysis:\n```json\n{\"summary\": \"done\"}\n```\nLet me know.";
        assert_eq!(parse_structured_record(text).unwrap()["summary"], "done");
    }

    #[test]
    fn test_bare_fence() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(parse_structured_record(text).unwrap()["a"], 1);
    }

    #[test]
    fn test_unterminated_fence() {
        let text = "```json\n{\"a\": 1}";
        assert_eq!(parse_structured_record(text).unwrap()["a"], 1);
    }

    #[test]
    fn test_prose_around_object_without_fence() {
        let text = "Sure! {\"answer\": \"yes\", \"nested\": {\"k\": [1, 2]}} Hope that helps.";
        let record = parse_structured_record(text).unwrap();
        assert_eq!(record["nested"], json!({"k": [1, 2]}));
    }

    #[test]
    fn test_trailing_commas_and_smart_quotes_are_repaired() {
        let text = "{\u{201C}files\u{201D}: [\"a.rs\", \"b.rs\",  ], \"done\": true,\n}";
        let record = parse_structured_record(text).unwrap();
        assert_eq!(record["files"], json!(["a.rs", "b.rs"]));
        assert_eq!(record["done"], true);
    }

    #[test]
    fn test_top_level_array_is_wrapped() {
        let text = "```json\n[{\"title\": \"Add tests\"}, {\"title\": \"Fix login\"}]\n```";
        let record = parse_structured_record(text).unwrap();
        assert_eq!(record["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_single_element_array_is_wrapped() {
        let record = parse_structured_record("[{\"title\": \"Add tests\"}]").unwrap();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["items"]);
        assert_eq!(record["items"], json!([{"title": "Add tests"}]));

        let fenced = "Suggested tasks:\n```json\n[\n  {\"title\": \"Add tests\"}\n]\n```";
        assert_eq!(
            parse_structured_record(fenced).unwrap()["items"][0]["title"],
            "Add tests"
        );
    }

    #[test]
    fn test_object_with_array_field_stays_an_object() {
        let record = parse_structured_record("{\"tasks\": [{\"title\": \"Add tests\"}]}").unwrap();
        assert_eq!(record["tasks"][0]["title"], "Add tests");
        assert!(record.get("items").is_none());
    }

    #[test]
    fn test_bracketed_prose_before_object() {
        let text = "Notes [draft] follow: {\"answer\": \"yes\"}";
        assert_eq!(parse_structured_record(text).unwrap()["answer"], "yes");
    }

    #[test]
    fn test_scalar_array_is_wrapped() {
        let record = parse_structured_record("[1, 2, 3]").unwrap();
        assert_eq!(record["items"], json!([1, 2, 3]));
    }

    #[test]
    fn test_rejects_text_without_json() {
        let err = parse_structured_record("I could not analyse the repository.").unwrap_err();
        assert!(matches!(err, AgentError::MalformedOutput(_)));
        assert!(parse_structured_record("   ").is_err());
    }

    #[test]
    fn test_rejects_truncated_object() {
        assert!(parse_structured_record("{\"summary\": \"cut off").is_err());
        assert!(parse_structured_record("} backwards {").is_err());
    }

    #[test]
    fn test_strip_fences_keeps_unfenced_text() {
        assert_eq!(strip_markdown_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
