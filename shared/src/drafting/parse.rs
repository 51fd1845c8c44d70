//! Defensive parsing of model output.

use serde_json::Value;

use super::DraftingError;
use crate::models::{Analysis, Urgency};

const MAX_INTENT_CHARS: usize = 200;
const MAX_DRAFT_CHARS: usize = 12_000;

/// Pull a JSON object out of free-form model output.
///
/// A fenced code block is preferred; otherwise the slice from the first `{`
/// to the last `}` is parsed.
pub fn extract_json(output: &str) -> Result<Value, DraftingError> {
    if let Some(block) = fenced_block(output) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(block) {
            return Ok(value);
        }
    }

    let start = output.find('{');
    let end = output.rfind('}');
    let slice = match (start, end) {
        (Some(start), Some(end)) if start < end => &output[start..=end],
        _ => {
            return Err(DraftingError::MalformedOutput(
                "no JSON object in output".to_string(),
            ))
        }
    };

    match serde_json::from_str::<Value>(slice) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(DraftingError::MalformedOutput(
            "output is not a JSON object".to_string(),
        )),
        Err(e) => Err(DraftingError::MalformedOutput(e.to_string())),
    }
}

/// Contents of the first ``` fence, minus an optional language tag.
fn fenced_block(output: &str) -> Option<&str> {
    let open = output.find("```")?;
    let after_fence = &output[open + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Check a parsed object against the exact output schema.
///
/// Numbers are rounded to the nearest integer; anything else that does not fit
/// is rejected rather than coerced.
pub fn validate_analysis(value: &Value) -> Result<Analysis, DraftingError> {
    let object = value
        .as_object()
        .ok_or_else(|| violation("expected a JSON object"))?;

    let intent = required_text(object.get("intent"), "intent", MAX_INTENT_CHARS)?;

    let urgency = match object.get("urgency").and_then(Value::as_str) {
        Some("low") => Urgency::Low,
        Some("medium") => Urgency::Medium,
        Some("high") => Urgency::High,
        Some(other) => return Err(violation(&format!("urgency '{}' is not low|medium|high", other))),
        None => return Err(violation("urgency is missing")),
    };

    let confidence = bounded_integer(object.get("confidence"), "confidence", 0, 100)?;
    let sentiment = bounded_integer(object.get("sentiment"), "sentiment", 1, 10)?;

    let draft = object
        .get("draftResponse")
        .or_else(|| object.get("draft_response"));
    let draft_response = required_text(draft, "draftResponse", MAX_DRAFT_CHARS)?;

    Ok(Analysis {
        intent,
        urgency,
        confidence,
        sentiment,
        draft_response,
    })
}

fn violation(message: &str) -> DraftingError {
    DraftingError::SchemaViolation(message.to_string())
}

fn required_text(value: Option<&Value>, field: &str, max_chars: usize) -> Result<String, DraftingError> {
    let text = value
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| violation(&format!("{} must be a string", field)))?;

    if text.is_empty() {
        return Err(violation(&format!("{} is empty", field)));
    }
    if text.chars().count() > max_chars {
        return Err(violation(&format!("{} exceeds {} characters", field, max_chars)));
    }
    Ok(text.to_string())
}

fn bounded_integer(value: Option<&Value>, field: &str, min: i32, max: i32) -> Result<i32, DraftingError> {
    let number = value
        .and_then(Value::as_f64)
        .ok_or_else(|| violation(&format!("{} must be a number", field)))?;

    let rounded = number.round();
    if !rounded.is_finite() || rounded < f64::from(min) || rounded > f64::from(max) {
        return Err(violation(&format!(
            "{} {} is outside {}-{}",
            field, number, min, max
        )));
    }
    Ok(rounded as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "intent": "Shipping Issue",
            "urgency": "medium",
            "confidence": 72,
            "sentiment": 3,
            "draftResponse": "Your parcel is on its way.",
        })
    }

    #[test]
    fn test_prefers_fenced_block() {
        let output = "Here you go {not json}\n```json\n{\"a\": 1}\n```\ntrailing }";
        assert_eq!(extract_json(output).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_bare_fence_without_language_tag() {
        let output = "```\n{\"b\": true}\n```";
        assert_eq!(extract_json(output).unwrap(), json!({"b": true}));
    }

    #[test]
    fn test_falls_back_to_brace_slice() {
        let output = "Sure! Here is the analysis: {\"a\": {\"b\": 2}} Hope it helps.";
        assert_eq!(extract_json(output).unwrap(), json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_invalid_fence_falls_back_to_braces() {
        let output = "```json\nnot json at all\n``` but later {\"c\": 3}";
        assert_eq!(extract_json(output).unwrap(), json!({"c": 3}));
    }

    #[test]
    fn test_malformed_output() {
        assert!(matches!(
            extract_json("I cannot help with that."),
            Err(DraftingError::MalformedOutput(_))
        ));
        assert!(matches!(
            extract_json("{\"unterminated\": "),
            Err(DraftingError::MalformedOutput(_))
        ));
        assert!(matches!(
            extract_json("} backwards {"),
            Err(DraftingError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_validates_complete_object() {
        let analysis = validate_analysis(&valid()).unwrap();
        assert_eq!(analysis.intent, "Shipping Issue");
        assert_eq!(analysis.urgency, Urgency::Medium);
        assert_eq!(analysis.confidence, 72);
        assert_eq!(analysis.sentiment, 3);
    }

    #[test]
    fn test_rounds_fractional_scores() {
        let mut value = valid();
        value["confidence"] = json!(71.6);
        value["sentiment"] = json!(9.4);
        let analysis = validate_analysis(&value).unwrap();
        assert_eq!(analysis.confidence, 72);
        assert_eq!(analysis.sentiment, 9);
    }

    #[test]
    fn test_accepts_snake_case_draft_field() {
        let mut value = valid();
        let draft = value.as_object_mut().unwrap().remove("draftResponse").unwrap();
        value["draft_response"] = draft;
        assert!(validate_analysis(&value).is_ok());
    }

    #[test]
    fn test_rejects_schema_violations() {
        let cases = [
            ("urgency", json!("URGENT")),
            ("confidence", json!(101)),
            ("confidence", json!("90")),
            ("sentiment", json!(0)),
            ("sentiment", json!(null)),
            ("intent", json!("   ")),
            ("draftResponse", json!("")),
            ("draftResponse", json!("x".repeat(MAX_DRAFT_CHARS + 1))),
        ];

        for (field, bad) in cases {
            let mut value = valid();
            value[field] = bad;
            assert!(
                matches!(validate_analysis(&value), Err(DraftingError::SchemaViolation(_))),
                "{} should be rejected",
                field
            );
        }
    }
}
