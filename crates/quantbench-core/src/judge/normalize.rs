//! Response normalization shared by every judge back-end. Providers vary
//! wildly in how well they follow the output contract; everything funnels
//! through the same score/best-answer/reason pipeline.

use serde_json::Value;

use crate::model::BestAnswer;

/// Score law: ratios at or below 1.0 scale to percent, everything clamps
/// into `[1, 100]`, garbage becomes 1.
pub fn normalize_score(raw: Option<&Value>) -> i64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(x) if x.is_finite() => {
            let scaled = if x <= 1.0 { x * 100.0 } else { x };
            (scaled.round() as i64).clamp(1, 100)
        }
        _ => 1,
    }
}

/// Fold the permissive verdict vocabulary into the closed `{A, B, AB}`
/// set. Ambiguous or missing markers become `None`.
pub fn normalize_best_answer(raw: Option<&Value>) -> Option<BestAnswer> {
    let s = raw?.as_str()?;
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    let cleaned = cleaned
        .replace("RESPONSE", "")
        .replace("ANSWER", "")
        .replace("OPTION", "");
    match cleaned.as_str() {
        "A" => Some(BestAnswer::A),
        "B" => Some(BestAnswer::B),
        "AB" | "BA" | "TIE" | "EQUAL" | "IDENTICAL" | "BOTH" | "SAME" | "EQUIVALENT" => {
            Some(BestAnswer::Ab)
        }
        _ => None,
    }
}

/// Case-insensitive field lookup.
fn get_ci<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    let obj = value.as_object()?;
    for key in keys {
        if let Some((_, v)) = obj.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            return Some(v);
        }
    }
    None
}

/// First JSON object embedded in free-form judge output.
fn extract_json(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    serde_json::Deserializer::from_str(&raw[start..])
        .into_iter::<Value>()
        .next()?
        .ok()
}

/// Truncation repair: balance an odd quote count, then close whatever
/// brackets and braces are still open outside strings.
pub fn repair_truncated(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let mut candidate = raw[start..].trim_end().to_string();

    let mut in_string = false;
    let mut escape = false;
    let mut stack: Vec<char> = Vec::new();
    for c in candidate.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        candidate.push('"');
    }
    while let Some(close) = stack.pop() {
        candidate.push(close);
    }
    serde_json::from_str(&candidate).ok()
}

/// Reason extraction cascade over raw output, from strict to desperate.
pub fn reason_from_regex(raw: &str) -> Option<String> {
    let patterns = [
        // Proper JSON string value with escapes.
        r#"(?is)"reason"\s*:\s*"((?:[^"\\]|\\.)*)""#,
        // Unterminated string value (truncated output).
        r#"(?is)"reason"\s*:\s*"([^"]+)"#,
        // Anything vaguely shaped like an assignment.
        r#"(?is)reason['"]?\s*[:=]\s*['"]?([^'"}\n]+)"#,
    ];
    for pattern in patterns {
        if let Some(m) = regex::Regex::new(pattern)
            .ok()
            .and_then(|re| re.captures(raw))
            .and_then(|c| c.get(1))
        {
            let text = m.as_str().replace("\\\"", "\"").replace("\\n", "\n");
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub score: i64,
    pub best_answer: Option<BestAnswer>,
    pub reason: Option<String>,
}

/// Parse one raw judge response. The score and best-answer marker are
/// always produced; the reason may legitimately come back empty, which
/// the caller treats as grounds for a full-call retry.
pub fn parse_judge_response(raw: &str) -> ParsedResponse {
    let value = extract_json(raw).or_else(|| repair_truncated(raw));

    let score = normalize_score(value.as_ref().and_then(|v| get_ci(v, &["score", "similarity"])));
    let best_answer = normalize_best_answer(
        value
            .as_ref()
            .and_then(|v| get_ci(v, &["bestanswer", "best_answer", "best"])),
    );
    let reason = value
        .as_ref()
        .and_then(|v| get_ci(v, &["reason", "response", "explanation"]))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| reason_from_regex(raw));

    ParsedResponse {
        score,
        best_answer,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn score_ratio_scales_to_percent() {
        assert_eq!(normalize_score(Some(&json!(0.87))), 87);
        assert_eq!(normalize_score(Some(&json!(1.0))), 100);
        assert_eq!(normalize_score(Some(&json!(0.004))), 1);
    }

    #[test]
    fn score_integer_clamps() {
        assert_eq!(normalize_score(Some(&json!(85))), 85);
        assert_eq!(normalize_score(Some(&json!(250))), 100);
        assert_eq!(normalize_score(Some(&json!(-3))), 1);
    }

    #[test]
    fn score_strings_and_garbage() {
        assert_eq!(normalize_score(Some(&json!("92"))), 92);
        assert_eq!(normalize_score(Some(&json!("92%"))), 92);
        assert_eq!(normalize_score(Some(&json!("0.5"))), 50);
        assert_eq!(normalize_score(Some(&json!("high"))), 1);
        assert_eq!(normalize_score(None), 1);
    }

    #[test]
    fn best_answer_vocabulary() {
        for (input, expected) in [
            ("A", Some(BestAnswer::A)),
            ("Response A", Some(BestAnswer::A)),
            ("Answer_B", Some(BestAnswer::B)),
            ("b", Some(BestAnswer::B)),
            ("AB", Some(BestAnswer::Ab)),
            ("Tie", Some(BestAnswer::Ab)),
            ("Equal", Some(BestAnswer::Ab)),
            ("Identical", Some(BestAnswer::Ab)),
            ("both", Some(BestAnswer::Ab)),
            ("C", None),
            ("neither is good", None),
        ] {
            assert_eq!(normalize_best_answer(Some(&json!(input))), expected, "{input}");
        }
        assert_eq!(normalize_best_answer(None), None);
    }

    #[test]
    fn parse_clean_response() {
        let raw = r#"{"score": 88, "bestanswer": "A", "reason": "close match"}"#;
        let parsed = parse_judge_response(raw);
        assert_eq!(parsed.score, 88);
        assert_eq!(parsed.best_answer, Some(BestAnswer::A));
        assert_eq!(parsed.reason.as_deref(), Some("close match"));
    }

    #[test]
    fn parse_response_with_prose_wrapper() {
        let raw = "Here is my verdict:\n{\"score\": 0.9, \"bestanswer\": \"Tie\", \"reason\": \"both correct\"}\nHope that helps.";
        let parsed = parse_judge_response(raw);
        assert_eq!(parsed.score, 90);
        assert_eq!(parsed.best_answer, Some(BestAnswer::Ab));
        assert_eq!(parsed.reason.as_deref(), Some("both correct"));
    }

    #[test]
    fn parse_truncated_response_repairs() {
        let raw = r#"{"score": 70, "bestanswer": "B", "reason": "answer B explains the edge ca"#;
        let parsed = parse_judge_response(raw);
        assert_eq!(parsed.score, 70);
        assert_eq!(parsed.best_answer, Some(BestAnswer::B));
        assert!(parsed
            .reason
            .as_deref()
            .is_some_and(|r| r.starts_with("answer B explains")));
    }

    #[test]
    fn parse_case_insensitive_fields() {
        let raw = r#"{"Score": "0.75", "BestAnswer": "response b", "Explanation": "details differ"}"#;
        let parsed = parse_judge_response(raw);
        assert_eq!(parsed.score, 75);
        assert_eq!(parsed.best_answer, Some(BestAnswer::B));
        assert_eq!(parsed.reason.as_deref(), Some("details differ"));
    }

    #[test]
    fn parse_hopeless_response_keeps_floor_score() {
        let parsed = parse_judge_response("I cannot compare these answers.");
        assert_eq!(parsed.score, 1);
        assert_eq!(parsed.best_answer, None);
        assert!(parsed.reason.is_none());
    }

    #[test]
    fn regex_cascade_handles_sloppy_quoting() {
        let raw = "score: 55, reason: 'the variant dropped a step'";
        assert_eq!(
            reason_from_regex(raw).as_deref(),
            Some("the variant dropped a step")
        );
    }
}
