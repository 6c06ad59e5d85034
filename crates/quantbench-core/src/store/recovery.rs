//! Corruption recovery for results documents.
//!
//! Two strategies run in order. The structural pass truncates the
//! document at the last syntactically complete question-result boundary
//! and re-balances with the minimal closing sequence. The general pass
//! re-parses character by character with a stack, skipping extraneous
//! closers and rewinding any unterminated member to the last good
//! boundary. Both ignore string interiors and escapes.

use anyhow::Context;
use serde::Serialize;

use crate::model::ResultsDocument;

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStats {
    pub truncated_arrays: u32,
    pub truncated_objects: u32,
    pub removed_bytes: u64,
    pub fixed_closures: u32,
}

/// Recover a document from corrupted text. After textual repair the
/// parsed document is filtered: variants without a tag or without
/// question results are dropped, and legacy byte payloads disappear with
/// the typed re-parse.
pub fn repair_document(input: &str) -> anyhow::Result<(ResultsDocument, RepairStats)> {
    if let Some((text, stats)) = structural_repair(input) {
        if let Ok(doc) = serde_json::from_str::<ResultsDocument>(&text) {
            return Ok((post_filter(doc), stats));
        }
    }
    let (text, stats) = general_repair(input);
    let doc: ResultsDocument =
        serde_json::from_str(&text).context("results document unrecoverable")?;
    Ok((post_filter(doc), stats))
}

fn post_filter(mut doc: ResultsDocument) -> ResultsDocument {
    doc.variants
        .retain(|v| !v.tag.is_empty() && !v.questions.is_empty());
    doc
}

/// A question result closes an object whose parent array sits at this
/// stack depth: root object, variants array, variant object, questions
/// array.
const QUESTION_RESULT_DEPTH: usize = 4;

/// Truncate at the last complete question-result record and emit the
/// minimal closing sequence for the still-open markers.
pub fn structural_repair(input: &str) -> Option<(String, RepairStats)> {
    let bytes = input.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    let mut boundary: Option<usize> = None;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(b),
            b'}' => {
                if stack.pop() != Some(b'{') {
                    return None;
                }
                if stack.len() == QUESTION_RESULT_DEPTH && stack.last() == Some(&b'[') {
                    boundary = Some(i + 1);
                }
            }
            b']' => {
                if stack.pop() != Some(b'[') {
                    return None;
                }
            }
            _ => {}
        }
    }

    let cut = boundary?;
    // Re-scan the kept prefix to learn which markers are still open there.
    let mut open: Vec<u8> = Vec::new();
    let (mut in_string, mut escape) = (false, false);
    for &b in &bytes[..cut] {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => open.push(b),
            b'}' | b']' => {
                open.pop();
            }
            _ => {}
        }
    }
    if open.is_empty() {
        // Nothing was actually truncated.
        return Some((input[..cut].to_string(), RepairStats::default()));
    }

    let mut out = input[..cut].to_string();
    let mut stats = RepairStats {
        removed_bytes: (input.len() - cut) as u64,
        ..RepairStats::default()
    };
    for &marker in open.iter().rev() {
        if marker == b'[' {
            out.push(']');
            stats.truncated_arrays += 1;
        } else {
            out.push('}');
            stats.truncated_objects += 1;
        }
        stats.fixed_closures += 1;
    }
    Some((out, stats))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    ObjBeforeKey,
    ObjAfterKey,
    ObjBeforeValue,
    ObjAfterValue,
    ArrBeforeValue,
    ArrAfterValue,
}

impl Frame {
    fn is_object(self) -> bool {
        matches!(
            self,
            Frame::ObjBeforeKey | Frame::ObjAfterKey | Frame::ObjBeforeValue | Frame::ObjAfterValue
        )
    }
}

/// Single-pass stack re-parse. Keeps a rolling snapshot of the last
/// position where every open container was between complete members;
/// whatever follows that point at EOF is dropped and the stack closed.
pub fn general_repair(input: &str) -> (String, RepairStats) {
    let mut out = String::with_capacity(input.len());
    let mut stack: Vec<Frame> = Vec::new();
    let mut stats = RepairStats::default();

    let mut in_string = false;
    let mut escape = false;
    let mut in_scalar = false;

    // Last good boundary: output length plus the marker stack open there.
    let mut clean_len = 0usize;
    let mut clean_stack: Vec<bool> = Vec::new(); // true = object

    macro_rules! snapshot {
        ($stack:expr, $out:expr) => {
            clean_len = $out.len();
            clean_stack = $stack.iter().map(|f| f.is_object()).collect();
        };
    }

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
                match stack.last_mut() {
                    Some(f @ Frame::ObjBeforeKey) => *f = Frame::ObjAfterKey,
                    Some(f @ Frame::ObjBeforeValue) => {
                        *f = Frame::ObjAfterValue;
                        snapshot!(stack, out);
                    }
                    Some(f @ Frame::ArrBeforeValue) => {
                        *f = Frame::ArrAfterValue;
                        snapshot!(stack, out);
                    }
                    _ => {}
                }
            }
            continue;
        }

        if in_scalar {
            let ends = matches!(c, ',' | '}' | ']') || c.is_whitespace();
            if !ends {
                out.push(c);
                if chars.peek().is_none() {
                    // Scalar runs to EOF; cannot prove it complete.
                    break;
                }
                continue;
            }
            in_scalar = false;
            match stack.last_mut() {
                Some(f @ Frame::ObjBeforeValue) => {
                    *f = Frame::ObjAfterValue;
                    snapshot!(stack, out);
                }
                Some(f @ Frame::ArrBeforeValue) => {
                    *f = Frame::ArrAfterValue;
                    snapshot!(stack, out);
                }
                _ => {}
            }
            // Fall through to process the delimiter itself.
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' | '[' => {
                let frame = if c == '{' {
                    Frame::ObjBeforeKey
                } else {
                    Frame::ArrBeforeValue
                };
                stack.push(frame);
                out.push(c);
            }
            '}' | ']' => {
                let matches_top = match stack.last() {
                    Some(f) if c == '}' => f.is_object(),
                    Some(f) => !f.is_object(),
                    None => false,
                };
                if !matches_top {
                    stats.fixed_closures += 1;
                    stats.removed_bytes += c.len_utf8() as u64;
                    continue;
                }
                stack.pop();
                out.push(c);
                match stack.last_mut() {
                    Some(f @ Frame::ObjBeforeValue) => *f = Frame::ObjAfterValue,
                    Some(f @ Frame::ArrBeforeValue) => *f = Frame::ArrAfterValue,
                    _ => {}
                }
                snapshot!(stack, out);
            }
            ':' => {
                if let Some(f @ Frame::ObjAfterKey) = stack.last_mut() {
                    *f = Frame::ObjBeforeValue;
                }
                out.push(c);
            }
            ',' => {
                match stack.last_mut() {
                    Some(f @ Frame::ObjAfterValue) => *f = Frame::ObjBeforeKey,
                    Some(f @ Frame::ArrAfterValue) => *f = Frame::ArrBeforeValue,
                    _ => {}
                }
                out.push(c);
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                in_scalar = true;
                out.push(c);
                if chars.peek().is_none() {
                    break;
                }
            }
        }
    }

    // Anything after the last clean boundary is an unterminated member.
    if in_string || in_scalar || out.len() > clean_len {
        let dangling = out.len() - clean_len.min(out.len());
        stats.removed_bytes += dangling as u64;
        out.truncate(clean_len);
    }
    for &is_object in clean_stack.iter().rev() {
        if is_object {
            out.push('}');
            stats.truncated_objects += 1;
        } else {
            out.push(']');
            stats.truncated_arrays += 1;
        }
        stats.fixed_closures += 1;
    }
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResultsDocument, RunOptions};

    fn sample_doc() -> String {
        let doc = serde_json::json!({
            "testSuite": "default",
            "modelName": "llama3.1",
            "options": serde_json::to_value(RunOptions::default()).unwrap(),
            "variants": [
                {
                    "tag": "fp16",
                    "modelName": "llama3.1:fp16",
                    "isBase": true,
                    "questions": [
                        {
                            "questionId": "reasoning-01",
                            "category": "reasoning",
                            "prompt": "p1",
                            "answer": "a1",
                            "logprobs": [{"token": "a", "logprob": -0.1}],
                            "evalTokensPerSecond": 10.0,
                            "promptTokensPerSecond": 100.0,
                            "totalTokens": 5,
                            "ctxSize": 4096
                        },
                        {
                            "questionId": "reasoning-02",
                            "category": "reasoning",
                            "prompt": "p2",
                            "answer": "a2",
                            "logprobs": [{"token": "b", "logprob": -0.2}],
                            "evalTokensPerSecond": 11.0,
                            "promptTokensPerSecond": 90.0,
                            "totalTokens": 6,
                            "ctxSize": 4096
                        }
                    ]
                }
            ]
        });
        serde_json::to_string_pretty(&doc).expect("serialize")
    }

    #[test]
    fn structural_repair_drops_partial_question() {
        let full = sample_doc();
        // Cut in the middle of the second question's answer string.
        let cut = full.find("\"a2\"").expect("answer marker") + 2;
        let truncated = &full[..cut];

        let (doc, stats) = repair_document(truncated).expect("recoverable");
        assert_eq!(doc.variants.len(), 1);
        assert_eq!(doc.variants[0].questions.len(), 1);
        assert_eq!(doc.variants[0].questions[0].question_id, "reasoning-01");
        assert!(stats.truncated_arrays >= 1);
        assert!(stats.truncated_objects >= 1);
        assert!(stats.removed_bytes > 0);
    }

    #[test]
    fn general_repair_handles_unterminated_string() {
        let input = r#"{"testSuite": "default", "modelName": "m", "partial": "oops"#;
        let (text, stats) = general_repair(input);
        let value: serde_json::Value = serde_json::from_str(&text).expect("parses");
        assert_eq!(value["modelName"], "m");
        assert!(value.get("partial").is_none());
        assert!(stats.removed_bytes > 0);
        assert_eq!(stats.truncated_objects, 1);
    }

    #[test]
    fn general_repair_skips_extraneous_closers() {
        let input = r#"{"a": [1, 2]]}"#;
        let (text, stats) = general_repair(input);
        let value: serde_json::Value = serde_json::from_str(&text).expect("parses");
        assert_eq!(value["a"][1], 2);
        assert_eq!(stats.fixed_closures, 1);
    }

    #[test]
    fn general_repair_keeps_well_formed_input() {
        let full = sample_doc();
        let (text, stats) = general_repair(&full);
        let doc: ResultsDocument = serde_json::from_str(&text).expect("parses");
        assert_eq!(doc.variants[0].questions.len(), 2);
        assert_eq!(stats.fixed_closures, 0);
        assert_eq!(stats.removed_bytes, 0);
    }

    #[test]
    fn repair_drops_variant_without_any_complete_question() {
        let doc = serde_json::json!({
            "testSuite": "default",
            "modelName": "m",
            "options": serde_json::to_value(RunOptions::default()).unwrap(),
            "variants": [{"tag": "q4_0", "modelName": "m:q4_0", "questions": []}]
        });
        let text = serde_json::to_string(&doc).expect("serialize");
        // Also truncate the trailing brackets to force repair.
        let cut = &text[..text.len() - 2];
        let (repaired, _) = repair_document(cut).expect("recoverable");
        assert!(repaired.variants.is_empty());
    }

    #[test]
    fn repair_strips_legacy_byte_payloads() {
        let full = sample_doc().replace(
            r#""logprob": -0.1,"#,
            r#""logprob": -0.1, "bytes": [97],"#,
        );
        assert!(full.contains("bytes"), "fixture must carry a legacy payload");
        // Truncate mid-way through the second question to force repair.
        let cut = full.find("reasoning-02").expect("second question") + 5;
        let (doc, _) = repair_document(&full[..cut]).expect("recoverable");
        let json = serde_json::to_string(&doc).expect("serialize");
        assert!(!json.contains("bytes"));
    }
}
